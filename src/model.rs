//! Domain types shared by the queue, the driving loop and the store.
use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A registered conversation mapped to a persistent workspace folder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub name: String,
    /// Folder name under the groups root, e.g. "family-chat"
    pub folder: String,
    /// Regex overriding the default "@{assistant}" trigger
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
    #[serde(default = "default_requires_trigger")]
    pub requires_trigger: bool,
    /// The primary group sees the whole project root (read-only)
    #[serde(default)]
    pub is_primary: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionConfig>,
}

fn default_requires_trigger() -> bool {
    true
}

/// Per-group execution overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionConfig {
    #[serde(default)]
    pub additional_mounts: Vec<AdditionalMount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_bytes: Option<usize>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// An operator-declared bind mount.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdditionalMount {
    pub host_path: PathBuf,
    pub container_path: String,
    #[serde(default = "default_readonly")]
    pub readonly: bool,
}

fn default_readonly() -> bool {
    true
}

/// A normalized chat message, as written by the platform adapters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub chat_jid: String,
    pub sender: String,
    #[serde(default)]
    pub sender_name: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_from_me: bool,
}

impl Message {
    /// Display name, falling back to the raw sender identifier.
    pub fn display_sender(&self) -> &str {
        if self.sender_name.is_empty() {
            &self.sender
        } else {
            &self.sender_name
        }
    }
}

/// Whether a scheduled task runs in the group's conversation context
/// or in a fresh one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextMode {
    #[default]
    Group,
    Isolated,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Active,
    Paused,
    Completed,
}

/// A ready-to-run task handed over by the external scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTaskRequest {
    pub id: String,
    pub group_folder: String,
    pub prompt: String,
    /// Opaque cron/interval descriptor; recurrence is computed elsewhere
    #[serde(default)]
    pub schedule: String,
    #[serde(default)]
    pub status: TaskStatus,
    pub next_run: DateTime<Utc>,
    #[serde(default)]
    pub context_mode: ContextMode,
    /// Deliver to this conversation instead of the group's own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_jid: Option<String>,
}

/// Returns the platform tag of a conversation identifier
/// (`"tg:12345"` → `"tg"`).
pub fn channel_of(jid: &str) -> &str {
    match jid.split_once(':') {
        Some((prefix, _)) if !prefix.is_empty() => prefix,
        _ => "unknown",
    }
}
