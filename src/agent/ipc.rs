//! File-based message exchange with a running sandbox.
//!
//! Layout per group (mounted at the sandbox IPC path):
//!   {root}/{folder}/input/{millis}-{rand}.json    follow-up input for the agent
//!   {root}/{folder}/input/_close                  ends an interactive session
//!   {root}/{folder}/output/{millis}-{rand}.json   messages the agent wants sent
//!   {root}/errors/                                output files that failed to parse
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const CLOSE_SENTINEL: &str = "_close";

#[derive(Debug, Serialize)]
struct InputMessage<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    text: &'a str,
}

/// A message dropped by the agent into its `output/` directory.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    /// Defaults to the group's own conversation
    #[serde(default)]
    pub chat_jid: Option<String>,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct IpcChannel {
    root: PathBuf,
}

impl IpcChannel {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn group_dir(&self, folder: &str) -> PathBuf {
        self.root.join(folder)
    }

    pub fn input_dir(&self, folder: &str) -> PathBuf {
        self.group_dir(folder).join("input")
    }

    pub fn output_dir(&self, folder: &str) -> PathBuf {
        self.group_dir(folder).join("output")
    }

    /// Queues follow-up text for a running sandbox.
    pub async fn send_input(&self, folder: &str, text: &str) -> Result<PathBuf> {
        let dir = self.input_dir(folder);
        tokio::fs::create_dir_all(&dir).await?;

        let name = format!(
            "{}-{:04x}.json",
            chrono::Utc::now().timestamp_millis(),
            rand::random::<u16>()
        );
        let path = dir.join(&name);
        let tmp = dir.join(format!(".{name}.tmp"));
        let body = serde_json::to_string(&InputMessage {
            kind: "message",
            text,
        })?;
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(folder, file = %name, "Follow-up input written");
        Ok(path)
    }

    /// Asks the agent to wind down its interactive session.
    pub async fn close(&self, folder: &str) -> Result<()> {
        let dir = self.input_dir(folder);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(CLOSE_SENTINEL), b"").await?;
        Ok(())
    }

    /// Collects and removes the agent's outbound messages, oldest first.
    pub async fn take_outbound(&self, folder: &str) -> Result<Vec<OutboundMessage>> {
        let dir = self.output_dir(folder);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                files.push(path);
            }
        }
        files.sort();

        let mut messages = Vec::with_capacity(files.len());
        for path in files {
            // per-file errors skip that file only
            let content = match tokio::fs::read_to_string(&path).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(folder, "Unreadable IPC output {}: {e}", path.display());
                    self.quarantine_logged(folder, &path).await;
                    continue;
                }
            };
            match serde_json::from_str::<OutboundMessage>(&content) {
                Ok(msg) => match tokio::fs::remove_file(&path).await {
                    Ok(()) => messages.push(msg),
                    Err(e) => warn!(folder, "Cannot remove IPC output {}: {e}", path.display()),
                },
                Err(e) => {
                    warn!(folder, "Malformed IPC output {}: {e}", path.display());
                    self.quarantine_logged(folder, &path).await;
                }
            }
        }
        Ok(messages)
    }

    async fn quarantine_logged(&self, folder: &str, path: &Path) {
        if let Err(e) = self.quarantine(folder, path).await {
            warn!(folder, "Cannot quarantine {}: {e:#}", path.display());
        }
    }

    async fn quarantine(&self, folder: &str, path: &Path) -> Result<()> {
        let errors = self.root.join("errors");
        tokio::fs::create_dir_all(&errors).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        tokio::fs::rename(path, errors.join(format!("{folder}-{name}"))).await?;
        Ok(())
    }
}
