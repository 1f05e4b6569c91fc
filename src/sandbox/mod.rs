//! Sandboxed execution of one group turn.
//!
//! The layers, from the host outwards:
//!
//! 1. Mount validation (`mounts`): decides the exact filesystem view
//! 2. Container launch (`executor`): no network, memory/CPU ceilings
//! 3. Stdio protocol (`protocol`): one JSON request in, marked result out
//!
//! Everything that goes wrong below the queue surfaces as an
//! [`ExecutionResult`] with `status: Error`; nothing here panics the host.
pub mod executor;
pub mod mounts;
pub mod protocol;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use executor::SandboxExecutor;
pub use mounts::{MountSecurityError, MountValidator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MountMode {
    ReadOnly,
    ReadWrite,
}

/// One host path exposed inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountBinding {
    pub host_path: PathBuf,
    pub container_path: String,
    pub mode: MountMode,
}

impl MountBinding {
    #[cfg(test)]
    pub fn new(host_path: impl Into<PathBuf>, container_path: &str, mode: MountMode) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: container_path.to_string(),
            mode,
        }
    }

    pub fn is_readonly(&self) -> bool {
        self.mode == MountMode::ReadOnly
    }
}

/// Everything the executor needs for one turn.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub group_folder: String,
    pub prompt: String,
    pub session_id: Option<String>,
    pub chat_jid: String,
    pub is_primary: bool,
    pub mounts: Vec<MountBinding>,
    pub env: BTreeMap<String, String>,
    pub timeout: Duration,
    pub max_output_bytes: usize,
    /// Unique sandbox instance name
    pub container_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Error,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    /// When set, the next turn must address the agent with this session
    pub new_session_id: Option<String>,
}

impl ExecutionResult {
    pub fn success(result: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Success,
            result: Some(result.into()),
            error: None,
            new_session_id: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Error,
            result: None,
            error: Some(message.into()),
            new_session_id: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}

/// Runs one execution request to completion.
///
/// Implementations never fail: launch problems, timeouts and garbled
/// output all come back as an error-status [`ExecutionResult`].
#[async_trait]
pub trait Executor: Send + Sync {
    async fn run(&self, request: ExecutionRequest) -> ExecutionResult;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executor_is_object_safe() {
        fn _assert_object_safe(_: &dyn Executor) {}
    }

    #[test]
    fn test_result_constructors() {
        let ok = ExecutionResult::success("done");
        assert!(ok.is_success());
        assert_eq!(ok.result.as_deref(), Some("done"));

        let err = ExecutionResult::error("boom");
        assert!(!err.is_success());
        assert_eq!(err.error.as_deref(), Some("boom"));
        assert!(err.result.is_none());
    }

    #[test]
    fn test_mount_mode_serialization() {
        let binding = MountBinding::new("/tmp/x", "/workspace/x", MountMode::ReadOnly);
        let json = serde_json::to_value(&binding).unwrap();
        assert_eq!(json["mode"], "read-only");
        assert!(binding.is_readonly());
    }
}
