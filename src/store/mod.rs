//! `Database` trait: the persistence contract the orchestrator consumes.
//!
//! The storage engine itself lives behind this trait; [`json::JsonStore`]
//! is the file-backed implementation used by the binary.
pub mod json;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Group, Message, ScheduledTaskRequest};

pub use json::JsonStore;

/// Driving-loop bookkeeping persisted across restarts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterState {
    /// Newest message timestamp seen by the driving loop
    #[serde(default)]
    pub last_timestamp: Option<DateTime<Utc>>,
    /// Agent session id per group folder
    #[serde(default)]
    pub sessions: HashMap<String, String>,
    /// Newest message handed to the agent, per conversation
    #[serde(default)]
    pub last_agent_timestamp: HashMap<String, DateTime<Utc>>,
}

impl RouterState {
    /// Moves the per-conversation cursor forward, never backwards.
    pub fn advance_agent_timestamp(&mut self, jid: &str, ts: DateTime<Utc>) {
        let entry = self.last_agent_timestamp.entry(jid.to_string()).or_insert(ts);
        if ts > *entry {
            *entry = ts;
        }
    }
}

#[async_trait]
pub trait Database: Send + Sync {
    /// Messages in one conversation strictly newer than `since`.
    async fn messages_since(
        &self,
        jid: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>>;

    /// Messages across all conversations strictly newer than `since`,
    /// oldest first.
    async fn new_messages_since(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Message>>;

    /// Registered groups keyed by conversation id.
    async fn registered_groups(&self) -> Result<HashMap<String, Group>>;

    async fn load_router_state(&self) -> Result<RouterState>;

    async fn save_router_state(&self, state: &RouterState) -> Result<()>;

    /// Scheduled tasks ready to run at `now`. Each task is handed out once.
    async fn due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledTaskRequest>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_database_is_object_safe() {
        fn _assert_object_safe(_: &dyn Database) {}
    }

    #[test]
    fn test_advance_agent_timestamp_is_monotonic() {
        let mut state = RouterState::default();
        let t1 = Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2026, 1, 1, 11, 0, 0).unwrap();

        state.advance_agent_timestamp("tg:1", t2);
        state.advance_agent_timestamp("tg:1", t1);
        assert_eq!(state.last_agent_timestamp["tg:1"], t2);
    }

    #[test]
    fn test_router_state_tolerates_missing_fields() {
        let state: RouterState = serde_json::from_str("{}").unwrap();
        assert_eq!(state, RouterState::default());
    }
}
