/// File-backed `Database`.
///
/// Layout:
///   {root}/registered_groups.json    map of conversation id → Group
///   {root}/router_state.json         driving-loop bookkeeping
///   {root}/messages/{jid}.jsonl      one Message per line (written by adapters)
///   {root}/tasks/{id}.json           one due task per file
///   {root}/tasks/{id}.json.claimed   task already handed out
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::{Database, RouterState};
use crate::model::{Group, Message, ScheduledTaskRequest, TaskStatus};

const GROUPS_FILE: &str = "registered_groups.json";
const STATE_FILE: &str = "router_state.json";

pub struct JsonStore {
    root: PathBuf,
}

impl JsonStore {
    pub fn open(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root.join("messages"))
            .with_context(|| format!("Cannot create store at {}", root.display()))?;
        std::fs::create_dir_all(root.join("tasks"))?;
        info!("Store opened at {}", root.display());
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn messages_file(&self, jid: &str) -> PathBuf {
        self.root
            .join("messages")
            .join(format!("{}.jsonl", sanitize_file_stem(jid)))
    }

    /// Appends a message to its conversation log.
    pub async fn append_message(&self, message: &Message) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        let mut line = serde_json::to_string(message)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.messages_file(&message.chat_jid))
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    pub async fn register_group(&self, jid: &str, group: Group) -> Result<()> {
        let mut groups = self.registered_groups().await?;
        groups.insert(jid.to_string(), group);
        write_json_atomic(&self.root.join(GROUPS_FILE), &groups).await
    }

    async fn read_messages(path: &Path) -> Result<Vec<Message>> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for (n, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Message>(line) {
                Ok(msg) => out.push(msg),
                Err(e) => warn!("Skipping malformed message {}:{}: {e}", path.display(), n + 1),
            }
        }
        Ok(out)
    }
}

fn newer_than(since: Option<DateTime<Utc>>) -> impl Fn(&Message) -> bool {
    move |m| since.map_or(true, |s| m.timestamp > s)
}

#[async_trait]
impl Database for JsonStore {
    async fn messages_since(
        &self,
        jid: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>> {
        let keep = newer_than(since);
        let mut messages: Vec<Message> = Self::read_messages(&self.messages_file(jid))
            .await?
            .into_iter()
            .filter(|m| m.chat_jid == jid && keep(m))
            .collect();
        messages.sort_by_key(|m| m.timestamp);
        Ok(messages)
    }

    async fn new_messages_since(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Message>> {
        let keep = newer_than(since);
        let mut messages = Vec::new();
        let mut entries = tokio::fs::read_dir(self.root.join("messages")).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            messages.extend(Self::read_messages(&path).await?.into_iter().filter(|m| keep(m)));
        }
        messages.sort_by_key(|m| m.timestamp);
        Ok(messages)
    }

    async fn registered_groups(&self) -> Result<HashMap<String, Group>> {
        read_json_or_default(&self.root.join(GROUPS_FILE)).await
    }

    async fn load_router_state(&self) -> Result<RouterState> {
        read_json_or_default(&self.root.join(STATE_FILE)).await
    }

    async fn save_router_state(&self, state: &RouterState) -> Result<()> {
        write_json_atomic(&self.root.join(STATE_FILE), state).await
    }

    async fn due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledTaskRequest>> {
        let mut due = Vec::new();
        let mut entries = tokio::fs::read_dir(self.root.join("tasks")).await?;
        // per-file errors skip that file only; claimed tasks are always returned
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("Task directory scan stopped early: {e}");
                    break;
                }
            };
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = match tokio::fs::read_to_string(&path).await {
                Ok(c) => c,
                Err(e) => {
                    warn!("Skipping unreadable task {}: {e}", path.display());
                    continue;
                }
            };
            let task: ScheduledTaskRequest = match serde_json::from_str(&content) {
                Ok(t) => t,
                Err(e) => {
                    warn!("Skipping malformed task {}: {e}", path.display());
                    continue;
                }
            };
            if task.status != TaskStatus::Active || task.next_run > now {
                continue;
            }
            let mut claimed = path.clone().into_os_string();
            claimed.push(".claimed");
            if let Err(e) = tokio::fs::rename(&path, &claimed).await {
                warn!(task = %task.id, "Cannot claim task {}: {e}", path.display());
                continue;
            }
            debug!(task = %task.id, "Task claimed");
            due.push(task);
        }
        due.sort_by_key(|t| t.next_run);
        Ok(due)
    }
}

async fn read_json_or_default<T>(path: &Path) -> Result<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    match tokio::fs::read_to_string(path).await {
        Ok(content) => serde_json::from_str(&content)
            .with_context(|| format!("Cannot parse {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

/// Writes to a sibling temp file then renames over the target.
async fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    let mut tmp = path.to_path_buf().into_os_string();
    tmp.push(".tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Maps a conversation id to a safe file stem.
pub fn sanitize_file_stem(jid: &str) -> String {
    jid.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' || c == '@' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn ts(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, m, 0).unwrap()
    }

    fn msg(id: &str, jid: &str, at: DateTime<Utc>) -> Message {
        Message {
            id: id.to_string(),
            chat_jid: jid.to_string(),
            sender: "tg:7".to_string(),
            sender_name: "Alice".to_string(),
            content: format!("message {id}"),
            timestamp: at,
            is_from_me: false,
        }
    }

    #[tokio::test]
    async fn test_messages_since_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();
        store.append_message(&msg("2", "tg:1", ts(10, 5))).await.unwrap();
        store.append_message(&msg("1", "tg:1", ts(10, 0))).await.unwrap();
        store.append_message(&msg("3", "tg:2", ts(10, 7))).await.unwrap();

        let all = store.messages_since("tg:1", None).await.unwrap();
        assert_eq!(all.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(), vec!["1", "2"]);

        let newer = store.messages_since("tg:1", Some(ts(10, 0))).await.unwrap();
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].id, "2");
    }

    #[tokio::test]
    async fn test_new_messages_across_conversations() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();
        store.append_message(&msg("a", "tg:1", ts(9, 0))).await.unwrap();
        store.append_message(&msg("b", "tg:2", ts(9, 30))).await.unwrap();
        store.append_message(&msg("c", "tg:1", ts(9, 45))).await.unwrap();

        let newer = store.new_messages_since(Some(ts(9, 0))).await.unwrap();
        assert_eq!(newer.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();
        store.append_message(&msg("a", "tg:1", ts(9, 0))).await.unwrap();
        let path = store.messages_file("tg:1");
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{not json}\n");
        std::fs::write(&path, content).unwrap();

        assert_eq!(store.messages_since("tg:1", None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_router_state_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();
        assert_eq!(store.load_router_state().await.unwrap(), RouterState::default());

        let mut state = RouterState::default();
        state.last_timestamp = Some(ts(12, 0));
        state.sessions.insert("main".into(), "sess-9".into());
        state.advance_agent_timestamp("tg:1", ts(11, 59));
        store.save_router_state(&state).await.unwrap();

        let reopened = JsonStore::open(dir.path()).unwrap();
        assert_eq!(reopened.load_router_state().await.unwrap(), state);
    }

    #[tokio::test]
    async fn test_register_group() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();
        let group: Group = serde_json::from_str(r#"{"name":"Main","folder":"main"}"#).unwrap();
        store.register_group("tg:1", group.clone()).await.unwrap();

        let groups = store.registered_groups().await.unwrap();
        assert_eq!(groups.get("tg:1"), Some(&group));
    }

    #[tokio::test]
    async fn test_due_tasks_are_claimed_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();
        let now = ts(8, 0);
        let write = |id: &str, next: DateTime<Utc>| {
            let task = serde_json::json!({
                "id": id,
                "groupFolder": "main",
                "prompt": "daily summary",
                "nextRun": next,
            });
            std::fs::write(dir.path().join(format!("tasks/{id}.json")), task.to_string()).unwrap();
        };
        write("due", now - Duration::minutes(1));
        write("later", now + Duration::hours(1));

        let due = store.due_tasks(now).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, "due");
        assert!(dir.path().join("tasks/due.json.claimed").exists());

        assert!(store.due_tasks(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_task_entry_does_not_drop_claimed_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();
        let now = ts(8, 0);
        std::fs::create_dir_all(dir.path().join("tasks/bad.json")).unwrap();
        for id in ["a-due", "z-due"] {
            let task = serde_json::json!({
                "id": id,
                "groupFolder": "main",
                "prompt": "daily summary",
                "nextRun": now - Duration::minutes(5),
            });
            std::fs::write(dir.path().join(format!("tasks/{id}.json")), task.to_string()).unwrap();
        }

        let due = store.due_tasks(now).await.unwrap();
        let mut ids: Vec<&str> = due.iter().map(|t| t.id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["a-due", "z-due"]);
        assert!(dir.path().join("tasks/a-due.json.claimed").exists());
        assert!(dir.path().join("tasks/z-due.json.claimed").exists());
        assert!(dir.path().join("tasks/bad.json").is_dir());
    }

    #[test]
    fn test_sanitize_file_stem() {
        assert_eq!(sanitize_file_stem("tg:123"), "tg_123");
        assert_eq!(sanitize_file_stem("120363@g.us"), "120363@g.us");
        assert_eq!(sanitize_file_stem("../etc/passwd"), ".._etc_passwd");
    }
}
