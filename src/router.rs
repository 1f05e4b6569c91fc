//! `Router` trait: delivery of agent replies to conversations.
//!
//! Platform adapters own the actual sending; the default router drops
//! replies into a per-conversation outbox file they consume.

use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::store::json::sanitize_file_stem;

#[async_trait]
pub trait Router: Send + Sync {
    async fn deliver(&self, jid: &str, text: &str) -> Result<()>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OutboxEntry<'a> {
    chat_jid: &'a str,
    text: &'a str,
    timestamp: String,
}

/// Appends replies to `{root}/{jid}.jsonl`.
pub struct OutboxRouter {
    root: PathBuf,
}

impl OutboxRouter {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn outbox_file(&self, jid: &str) -> PathBuf {
        self.root.join(format!("{}.jsonl", sanitize_file_stem(jid)))
    }
}

#[async_trait]
impl Router for OutboxRouter {
    async fn deliver(&self, jid: &str, text: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        let entry = OutboxEntry {
            chat_jid: jid,
            text,
            timestamp: Utc::now().to_rfc3339(),
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.outbox_file(jid))
            .await?;
        file.write_all(line.as_bytes()).await?;

        info!("Reply to {jid}: {} chars", text.chars().count());
        Ok(())
    }
}
