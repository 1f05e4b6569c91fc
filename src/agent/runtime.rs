use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::model::{Group, Message, ScheduledTaskRequest};
use crate::router::Router;
use crate::store::{Database, RouterState};

use super::ipc::IpcChannel;
use super::queue::GroupQueue;
use super::transcript::Trigger;

/// What one polling cycle did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub messages: usize,
    pub submitted: usize,
    pub tasks: usize,
    pub outbound: usize,
    /// Shutdown arrived mid-batch; the global cursor was left alone
    pub interrupted: bool,
}

/// The driving loop, core of nanogridbot.
///
/// Polls the store for chat activity, applies trigger matching, and
/// feeds admitted work into the [`GroupQueue`]. Owns persistence of the
/// shared [`RouterState`].
pub struct AgentRuntime {
    db: Arc<dyn Database>,
    router: Arc<dyn Router>,
    queue: GroupQueue,
    ipc: IpcChannel,
    state: Arc<Mutex<RouterState>>,
    default_trigger: Trigger,
    poll_interval: Duration,
}

impl AgentRuntime {
    pub fn new(
        config: &Config,
        db: Arc<dyn Database>,
        router: Arc<dyn Router>,
        queue: GroupQueue,
        ipc: IpcChannel,
        state: Arc<Mutex<RouterState>>,
    ) -> Result<Self> {
        Ok(Self {
            db,
            router,
            queue,
            ipc,
            state,
            default_trigger: Trigger::new(&config.default_trigger_pattern())?,
            poll_interval: config.runtime.poll_interval(),
        })
    }

    /// Main loop. Returns once `shutdown` flips to true, after the
    /// state has been written back.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.restore_state().await?;
        info!(
            "Driving loop started, polling every {}ms",
            self.poll_interval.as_millis()
        );

        while !*shutdown.borrow() {
            match self.run_cycle(&shutdown).await {
                Ok(report) if report.messages > 0 || report.tasks > 0 || report.outbound > 0 => {
                    debug!(?report, "Cycle complete");
                }
                Ok(_) => {}
                Err(e) => error!("Cycle failed: {e:#}"),
            }
            if let Err(e) = self.persist_state().await {
                error!("Cannot save router state: {e:#}");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Driving loop stopping");
        self.persist_state().await
    }

    /// Loads persisted bookkeeping into the shared state.
    pub async fn restore_state(&self) -> Result<()> {
        let loaded = self.db.load_router_state().await?;
        info!(
            sessions = loaded.sessions.len(),
            conversations = loaded.last_agent_timestamp.len(),
            "Router state restored"
        );
        *self.state.lock().await = loaded;
        Ok(())
    }

    pub async fn persist_state(&self) -> Result<()> {
        let snapshot = self.state.lock().await.clone();
        self.db.save_router_state(&snapshot).await
    }

    /// One poll: chat activity, then due tasks, then agent-initiated
    /// messages.
    pub async fn run_cycle(&self, shutdown: &watch::Receiver<bool>) -> Result<CycleReport> {
        let groups = self.db.registered_groups().await?;
        let mut report = CycleReport::default();

        self.process_messages(&groups, shutdown, &mut report).await?;
        if report.interrupted {
            return Ok(report);
        }

        match self.db.due_tasks(Utc::now()).await {
            Ok(tasks) => {
                for task in tasks {
                    if self.submit_task(&groups, task).await {
                        report.tasks += 1;
                    }
                }
            }
            Err(e) => warn!("Cannot read due tasks: {e:#}"),
        }

        report.outbound = self.deliver_outbound(&groups).await;
        Ok(report)
    }

    // ── Chat activity ────────────────────────────────────

    async fn process_messages(
        &self,
        groups: &HashMap<String, Group>,
        shutdown: &watch::Receiver<bool>,
        report: &mut CycleReport,
    ) -> Result<()> {
        let since = self.state.lock().await.last_timestamp;
        let messages = self.db.new_messages_since(since).await?;
        report.messages = messages.len();
        let Some(newest) = messages.iter().map(|m| m.timestamp).max() else {
            return Ok(());
        };

        for (jid, batch) in by_conversation(messages) {
            if *shutdown.borrow() {
                info!("Shutdown requested, leaving remaining conversations for the next start");
                report.interrupted = true;
                return Ok(());
            }

            let Some(group) = groups.get(&jid) else {
                debug!(jid = %jid, "Message from unregistered conversation, ignored");
                continue;
            };
            let incoming: Vec<Message> = batch.into_iter().filter(|m| !m.is_from_me).collect();
            if incoming.is_empty() {
                continue;
            }
            if group.requires_trigger && !self.trigger_for(group).any_match(&incoming) {
                debug!(jid = %jid, "No trigger in batch, skipped");
                continue;
            }

            let (session_id, last_agent_ts) = {
                let state = self.state.lock().await;
                (
                    state.sessions.get(&group.folder).cloned(),
                    state.last_agent_timestamp.get(&jid).copied(),
                )
            };
            info!(jid = %jid, folder = %group.folder, messages = incoming.len(), "Submitting chat activity");
            self.queue
                .submit_message_activity(&jid, group, session_id, last_agent_ts)
                .await;
            report.submitted += 1;
        }

        self.state.lock().await.last_timestamp = Some(newest);
        Ok(())
    }

    /// Group-specific pattern, falling back to the default trigger if
    /// the group's own pattern does not compile.
    fn trigger_for(&self, group: &Group) -> Trigger {
        match group.trigger.as_deref() {
            Some(pattern) => Trigger::new(pattern).unwrap_or_else(|e| {
                warn!(folder = %group.folder, "Invalid trigger pattern, using default: {e}");
                self.default_trigger.clone()
            }),
            None => self.default_trigger.clone(),
        }
    }

    // ── Scheduled tasks ──────────────────────────────────

    async fn submit_task(&self, groups: &HashMap<String, Group>, task: ScheduledTaskRequest) -> bool {
        let Some((jid, group)) = resolve_task_group(groups, &task) else {
            warn!(task = %task.id, folder = %task.group_folder, "No registered group for task, dropped");
            return false;
        };
        let session_id = self.state.lock().await.sessions.get(&group.folder).cloned();
        info!(task = %task.id, jid = %jid, "Submitting scheduled task");
        self.queue
            .submit_scheduled_task(jid, group, task, session_id)
            .await;
        true
    }

    // ── Agent-initiated messages ─────────────────────────

    /// Delivers files the sandboxes left in their `output/` directories.
    /// Only the primary group may address other conversations.
    async fn deliver_outbound(&self, groups: &HashMap<String, Group>) -> usize {
        let mut delivered = 0;
        for (jid, group) in groups {
            let outbound = match self.ipc.take_outbound(&group.folder).await {
                Ok(m) => m,
                Err(e) => {
                    warn!(folder = %group.folder, "Cannot read IPC output: {e:#}");
                    continue;
                }
            };
            for msg in outbound {
                let target = msg.chat_jid.as_deref().unwrap_or(jid);
                if target != jid && !group.is_primary {
                    warn!(folder = %group.folder, target, "Cross-conversation message blocked");
                    continue;
                }
                match self.router.deliver(target, &msg.text).await {
                    Ok(()) => delivered += 1,
                    Err(e) => error!(target, "Delivery failed: {e:#}"),
                }
            }
        }
        delivered
    }
}

/// Splits a batch by conversation, preserving order of first appearance
/// and message order within each conversation.
fn by_conversation(messages: Vec<Message>) -> Vec<(String, Vec<Message>)> {
    let mut order: Vec<(String, Vec<Message>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for msg in messages {
        match index.get(&msg.chat_jid) {
            Some(&i) => order[i].1.push(msg),
            None => {
                index.insert(msg.chat_jid.clone(), order.len());
                order.push((msg.chat_jid.clone(), vec![msg]));
            }
        }
    }
    order
}

/// Explicit target conversation first, then the group owning the folder.
fn resolve_task_group<'a>(
    groups: &'a HashMap<String, Group>,
    task: &ScheduledTaskRequest,
) -> Option<(&'a str, &'a Group)> {
    if let Some(target) = &task.chat_jid {
        if let Some((jid, group)) = groups.get_key_value(target) {
            if group.folder == task.group_folder {
                return Some((jid.as_str(), group));
            }
        }
    }
    groups
        .iter()
        .filter(|(_, g)| g.folder == task.group_folder)
        .min_by(|a, b| a.0.cmp(b.0))
        .map(|(jid, group)| (jid.as_str(), group))
}
