//! Per-group work queue.
//!
//! Each group is either idle or running exactly one sandbox execution.
//! A global ceiling bounds how many groups run at once; groups that
//! find no free slot wait in FIFO order. When an execution ends, the
//! group's own pending work (scheduled tasks first, then the follow-up
//! flag) is started before any waiting group is woken.
//!
//! All bookkeeping happens under one lock; the execution itself (message
//! gathering, mount resolution, subprocess I/O) runs in its own task
//! without holding it. The `active` flag alone keeps a group sequential.
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

use super::ipc::IpcChannel;
use super::transcript::format_transcript;
use crate::backoff::Backoff;
use crate::config::Config;
use crate::model::{ContextMode, Group, Message, ScheduledTaskRequest};
use crate::router::Router;
use crate::sandbox::{ExecutionRequest, ExecutionResult, Executor, MountValidator};
use crate::store::{Database, RouterState};

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub max_concurrent: usize,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub default_timeout: Duration,
    pub default_max_output_bytes: usize,
}

impl QueueSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_concurrent: config.queue.max_concurrent,
            max_retries: config.queue.max_retries,
            retry_base_delay: config.queue.retry_base_delay(),
            default_timeout: Duration::from_secs(config.sandbox.timeout_secs),
            default_max_output_bytes: config.sandbox.max_output_bytes,
        }
    }
}

/// Collaborators injected into the queue.
pub struct QueueDeps {
    pub db: Arc<dyn Database>,
    pub router: Arc<dyn Router>,
    pub executor: Arc<dyn Executor>,
    pub validator: Arc<MountValidator>,
    pub ipc: IpcChannel,
    /// Shared with the driving loop, which persists it
    pub state: Arc<Mutex<RouterState>>,
}

/// What a group needs to answer chat activity.
#[derive(Debug, Clone)]
struct MessageContext {
    group: Group,
    session_id: Option<String>,
    last_agent_ts: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct PendingTask {
    group: Group,
    task: ScheduledTaskRequest,
    session_id: Option<String>,
}

#[derive(Debug, Clone)]
enum Work {
    Messages(MessageContext),
    Task(PendingTask),
}

impl Work {
    fn group(&self) -> &Group {
        match self {
            Work::Messages(ctx) => &ctx.group,
            Work::Task(t) => &t.group,
        }
    }
}

#[derive(Debug, Default)]
struct GroupState {
    active: bool,
    /// A sandbox is up and reading its input directory. Only then can
    /// follow-ups be piped; `active` also covers backoff and setup.
    running: bool,
    pending_messages: bool,
    /// Front = highest priority
    pending_tasks: VecDeque<PendingTask>,
    retry_count: u32,
    container_name: Option<String>,
    /// Folder of the running execution
    folder: Option<String>,
    context: Option<MessageContext>,
}

impl GroupState {
    /// Next pending unit of work: tasks before the follow-up flag.
    fn take_pending(&mut self) -> Option<Work> {
        if let Some(task) = self.pending_tasks.pop_front() {
            return Some(Work::Task(task));
        }
        if self.pending_messages {
            self.pending_messages = false;
            return self.context.clone().map(Work::Messages);
        }
        None
    }
}

#[derive(Debug, Default)]
struct QueueState {
    groups: HashMap<String, GroupState>,
    active_count: usize,
    waiting: VecDeque<String>,
    shutting_down: bool,
}

/// Serializable view of the queue for observability.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    pub active_count: usize,
    pub max_concurrent: usize,
    pub waiting: Vec<String>,
    pub groups: Vec<GroupSnapshot>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GroupSnapshot {
    pub jid: String,
    pub active: bool,
    pub pending_messages: bool,
    pub pending_tasks: usize,
    pub retry_count: u32,
    pub container_name: Option<String>,
}

struct Inner {
    settings: QueueSettings,
    deps: QueueDeps,
    state: Mutex<QueueState>,
    idle: Notify,
}

#[derive(Clone)]
pub struct GroupQueue {
    inner: Arc<Inner>,
}

impl GroupQueue {
    pub fn new(settings: QueueSettings, deps: QueueDeps) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                deps,
                state: Mutex::new(QueueState::default()),
                idle: Notify::new(),
            }),
        }
    }

    /// New chat activity for a group.
    ///
    /// An active group gets its follow-up flag set, and if its sandbox is
    /// already running the new messages are piped into its input
    /// directory. An idle group is admitted.
    pub async fn submit_message_activity(
        &self,
        jid: &str,
        group: &Group,
        session_id: Option<String>,
        last_agent_ts: Option<DateTime<Utc>>,
    ) {
        let ctx = MessageContext {
            group: group.clone(),
            session_id,
            last_agent_ts,
        };

        let mut st = self.inner.state.lock().await;
        let gs = st.groups.entry(jid.to_string()).or_default();
        gs.context = Some(ctx.clone());

        if gs.active {
            gs.pending_messages = true;
            if !gs.running {
                debug!(jid, "Group active but no sandbox running, follow-up queued");
                return;
            }
            drop(st);
            debug!(jid, "Group running, piping follow-up messages");
            self.inner.pipe_follow_up(jid, &ctx).await;
            return;
        }

        self.inner.admit_locked(&mut st, jid, Work::Messages(ctx));
    }

    /// A due scheduled task for a group. Tasks jump ahead of any
    /// queued chat follow-up.
    pub async fn submit_scheduled_task(
        &self,
        jid: &str,
        group: &Group,
        task: ScheduledTaskRequest,
        session_id: Option<String>,
    ) {
        let pending = PendingTask {
            group: group.clone(),
            task,
            session_id,
        };

        let mut st = self.inner.state.lock().await;
        let gs = st.groups.entry(jid.to_string()).or_default();
        if gs.active {
            debug!(jid, task = %pending.task.id, "Group active, task queued");
            gs.pending_tasks.push_front(pending);
            return;
        }

        self.inner.admit_locked(&mut st, jid, Work::Task(pending));
    }

    /// Signals a running interactive session to finish.
    /// Returns false if the group has nothing running.
    pub async fn close_input(&self, jid: &str) -> Result<bool> {
        let folder = {
            let st = self.inner.state.lock().await;
            match st.groups.get(jid) {
                Some(gs) if gs.active => gs.folder.clone(),
                _ => None,
            }
        };
        match folder {
            Some(folder) => {
                self.inner.deps.ipc.close(&folder).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn snapshot(&self) -> QueueSnapshot {
        let st = self.inner.state.lock().await;
        let mut groups: Vec<GroupSnapshot> = st
            .groups
            .iter()
            .map(|(jid, gs)| GroupSnapshot {
                jid: jid.clone(),
                active: gs.active,
                pending_messages: gs.pending_messages,
                pending_tasks: gs.pending_tasks.len(),
                retry_count: gs.retry_count,
                container_name: gs.container_name.clone(),
            })
            .collect();
        groups.sort_by(|a, b| a.jid.cmp(&b.jid));

        QueueSnapshot {
            active_count: st.active_count,
            max_concurrent: self.inner.settings.max_concurrent,
            waiting: st.waiting.iter().cloned().collect(),
            groups,
        }
    }

    /// Stops admitting new executions. Running ones continue.
    pub async fn shutdown(&self) {
        let mut st = self.inner.state.lock().await;
        st.shutting_down = true;
        info!(
            active = st.active_count,
            waiting = st.waiting.len(),
            "Queue shutting down, in-flight executions will finish"
        );
    }

    /// Resolves once no execution is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.state.lock().await.active_count == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Inner {
    /// Starts `work` now if a slot is free, otherwise parks the group
    /// on the waiting list with the work recorded as pending.
    fn admit_locked(self: &Arc<Self>, st: &mut QueueState, jid: &str, work: Work) {
        if st.shutting_down || st.active_count >= self.settings.max_concurrent {
            let gs = st.groups.entry(jid.to_string()).or_default();
            match work {
                Work::Messages(ctx) => {
                    gs.context = Some(ctx);
                    gs.pending_messages = true;
                }
                Work::Task(task) => gs.pending_tasks.push_front(task),
            }
            if !st.waiting.iter().any(|w| w == jid) {
                st.waiting.push_back(jid.to_string());
            }
            info!(
                jid,
                active = st.active_count,
                "At concurrency limit, group waiting"
            );
            return;
        }

        self.start_locked(st, jid, work);
    }

    fn start_locked(self: &Arc<Self>, st: &mut QueueState, jid: &str, work: Work) {
        let folder = work.group().folder.clone();
        let container_name = container_name(&folder);
        let gs = st.groups.entry(jid.to_string()).or_default();
        gs.active = true;
        gs.container_name = Some(container_name.clone());
        gs.folder = Some(folder);
        st.active_count += 1;

        debug!(jid, container = %container_name, active = st.active_count, "Execution admitted");

        let inner = Arc::clone(self);
        let jid = jid.to_string();
        tokio::spawn(async move {
            inner.run_with_retry(&jid, work, container_name).await;
            inner.finish(&jid).await;
        });
    }

    /// Bounded retry loop around one unit of work.
    async fn run_with_retry(self: &Arc<Self>, jid: &str, work: Work, container_name: String) {
        let mut backoff = Backoff::doubling(self.settings.retry_base_delay);
        loop {
            match self.process(jid, &work, &container_name).await {
                Ok(()) => {
                    self.set_retry_count(jid, 0).await;
                    return;
                }
                Err(e) => {
                    let delay = backoff.record_failure();
                    if backoff.exhausted(self.settings.max_retries) {
                        error!(
                            jid,
                            attempts = backoff.failures,
                            "Max retries exceeded, dropping work: {e:#}"
                        );
                        self.set_retry_count(jid, 0).await;
                        return;
                    }
                    self.set_retry_count(jid, backoff.failures).await;
                    warn!(
                        jid,
                        attempt = backoff.failures,
                        "Execution attempt failed, retrying in {}ms: {e:#}",
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn set_retry_count(&self, jid: &str, count: u32) {
        let mut st = self.state.lock().await;
        if let Some(gs) = st.groups.get_mut(jid) {
            gs.retry_count = count;
        }
    }

    /// Marks the group idle, then drains its own pending work before
    /// waking waiting groups in FIFO order.
    async fn finish(self: &Arc<Self>, jid: &str) {
        let mut st = self.state.lock().await;
        st.active_count = st.active_count.saturating_sub(1);
        let own_next = match st.groups.get_mut(jid) {
            Some(gs) => {
                gs.active = false;
                gs.container_name = None;
                gs.folder = None;
                gs.take_pending()
            }
            None => None,
        };

        if !st.shutting_down {
            if let Some(work) = own_next {
                self.start_locked(&mut st, jid, work);
            }
            while st.active_count < self.settings.max_concurrent {
                let Some(next) = st.waiting.pop_front() else {
                    break;
                };
                let work = match st.groups.get_mut(&next) {
                    Some(gs) if !gs.active => gs.take_pending(),
                    _ => None,
                };
                if let Some(work) = work {
                    info!(jid = %next, "Waking waiting group");
                    self.start_locked(&mut st, &next, work);
                }
            }
        } else if let Some(work) = own_next {
            // keep it for after a restart of admissions
            if let Some(gs) = st.groups.get_mut(jid) {
                match work {
                    Work::Messages(_) => gs.pending_messages = true,
                    Work::Task(task) => gs.pending_tasks.push_front(task),
                }
            }
        }

        if st.active_count == 0 {
            self.idle.notify_waiters();
        }
    }

    /// One attempt. `Err` triggers the retry policy; a failed
    /// execution is an `Ok` with an error-status result.
    async fn process(&self, jid: &str, work: &Work, container_name: &str) -> Result<()> {
        match work {
            Work::Messages(ctx) => {
                let since = self.agent_cursor(jid, ctx.last_agent_ts).await;
                let messages = self.pending_messages(jid, since).await?;
                let Some(newest) = messages.last().map(|m| m.timestamp) else {
                    debug!(jid, "No new messages, nothing to run");
                    return Ok(());
                };
                let session_id = self.session_for(&ctx.group.folder, ctx.session_id.clone()).await;
                let prompt = format_transcript(&messages);

                // advance before running so piped follow-ups start after this batch
                self.deps
                    .state
                    .lock()
                    .await
                    .advance_agent_timestamp(jid, newest);

                info!(jid, folder = %ctx.group.folder, messages = messages.len(), "Running group turn");
                let result = self
                    .execute(jid, jid, &ctx.group, prompt, session_id, container_name)
                    .await;
                if !result.is_success() {
                    self.rewind_cursor(jid, newest, since).await;
                }
                self.handle_result(jid, &ctx.group, result).await;
                Ok(())
            }
            Work::Task(pending) => {
                let session_id = match pending.task.context_mode {
                    ContextMode::Group => {
                        self.session_for(&pending.group.folder, pending.session_id.clone())
                            .await
                    }
                    ContextMode::Isolated => None,
                };
                let target = pending.task.chat_jid.as_deref().unwrap_or(jid);

                info!(jid, task = %pending.task.id, "Running scheduled task");
                let result = self
                    .execute(
                        jid,
                        target,
                        &pending.group,
                        pending.task.prompt.clone(),
                        session_id,
                        container_name,
                    )
                    .await;
                self.handle_result(target, &pending.group, result).await;
                Ok(())
            }
        }
    }

    async fn execute(
        &self,
        jid: &str,
        chat_jid: &str,
        group: &Group,
        prompt: String,
        session_id: Option<String>,
        container_name: &str,
    ) -> ExecutionResult {
        let execution = group.execution.as_ref();
        let mounts = match self
            .deps
            .validator
            .resolve_mounts(&group.folder, execution, group.is_primary)
        {
            Ok(m) => m,
            Err(e) => {
                error!(folder = %group.folder, "Mount validation failed: {e}");
                return ExecutionResult::error(format!("Mount validation failed: {e}"));
            }
        };

        let env: BTreeMap<String, String> = execution
            .map(|e| e.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        let timeout = execution
            .and_then(|e| e.timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or(self.settings.default_timeout);
        let max_output_bytes = execution
            .and_then(|e| e.max_output_bytes)
            .unwrap_or(self.settings.default_max_output_bytes);

        let request = ExecutionRequest {
            group_folder: group.folder.clone(),
            prompt,
            session_id,
            chat_jid: chat_jid.to_string(),
            is_primary: group.is_primary,
            mounts,
            env,
            timeout,
            max_output_bytes,
            container_name: container_name.to_string(),
        };
        self.set_running(jid, true).await;
        let result = self.deps.executor.run(request).await;
        self.set_running(jid, false).await;
        result
    }

    async fn set_running(&self, jid: &str, running: bool) {
        let mut st = self.state.lock().await;
        if let Some(gs) = st.groups.get_mut(jid) {
            gs.running = running;
        }
    }

    async fn handle_result(&self, deliver_to: &str, group: &Group, result: ExecutionResult) {
        if let Some(session) = &result.new_session_id {
            self.deps
                .state
                .lock()
                .await
                .sessions
                .insert(group.folder.clone(), session.clone());
        }

        if !result.is_success() {
            warn!(
                folder = %group.folder,
                "Execution failed: {}",
                result.error.as_deref().unwrap_or("unknown error")
            );
            return;
        }

        let Some(text) = result.result.as_deref().map(str::trim) else {
            return;
        };
        if text.is_empty() {
            return;
        }
        if let Err(e) = self.deps.router.deliver(deliver_to, text).await {
            error!(jid = deliver_to, "Delivery failed: {e:#}");
        }
    }

    /// Writes messages that arrived while the sandbox is running into its
    /// input directory and advances the cursor past them. If the sandbox
    /// has exited by the time the file lands, the file is withdrawn and
    /// the follow-up run picks the messages up instead.
    async fn pipe_follow_up(&self, jid: &str, ctx: &MessageContext) {
        let since = self.agent_cursor(jid, ctx.last_agent_ts).await;
        let messages = match self.pending_messages(jid, since).await {
            Ok(m) => m,
            Err(e) => {
                warn!(jid, "Cannot read follow-up messages: {e:#}");
                return;
            }
        };
        let Some(newest) = messages.last().map(|m| m.timestamp) else {
            return;
        };

        let path = match self
            .deps
            .ipc
            .send_input(&ctx.group.folder, &format_transcript(&messages))
            .await
        {
            Ok(path) => path,
            Err(e) => {
                warn!(jid, "Cannot pipe follow-up messages: {e:#}");
                return;
            }
        };

        // held across the cursor update so the run cannot end in between
        let st = self.state.lock().await;
        if st.groups.get(jid).is_some_and(|gs| gs.running) {
            self.deps
                .state
                .lock()
                .await
                .advance_agent_timestamp(jid, newest);
            return;
        }
        drop(st);

        debug!(jid, "Sandbox exited before follow-up landed, withdrawing it");
        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!(jid, "Cannot withdraw follow-up {}: {e}", path.display());
        }
    }

    async fn pending_messages(
        &self,
        jid: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>> {
        let messages = self.deps.db.messages_since(jid, since).await?;
        Ok(messages.into_iter().filter(|m| !m.is_from_me).collect())
    }

    /// The later of the caller's cursor and the shared one.
    async fn agent_cursor(
        &self,
        jid: &str,
        given: Option<DateTime<Utc>>,
    ) -> Option<DateTime<Utc>> {
        let shared = self.deps.state.lock().await.last_agent_timestamp.get(jid).copied();
        match (given, shared) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    /// Puts a failed batch back so the next turn sees it again, unless
    /// follow-ups already moved the cursor further.
    async fn rewind_cursor(&self, jid: &str, newest: DateTime<Utc>, since: Option<DateTime<Utc>>) {
        let mut state = self.deps.state.lock().await;
        if state.last_agent_timestamp.get(jid) != Some(&newest) {
            return;
        }
        match since {
            Some(ts) => state.last_agent_timestamp.insert(jid.to_string(), ts),
            None => state.last_agent_timestamp.remove(jid),
        };
    }

    async fn session_for(&self, folder: &str, given: Option<String>) -> Option<String> {
        self.deps
            .state
            .lock()
            .await
            .sessions
            .get(folder)
            .cloned()
            .or(given)
    }
}

/// `nanogridbot-{folder}-{8 hex}` restricted to runtime-safe characters.
fn container_name(folder: &str) -> String {
    let safe: String = folder
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("nanogridbot-{safe}-{}", &id[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TaskStatus;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::{mpsc, Semaphore};

    // ── fakes ─────────────────────────────────────────

    #[derive(Default)]
    struct FakeDb {
        messages: StdMutex<Vec<Message>>,
        fail_remaining: AtomicU32,
        calls: AtomicU32,
    }

    impl FakeDb {
        fn push(&self, jid: &str, id: &str, secs: i64) {
            self.messages.lock().unwrap().push(Message {
                id: id.to_string(),
                chat_jid: jid.to_string(),
                sender: "tg:7".to_string(),
                sender_name: "Alice".to_string(),
                content: format!("@Grid {id}"),
                timestamp: DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap(),
                is_from_me: false,
            });
        }
    }

    #[async_trait::async_trait]
    impl Database for FakeDb {
        async fn messages_since(
            &self,
            jid: &str,
            since: Option<DateTime<Utc>>,
        ) -> Result<Vec<Message>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .fail_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                anyhow::bail!("database unavailable");
            }
            Ok(self
                .messages
                .lock()
                .unwrap()
                .iter()
                .filter(|m| m.chat_jid == jid && since.map_or(true, |s| m.timestamp > s))
                .cloned()
                .collect())
        }

        async fn new_messages_since(&self, _: Option<DateTime<Utc>>) -> Result<Vec<Message>> {
            Ok(Vec::new())
        }

        async fn registered_groups(&self) -> Result<HashMap<String, Group>> {
            Ok(HashMap::new())
        }

        async fn load_router_state(&self) -> Result<RouterState> {
            Ok(RouterState::default())
        }

        async fn save_router_state(&self, _: &RouterState) -> Result<()> {
            Ok(())
        }

        async fn due_tasks(&self, _: DateTime<Utc>) -> Result<Vec<ScheduledTaskRequest>> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct FakeRouter {
        sent: StdMutex<Vec<(String, String)>>,
    }

    #[async_trait::async_trait]
    impl Router for FakeRouter {
        async fn deliver(&self, jid: &str, text: &str) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((jid.to_string(), text.to_string()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct Tracker {
        running: HashMap<String, usize>,
        global: usize,
        max_global: usize,
        overlap: bool,
        runs: Vec<(String, String, Option<String>)>,
    }

    struct FakeExecutor {
        gate: Option<Arc<Semaphore>>,
        started: mpsc::UnboundedSender<String>,
        tracker: StdMutex<Tracker>,
    }

    #[async_trait::async_trait]
    impl Executor for FakeExecutor {
        async fn run(&self, request: ExecutionRequest) -> ExecutionResult {
            {
                let mut t = self.tracker.lock().unwrap();
                let n = t.running.entry(request.group_folder.clone()).or_default();
                *n += 1;
                if *n > 1 {
                    t.overlap = true;
                }
                t.global += 1;
                t.max_global = t.max_global.max(t.global);
                t.runs.push((
                    request.group_folder.clone(),
                    request.prompt.clone(),
                    request.session_id.clone(),
                ));
            }
            let _ = self.started.send(request.group_folder.clone());
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            tokio::task::yield_now().await;
            {
                let mut t = self.tracker.lock().unwrap();
                *t.running.get_mut(&request.group_folder).unwrap() -= 1;
                t.global -= 1;
            }
            ExecutionResult {
                new_session_id: Some(format!("sess-{}", request.group_folder)),
                ..ExecutionResult::success(format!("reply for {}", request.group_folder))
            }
        }
    }

    struct Harness {
        queue: GroupQueue,
        db: Arc<FakeDb>,
        router: Arc<FakeRouter>,
        exec: Arc<FakeExecutor>,
        gate: Arc<Semaphore>,
        started: mpsc::UnboundedReceiver<String>,
        state: Arc<Mutex<RouterState>>,
        ipc: IpcChannel,
        _dir: tempfile::TempDir,
    }

    fn harness(max_concurrent: usize, gated: bool) -> Harness {
        harness_with_retry_delay(max_concurrent, gated, Duration::from_millis(1))
    }

    fn harness_with_retry_delay(max_concurrent: usize, gated: bool, retry: Duration) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().to_path_buf();
        std::fs::create_dir_all(project.join("groups")).unwrap();
        let validator = MountValidator::new(
            project.clone(),
            project.join("groups"),
            project.join("data"),
            project.join("store"),
        )
        .with_non_primary_confinement(false);

        let gate = Arc::new(Semaphore::new(0));
        let (tx, rx) = mpsc::unbounded_channel();
        let exec = Arc::new(FakeExecutor {
            gate: gated.then(|| gate.clone()),
            started: tx,
            tracker: StdMutex::new(Tracker::default()),
        });
        let db = Arc::new(FakeDb::default());
        let router = Arc::new(FakeRouter::default());
        let state = Arc::new(Mutex::new(RouterState::default()));
        let ipc = IpcChannel::new(&project.join("data/ipc"));

        let queue = GroupQueue::new(
            QueueSettings {
                max_concurrent,
                max_retries: 5,
                retry_base_delay: retry,
                default_timeout: Duration::from_secs(30),
                default_max_output_bytes: 1024,
            },
            QueueDeps {
                db: db.clone(),
                router: router.clone(),
                executor: exec.clone(),
                validator: Arc::new(validator),
                ipc: ipc.clone(),
                state: state.clone(),
            },
        );

        Harness {
            queue,
            db,
            router,
            exec,
            gate,
            started: rx,
            state,
            ipc,
            _dir: dir,
        }
    }

    fn group(folder: &str) -> Group {
        Group {
            name: folder.to_string(),
            folder: folder.to_string(),
            trigger: None,
            requires_trigger: false,
            is_primary: false,
            execution: None,
        }
    }

    fn task(id: &str, folder: &str, mode: ContextMode) -> ScheduledTaskRequest {
        ScheduledTaskRequest {
            id: id.to_string(),
            group_folder: folder.to_string(),
            prompt: format!("task {id}"),
            schedule: "0 9 * * *".to_string(),
            status: TaskStatus::Active,
            next_run: Utc::now(),
            context_mode: mode,
            chat_jid: None,
        }
    }

    // ── tests ─────────────────────────────────────────

    #[tokio::test]
    async fn test_message_turn_delivers_and_updates_state() {
        let h = harness(2, false);
        h.db.push("tg:a", "m1", 1);
        h.db.push("tg:a", "m2", 2);

        h.queue
            .submit_message_activity("tg:a", &group("grpA"), None, None)
            .await;
        h.queue.wait_idle().await;

        let sent = h.router.sent.lock().unwrap().clone();
        assert_eq!(sent, vec![("tg:a".to_string(), "reply for grpA".to_string())]);

        let runs = &h.exec.tracker.lock().unwrap().runs;
        assert_eq!(runs.len(), 1);
        assert!(runs[0].1.contains("@Grid m1"));
        assert!(runs[0].1.contains("@Grid m2"));

        let state = h.state.lock().await;
        assert_eq!(state.sessions.get("grpA").map(String::as_str), Some("sess-grpA"));
        assert_eq!(
            state.last_agent_timestamp.get("tg:a").copied(),
            DateTime::from_timestamp(1_700_000_002, 0)
        );
    }

    #[tokio::test]
    async fn test_no_new_messages_skips_execution() {
        let h = harness(2, false);
        h.queue
            .submit_message_activity("tg:a", &group("grpA"), None, None)
            .await;
        h.queue.wait_idle().await;
        assert!(h.exec.tracker.lock().unwrap().runs.is_empty());
        assert!(!h.queue.snapshot().await.groups[0].active);
    }

    #[tokio::test]
    async fn test_ceiling_parks_third_group() {
        let mut h = harness(2, true);
        for (jid, folder) in [("tg:1", "one"), ("tg:2", "two"), ("tg:b", "grpB")] {
            h.db.push(jid, "hello", 1);
            h.queue
                .submit_message_activity(jid, &group(folder), None, None)
                .await;
        }
        h.started.recv().await.unwrap();
        h.started.recv().await.unwrap();

        let snap = h.queue.snapshot().await;
        assert_eq!(snap.active_count, 2);
        assert_eq!(snap.waiting, vec!["tg:b".to_string()]);
        let grp_b = snap.groups.iter().find(|g| g.jid == "tg:b").unwrap();
        assert!(!grp_b.active);
        assert!(grp_b.pending_messages);

        h.gate.add_permits(3);
        h.queue.wait_idle().await;

        let t = h.exec.tracker.lock().unwrap();
        assert_eq!(t.runs.len(), 3);
        assert!(t.max_global <= 2);
        assert!(!t.overlap);
        assert!(h.queue.inner.state.try_lock().unwrap().waiting.is_empty());
    }

    #[tokio::test]
    async fn test_waiting_groups_wake_in_fifo_order() {
        let mut h = harness(1, true);
        for (jid, folder) in [("tg:1", "first"), ("tg:2", "second"), ("tg:3", "third")] {
            h.db.push(jid, "hi", 1);
            h.queue
                .submit_message_activity(jid, &group(folder), None, None)
                .await;
        }
        assert_eq!(h.started.recv().await.unwrap(), "first");
        h.gate.add_permits(1);
        assert_eq!(h.started.recv().await.unwrap(), "second");
        h.gate.add_permits(1);
        assert_eq!(h.started.recv().await.unwrap(), "third");
        h.gate.add_permits(1);
        h.queue.wait_idle().await;
        assert_eq!(h.exec.tracker.lock().unwrap().max_global, 1);
    }

    #[tokio::test]
    async fn test_active_group_gets_follow_up_piped() {
        let mut h = harness(2, true);
        h.db.push("tg:a", "m1", 1);
        h.queue
            .submit_message_activity("tg:a", &group("grpA"), None, None)
            .await;
        h.started.recv().await.unwrap();

        h.db.push("tg:a", "m2", 2);
        h.queue
            .submit_message_activity("tg:a", &group("grpA"), None, None)
            .await;

        let snap = h.queue.snapshot().await;
        assert_eq!(snap.active_count, 1);
        assert!(snap.groups[0].pending_messages);

        let files: Vec<_> = std::fs::read_dir(h.ipc.input_dir("grpA"))
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(files.len(), 1);
        let piped = std::fs::read_to_string(&files[0]).unwrap();
        assert!(piped.contains("@Grid m2"));
        assert!(!piped.contains("@Grid m1"));

        h.gate.add_permits(5);
        h.queue.wait_idle().await;
        // m2 went to the running sandbox, so the follow-up finds nothing new
        let t = h.exec.tracker.lock().unwrap();
        assert_eq!(t.runs.len(), 1);
        assert!(!t.overlap);
    }

    #[tokio::test]
    async fn test_follow_up_during_backoff_runs_with_retry() {
        let h = harness_with_retry_delay(2, false, Duration::from_millis(300));
        h.db.push("tg:a", "m1", 1);
        h.db.fail_remaining.store(1, Ordering::SeqCst);
        h.queue
            .submit_message_activity("tg:a", &group("grpA"), None, None)
            .await;

        // first attempt failed, the group now sits in backoff
        while h.queue.snapshot().await.groups[0].retry_count == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        h.db.push("tg:a", "m2", 2);
        h.queue
            .submit_message_activity("tg:a", &group("grpA"), None, None)
            .await;

        let snap = h.queue.snapshot().await;
        assert!(snap.groups[0].active);
        assert!(snap.groups[0].pending_messages);
        let piped = std::fs::read_dir(h.ipc.input_dir("grpA"))
            .map(|d| d.count())
            .unwrap_or(0);
        assert_eq!(piped, 0);

        h.queue.wait_idle().await;

        let t = h.exec.tracker.lock().unwrap();
        assert_eq!(t.runs.len(), 1);
        assert!(t.runs[0].1.contains("@Grid m1"));
        assert!(t.runs[0].1.contains("@Grid m2"));
        assert_eq!(h.router.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_task_drains_before_follow_up() {
        let mut h = harness(2, true);
        h.db.push("tg:a", "m1", 1);
        h.queue
            .submit_message_activity("tg:a", &group("grpA"), None, None)
            .await;
        h.started.recv().await.unwrap();

        h.db.push("tg:a", "m2", 2);
        h.queue
            .submit_message_activity("tg:a", &group("grpA"), None, None)
            .await;
        h.queue
            .submit_scheduled_task("tg:a", &group("grpA"), task("t1", "grpA", ContextMode::Group), None)
            .await;
        // arrives after the pipe, so only the follow-up run can pick it up
        h.db.push("tg:a", "m3", 3);

        assert_eq!(h.queue.snapshot().await.groups[0].pending_tasks, 1);

        h.gate.add_permits(10);
        h.queue.wait_idle().await;

        let t = h.exec.tracker.lock().unwrap();
        let prompts: Vec<&str> = t.runs.iter().map(|r| r.1.as_str()).collect();
        assert_eq!(prompts.len(), 3);
        assert!(prompts[0].contains("@Grid m1"));
        assert_eq!(prompts[1], "task t1");
        assert!(prompts[2].contains("@Grid m3"));
        assert!(!t.overlap);
    }

    #[tokio::test]
    async fn test_newer_task_preempts_older_pending_task() {
        let mut h = harness(1, true);
        h.db.push("tg:a", "m1", 1);
        h.queue
            .submit_message_activity("tg:a", &group("grpA"), None, None)
            .await;
        h.started.recv().await.unwrap();

        for id in ["old", "new"] {
            h.queue
                .submit_scheduled_task("tg:a", &group("grpA"), task(id, "grpA", ContextMode::Group), None)
                .await;
        }
        h.gate.add_permits(10);
        h.queue.wait_idle().await;

        let t = h.exec.tracker.lock().unwrap();
        let prompts: Vec<&str> = t.runs.iter().skip(1).map(|r| r.1.as_str()).collect();
        assert_eq!(prompts, vec!["task new", "task old"]);
    }

    #[tokio::test]
    async fn test_task_context_modes() {
        let h = harness(2, false);
        h.state
            .lock()
            .await
            .sessions
            .insert("grpA".to_string(), "sess-existing".to_string());

        h.queue
            .submit_scheduled_task("tg:a", &group("grpA"), task("shared", "grpA", ContextMode::Group), None)
            .await;
        h.queue.wait_idle().await;
        h.queue
            .submit_scheduled_task("tg:a", &group("grpA"), task("fresh", "grpA", ContextMode::Isolated), None)
            .await;
        h.queue.wait_idle().await;

        let t = h.exec.tracker.lock().unwrap();
        assert_eq!(t.runs[0].2.as_deref(), Some("sess-existing"));
        assert_eq!(t.runs[1].2, None);
    }

    #[tokio::test]
    async fn test_task_delivers_to_explicit_target() {
        let h = harness(2, false);
        let mut t = task("t1", "grpA", ContextMode::Isolated);
        t.chat_jid = Some("tg:elsewhere".to_string());
        h.queue
            .submit_scheduled_task("tg:a", &group("grpA"), t, None)
            .await;
        h.queue.wait_idle().await;

        let sent = h.router.sent.lock().unwrap().clone();
        assert_eq!(sent[0].0, "tg:elsewhere");
    }

    #[tokio::test]
    async fn test_retries_stop_after_max_and_reset() {
        let h = harness(2, false);
        h.db.push("tg:a", "m1", 1);
        h.db.fail_remaining.store(100, Ordering::SeqCst);

        h.queue
            .submit_message_activity("tg:a", &group("grpA"), None, None)
            .await;
        h.queue.wait_idle().await;

        assert_eq!(h.db.calls.load(Ordering::SeqCst), 5);
        assert!(h.exec.tracker.lock().unwrap().runs.is_empty());
        let snap = h.queue.snapshot().await;
        assert_eq!(snap.groups[0].retry_count, 0);
        assert!(!snap.groups[0].active);
        assert_eq!(snap.active_count, 0);
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let h = harness(2, false);
        h.db.push("tg:a", "m1", 1);
        h.db.fail_remaining.store(2, Ordering::SeqCst);

        h.queue
            .submit_message_activity("tg:a", &group("grpA"), None, None)
            .await;
        h.queue.wait_idle().await;

        assert_eq!(h.db.calls.load(Ordering::SeqCst), 3);
        assert_eq!(h.router.sent.lock().unwrap().len(), 1);
        assert_eq!(h.queue.snapshot().await.groups[0].retry_count, 0);
    }

    #[tokio::test]
    async fn test_mount_failure_is_error_result_not_retry() {
        let h = harness(2, false);
        let mut g = group("grpA");
        g.execution = Some(crate::model::ExecutionConfig {
            additional_mounts: vec![crate::model::AdditionalMount {
                host_path: std::env::temp_dir(),
                container_path: "/workspace/extra/tmp".to_string(),
                readonly: true,
            }],
            ..Default::default()
        });
        h.db.push("tg:a", "m1", 1);

        h.queue.submit_message_activity("tg:a", &g, None, None).await;
        h.queue.wait_idle().await;

        assert_eq!(h.db.calls.load(Ordering::SeqCst), 1);
        assert!(h.exec.tracker.lock().unwrap().runs.is_empty());
        assert!(h.router.sent.lock().unwrap().is_empty());
        // cursor stays put so the next turn sees the messages again
        assert!(h.state.lock().await.last_agent_timestamp.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_stops_admissions_but_finishes_running() {
        let mut h = harness(2, true);
        h.db.push("tg:a", "m1", 1);
        h.queue
            .submit_message_activity("tg:a", &group("grpA"), None, None)
            .await;
        h.started.recv().await.unwrap();

        h.queue.shutdown().await;
        h.db.push("tg:b", "m1", 1);
        h.queue
            .submit_message_activity("tg:b", &group("grpB"), None, None)
            .await;
        assert_eq!(h.queue.snapshot().await.active_count, 1);

        h.gate.add_permits(5);
        h.queue.wait_idle().await;
        let t = h.exec.tracker.lock().unwrap();
        assert_eq!(t.runs.len(), 1);
        assert_eq!(t.runs[0].0, "grpA");
    }

    #[tokio::test]
    async fn test_close_input_only_when_active() {
        let mut h = harness(2, true);
        assert!(!h.queue.close_input("tg:a").await.unwrap());

        h.db.push("tg:a", "m1", 1);
        h.queue
            .submit_message_activity("tg:a", &group("grpA"), None, None)
            .await;
        h.started.recv().await.unwrap();
        assert!(h.queue.close_input("tg:a").await.unwrap());
        assert!(h.ipc.input_dir("grpA").join(crate::agent::ipc::CLOSE_SENTINEL).exists());

        h.gate.add_permits(1);
        h.queue.wait_idle().await;
    }

    #[test]
    fn test_container_name_is_safe_and_unique() {
        let a = container_name("family chat/ü");
        let b = container_name("family chat/ü");
        assert!(a.starts_with("nanogridbot-family-chat--"));
        assert!(a
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'));
        assert_ne!(a, b);
    }
}
