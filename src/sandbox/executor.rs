//! Container-backed executor.
//!
//! Launches `{runtime} run -i --rm ...` with no network, fixed
//! memory/CPU ceilings and one `-v` flag per validated mount, feeds it
//! the request on stdin and parses the marked result from its combined
//! output. All I/O uses tokio so a stuck sandbox only blocks its own
//! task.
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::protocol::{parse_output, SandboxInput};
use super::{ExecutionRequest, ExecutionResult, Executor};
use crate::config::SandboxConfig;
use crate::metrics::Metrics;
use crate::model::channel_of;

/// Env var telling the agent whether it runs for the primary group.
pub const ENV_IS_MAIN: &str = "NANOGRIDBOT_IS_MAIN";
/// Env var carrying the group folder name.
pub const ENV_GROUP_FOLDER: &str = "NANOGRIDBOT_GROUP_FOLDER";

/// How long to wait for output pipes after the process exits.
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Characters of trailing output quoted in error messages.
const ERROR_TAIL_CHARS: usize = 400;

const READ_CHUNK: usize = 8192;

pub struct SandboxExecutor {
    config: SandboxConfig,
    metrics: Arc<dyn Metrics>,
    log_root: Option<PathBuf>,
}

impl SandboxExecutor {
    pub fn new(config: SandboxConfig, metrics: Arc<dyn Metrics>) -> Self {
        Self {
            config,
            metrics,
            log_root: None,
        }
    }

    /// Writes one run log per execution under `{root}/{folder}/`.
    pub fn with_log_root(mut self, root: PathBuf) -> Self {
        self.log_root = Some(root);
        self
    }

    /// Arguments passed to the container runtime for one request.
    pub fn build_args(&self, request: &ExecutionRequest) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "-i".into(),
            "--rm".into(),
            "--name".into(),
            request.container_name.clone(),
            "--network".into(),
            "none".into(),
            "--memory".into(),
            self.config.memory.clone(),
            "--cpus".into(),
            self.config.cpus.clone(),
            "--stop-timeout".into(),
            request.timeout.as_secs().max(1).to_string(),
        ];

        for mount in &request.mounts {
            let mut spec = format!("{}:{}", mount.host_path.display(), mount.container_path);
            if mount.is_readonly() {
                spec.push_str(":ro");
            }
            args.push("-v".into());
            args.push(spec);
        }

        args.push("-e".into());
        args.push(format!(
            "{ENV_IS_MAIN}={}",
            if request.is_primary { "1" } else { "0" }
        ));
        args.push("-e".into());
        args.push(format!("{ENV_GROUP_FOLDER}={}", request.group_folder));

        for (name, value) in &request.env {
            if !is_valid_env_name(name) {
                warn!(folder = %request.group_folder, "Skipping invalid env var name {name:?}");
                continue;
            }
            args.push("-e".into());
            args.push(format!("{name}={value}"));
        }

        args.push(self.config.image.clone());
        args
    }

    async fn execute(&self, request: &ExecutionRequest) -> ExecutionResult {
        let input = SandboxInput {
            prompt: &request.prompt,
            session_id: request.session_id.as_deref(),
            group_folder: &request.group_folder,
            chat_jid: &request.chat_jid,
            is_main: request.is_primary,
        };
        let payload = match serde_json::to_string(&input) {
            Ok(p) => p,
            Err(e) => return ExecutionResult::error(format!("Cannot encode sandbox input: {e}")),
        };

        let mut cmd = Command::new(&self.config.runtime);
        cmd.args(self.build_args(request));

        info!(
            folder = %request.group_folder,
            container = %request.container_name,
            mounts = request.mounts.len(),
            "Starting sandbox"
        );

        let started = Instant::now();
        let stop = self.stop_command(&request.container_name);
        let outcome = run_process(
            cmd,
            &payload,
            request.timeout,
            request.max_output_bytes,
            Some(stop),
        )
        .await;
        let elapsed = started.elapsed();

        let result = match outcome {
            Err(e) if e.kind() == io::ErrorKind::NotFound => ExecutionResult::error(format!(
                "Container runtime '{}' is not installed",
                self.config.runtime
            )),
            Err(e) => ExecutionResult::error(format!("Sandbox launch failed: {e}")),
            Ok(ProcessOutcome::TimedOut { output }) => {
                error!(
                    folder = %request.group_folder,
                    container = %request.container_name,
                    "Sandbox timed out after {}s",
                    request.timeout.as_secs()
                );
                self.write_run_log(request, elapsed, "timeout", &output).await;
                ExecutionResult::error(format!(
                    "Sandbox timed out after {}s",
                    request.timeout.as_secs()
                ))
            }
            Ok(ProcessOutcome::Exited {
                code,
                stdout,
                output,
                truncated,
            }) => {
                if truncated {
                    warn!(
                        folder = %request.group_folder,
                        "Sandbox output exceeded {} bytes, truncated",
                        request.max_output_bytes
                    );
                }
                let exit = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
                self.write_run_log(request, elapsed, &exit, &output).await;
                interpret_output(code, &stdout, &output)
            }
        };

        info!(
            folder = %request.group_folder,
            status = result.status.as_str(),
            duration_ms = elapsed.as_millis() as u64,
            "Sandbox finished"
        );
        result
    }

    /// `{runtime} stop {name}`, issued on timeout before the client is killed.
    fn stop_command(&self, name: &str) -> Command {
        let mut cmd = Command::new(&self.config.runtime);
        cmd.args(["stop", name]);
        cmd
    }

    async fn write_run_log(
        &self,
        request: &ExecutionRequest,
        elapsed: Duration,
        exit: &str,
        output: &str,
    ) {
        let Some(root) = &self.log_root else {
            return;
        };
        let dir = root.join(&request.group_folder);
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let path = dir.join(format!("run-{stamp}.log"));

        let mut text = format!(
            "=== Sandbox run ===\n\
             Timestamp: {}\n\
             Group: {}\n\
             Container: {}\n\
             Primary: {}\n\
             Duration: {}ms\n\
             Exit: {exit}\n\
             Prompt length: {} chars\n\
             Session: {}\n\n=== Mounts ===\n",
            chrono::Utc::now().to_rfc3339(),
            request.group_folder,
            request.container_name,
            request.is_primary,
            elapsed.as_millis(),
            request.prompt.chars().count(),
            request.session_id.as_deref().unwrap_or("new"),
        );
        for m in &request.mounts {
            text.push_str(&format!(
                "{} -> {}{}\n",
                m.host_path.display(),
                m.container_path,
                if m.is_readonly() { " (ro)" } else { "" }
            ));
        }
        text.push_str("\n=== Output ===\n");
        text.push_str(output);

        if let Err(e) = write_file(&dir, &path, &text).await {
            warn!("Cannot write run log {}: {e}", path.display());
        }
    }
}

#[async_trait]
impl Executor for SandboxExecutor {
    async fn run(&self, request: ExecutionRequest) -> ExecutionResult {
        let metric_id = match self
            .metrics
            .record_execution_start(&request.group_folder, channel_of(&request.chat_jid))
        {
            Ok(id) => Some(id),
            Err(e) => {
                debug!("Metrics start failed: {e}");
                None
            }
        };

        let started = Instant::now();
        let result = self.execute(&request).await;

        if let Some(id) = metric_id {
            if let Err(e) = self.metrics.record_execution_end(
                &id,
                result.status,
                started.elapsed(),
                result.error.as_deref(),
            ) {
                debug!("Metrics end failed: {e}");
            }
        }

        result
    }
}

/// Maps raw process output to a result. Markers are looked for on
/// stdout first so stderr chatter cannot split the payload; agents that
/// print them elsewhere are still found in the combined stream.
fn interpret_output(code: Option<i32>, stdout: &str, output: &str) -> ExecutionResult {
    if let Some(result) = parse_output(stdout).or_else(|| parse_output(output)) {
        return result;
    }
    match code {
        Some(0) => ExecutionResult::error("Sandbox produced no output"),
        _ => {
            let exit = code.map_or_else(|| "signal".to_string(), |c| format!("code {c}"));
            ExecutionResult::error(format!(
                "Sandbox exited with {exit} and no output: {}",
                tail(output, ERROR_TAIL_CHARS)
            ))
        }
    }
}

fn tail(text: &str, max_chars: usize) -> &str {
    let trimmed = text.trim_end();
    let count = trimmed.chars().count();
    if count <= max_chars {
        return trimmed;
    }
    let skip = count - max_chars;
    let start = trimmed
        .char_indices()
        .nth(skip)
        .map(|(i, _)| i)
        .unwrap_or(0);
    &trimmed[start..]
}

fn is_valid_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

async fn write_file(dir: &Path, path: &Path, text: &str) -> io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::write(path, text).await
}

#[derive(Debug)]
pub(crate) enum ProcessOutcome {
    Exited {
        code: Option<i32>,
        /// Stdout alone
        stdout: String,
        /// Stdout and stderr interleaved, for the run log
        output: String,
        truncated: bool,
    },
    TimedOut {
        output: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

/// Sandbox output, each view capped at `limit` bytes.
struct Capture {
    stdout: Vec<u8>,
    combined: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl Capture {
    fn new(limit: usize) -> Self {
        Self {
            stdout: Vec::new(),
            combined: Vec::new(),
            limit,
            truncated: false,
        }
    }

    fn push(&mut self, stream: Stream, chunk: &[u8]) {
        if stream == Stream::Stdout {
            self.truncated |= append_capped(&mut self.stdout, chunk, self.limit);
        }
        self.truncated |= append_capped(&mut self.combined, chunk, self.limit);
    }
}

/// Appends what fits; true if anything was cut.
fn append_capped(buf: &mut Vec<u8>, chunk: &[u8], limit: usize) -> bool {
    let room = limit.saturating_sub(buf.len());
    let take = chunk.len().min(room);
    buf.extend_from_slice(&chunk[..take]);
    chunk.len() > room
}

async fn pump<R: AsyncRead + Unpin>(mut reader: R, stream: Stream, capture: Arc<Mutex<Capture>>) {
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => capture.lock().await.push(stream, &chunk[..n]),
            Err(e) => {
                debug!("Sandbox output read failed: {e}");
                break;
            }
        }
    }
}

/// Spawns `cmd`, writes `input` to its stdin, closes it, and collects
/// its output until exit. On timeout `stop` (if any) is issued, then the
/// process is killed and reaped before returning.
pub(crate) async fn run_process(
    mut cmd: Command,
    input: &str,
    timeout: Duration,
    max_output: usize,
    stop: Option<Command>,
) -> io::Result<ProcessOutcome> {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = cmd.spawn()?;

    let capture = Arc::new(Mutex::new(Capture::new(max_output)));
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(pump(stdout, Stream::Stdout, capture.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(pump(stderr, Stream::Stderr, capture.clone())));
    }

    let stdin = child.stdin.take();
    let exchange = async {
        if let Some(mut stdin) = stdin {
            // The agent may exit without reading; a broken pipe is not fatal.
            if let Err(e) = stdin.write_all(input.as_bytes()).await {
                debug!("Writing sandbox stdin failed: {e}");
            }
            drop(stdin);
        }
        child.wait().await
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(status) => {
            let status = status?;
            let drain = async {
                for reader in readers.iter_mut() {
                    let _ = reader.await;
                }
            };
            if tokio::time::timeout(PIPE_DRAIN_GRACE, drain).await.is_err() {
                for reader in &readers {
                    reader.abort();
                }
            }
            let capture = capture.lock().await;
            Ok(ProcessOutcome::Exited {
                code: status.code(),
                stdout: String::from_utf8_lossy(&capture.stdout).into_owned(),
                output: String::from_utf8_lossy(&capture.combined).into_owned(),
                truncated: capture.truncated,
            })
        }
        Err(_) => {
            if let Some(stop) = stop {
                issue_stop(stop);
            }
            if let Err(e) = child.kill().await {
                warn!("Killing timed-out sandbox failed: {e}");
            }
            for reader in &readers {
                reader.abort();
            }
            let capture = capture.lock().await;
            Ok(ProcessOutcome::TimedOut {
                output: String::from_utf8_lossy(&capture.combined).into_owned(),
            })
        }
    }
}

/// Starts the stop command right away and reaps it in the background.
fn issue_stop(mut cmd: Command) {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    match cmd.spawn() {
        Ok(mut child) => {
            tokio::spawn(async move {
                match child.wait().await {
                    Ok(status) if status.success() => debug!("Sandbox stopped"),
                    Ok(status) => debug!("Stop command exited with {status}"),
                    Err(e) => debug!("Stop command failed: {e}"),
                }
            });
        }
        Err(e) => debug!("Cannot issue stop command: {e}"),
    }
}
