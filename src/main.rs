mod agent;
mod backoff;
mod config;
mod metrics;
mod model;
mod router;
mod sandbox;
mod store;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::agent::ipc::IpcChannel;
use crate::agent::queue::{GroupQueue, QueueDeps, QueueSettings};
use crate::agent::runtime::AgentRuntime;
use crate::config::Config;
use crate::metrics::TracingMetrics;
use crate::router::OutboxRouter;
use crate::sandbox::{MountValidator, SandboxExecutor};
use crate::store::{Database, JsonStore, RouterState};

fn print_help() {
    println!(
        "\
nanogridbot v{}

Per-group agent orchestration: polls chat activity, runs each group's
agent in an isolated container, and hands replies back to the adapters.

USAGE:
    nanogridbot [OPTIONS] [CONFIG_PATH]

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file [default: config/nanogridbot.toml]

OPTIONS:
    -h, --help       Print this help message and exit
    -V, --version    Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG    Log level filter for tracing
                (e.g. debug, nanogridbot=debug,metrics=info)

EXAMPLES:
    nanogridbot                               # uses config/nanogridbot.toml
    nanogridbot /etc/nanogridbot/config.toml  # custom config path
    RUST_LOG=debug nanogridbot                # with debug logging",
        env!("CARGO_PKG_VERSION"),
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --help / --version before anything else
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("nanogridbot v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {}
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("nanogridbot=info,metrics=info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/nanogridbot.toml".to_string());

    info!("Loading configuration from {config_path}");
    let config = Config::load(&config_path)?;

    info!("Assistant: {}", config.assistant.name);
    info!(
        "Sandbox: {} ({}, {} memory, {} cpus)",
        config.sandbox.runtime, config.sandbox.image, config.sandbox.memory, config.sandbox.cpus
    );
    info!(
        "Queue: {} concurrent, {} retries",
        config.queue.max_concurrent, config.queue.max_retries
    );

    let data_root = config.paths.data_root();
    let store = Arc::new(JsonStore::open(&config.paths.store_root())?);
    let router = Arc::new(OutboxRouter::new(&data_root.join("outbox")));
    let executor = Arc::new(
        SandboxExecutor::new(config.sandbox.clone(), Arc::new(TracingMetrics))
            .with_log_root(data_root.join("logs")),
    );
    let validator = Arc::new(MountValidator::from_config(&config));
    let ipc = IpcChannel::new(&data_root.join("ipc"));
    let state = Arc::new(Mutex::new(RouterState::default()));

    warn_unreachable_groups(store.as_ref(), &validator).await;

    let queue = GroupQueue::new(
        QueueSettings::from_config(&config),
        QueueDeps {
            db: store.clone(),
            router: router.clone(),
            executor,
            validator,
            ipc: ipc.clone(),
            state: state.clone(),
        },
    );
    let runtime = AgentRuntime::new(&config, store, router, queue.clone(), ipc, state)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut loop_task = tokio::spawn(async move { runtime.run(shutdown_rx).await });

    tokio::select! {
        result = &mut loop_task => {
            // the loop only returns on its own after a startup failure
            return match result {
                Ok(r) => r,
                Err(e) => Err(e.into()),
            };
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, stopping");
        }
    }

    let _ = shutdown_tx.send(true);
    queue.shutdown().await;

    match loop_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Driving loop ended with error: {e:#}"),
        Err(e) => error!("Driving loop panicked: {e}"),
    }

    let snapshot = queue.snapshot().await;
    if snapshot.active_count > 0 {
        info!(
            "Waiting for {} in-flight execution(s) to finish",
            snapshot.active_count
        );
    }
    queue.wait_idle().await;

    let leftover = queue.snapshot().await;
    let pending: Vec<&str> = leftover
        .groups
        .iter()
        .filter(|g| g.pending_messages || g.pending_tasks > 0)
        .map(|g| g.jid.as_str())
        .collect();
    if !pending.is_empty() {
        warn!("Unstarted work left for: {}", pending.join(", "));
    }

    info!("Shutdown complete");
    Ok(())
}

/// With confinement on, a non-primary group can only run if its
/// session and IPC directories sit under the groups root.
async fn warn_unreachable_groups(db: &dyn Database, validator: &MountValidator) {
    if !validator.confines_non_primary() {
        return;
    }
    let groups = match db.registered_groups().await {
        Ok(g) => g,
        Err(e) => {
            warn!("Cannot read registered groups: {e:#}");
            return;
        }
    };
    for group in groups.values().filter(|g| !g.is_primary) {
        if !validator.session_dir(&group.folder).starts_with(validator.groups_root())
            || !validator.ipc_dir(&group.folder).starts_with(validator.groups_root())
        {
            warn!(
                folder = %group.folder,
                "Non-primary group cannot pass mount validation while mounts.confine_non_primary \
                 is on; set it to false or move data_dir under groups_dir"
            );
        }
    }
}
