//! `Metrics` trait: execution start/end reporting.
//!
//! Recording is best-effort: callers log and drop any error, so a
//! broken metrics backend can never change an execution's outcome.

use std::time::Duration;

use anyhow::Result;
use tracing::info;

use crate::sandbox::ExecutionStatus;

pub trait Metrics: Send + Sync {
    /// Records the start of an execution and returns its metric id.
    fn record_execution_start(&self, group: &str, channel: &str) -> Result<String>;

    fn record_execution_end(
        &self,
        id: &str,
        status: ExecutionStatus,
        duration: Duration,
        error: Option<&str>,
    ) -> Result<()>;
}

/// Emits metric events as tracing records under the `metrics` target.
pub struct TracingMetrics;

impl Metrics for TracingMetrics {
    fn record_execution_start(&self, group: &str, channel: &str) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        info!(target: "metrics", id = %id, group, channel, "execution_start");
        Ok(id)
    }

    fn record_execution_end(
        &self,
        id: &str,
        status: ExecutionStatus,
        duration: Duration,
        error: Option<&str>,
    ) -> Result<()> {
        info!(
            target: "metrics",
            id,
            status = status.as_str(),
            duration_ms = duration.as_millis() as u64,
            error = error.unwrap_or(""),
            "execution_end"
        );
        Ok(())
    }
}
