//! Built-in jobs shipped with the daemon.

use std::sync::Arc;

use serde_json::json;
use tracing::info;

use flywheel_scheduler::JobRegistry;

/// Periodic liveness job — proves the queue end to end on a fresh install.
pub const HEARTBEAT_JOB: &str = "heartbeat";
pub const HEARTBEAT_INTERVAL_MINUTES: i64 = 1;

/// Register every built-in job. Call before the engine starts.
pub fn register_builtin(registry: &Arc<JobRegistry>) {
    registry.register_async(HEARTBEAT_JOB, Some(HEARTBEAT_INTERVAL_MINUTES), |_args| {
        Box::pin(async {
            let beat = chrono::Utc::now().to_rfc3339();
            info!(at = %beat, "heartbeat");
            Ok(json!({ "beat": beat }))
        })
    });
}
