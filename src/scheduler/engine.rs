use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, error, info};

use crate::orchestrator::{ExecutionOrchestrator, RequestContext, SchedulingFailure, StartRequest};

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub attempted: usize,
    pub started: usize,
    /// Still PENDING, or in flight elsewhere.
    pub deferred: usize,
    pub failed: usize,
}

/// Re-issue a primary start for every PENDING execution below the attempt cap.
pub async fn sweep_pending(orch: &ExecutionOrchestrator, max_attempts: u32) -> Result<SweepStats> {
    let ids = orch.store().pending_for_retry(max_attempts).await?;
    let ctx = RequestContext::system();
    let mut stats = SweepStats::default();

    for id in ids {
        stats.attempted += 1;
        let req = StartRequest {
            execution_id: id,
            node_ids: Vec::new(),
            broadcast: true,
            shard_plan: None,
        };
        match orch.start(&ctx, req).await {
            Ok(outcomes) if outcomes.iter().any(|o| o.success) => stats.started += 1,
            Ok(_) => stats.deferred += 1,
            Err(e) if e.is_transient() || matches!(e, SchedulingFailure::InFlight(_)) => {
                debug!(execution_id = id, reason = %e, "retry deferred");
                stats.deferred += 1;
            }
            Err(e) => {
                error!(execution_id = id, error = %e, "retry failed");
                stats.failed += 1;
            }
        }
    }
    Ok(stats)
}

/// Sweep forever at `interval`.
pub async fn run_retry_loop(orch: Arc<ExecutionOrchestrator>, interval: Duration, max_attempts: u32) {
    info!(interval_secs = interval.as_secs(), "pending retry loop started");

    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;

        match sweep_pending(&orch, max_attempts).await {
            Ok(stats) if stats.attempted > 0 => {
                info!(
                    attempted = stats.attempted,
                    started = stats.started,
                    deferred = stats.deferred,
                    failed = stats.failed,
                    "pending sweep finished"
                );
            }
            Ok(_) => {}
            Err(e) => error!("pending sweep failed: {}", e),
        }
    }
}
