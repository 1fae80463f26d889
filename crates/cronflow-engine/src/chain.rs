//! Downstream propagation along trigger edges.

use std::sync::Arc;

use tracing::{error, info, warn};

use cronflow_types::{Edge, RunStatus};

use crate::engine::Engine;
use crate::error::EngineError;
use crate::executor::RunRequest;

/// Edges a finished job fires, in edge-list order.
pub fn triggered_edges<'a>(edges: &'a [Edge], job_id: &str, status: RunStatus) -> Vec<&'a Edge> {
    edges
        .iter()
        .filter(|e| e.from == job_id && e.trigger)
        .filter(|e| !e.on_success || status == RunStatus::Success)
        .collect()
}

impl Engine {
    /// Start every job downstream of `job_id`. Runs are not awaited; a
    /// downstream failure to start is logged and does not stop its siblings.
    pub async fn on_job_completed(self: &Arc<Self>, job_id: &str, status: RunStatus, depth: u32) {
        if depth >= self.config.max_chain_depth {
            error!(
                job_id = %job_id,
                depth,
                max_depth = self.config.max_chain_depth,
                "Chain depth limit reached, not triggering downstream jobs"
            );
            return;
        }

        let edges = match self.store.list_edges().await {
            Ok(edges) => edges,
            Err(e) => {
                error!(job_id = %job_id, "Failed to load edges for chaining: {e}");
                return;
            }
        };

        for edge in triggered_edges(&edges, job_id, status) {
            match self.start_job(&edge.to, RunRequest::chained(depth + 1)).await {
                Ok(_) => info!(from = %job_id, to = %edge.to, depth = depth + 1, "Chained job started"),
                Err(EngineError::JobNotFound(_)) => {
                    warn!(edge = %edge.id, to = %edge.to, "Edge points at a deleted job, skipping");
                }
                Err(e) => error!(from = %job_id, to = %edge.to, "Failed to start chained job: {e}"),
            }
        }
    }
}
