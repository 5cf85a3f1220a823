//! Typed run statistics.
//!
//! Owners hold these as `Option<_>`: `None` when stats are off, so nothing
//! is allocated or recorded in production runs.

use serde::Serialize;

use super::ids::WorkItemId;

/// What one producer run saw and did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProducerStats {
    pub institutions_cached: Vec<String>,
    pub items_cached: Vec<WorkItemId>,
    pub items_found: Vec<WorkItemId>,
    pub items_created: Vec<WorkItemId>,
    pub items_queued: Vec<WorkItemId>,
    pub objects_skipped: Vec<String>,
    pub errors: Vec<String>,
}

/// Per-pipeline outcome counts, keyed by item locator.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineStats {
    pub succeeded: Vec<String>,
    pub requeued: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
}
