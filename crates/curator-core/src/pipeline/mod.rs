//! Staged pipeline workers.
//!
//! A pipeline is a `MessageHandler` in front of a chain of bounded
//! channels. The handler loads and leases the work item, takes over the
//! message response, and pushes a [`Task`] into the first stage. Each stage
//! is drained by a fixed [`StagePool`]; a stage that records an error sends
//! the task straight to the finish pool, which persists the outcome,
//! routes the item onward and answers the message exactly once.
//!
//! | pipeline | topic | stages |
//! |---|---|---|
//! | fetch | fetch | fetch, validate, finish |
//! | store | store | store, finish |
//! | record | record | record, cleanup, finish |
//! | fixity | fixity | fetch+checksum, record, finish |
//! | delete | file_delete | delete, record, finish |
//! | cold_restore | cold_restore | request, finish |
//! | restore | restore | fetch, package, copy, record, finish |
//! | replication | replication | copy, validate, record, finish |

pub mod cold_restore;
pub mod delete;
pub mod fetch;
pub mod finish;
pub mod fixity;
pub mod lease;
pub mod record;
pub mod replication;
pub mod restore;
pub mod stage;
pub mod store;
#[cfg(test)]
mod testing;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::config::{CuratorConfig, PreservationConfig, WorkerConfig};
use crate::domain::{
    Decider, DefaultDecider, Lifecycle, PipelineStats, Stage, TaskEnvelope, WorkItem, WorkerIdentity,
};
use crate::error::CuratorError;
use crate::jsonlog::JsonLog;
use crate::ports::{Clock, IdGenerator, ObjectStore, QueueBroker, QueueMessage, Registry};

pub use self::cold_restore::ColdRestorePipeline;
pub use self::delete::DeletePipeline;
pub use self::fetch::FetchPipeline;
pub use self::fixity::FixityPipeline;
pub use self::lease::LeaseCheck;
pub use self::record::RecordPipeline;
pub use self::replication::ReplicationPipeline;
pub use self::restore::RestorePipeline;
pub use self::stage::StagePool;
pub use self::store::StorePipeline;

/// Collaborators shared by every pipeline on a node.
#[derive(Clone)]
pub struct Services {
    pub registry: Arc<dyn Registry>,
    pub broker: Arc<dyn QueueBroker>,
    pub storage: Arc<dyn ObjectStore>,
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdGenerator>,
    pub identity: WorkerIdentity,
    pub json_log: Option<Arc<JsonLog>>,
}

/// Per-pipeline state: configuration, decider, the set of items this
/// instance is working on, and optional stats.
pub struct PipelineContext {
    pub services: Services,
    pub worker: WorkerConfig,
    pub preservation: PreservationConfig,
    pub staging_dir: PathBuf,
    pub lease_expiry: Option<chrono::Duration>,
    pub fixity_max_days: i64,
    decider: Arc<dyn Decider>,
    in_flight: Mutex<HashSet<String>>,
    stats: Option<Mutex<PipelineStats>>,
}

impl PipelineContext {
    pub fn new(services: Services, config: &CuratorConfig, worker: WorkerConfig) -> Self {
        let decider = Arc::new(DefaultDecider::new(worker.retry_policy()));
        Self {
            services,
            preservation: config.preservation.clone(),
            staging_dir: config.staging_dir.clone(),
            lease_expiry: config.lease_expiry(),
            fixity_max_days: config.fixity.max_days,
            stats: config.collect_stats.then(|| Mutex::new(PipelineStats::default())),
            decider,
            worker,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = decider;
        self
    }

    pub fn registry(&self) -> &dyn Registry {
        self.services.registry.as_ref()
    }

    pub fn storage(&self) -> &dyn ObjectStore {
        self.services.storage.as_ref()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.services.clock.now()
    }

    pub fn decider(&self) -> &dyn Decider {
        self.decider.as_ref()
    }

    /// Snapshot of the stats, `None` when collection is off.
    pub fn stats(&self) -> Option<PipelineStats> {
        self.stats
            .as_ref()
            .and_then(|s| s.lock().ok().map(|guard| guard.clone()))
    }

    pub(crate) fn count(&self, update: impl FnOnce(&mut PipelineStats)) {
        if let Some(stats) = &self.stats {
            if let Ok(mut guard) = stats.lock() {
                update(&mut guard);
            }
        }
    }

    /// Adds `key` to the in-flight set; false if it was already there.
    pub(crate) fn enter_in_flight(&self, key: &str) -> bool {
        self.in_flight
            .lock()
            .map(|mut set| set.insert(key.to_string()))
            .unwrap_or(false)
    }

    pub(crate) fn is_in_flight(&self, key: &str) -> bool {
        self.in_flight
            .lock()
            .map(|set| set.contains(key))
            .unwrap_or(false)
    }

    pub(crate) fn leave_in_flight(&self, key: &str) {
        if let Ok(mut set) = self.in_flight.lock() {
            set.remove(key);
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().map(|set| set.len()).unwrap_or(0)
    }

    /// Extends the message's visibility timeout between units of work.
    pub async fn touch(&self, message: &dyn QueueMessage) {
        if let Err(err) = message.touch().await {
            warn!(message = %message.id(), error = %err, "touch failed");
        }
    }

    pub(crate) fn write_json_log<T: Serialize>(&self, marker: &str, record: &T) {
        if let Some(log) = &self.services.json_log {
            if let Err(err) = log.write_record(marker, record) {
                warn!(error = %err, "cannot write json log record");
            }
        }
    }
}

/// An envelope travelling through the stages with the message it came in.
pub struct Task<P> {
    pub envelope: TaskEnvelope<P>,
    pub message: Arc<dyn QueueMessage>,
    /// Position the item was routed at when this delivery claimed it.
    pub entry_stage: Stage,
    /// Delivery attempt, derived from the saved stage summaries.
    pub attempt: u16,
    /// Stages run during this delivery, in order.
    pub ran: Vec<Stage>,
    /// Set by a stage that found nothing to do yet: the finish pool
    /// requeues after the delay, with the note, without counting an attempt.
    pub wait: Option<(std::time::Duration, String)>,
    /// Set by a stage that found the work withdrawn upstream.
    pub cancelled: Option<String>,
}

impl<P> Task<P> {
    pub fn item(&self) -> &WorkItem {
        &self.envelope.item
    }

    /// Errors recorded by the stages of this delivery.
    pub fn has_errors(&self) -> bool {
        self.ran
            .iter()
            .any(|stage| self.envelope.results.get(*stage).is_some_and(|s| s.has_errors()))
    }

    pub fn has_fatal_errors(&self) -> bool {
        self.ran
            .iter()
            .any(|stage| self.envelope.results.get(*stage).is_some_and(|s| s.error_is_fatal))
    }

    /// Runs `stage`: counts an attempt, clears errors a previous delivery
    /// left there, and moves the item when `stage` is a routable position.
    pub fn enter_stage(&mut self, stage: Stage, now: DateTime<Utc>) {
        let attempt = self.attempt;
        if !self.ran.contains(&stage) {
            self.ran.push(stage);
        }
        let summary = self.envelope.summary(stage);
        summary.clear_errors();
        summary.begin_attempt(now);
        if summary.attempt_number < attempt {
            summary.attempt_number = attempt;
        }
        let item = &mut self.envelope.item;
        if Lifecycle::route(item.action, stage).is_ok() {
            item.stage = stage;
        }
        item.note = format!("{stage} started");
        item.stage_started_at = Some(now);
        item.updated_at = now;
    }

    pub fn finish_stage(&mut self, stage: Stage, now: DateTime<Utc>) {
        self.envelope.summary(stage).finish_at(now);
    }

    /// Records `err` on `stage`, as fatal when retrying cannot help.
    pub fn record_error(&mut self, stage: Stage, err: &CuratorError) {
        warn!(item = %self.envelope.item.id, stage = %stage, error = %err, kind = ?err.kind(), "stage error");
        let summary = self.envelope.summary(stage);
        if err.is_fatal() {
            summary.fatal(err.to_string());
        } else {
            summary.add_error(err.to_string());
        }
    }

    /// Records a fatal error on the stage running now.
    pub fn record_fatal(&mut self, stage: Stage, message: impl Into<String>) {
        let message = message.into();
        warn!(item = %self.envelope.item.id, stage = %stage, error = %message, "fatal stage error");
        self.envelope.summary(stage).fatal(message);
    }
}

/// Staging location of an item, `<staging>/<institution>/<name>`.
pub fn staging_path(ctx: &PipelineContext, item: &WorkItem) -> PathBuf {
    let institution = if item.institution.is_empty() {
        "unknown"
    } else {
        item.institution.as_str()
    };
    ctx.staging_dir.join(institution).join(&item.name)
}
