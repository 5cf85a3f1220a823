//! Producers: scan a source and put work on the broker.
//!
//! Every producer follows the same order for each unit of work: make sure
//! a durable record exists, enqueue it, and only after the broker accepted
//! the message mark the record as queued. A crash between the two steps
//! leaves an unqueued record that the next run picks up.

pub mod bucket_reader;
pub mod fixity_queuer;
pub mod replication_queuer;
pub mod work_item_queuer;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;

use crate::domain::{Institution, ProducerStats, WorkItemId};
use crate::error::CuratorError;
use crate::ports::{Registry, RegistryError};

pub use self::bucket_reader::BucketReader;
pub use self::fixity_queuer::FixityQueuer;
pub use self::replication_queuer::ReplicationQueuer;
pub use self::work_item_queuer::WorkItemQueuer;

#[async_trait]
pub trait Producer: Send {
    async fn run(&mut self) -> Result<ProducerReport, CuratorError>;
}

/// Counts and errors of one producer run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProducerReport {
    pub created: usize,
    /// Existing records matched instead of created.
    pub found: usize,
    pub queued: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
}

impl ProducerReport {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Report plus optional detailed stats, shared by all producers.
#[derive(Debug, Default)]
pub(crate) struct RunLog {
    pub report: ProducerReport,
    pub stats: Option<ProducerStats>,
}

impl RunLog {
    pub fn new(collect_stats: bool) -> Self {
        Self {
            report: ProducerReport::default(),
            stats: collect_stats.then(ProducerStats::default),
        }
    }

    pub fn error(&mut self, message: String) {
        tracing::warn!(error = %message, "producer error");
        if let Some(stats) = self.stats.as_mut() {
            stats.errors.push(message.clone());
        }
        self.report.errors.push(message);
    }

    pub fn created(&mut self, id: WorkItemId) {
        self.report.created += 1;
        if let Some(stats) = self.stats.as_mut() {
            stats.items_created.push(id);
        }
    }

    pub fn found(&mut self, id: WorkItemId) {
        self.report.found += 1;
        if let Some(stats) = self.stats.as_mut() {
            stats.items_found.push(id);
        }
    }

    pub fn queued(&mut self, id: Option<WorkItemId>) {
        self.report.queued += 1;
        if let (Some(stats), Some(id)) = (self.stats.as_mut(), id) {
            stats.items_queued.push(id);
        }
    }

    pub fn skipped(&mut self, what: &str) {
        self.report.skipped += 1;
        if let Some(stats) = self.stats.as_mut() {
            stats.objects_skipped.push(what.to_string());
        }
    }
}

/// Institutions by identifier, loaded once per run.
#[derive(Debug, Default)]
pub struct InstitutionCache {
    by_identifier: HashMap<String, Institution>,
}

impl InstitutionCache {
    pub async fn load(registry: &dyn Registry) -> Result<Self, RegistryError> {
        let by_identifier = registry
            .list_institutions()
            .await?
            .into_iter()
            .map(|inst| (inst.identifier.clone(), inst))
            .collect();
        Ok(Self { by_identifier })
    }

    pub fn get(&self, identifier: &str) -> Option<&Institution> {
        self.by_identifier.get(identifier)
    }

    pub fn identifiers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.by_identifier.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.by_identifier.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_identifier.is_empty()
    }
}
