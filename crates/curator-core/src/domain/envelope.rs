//! TaskEnvelope: a work item plus the per-stage results of its pipeline.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::lifecycle::Stage;
use super::summary::WorkSummary;
use super::work_item::WorkItem;

/// One `WorkSummary` per stage the pipeline has touched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResults(BTreeMap<Stage, WorkSummary>);

impl StageResults {
    pub fn new() -> Self {
        Self::default()
    }

    /// Summary for `stage`, created on first use.
    pub fn get_mut(&mut self, stage: Stage) -> &mut WorkSummary {
        self.0.entry(stage).or_default()
    }

    pub fn get(&self, stage: Stage) -> Option<&WorkSummary> {
        self.0.get(&stage)
    }

    pub fn has_errors(&self) -> bool {
        self.0.values().any(WorkSummary::has_errors)
    }

    pub fn has_fatal_errors(&self) -> bool {
        self.0.values().any(|s| s.error_is_fatal)
    }

    /// Highest attempt number recorded by any stage.
    pub fn max_attempt_number(&self) -> u16 {
        self.0.values().map(|s| s.attempt_number).max().unwrap_or(0)
    }

    /// Highest attempt number among `stages`. Pipelines sharing an
    /// envelope each count only the stages they run.
    pub fn max_attempt_number_in(&self, stages: &[Stage]) -> u16 {
        stages
            .iter()
            .filter_map(|stage| self.0.get(stage))
            .map(|s| s.attempt_number)
            .max()
            .unwrap_or(0)
    }

    /// Errors of every stage, prefixed with the stage name.
    pub fn all_errors(&self) -> String {
        self.0
            .iter()
            .filter(|(_, s)| s.has_errors())
            .map(|(stage, s)| format!("{stage}: {}", s.all_errors_as_string()))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Stage, &WorkSummary)> {
        self.0.iter()
    }
}

/// Work item, stage results and pipeline payload travelling together.
///
/// Serialized as the item's saved state after each transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope<P> {
    pub item: WorkItem,
    pub results: StageResults,
    pub payload: P,
}

impl<P> TaskEnvelope<P> {
    pub fn new(item: WorkItem, payload: P) -> Self {
        Self {
            item,
            results: StageResults::new(),
            payload,
        }
    }

    pub fn summary(&mut self, stage: Stage) -> &mut WorkSummary {
        self.results.get_mut(stage)
    }
}
