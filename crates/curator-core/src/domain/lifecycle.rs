//! Lifecycle: Action × Stage × Status and the explicit transition table.
//!
//! Design:
//! - `(Action, Stage)` names a position a work item can wait at.
//! - `TRANSITIONS` is the single place that says which topic serves a
//!   position and where success leads. Producers and pipelines both route
//!   through it; nothing else compares action/stage pairs.
//! - `Status` changes are applied by the `WorkItem` transition methods.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Ingest,
    FixityCheck,
    Restore,
    ColdRestore,
    Delete,
    Replication,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Requested,
    Receive,
    Fetch,
    Unpack,
    Validate,
    Store,
    Record,
    Cleanup,
    Package,
    Copy,
    Resolve,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Started,
    Success,
    Failed,
    Cancelled,
}

/// Destination queue topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Fetch,
    Store,
    Record,
    Fixity,
    FileDelete,
    ColdRestore,
    Restore,
    Replication,
}

impl Topic {
    pub const ALL: [Topic; 8] = [
        Topic::Fetch,
        Topic::Store,
        Topic::Record,
        Topic::Fixity,
        Topic::FileDelete,
        Topic::ColdRestore,
        Topic::Restore,
        Topic::Replication,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Fetch => "fetch",
            Topic::Store => "store",
            Topic::Record => "record",
            Topic::Fixity => "fixity",
            Topic::FileDelete => "file_delete",
            Topic::ColdRestore => "cold_restore",
            Topic::Restore => "restore",
            Topic::Replication => "replication",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Requested => "Requested",
            Stage::Receive => "Receive",
            Stage::Fetch => "Fetch",
            Stage::Unpack => "Unpack",
            Stage::Validate => "Validate",
            Stage::Store => "Store",
            Stage::Record => "Record",
            Stage::Cleanup => "Cleanup",
            Stage::Package => "Package",
            Stage::Copy => "Copy",
            Stage::Resolve => "Resolve",
        };
        f.write_str(name)
    }
}

/// Where success at a position leads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    /// Wait at `stage` with `Status=Pending` (and be routed again).
    Continue(Stage),
    /// Finish at `stage` with `Status=Success`.
    Done(Stage),
}

impl Next {
    pub fn stage(&self) -> Stage {
        match self {
            Next::Continue(stage) | Next::Done(stage) => *stage,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Next::Done(_))
    }
}

/// One row of the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub action: Action,
    pub stage: Stage,
    /// Queue serving this position; `None` means nothing left to route.
    pub topic: Option<Topic>,
    pub on_success: Option<Next>,
}

const fn row(action: Action, stage: Stage, topic: Topic, on_success: Next) -> Transition {
    Transition {
        action,
        stage,
        topic: Some(topic),
        on_success: Some(on_success),
    }
}

const fn rest(action: Action, stage: Stage) -> Transition {
    Transition {
        action,
        stage,
        topic: None,
        on_success: None,
    }
}

pub const TRANSITIONS: &[Transition] = &[
    // ingest: receive -> fetch/validate -> store -> record -> cleanup
    row(Action::Ingest, Stage::Receive, Topic::Fetch, Next::Continue(Stage::Store)),
    row(Action::Ingest, Stage::Fetch, Topic::Fetch, Next::Continue(Stage::Store)),
    row(Action::Ingest, Stage::Validate, Topic::Fetch, Next::Continue(Stage::Store)),
    row(Action::Ingest, Stage::Store, Topic::Store, Next::Continue(Stage::Record)),
    row(Action::Ingest, Stage::Record, Topic::Record, Next::Done(Stage::Cleanup)),
    rest(Action::Ingest, Stage::Cleanup),
    // fixity checks are keyed by file, the row only provides routing
    row(Action::FixityCheck, Stage::Requested, Topic::Fixity, Next::Done(Stage::Resolve)),
    rest(Action::FixityCheck, Stage::Resolve),
    // deletion
    row(Action::Delete, Stage::Requested, Topic::FileDelete, Next::Done(Stage::Resolve)),
    rest(Action::Delete, Stage::Resolve),
    // restore from hot storage
    row(Action::Restore, Stage::Requested, Topic::Restore, Next::Done(Stage::Resolve)),
    row(Action::Restore, Stage::Fetch, Topic::Restore, Next::Done(Stage::Resolve)),
    row(Action::Restore, Stage::Package, Topic::Restore, Next::Done(Stage::Resolve)),
    row(Action::Restore, Stage::Copy, Topic::Restore, Next::Done(Stage::Resolve)),
    rest(Action::Restore, Stage::Resolve),
    // restore from the cold tier: first thaw, then the regular restore
    row(Action::ColdRestore, Stage::Requested, Topic::ColdRestore, Next::Continue(Stage::Fetch)),
    row(Action::ColdRestore, Stage::Fetch, Topic::Restore, Next::Done(Stage::Resolve)),
    row(Action::ColdRestore, Stage::Package, Topic::Restore, Next::Done(Stage::Resolve)),
    row(Action::ColdRestore, Stage::Copy, Topic::Restore, Next::Done(Stage::Resolve)),
    rest(Action::ColdRestore, Stage::Resolve),
    // replication from partner nodes
    row(Action::Replication, Stage::Requested, Topic::Replication, Next::Done(Stage::Resolve)),
    row(Action::Replication, Stage::Copy, Topic::Replication, Next::Done(Stage::Resolve)),
    row(Action::Replication, Stage::Validate, Topic::Replication, Next::Done(Stage::Resolve)),
    rest(Action::Replication, Stage::Resolve),
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    #[error("no transition for action={action:?} stage={stage:?}")]
    Unroutable { action: Action, stage: Stage },

    #[error("action={action:?} stage={stage:?} is already at rest")]
    AtRest { action: Action, stage: Stage },
}

/// Lookup helpers over `TRANSITIONS`.
pub struct Lifecycle;

impl Lifecycle {
    pub fn transition(action: Action, stage: Stage) -> Result<&'static Transition, LifecycleError> {
        TRANSITIONS
            .iter()
            .find(|t| t.action == action && t.stage == stage)
            .ok_or(LifecycleError::Unroutable { action, stage })
    }

    /// Pure routing function: which topic serves `(action, stage)`.
    pub fn route(action: Action, stage: Stage) -> Result<Topic, LifecycleError> {
        Self::transition(action, stage)?
            .topic
            .ok_or(LifecycleError::AtRest { action, stage })
    }

    /// Where success at `(action, stage)` leads.
    pub fn advance(action: Action, stage: Stage) -> Result<Next, LifecycleError> {
        Self::transition(action, stage)?
            .on_success
            .ok_or(LifecycleError::AtRest { action, stage })
    }

    /// The stage a freshly created item waits at.
    pub fn first_stage(action: Action) -> Stage {
        match action {
            Action::Ingest => Stage::Receive,
            _ => Stage::Requested,
        }
    }

    pub fn is_legal(action: Action, stage: Stage) -> bool {
        Self::transition(action, stage).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Action::Ingest, Stage::Receive, Topic::Fetch)]
    #[case(Action::Ingest, Stage::Store, Topic::Store)]
    #[case(Action::Ingest, Stage::Record, Topic::Record)]
    #[case(Action::FixityCheck, Stage::Requested, Topic::Fixity)]
    #[case(Action::Delete, Stage::Requested, Topic::FileDelete)]
    #[case(Action::Restore, Stage::Requested, Topic::Restore)]
    #[case(Action::ColdRestore, Stage::Requested, Topic::ColdRestore)]
    #[case(Action::ColdRestore, Stage::Fetch, Topic::Restore)]
    #[case(Action::Replication, Stage::Requested, Topic::Replication)]
    fn routes(#[case] action: Action, #[case] stage: Stage, #[case] topic: Topic) {
        assert_eq!(Lifecycle::route(action, stage).unwrap(), topic);
    }

    #[rstest]
    #[case(Action::Ingest, Stage::Package)]
    #[case(Action::Delete, Stage::Store)]
    #[case(Action::Restore, Stage::Receive)]
    fn illegal_positions_are_unroutable(#[case] action: Action, #[case] stage: Stage) {
        assert_eq!(
            Lifecycle::route(action, stage),
            Err(LifecycleError::Unroutable { action, stage })
        );
        assert!(!Lifecycle::is_legal(action, stage));
    }

    #[test]
    fn resting_positions_have_no_topic() {
        assert_eq!(
            Lifecycle::route(Action::Ingest, Stage::Cleanup),
            Err(LifecycleError::AtRest {
                action: Action::Ingest,
                stage: Stage::Cleanup
            })
        );
    }

    #[test]
    fn ingest_walks_forward_to_cleanup() {
        let mut stage = Lifecycle::first_stage(Action::Ingest);
        let mut seen = vec![stage];
        loop {
            match Lifecycle::advance(Action::Ingest, stage).unwrap() {
                Next::Continue(next) => {
                    stage = next;
                    seen.push(stage);
                }
                Next::Done(last) => {
                    seen.push(last);
                    break;
                }
            }
        }
        assert_eq!(
            seen,
            vec![Stage::Receive, Stage::Store, Stage::Record, Stage::Cleanup]
        );
    }

    #[test]
    fn every_success_target_is_a_known_position() {
        for t in TRANSITIONS {
            if let Some(next) = t.on_success {
                assert!(
                    Lifecycle::is_legal(t.action, next.stage()),
                    "{:?}/{:?} leads to unknown {:?}",
                    t.action,
                    t.stage,
                    next.stage()
                );
            }
        }
    }

    #[test]
    fn table_has_no_duplicate_keys() {
        for (i, a) in TRANSITIONS.iter().enumerate() {
            for b in &TRANSITIONS[i + 1..] {
                assert!(!(a.action == b.action && a.stage == b.stage));
            }
        }
    }
}
