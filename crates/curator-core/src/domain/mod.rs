//! Domain model: summaries, work items, lifecycle, entities, decisions.

pub mod decision;
pub mod entities;
pub mod envelope;
pub mod errors;
pub mod fingerprint;
pub mod ids;
pub mod lifecycle;
pub mod node;
pub mod retry;
pub mod stats;
pub mod summary;
pub mod work_item;

pub use decision::{AttemptContext, Decider, Decision, DefaultDecider};
pub use entities::{
    EventType, FileState, GenericFile, Institution, IntellectualObject, PremisEvent,
    StorageOption, owner_of_bucket,
};
pub use envelope::{StageResults, TaskEnvelope};
pub use errors::ErrorKind;
pub use fingerprint::{Fingerprint, normalize_etag};
pub use ids::{EventId, MessageId, ParseIdError, WorkItemId};
pub use lifecycle::{Action, Lifecycle, LifecycleError, Next, Stage, Status, Topic, Transition};
pub use node::{
    Bag, Digest, EntityKind, FixityCheck, Member, NodeEntity, ReplicationTransfer,
    RestoreTransfer, TransferStatus,
};
pub use retry::RetryPolicy;
pub use stats::{PipelineStats, ProducerStats};
pub use summary::WorkSummary;
pub use work_item::{WorkItem, WorkerIdentity};
