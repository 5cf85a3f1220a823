//! Ports: the seams to every external collaborator.
//!
//! The pipelines only talk to the registry, broker, object storage and
//! partner nodes through these traits. `impls` carries in-memory versions
//! for tests and local runs.

pub mod bag_reader;
pub mod broker;
pub mod clock;
pub mod id_generator;
pub mod partner;
pub mod registry;
pub mod storage;

pub use self::bag_reader::{BagError, BagHeader, BagReader};
pub use self::broker::{BrokerError, MessageHandler, QueueBroker, QueueMessage};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::partner::{NodeRegistry, PartnerClient, PartnerDirectory, PartnerError};
pub use self::registry::{FileQuery, Page, Registry, RegistryError, WorkItemQuery};
pub use self::storage::{
    ObjectInfo, ObjectMetadata, ObjectPage, ObjectStore, RestoreState, RetrievalTier, StorageError,
};
