//! In-memory and local implementations of the ports.
//!
//! These back the test suite and the CLI's local mode. Production adapters
//! (registry HTTP client, broker, object storage) implement the same traits
//! in their own crates.

pub mod inmem_broker;
pub mod inmem_partner;
pub mod inmem_registry;
pub mod inmem_storage;
pub mod tar_bag;

pub use self::inmem_broker::{ChannelCounts, InMemoryBroker};
pub use self::inmem_partner::{InMemoryDirectory, InMemoryNodeRegistry, InMemoryPartner};
pub use self::inmem_registry::{InMemoryRegistry, WriteKind};
pub use self::inmem_storage::{InMemoryObjectStore, RestoreRequest};
pub use self::tar_bag::{TAG_MANIFEST_SHA256, TarBagReader, pack_bag, tag_manifest_digest};
