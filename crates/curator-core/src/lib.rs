//! curator-core
//!
//! Staged worker pipelines for a digital-preservation node.
//!
//! - **domain**: work items, the (action, stage) transition table, task
//!   envelopes and stage summaries, partner-node entities
//! - **ports**: registry, broker, object storage, partner and bag-reader traits
//! - **impls**: in-memory ports and the tar bag reader
//! - **producer**: bucket reader and queuers that put work on the broker
//! - **pipeline**: the eight staged pipelines behind the message handlers
//! - **worker**: consumer loops feeding a handler from one topic/channel
//! - **fanout**: bucket audit with bounded fork-join batches
//! - **sync**: partner registry mirroring

pub mod config;
pub mod dedup;
pub mod domain;
pub mod error;
pub mod fanout;
pub mod impls;
pub mod jsonlog;
pub mod logging;
pub mod pipeline;
pub mod ports;
pub mod producer;
pub mod sync;
pub mod worker;

pub use crate::config::CuratorConfig;
pub use crate::error::CuratorError;
