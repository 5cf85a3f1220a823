//! BagReader port: turns a deposited bag into an object graph.
//!
//! The reader is a black box to the pipelines. It unpacks the bag, checks
//! it, and returns the object with one `GenericFile` per payload file.
//! Implementations do blocking I/O; call them from `spawn_blocking`.

use std::path::Path;

use crate::domain::IntellectualObject;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BagError {
    /// Content problems; retrying cannot fix these.
    #[error("invalid bag: {}", .0.join("; "))]
    Invalid(Vec<String>),

    #[error("bag i/o: {0}")]
    Io(String),
}

/// Identity fields the reader copies onto the object it builds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BagHeader {
    pub object_identifier: String,
    pub institution: String,
    pub bag_name: String,
    pub etag: String,
}

pub trait BagReader: Send + Sync {
    fn read_bag(
        &self,
        tar_path: &Path,
        unpack_dir: &Path,
        header: &BagHeader,
    ) -> Result<IntellectualObject, BagError>;
}
