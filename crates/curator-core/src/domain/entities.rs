//! Registry entities the pipelines read and write.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::EventId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Institution {
    pub identifier: String,
    pub receiving_bucket: String,
    pub restore_bucket: String,
}

impl Institution {
    pub fn new(identifier: impl Into<String>) -> Self {
        let identifier = identifier.into();
        Self {
            receiving_bucket: format!("{RECEIVING_PREFIX}{identifier}"),
            restore_bucket: format!("{RESTORE_PREFIX}{identifier}"),
            identifier,
        }
    }
}

pub const RECEIVING_PREFIX: &str = "receiving.";
pub const RECEIVING_TEST_PREFIX: &str = "receiving.test.";
pub const RESTORE_PREFIX: &str = "restore.";

/// Owner of a receiving bucket, or `None` if the name has no known prefix.
pub fn owner_of_bucket(bucket: &str) -> Option<&str> {
    bucket
        .strip_prefix(RECEIVING_TEST_PREFIX)
        .or_else(|| bucket.strip_prefix(RECEIVING_PREFIX))
        .filter(|owner| !owner.is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageOption {
    #[default]
    Standard,
    Glacier,
    GlacierDeepArchive,
}

impl StorageOption {
    pub fn is_cold(&self) -> bool {
        !matches!(self, StorageOption::Standard)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FileState {
    #[default]
    Active,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GenericFile {
    pub identifier: String,
    pub object_identifier: String,
    /// Path inside the bag, e.g. `data/image.tif`.
    pub path: String,
    pub size: u64,
    pub md5: Option<String>,
    pub sha256: Option<String>,
    pub storage_option: StorageOption,
    pub primary_url: Option<String>,
    pub secondary_url: Option<String>,
    pub stored_at: Option<DateTime<Utc>>,
    pub deleted_from_primary_at: Option<DateTime<Utc>>,
    pub deleted_from_secondary_at: Option<DateTime<Utc>>,
    pub last_fixity_check: Option<DateTime<Utc>>,
    pub state: FileState,
}

impl GenericFile {
    /// Storage key shared by both tiers.
    pub fn storage_key(&self) -> String {
        self.identifier.clone()
    }

    pub fn needs_fixity_check(&self, now: DateTime<Utc>, max_days: i64) -> bool {
        match self.last_fixity_check {
            None => true,
            Some(last) => now - last >= chrono::Duration::days(max_days),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IntellectualObject {
    pub identifier: String,
    pub institution: String,
    pub bag_name: String,
    pub etag: String,
    pub storage_option: StorageOption,
    pub files: Vec<GenericFile>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Ingestion,
    FixityCheck,
    Deletion,
    Replication,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PremisEvent {
    pub identifier: EventId,
    pub event_type: EventType,
    pub object_identifier: String,
    pub generic_file_identifier: Option<String>,
    pub outcome: String,
    pub detail: String,
    pub date_time: DateTime<Utc>,
}
