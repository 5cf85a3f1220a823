//! Registry port: the remote system of record.
//!
//! The registry owns work items, their saved envelope state and the
//! preservation entities. It offers no locking; callers coordinate through
//! the soft lease on `WorkItem`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    Action, EventType, GenericFile, Institution, IntellectualObject, PremisEvent, Stage, WorkItem,
    WorkItemId,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("registry unavailable: {0}")]
    Unavailable(String),

    #[error("registry rejected request: {0}")]
    Rejected(String),
}

/// One page of a listing.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub has_next: bool,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            has_next: false,
        }
    }
}

/// Filter for work item listings. `None` fields do not filter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkItemQuery {
    pub action: Option<Action>,
    pub stage: Option<Stage>,
    pub name: Option<String>,
    pub etag: Option<String>,
    pub bag_date: Option<DateTime<Utc>>,
    pub replication_id: Option<String>,
    pub queued: Option<bool>,
    pub retry: Option<bool>,
    pub created_after: Option<DateTime<Utc>>,
    /// 1-based page number.
    pub page: u32,
    pub per_page: u32,
}

impl WorkItemQuery {
    pub fn first_page(per_page: u32) -> Self {
        Self {
            page: 1,
            per_page,
            ..Self::default()
        }
    }

    pub fn matches(&self, item: &WorkItem) -> bool {
        self.action.is_none_or(|a| item.action == a)
            && self.stage.is_none_or(|s| item.stage == s)
            && self.name.as_ref().is_none_or(|n| &item.name == n)
            && self.etag.as_ref().is_none_or(|e| &item.etag == e)
            && self.bag_date.is_none_or(|d| item.bag_date == d)
            && self
                .replication_id
                .as_ref()
                .is_none_or(|r| item.replication_id.as_ref() == Some(r))
            && self.queued.is_none_or(|q| item.queued_at.is_some() == q)
            && self.retry.is_none_or(|r| item.retry == r)
            && self.created_after.is_none_or(|c| item.created_at >= c)
    }
}

/// Filter for generic file listings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileQuery {
    pub object_identifier: Option<String>,
    /// Only files never checked or last checked before this instant.
    pub not_checked_since: Option<DateTime<Utc>>,
    pub page: u32,
    pub per_page: u32,
}

#[async_trait]
pub trait Registry: Send + Sync {
    async fn list_work_items(&self, query: &WorkItemQuery) -> Result<Page<WorkItem>, RegistryError>;

    /// Most recently created item matching `query`, whatever its status.
    async fn find_work_item(&self, query: &WorkItemQuery) -> Result<Option<WorkItem>, RegistryError>;

    async fn get_work_item(&self, id: WorkItemId) -> Result<WorkItem, RegistryError>;

    /// Create-or-update; returns the stored copy.
    async fn save_work_item(&self, item: &WorkItem) -> Result<WorkItem, RegistryError>;

    /// Saved envelope JSON of a work item, if any stage saved one.
    async fn get_state(&self, id: WorkItemId) -> Result<Option<serde_json::Value>, RegistryError>;

    async fn save_state(&self, id: WorkItemId, state: serde_json::Value) -> Result<(), RegistryError>;

    async fn list_institutions(&self) -> Result<Vec<Institution>, RegistryError>;

    async fn get_object(&self, identifier: &str) -> Result<Option<IntellectualObject>, RegistryError>;

    async fn save_object(&self, object: &IntellectualObject) -> Result<IntellectualObject, RegistryError>;

    async fn get_generic_file(&self, identifier: &str) -> Result<GenericFile, RegistryError>;

    async fn save_generic_file(&self, file: &GenericFile) -> Result<GenericFile, RegistryError>;

    /// Batch save. Partial failure reports the identifiers that failed.
    async fn save_generic_files(&self, files: &[GenericFile]) -> Result<Vec<GenericFile>, RegistryError>;

    async fn list_generic_files(&self, query: &FileQuery) -> Result<Page<GenericFile>, RegistryError>;

    /// Newest event of `event_type` recorded against a file.
    async fn latest_event(
        &self,
        file_identifier: &str,
        event_type: EventType,
    ) -> Result<Option<PremisEvent>, RegistryError>;

    async fn save_event(&self, event: &PremisEvent) -> Result<(), RegistryError>;
}
