//! Partner-node ports used by replication.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::registry::Page;
use crate::domain::{EntityKind, NodeEntity, ReplicationTransfer};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PartnerError {
    #[error("node {node} unreachable: {reason}")]
    Unreachable { node: String, reason: String },

    #[error("node {node} returned an error: {reason}")]
    Remote { node: String, reason: String },

    #[error("{kind:?} {key} not found")]
    NotFound { kind: EntityKind, key: String },
}

/// Client for one remote node's registry.
#[async_trait]
pub trait PartnerClient: Send + Sync {
    fn node(&self) -> &str;

    /// Entities of `kind` updated at or after `since`, oldest first.
    async fn list_changed(
        &self,
        kind: EntityKind,
        since: Option<DateTime<Utc>>,
        page: u32,
        per_page: u32,
    ) -> Result<Page<NodeEntity>, PartnerError>;

    async fn get_replication(&self, replication_id: &str) -> Result<ReplicationTransfer, PartnerError>;

    async fn update_replication(&self, transfer: &ReplicationTransfer) -> Result<ReplicationTransfer, PartnerError>;
}

/// Opens partner clients by node name.
pub trait PartnerDirectory: Send + Sync {
    fn local_node(&self) -> &str;

    fn nodes(&self) -> Vec<String>;

    fn client(&self, node: &str) -> Result<Arc<dyn PartnerClient>, PartnerError>;
}

/// Local mirror of partner-node entities.
#[async_trait]
pub trait NodeRegistry: Send + Sync {
    async fn get(&self, kind: EntityKind, key: &str) -> Result<Option<NodeEntity>, PartnerError>;

    /// Stores `entity` as last received from `node`.
    async fn upsert(&self, node: &str, entity: &NodeEntity) -> Result<(), PartnerError>;

    /// Newest `updated_at` seen for `kind` from `node`.
    async fn max_updated_at(&self, kind: EntityKind, node: &str) -> Result<Option<DateTime<Utc>>, PartnerError>;
}
