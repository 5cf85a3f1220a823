//! Partner-node entities reconciled by replication sync.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Entity families synced from partner nodes, in sync order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Member,
    Bag,
    Digest,
    FixityCheck,
    ReplicationTransfer,
    RestoreTransfer,
}

impl EntityKind {
    pub const SYNC_ORDER: [EntityKind; 6] = [
        EntityKind::Member,
        EntityKind::Bag,
        EntityKind::Digest,
        EntityKind::FixityCheck,
        EntityKind::ReplicationTransfer,
        EntityKind::RestoreTransfer,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub uuid: String,
    pub name: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bag {
    pub uuid: String,
    pub ingest_node: String,
    pub admin_node: String,
    pub member: String,
    pub size: u64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Digest {
    pub bag: String,
    pub algorithm: String,
    pub node: String,
    pub value: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixityCheck {
    pub fixity_check_id: String,
    pub bag: String,
    pub node: String,
    pub success: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Requested,
    Received,
    Stored,
    Rejected,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationTransfer {
    pub replication_id: String,
    pub from_node: String,
    pub to_node: String,
    pub bag: String,
    /// Where the receiving node downloads the bag from.
    pub link: String,
    pub status: TransferStatus,
    pub fixity_value: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreTransfer {
    pub restore_id: String,
    pub from_node: String,
    pub to_node: String,
    pub bag: String,
    pub status: TransferStatus,
    pub updated_at: DateTime<Utc>,
}

/// Any syncable entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeEntity {
    Member(Member),
    Bag(Bag),
    Digest(Digest),
    FixityCheck(FixityCheck),
    ReplicationTransfer(ReplicationTransfer),
    RestoreTransfer(RestoreTransfer),
}

impl NodeEntity {
    pub fn kind(&self) -> EntityKind {
        match self {
            NodeEntity::Member(_) => EntityKind::Member,
            NodeEntity::Bag(_) => EntityKind::Bag,
            NodeEntity::Digest(_) => EntityKind::Digest,
            NodeEntity::FixityCheck(_) => EntityKind::FixityCheck,
            NodeEntity::ReplicationTransfer(_) => EntityKind::ReplicationTransfer,
            NodeEntity::RestoreTransfer(_) => EntityKind::RestoreTransfer,
        }
    }

    /// Stable key within its kind.
    pub fn key(&self) -> String {
        match self {
            NodeEntity::Member(m) => m.uuid.clone(),
            NodeEntity::Bag(b) => b.uuid.clone(),
            NodeEntity::Digest(d) => format!("{}:{}:{}", d.bag, d.algorithm, d.node),
            NodeEntity::FixityCheck(f) => f.fixity_check_id.clone(),
            NodeEntity::ReplicationTransfer(r) => r.replication_id.clone(),
            NodeEntity::RestoreTransfer(r) => r.restore_id.clone(),
        }
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        match self {
            NodeEntity::Member(m) => m.updated_at,
            NodeEntity::Bag(b) => b.updated_at,
            NodeEntity::Digest(d) => d.updated_at,
            NodeEntity::FixityCheck(f) => f.updated_at,
            NodeEntity::ReplicationTransfer(r) => r.updated_at,
            NodeEntity::RestoreTransfer(r) => r.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn digest_key_combines_fields() {
        let d = NodeEntity::Digest(Digest {
            bag: "b1".into(),
            algorithm: "sha256".into(),
            node: "tdr".into(),
            value: "ff".into(),
            updated_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        });
        assert_eq!(d.kind(), EntityKind::Digest);
        assert_eq!(d.key(), "b1:sha256:tdr");
    }

    #[test]
    fn tagged_serialization_keeps_kind() {
        let m = NodeEntity::Member(Member {
            uuid: "m1".into(),
            name: "Member One".into(),
            updated_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        });
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["kind"], "member");
    }
}
