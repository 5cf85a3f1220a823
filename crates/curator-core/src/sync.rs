//! Mirror partner-node registries into the local node registry.
//!
//! Entity kinds are synced in dependency order so a bag never arrives
//! before its member, nor a digest before its bag. Each kind is fetched
//! incrementally from the newest `updated_at` already mirrored from that
//! node. The boundary is inclusive, so entities sharing that timestamp are
//! listed again and skipped by the newer-wins rule.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::config::SyncConfig;
use crate::domain::{EntityKind, NodeEntity};
use crate::ports::{NodeRegistry, PartnerClient, PartnerDirectory, PartnerError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncError {
    /// `None` when the node could not be reached at all.
    pub kind: Option<EntityKind>,
    pub message: String,
}

/// Outcome of syncing one partner node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncResult {
    pub node: String,
    /// Entities received from the node, per kind.
    pub fetch_counts: BTreeMap<EntityKind, usize>,
    /// Entities created or updated locally, per kind.
    pub sync_counts: BTreeMap<EntityKind, usize>,
    pub errors: Vec<SyncError>,
}

impl SyncResult {
    fn new(node: &str) -> Self {
        Self {
            node: node.to_string(),
            ..Self::default()
        }
    }

    /// Errors of `kind`, or of any kind when `None`.
    pub fn has_errors(&self, kind: Option<EntityKind>) -> bool {
        match kind {
            None => !self.errors.is_empty(),
            Some(kind) => self.errors.iter().any(|e| e.kind == Some(kind)),
        }
    }

    pub fn fetched(&self, kind: EntityKind) -> usize {
        self.fetch_counts.get(&kind).copied().unwrap_or(0)
    }

    pub fn synced(&self, kind: EntityKind) -> usize {
        self.sync_counts.get(&kind).copied().unwrap_or(0)
    }
}

pub struct ReplicationSync {
    directory: Arc<dyn PartnerDirectory>,
    registry: Arc<dyn NodeRegistry>,
    config: SyncConfig,
}

impl ReplicationSync {
    pub fn new(directory: Arc<dyn PartnerDirectory>, registry: Arc<dyn NodeRegistry>, config: SyncConfig) -> Self {
        Self {
            directory,
            registry,
            config,
        }
    }

    /// Configured partners, or every node the directory knows.
    fn partners(&self) -> Vec<String> {
        let local = self.directory.local_node();
        let nodes = if self.config.partners.is_empty() {
            self.directory.nodes()
        } else {
            self.config.partners.clone()
        };
        nodes.into_iter().filter(|node| node != local).collect()
    }

    /// Syncs every partner. A failing node does not stop the others.
    #[instrument(skip(self), fields(local = %self.directory.local_node()))]
    pub async fn run(&self) -> Vec<SyncResult> {
        let mut results = Vec::new();
        for node in self.partners() {
            let result = self.sync_node(&node).await;
            info!(
                node = %result.node,
                fetched = result.fetch_counts.values().sum::<usize>(),
                synced = result.sync_counts.values().sum::<usize>(),
                errors = result.errors.len(),
                "node synced"
            );
            results.push(result);
        }
        results
    }

    async fn sync_node(&self, node: &str) -> SyncResult {
        let mut result = SyncResult::new(node);
        let client = match self.directory.client(node) {
            Ok(client) => client,
            Err(err) => {
                warn!(node, error = %err, "cannot open partner client");
                result.errors.push(SyncError {
                    kind: None,
                    message: err.to_string(),
                });
                return result;
            }
        };

        for kind in EntityKind::SYNC_ORDER {
            if let Err(err) = self.sync_kind(client.as_ref(), kind, &mut result).await {
                warn!(node, kind = ?kind, error = %err, "sync stopped for node");
                result.errors.push(SyncError {
                    kind: Some(kind),
                    message: err.to_string(),
                });
                break;
            }
        }
        result
    }

    async fn sync_kind(&self, client: &dyn PartnerClient, kind: EntityKind, result: &mut SyncResult) -> Result<(), PartnerError> {
        let node = client.node();
        let since = self.registry.max_updated_at(kind, node).await?;
        debug!(node, kind = ?kind, since = ?since, "syncing kind");

        let mut page_number = 1;
        loop {
            let page = client
                .list_changed(kind, since, page_number, self.config.batch_size)
                .await?;
            *result.fetch_counts.entry(kind).or_default() += page.items.len();
            for entity in &page.items {
                if self.apply(node, entity).await? {
                    *result.sync_counts.entry(kind).or_default() += 1;
                }
            }
            if !page.has_next {
                return Ok(());
            }
            page_number += 1;
        }
    }

    /// Creates or updates the local copy; false when ours is as new.
    async fn apply(&self, node: &str, entity: &NodeEntity) -> Result<bool, PartnerError> {
        let local = self.registry.get(entity.kind(), &entity.key()).await?;
        if local.is_some_and(|local| local.updated_at() >= entity.updated_at()) {
            return Ok(false);
        }
        self.registry.upsert(node, entity).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Bag, Member, ReplicationTransfer, TransferStatus};
    use crate::impls::{InMemoryDirectory, InMemoryNodeRegistry, InMemoryPartner};
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn t(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 10, 0, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn member(uuid: &str, at: DateTime<Utc>) -> NodeEntity {
        NodeEntity::Member(Member {
            uuid: uuid.to_string(),
            name: format!("member {uuid}"),
            updated_at: at,
        })
    }

    fn bag(uuid: &str, at: DateTime<Utc>) -> NodeEntity {
        NodeEntity::Bag(Bag {
            uuid: uuid.to_string(),
            ingest_node: "chron".to_string(),
            admin_node: "chron".to_string(),
            member: "m1".to_string(),
            size: 1024,
            updated_at: at,
        })
    }

    struct Fixture {
        chron: Arc<InMemoryPartner>,
        hathi: Arc<InMemoryPartner>,
        mirror: Arc<InMemoryNodeRegistry>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                chron: Arc::new(InMemoryPartner::new("chron")),
                hathi: Arc::new(InMemoryPartner::new("hathi")),
                mirror: Arc::new(InMemoryNodeRegistry::new()),
            }
        }

        fn sync(&self, batch_size: u32) -> ReplicationSync {
            let directory = InMemoryDirectory::new("aptrust")
                .with_partner(Arc::clone(&self.chron))
                .with_partner(Arc::clone(&self.hathi));
            let config = SyncConfig {
                local_node: "aptrust".to_string(),
                partners: Vec::new(),
                batch_size,
            };
            ReplicationSync::new(Arc::new(directory), self.mirror.clone(), config)
        }
    }

    #[tokio::test]
    async fn pages_through_every_kind() {
        let fx = Fixture::new();
        for i in 0..5 {
            fx.chron.put(member(&format!("m{i}"), t(i)));
        }
        fx.chron.put(bag("b1", t(10)));
        fx.chron.put(NodeEntity::ReplicationTransfer(ReplicationTransfer {
            replication_id: "r1".to_string(),
            from_node: "chron".to_string(),
            to_node: "aptrust".to_string(),
            bag: "b1".to_string(),
            link: "chron.outbound/b1.tar".to_string(),
            status: TransferStatus::Requested,
            fixity_value: None,
            updated_at: t(11),
        }));

        let results = fx.sync(2).run().await;

        assert_eq!(results.len(), 2);
        let chron = results.iter().find(|r| r.node == "chron").unwrap();
        assert!(!chron.has_errors(None));
        assert_eq!(chron.fetched(EntityKind::Member), 5);
        assert_eq!(chron.synced(EntityKind::Member), 5);
        assert_eq!(chron.synced(EntityKind::Bag), 1);
        assert_eq!(chron.synced(EntityKind::ReplicationTransfer), 1);
        assert_eq!(fx.mirror.len(), 7);
        // 3 pages of members, then one page for each of the other kinds
        assert_eq!(fx.chron.list_calls(), 3 + 5);
    }

    #[tokio::test]
    async fn second_run_only_fetches_newer_entities() {
        let fx = Fixture::new();
        fx.chron.put(member("m1", t(0)));
        fx.chron.put(member("m2", t(1)));
        let sync = fx.sync(50);
        sync.run().await;

        fx.chron.put(member("m2", t(5)));
        let results = sync.run().await;

        let chron = &results[0];
        assert_eq!(chron.node, "chron");
        assert_eq!(chron.fetched(EntityKind::Member), 1);
        assert_eq!(chron.synced(EntityKind::Member), 1);
        let local = fx.mirror.get(EntityKind::Member, "m2").await.unwrap().unwrap();
        assert_eq!(local.updated_at(), t(5));
    }

    #[tokio::test]
    async fn entities_sharing_the_newest_timestamp_are_not_lost() {
        let fx = Fixture::new();
        // an earlier run stopped after mirroring m1 but before m2
        fx.mirror.upsert("chron", &member("m1", t(5))).await.unwrap();
        fx.chron.put(member("m1", t(5)));
        fx.chron.put(member("m2", t(5)));

        let results = fx.sync(50).run().await;

        let chron = results.iter().find(|r| r.node == "chron").unwrap();
        assert_eq!(chron.fetched(EntityKind::Member), 2);
        assert_eq!(chron.synced(EntityKind::Member), 1);
        assert!(fx.mirror.get(EntityKind::Member, "m2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn older_copy_does_not_overwrite() {
        let fx = Fixture::new();
        fx.mirror.upsert("hathi", &member("m1", t(30))).await.unwrap();
        fx.chron.put(member("m1", t(10)));

        let results = fx.sync(50).run().await;

        let chron = results.iter().find(|r| r.node == "chron").unwrap();
        assert_eq!(chron.fetched(EntityKind::Member), 1);
        assert_eq!(chron.synced(EntityKind::Member), 0);
        let local = fx.mirror.get(EntityKind::Member, "m1").await.unwrap().unwrap();
        assert_eq!(local.updated_at(), t(30));
    }

    #[tokio::test]
    async fn unreachable_node_does_not_stop_the_others() {
        let fx = Fixture::new();
        fx.chron.set_unreachable(true);
        fx.hathi.put(member("m9", t(0)));

        let results = fx.sync(50).run().await;

        let chron = results.iter().find(|r| r.node == "chron").unwrap();
        assert!(chron.has_errors(Some(EntityKind::Member)));
        assert!(!chron.has_errors(Some(EntityKind::Bag)));
        assert_eq!(chron.errors.len(), 1);
        let hathi = results.iter().find(|r| r.node == "hathi").unwrap();
        assert!(!hathi.has_errors(None));
        assert_eq!(hathi.synced(EntityKind::Member), 1);
    }

    #[tokio::test]
    async fn unknown_partner_is_reported() {
        let fx = Fixture::new();
        let directory = InMemoryDirectory::new("aptrust").with_partner(Arc::clone(&fx.chron));
        let config = SyncConfig {
            local_node: "aptrust".to_string(),
            partners: vec!["aptrust".to_string(), "sdr".to_string()],
            batch_size: 50,
        };
        let results = ReplicationSync::new(Arc::new(directory), fx.mirror.clone(), config).run().await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].node, "sdr");
        assert!(results[0].has_errors(None));
        assert_eq!(results[0].errors[0].kind, None);
    }
}
