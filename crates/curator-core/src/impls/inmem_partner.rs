//! In-memory partner nodes and local node-entity mirror.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{EntityKind, NodeEntity, ReplicationTransfer};
use crate::ports::{NodeRegistry, Page, PartnerClient, PartnerDirectory, PartnerError};

#[derive(Debug, Default)]
struct PartnerState {
    entities: Vec<NodeEntity>,
    unreachable: bool,
    list_calls: usize,
}

/// One remote node's registry.
pub struct InMemoryPartner {
    node: String,
    state: Mutex<PartnerState>,
}

impl InMemoryPartner {
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            state: Mutex::new(PartnerState::default()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, PartnerState>, PartnerError> {
        self.state.lock().map_err(|_| PartnerError::Remote {
            node: self.node.clone(),
            reason: "state poisoned".to_string(),
        })
    }

    /// Adds or replaces an entity (matched by kind and key).
    pub fn put(&self, entity: NodeEntity) {
        if let Ok(mut state) = self.lock() {
            let (kind, key) = (entity.kind(), entity.key());
            state.entities.retain(|e| e.kind() != kind || e.key() != key);
            state.entities.push(entity);
        }
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        if let Ok(mut state) = self.lock() {
            state.unreachable = unreachable;
        }
    }

    pub fn list_calls(&self) -> usize {
        self.lock().map(|s| s.list_calls).unwrap_or(0)
    }

    pub fn replication(&self, id: &str) -> Option<ReplicationTransfer> {
        self.lock().ok()?.entities.iter().find_map(|e| match e {
            NodeEntity::ReplicationTransfer(r) if r.replication_id == id => Some(r.clone()),
            _ => None,
        })
    }

    fn check_reachable(&self, state: &PartnerState) -> Result<(), PartnerError> {
        if state.unreachable {
            return Err(PartnerError::Unreachable {
                node: self.node.clone(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl PartnerClient for InMemoryPartner {
    fn node(&self) -> &str {
        &self.node
    }

    async fn list_changed(
        &self,
        kind: EntityKind,
        since: Option<DateTime<Utc>>,
        page: u32,
        per_page: u32,
    ) -> Result<Page<NodeEntity>, PartnerError> {
        let mut state = self.lock()?;
        self.check_reachable(&state)?;
        state.list_calls += 1;

        let mut changed: Vec<NodeEntity> = state
            .entities
            .iter()
            .filter(|e| e.kind() == kind)
            .filter(|e| since.is_none_or(|s| e.updated_at() >= s))
            .cloned()
            .collect();
        changed.sort_by_key(|e| (e.updated_at(), e.key()));

        let per_page = per_page.max(1) as usize;
        let start = (page.max(1) as usize - 1) * per_page;
        let has_next = changed.len() > start + per_page;
        let items = changed.into_iter().skip(start).take(per_page).collect();
        Ok(Page { items, has_next })
    }

    async fn get_replication(&self, replication_id: &str) -> Result<ReplicationTransfer, PartnerError> {
        {
            let state = self.lock()?;
            self.check_reachable(&state)?;
        }
        self.replication(replication_id)
            .ok_or_else(|| PartnerError::NotFound {
                kind: EntityKind::ReplicationTransfer,
                key: replication_id.to_string(),
            })
    }

    async fn update_replication(&self, transfer: &ReplicationTransfer) -> Result<ReplicationTransfer, PartnerError> {
        {
            let state = self.lock()?;
            self.check_reachable(&state)?;
        }
        if self.replication(&transfer.replication_id).is_none() {
            return Err(PartnerError::NotFound {
                kind: EntityKind::ReplicationTransfer,
                key: transfer.replication_id.clone(),
            });
        }
        self.put(NodeEntity::ReplicationTransfer(transfer.clone()));
        Ok(transfer.clone())
    }
}

/// Fixed set of partner clients keyed by node name.
pub struct InMemoryDirectory {
    local: String,
    partners: HashMap<String, Arc<InMemoryPartner>>,
}

impl InMemoryDirectory {
    pub fn new(local: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            partners: HashMap::new(),
        }
    }

    pub fn with_partner(mut self, partner: Arc<InMemoryPartner>) -> Self {
        self.partners.insert(partner.node.clone(), partner);
        self
    }
}

impl PartnerDirectory for InMemoryDirectory {
    fn local_node(&self) -> &str {
        &self.local
    }

    fn nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self.partners.keys().cloned().collect();
        nodes.sort();
        nodes
    }

    fn client(&self, node: &str) -> Result<Arc<dyn PartnerClient>, PartnerError> {
        self.partners
            .get(node)
            .map(|p| Arc::clone(p) as Arc<dyn PartnerClient>)
            .ok_or_else(|| PartnerError::Unreachable {
                node: node.to_string(),
                reason: "unknown node".to_string(),
            })
    }
}

#[derive(Debug, Clone)]
struct Mirrored {
    source: String,
    entity: NodeEntity,
}

#[derive(Default)]
pub struct InMemoryNodeRegistry {
    entries: Mutex<HashMap<(EntityKind, String), Mirrored>>,
}

impl InMemoryNodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<(EntityKind, String), Mirrored>>, PartnerError> {
        self.entries.lock().map_err(|_| PartnerError::Remote {
            node: "local".to_string(),
            reason: "mirror poisoned".to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl NodeRegistry for InMemoryNodeRegistry {
    async fn get(&self, kind: EntityKind, key: &str) -> Result<Option<NodeEntity>, PartnerError> {
        Ok(self
            .lock()?
            .get(&(kind, key.to_string()))
            .map(|m| m.entity.clone()))
    }

    async fn upsert(&self, node: &str, entity: &NodeEntity) -> Result<(), PartnerError> {
        self.lock()?.insert(
            (entity.kind(), entity.key()),
            Mirrored {
                source: node.to_string(),
                entity: entity.clone(),
            },
        );
        Ok(())
    }

    async fn max_updated_at(&self, kind: EntityKind, node: &str) -> Result<Option<DateTime<Utc>>, PartnerError> {
        Ok(self
            .lock()?
            .iter()
            .filter(|((k, _), m)| *k == kind && m.source == node)
            .map(|(_, m)| m.entity.updated_at())
            .max())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Member;
    use chrono::TimeZone;

    fn member(uuid: &str, minute: u32) -> NodeEntity {
        NodeEntity::Member(Member {
            uuid: uuid.to_string(),
            name: uuid.to_uppercase(),
            updated_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, minute, 0).unwrap(),
        })
    }

    #[tokio::test]
    async fn list_changed_filters_by_since() {
        let partner = InMemoryPartner::new("chron");
        partner.put(member("a", 1));
        partner.put(member("b", 2));
        partner.put(member("c", 3));

        // inclusive: b shares the boundary timestamp
        let since = Utc.with_ymd_and_hms(2024, 3, 1, 12, 2, 0).unwrap();
        let page = partner
            .list_changed(EntityKind::Member, Some(since), 1, 50)
            .await
            .unwrap();
        let keys: Vec<String> = page.items.iter().map(NodeEntity::key).collect();
        assert_eq!(keys, vec!["b", "c"]);
        assert!(!page.has_next);
    }

    #[tokio::test]
    async fn mirror_tracks_newest_per_source() {
        let mirror = InMemoryNodeRegistry::new();
        mirror.upsert("chron", &member("a", 5)).await.unwrap();
        mirror.upsert("hathi", &member("b", 9)).await.unwrap();
        assert_eq!(
            mirror.max_updated_at(EntityKind::Member, "chron").await.unwrap(),
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 5, 0).unwrap())
        );
        assert_eq!(mirror.max_updated_at(EntityKind::Bag, "chron").await.unwrap(), None);
    }
}
