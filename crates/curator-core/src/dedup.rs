//! Fingerprint-keyed cache of work items, owned by one producer run.
//!
//! A hit means the bag version already has a work item and must not get a
//! second one. Misses fall through to the registry, so a cold cache only
//! costs lookups, never duplicates.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::domain::{Action, Fingerprint, WorkItem};
use crate::ports::{Clock, Registry, RegistryError, WorkItemQuery};

const WARM_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone)]
struct Entry {
    item: WorkItem,
    inserted_at: DateTime<Utc>,
}

pub struct DedupIndex {
    registry: Arc<dyn Registry>,
    clock: Arc<dyn Clock>,
    horizon: Duration,
    entries: HashMap<Fingerprint, Entry>,
}

impl DedupIndex {
    pub fn new(registry: Arc<dyn Registry>, clock: Arc<dyn Clock>, horizon: Duration) -> Self {
        Self {
            registry,
            clock,
            horizon,
            entries: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_fresh(&self, entry: &Entry, now: DateTime<Utc>) -> bool {
        now - entry.inserted_at < self.horizon
    }

    /// Cached item for `fingerprint`, else the registry's most recent match.
    pub async fn lookup(&mut self, fingerprint: &Fingerprint) -> Result<Option<WorkItem>, RegistryError> {
        let now = self.clock.now();
        if let Some(entry) = self.entries.get(fingerprint) {
            if self.is_fresh(entry, now) {
                return Ok(Some(entry.item.clone()));
            }
        }

        let query = WorkItemQuery {
            action: Some(Action::Ingest),
            name: Some(fingerprint.key.clone()),
            etag: Some(fingerprint.etag.clone()),
            bag_date: Some(fingerprint.timestamp),
            ..WorkItemQuery::first_page(1)
        };
        let found = self.registry.find_work_item(&query).await?;
        if let Some(item) = &found {
            self.register(item);
        }
        Ok(found)
    }

    /// Caches `item` under its fingerprint, replacing an older entry.
    pub fn register(&mut self, item: &WorkItem) {
        let inserted_at = self.clock.now();
        self.entries.insert(
            item.fingerprint(),
            Entry {
                item: item.clone(),
                inserted_at,
            },
        );
    }

    /// Loads ingest items created since `since`. Returns how many were cached.
    pub async fn warm(&mut self, since: DateTime<Utc>) -> Result<usize, RegistryError> {
        let mut query = WorkItemQuery {
            action: Some(Action::Ingest),
            created_after: Some(since),
            ..WorkItemQuery::first_page(WARM_PAGE_SIZE)
        };
        let mut cached = 0;
        loop {
            let page = self.registry.list_work_items(&query).await?;
            for item in &page.items {
                self.register(item);
                cached += 1;
            }
            if !page.has_next {
                break;
            }
            query.page += 1;
        }
        debug!(cached, since = %since, "dedup index warmed");
        Ok(cached)
    }

    /// Drops entries older than the horizon.
    pub fn evict_expired(&mut self) -> usize {
        let now = self.clock.now();
        let horizon = self.horizon;
        let before = self.entries.len();
        self.entries.retain(|_, entry| now - entry.inserted_at < horizon);
        before - self.entries.len()
    }
}
