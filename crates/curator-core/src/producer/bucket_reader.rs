use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use tracing::{debug, info, instrument};

use super::{InstitutionCache, Producer, ProducerReport, RunLog};
use crate::dedup::DedupIndex;
use crate::domain::{
    Action, Fingerprint, Lifecycle, ProducerStats, WorkItem, normalize_etag, owner_of_bucket,
};
use crate::error::CuratorError;
use crate::ports::{Clock, IdGenerator, ObjectInfo, ObjectStore, QueueBroker, Registry};

const LIST_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone)]
pub struct BucketReaderConfig {
    pub buckets: Vec<String>,
    pub cache_hours: i64,
    /// 0 disables the ceiling.
    pub max_file_size: u64,
    pub collect_stats: bool,
}

/// Creates ingest work items for new bags in the receiving buckets and
/// queues them for fetch.
pub struct BucketReader {
    registry: Arc<dyn Registry>,
    broker: Arc<dyn QueueBroker>,
    storage: Arc<dyn ObjectStore>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    config: BucketReaderConfig,
    dedup: DedupIndex,
    last_stats: Option<ProducerStats>,
}

impl BucketReader {
    pub fn new(
        registry: Arc<dyn Registry>,
        broker: Arc<dyn QueueBroker>,
        storage: Arc<dyn ObjectStore>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        config: BucketReaderConfig,
    ) -> Self {
        let dedup = DedupIndex::new(
            Arc::clone(&registry),
            Arc::clone(&clock),
            Duration::hours(config.cache_hours),
        );
        Self {
            registry,
            broker,
            storage,
            ids,
            clock,
            config,
            dedup,
            last_stats: None,
        }
    }

    /// Detailed stats of the last run, when enabled.
    pub fn stats(&self) -> Option<&ProducerStats> {
        self.last_stats.as_ref()
    }

    async fn scan_bucket(&mut self, bucket: &str, institutions: &InstitutionCache, log: &mut RunLog) {
        let Some(owner) = owner_of_bucket(bucket).map(str::to_string) else {
            log.error(format!("bucket {bucket} is not a receiving bucket"));
            return;
        };
        if institutions.get(&owner).is_none() {
            log.error(format!("bucket {bucket} belongs to unknown institution {owner}"));
            return;
        }

        let mut token: Option<String> = None;
        loop {
            let page = match self
                .storage
                .list_objects(bucket, "", LIST_PAGE_SIZE, token.as_deref())
                .await
            {
                Ok(page) => page,
                Err(err) => {
                    log.error(format!("listing {bucket}: {err}"));
                    return;
                }
            };
            for object in &page.objects {
                if let Err(err) = self.process_object(bucket, &owner, object, log).await {
                    log.error(format!("{bucket}/{}: {err}", object.key));
                }
            }
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
    }

    async fn process_object(
        &mut self,
        bucket: &str,
        owner: &str,
        object: &ObjectInfo,
        log: &mut RunLog,
    ) -> Result<(), CuratorError> {
        if object.key.contains('/') {
            debug!(bucket, key = %object.key, "skipping nested key");
            log.skipped(&object.key);
            return Ok(());
        }
        if self.config.max_file_size > 0 && object.size > self.config.max_file_size {
            debug!(bucket, key = %object.key, size = object.size, "skipping oversized object");
            log.skipped(&object.key);
            return Ok(());
        }

        let fingerprint = Fingerprint::new(object.key.clone(), &object.etag, object.last_modified);
        let mut item = match self.dedup.lookup(&fingerprint).await? {
            Some(item) => {
                log.found(item.id);
                item
            }
            None => {
                let item = self.create_item(bucket, owner, object).await?;
                log.created(item.id);
                item
            }
        };

        if item.queued_at.is_some() || item.is_terminal() || !item.retry {
            return Ok(());
        }
        let topic = Lifecycle::route(item.action, item.stage)?;
        self.broker.enqueue(topic.as_str(), &item.id.to_string()).await?;
        item.queued_at = Some(self.clock.now());
        let item = self.registry.save_work_item(&item).await?;
        self.dedup.register(&item);
        log.queued(Some(item.id));
        Ok(())
    }

    async fn create_item(
        &mut self,
        bucket: &str,
        owner: &str,
        object: &ObjectInfo,
    ) -> Result<WorkItem, CuratorError> {
        let now = self.clock.now();
        let mut item = WorkItem::new(self.ids.work_item_id(), Action::Ingest, now);
        let bag_name = object.key.strip_suffix(".tar").unwrap_or(&object.key);
        item.bucket = bucket.to_string();
        item.name = object.key.clone();
        item.etag = normalize_etag(&object.etag);
        item.size = object.size;
        item.bag_date = object.last_modified;
        item.institution = owner.to_string();
        item.object_identifier = Some(format!("{owner}/{bag_name}"));
        item.note = "Bag is in receiving bucket".to_string();

        let item = self.registry.save_work_item(&item).await?;
        self.dedup.register(&item);
        info!(item = %item.id, locator = %item.locator(), "created ingest work item");
        Ok(item)
    }
}

#[async_trait]
impl Producer for BucketReader {
    #[instrument(skip(self), fields(buckets = self.config.buckets.len()))]
    async fn run(&mut self) -> Result<ProducerReport, CuratorError> {
        let mut log = RunLog::new(self.config.collect_stats);

        let institutions = InstitutionCache::load(self.registry.as_ref()).await?;
        if let Some(stats) = log.stats.as_mut() {
            stats.institutions_cached = institutions.identifiers();
        }

        self.dedup.evict_expired();
        let since = self.clock.now() - Duration::hours(self.config.cache_hours);
        self.dedup.warm(since).await?;

        let buckets = self.config.buckets.clone();
        for bucket in &buckets {
            self.scan_bucket(bucket, &institutions, &mut log).await;
        }

        let report = log.report;
        info!(
            created = report.created,
            found = report.found,
            queued = report.queued,
            skipped = report.skipped,
            errors = report.errors.len(),
            "bucket reader finished"
        );
        self.last_stats = log.stats;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Institution, Stage, Status};
    use crate::impls::{InMemoryBroker, InMemoryObjectStore, InMemoryRegistry};
    use crate::ports::{FixedClock, UlidGenerator};
    use chrono::{DateTime, TimeZone, Utc};

    const BUCKET: &str = "receiving.example.edu";

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 3, 10, 0, 0).unwrap()
    }

    struct Fixture {
        registry: InMemoryRegistry,
        broker: Arc<InMemoryBroker>,
        storage: InMemoryObjectStore,
        clock: Arc<FixedClock>,
    }

    impl Fixture {
        async fn new() -> Self {
            let registry = InMemoryRegistry::new();
            registry.add_institution(Institution::new("example.edu")).await;
            Self {
                registry,
                broker: Arc::new(InMemoryBroker::default()),
                storage: InMemoryObjectStore::new(),
                clock: Arc::new(FixedClock::new(t0())),
            }
        }

        fn reader(&self, buckets: &[&str], max_file_size: u64) -> BucketReader {
            BucketReader::new(
                Arc::new(self.registry.clone()),
                self.broker.clone(),
                Arc::new(self.storage.clone()),
                Arc::new(UlidGenerator::new(self.clock.clone())),
                self.clock.clone(),
                BucketReaderConfig {
                    buckets: buckets.iter().map(|b| b.to_string()).collect(),
                    cache_hours: 24,
                    max_file_size,
                    collect_stats: true,
                },
            )
        }
    }

    #[tokio::test]
    async fn second_run_creates_and_queues_nothing() {
        let fx = Fixture::new().await;
        fx.storage.insert(BUCKET, "photos.tar", b"bag bytes", t0());

        let first = fx.reader(&[BUCKET], 0).run().await.unwrap();
        assert_eq!(first.created, 1);
        assert_eq!(first.queued, 1);

        let second = fx.reader(&[BUCKET], 0).run().await.unwrap();
        assert_eq!(second.created, 0);
        assert_eq!(second.found, 1);
        assert_eq!(second.queued, 0);

        assert_eq!(fx.registry.work_items().await.len(), 1);
        assert_eq!(fx.broker.published("fetch").await.len(), 1);
    }

    #[tokio::test]
    async fn same_reader_uses_its_cache_on_rerun() {
        let fx = Fixture::new().await;
        fx.storage.insert(BUCKET, "photos.tar", b"bag bytes", t0());
        let mut reader = fx.reader(&[BUCKET], 0);

        reader.run().await.unwrap();
        let second = reader.run().await.unwrap();
        assert_eq!(second.found, 1);
        assert_eq!(second.queued, 0);
        assert_eq!(fx.broker.published("fetch").await.len(), 1);
    }

    #[tokio::test]
    async fn new_item_is_pending_and_marked_queued() {
        let fx = Fixture::new().await;
        fx.storage.insert(BUCKET, "photos.tar", b"bag bytes", t0());
        fx.reader(&[BUCKET], 0).run().await.unwrap();

        let items = fx.registry.work_items().await;
        let item = &items[0];
        assert_eq!(item.action, Action::Ingest);
        assert_eq!(item.stage, Stage::Receive);
        assert_eq!(item.status, Status::Pending);
        assert_eq!(item.institution, "example.edu");
        assert_eq!(item.object_identifier.as_deref(), Some("example.edu/photos"));
        assert_eq!(item.queued_at, Some(t0()));
        assert_eq!(fx.broker.published("fetch").await, vec![item.id.to_string()]);
    }

    #[tokio::test]
    async fn failed_enqueue_leaves_item_unqueued() {
        let fx = Fixture::new().await;
        fx.storage.insert(BUCKET, "photos.tar", b"bag bytes", t0());
        fx.broker.set_unavailable(true).await;

        let report = fx.reader(&[BUCKET], 0).run().await.unwrap();
        assert_eq!(report.created, 1);
        assert_eq!(report.queued, 0);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(fx.registry.work_items().await[0].queued_at, None);

        fx.broker.set_unavailable(false).await;
        let retry = fx.reader(&[BUCKET], 0).run().await.unwrap();
        assert_eq!(retry.created, 0);
        assert_eq!(retry.queued, 1);
    }

    #[tokio::test]
    async fn skips_nested_and_oversized_objects() {
        let fx = Fixture::new().await;
        fx.storage.insert(BUCKET, "dir/inner.tar", b"x", t0());
        fx.storage.insert(BUCKET, "huge.tar", &[0u8; 64], t0());
        fx.storage.insert(BUCKET, "ok.tar", b"x", t0());

        let mut reader = fx.reader(&[BUCKET], 32);
        let report = reader.run().await.unwrap();
        assert_eq!(report.skipped, 2);
        assert_eq!(report.created, 1);
        let stats = reader.stats().unwrap();
        assert_eq!(stats.objects_skipped, vec!["dir/inner.tar", "huge.tar"]);
        assert_eq!(stats.institutions_cached, vec!["example.edu"]);
    }

    #[tokio::test]
    async fn unknown_owner_is_an_error() {
        let fx = Fixture::new().await;
        fx.storage.insert("receiving.nowhere.org", "a.tar", b"x", t0());
        let report = fx
            .reader(&["receiving.nowhere.org", "not-a-receiving-bucket"], 0)
            .run()
            .await
            .unwrap();
        assert_eq!(report.errors.len(), 2);
        assert_eq!(report.created, 0);
    }

    #[tokio::test]
    async fn new_etag_is_new_work() {
        let fx = Fixture::new().await;
        fx.storage.insert(BUCKET, "photos.tar", b"v1", t0());
        fx.reader(&[BUCKET], 0).run().await.unwrap();

        fx.clock.advance(Duration::hours(1));
        fx.storage.insert(BUCKET, "photos.tar", b"v2", t0() + Duration::hours(1));
        let report = fx.reader(&[BUCKET], 0).run().await.unwrap();
        assert_eq!(report.created, 1);
        assert_eq!(fx.registry.work_items().await.len(), 2);
    }
}
