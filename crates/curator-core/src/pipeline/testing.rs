//! Fixtures for the pipeline tests.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use super::{PipelineContext, Services};
use crate::config::{CuratorConfig, WorkerConfig};
use crate::domain::{Action, GenericFile, IntellectualObject, Topic, WorkItem, WorkItemId, WorkerIdentity};
use crate::impls::{InMemoryBroker, InMemoryObjectStore, InMemoryRegistry};
use crate::ports::{Clock, FixedClock, IdGenerator, QueueBroker, QueueMessage, Registry, UlidGenerator};

pub(crate) const CHANNEL: &str = "curator";

pub(crate) fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 9, 2, 9, 30, 0).unwrap()
}

pub(crate) struct Harness {
    pub registry: InMemoryRegistry,
    pub broker: Arc<InMemoryBroker>,
    pub storage: InMemoryObjectStore,
    pub clock: Arc<FixedClock>,
    pub ids: Arc<dyn IdGenerator>,
    pub config: CuratorConfig,
    pub staging: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(edit: impl FnOnce(&mut CuratorConfig)) -> Self {
        let staging = tempfile::tempdir().unwrap();
        let mut config = CuratorConfig {
            staging_dir: staging.path().to_path_buf(),
            collect_stats: true,
            ..CuratorConfig::default()
        };
        edit(&mut config);
        let clock = Arc::new(FixedClock::new(start_time()));
        Self {
            registry: InMemoryRegistry::new(),
            broker: Arc::new(InMemoryBroker::default()),
            storage: InMemoryObjectStore::new(),
            ids: Arc::new(UlidGenerator::new(Arc::clone(&clock))),
            clock,
            config,
            staging,
        }
    }

    pub fn services(&self) -> Services {
        Services {
            registry: Arc::new(self.registry.clone()),
            broker: self.broker.clone(),
            storage: Arc::new(self.storage.clone()),
            clock: self.clock.clone(),
            ids: Arc::clone(&self.ids),
            identity: WorkerIdentity::new("test-node", 4242),
            json_log: None,
        }
    }

    pub fn context(&self, topic: Topic) -> Arc<PipelineContext> {
        let worker = WorkerConfig {
            channel: CHANNEL.to_string(),
            ..WorkerConfig::for_topic(topic)
        };
        Arc::new(PipelineContext::new(self.services(), &self.config, worker))
    }

    /// Saves a pending item built by `edit` and queues it on `topic`.
    pub async fn queue_item(&self, action: Action, topic: Topic, edit: impl FnOnce(&mut WorkItem)) -> WorkItem {
        let mut item = WorkItem::new(self.ids.work_item_id(), action, self.clock.now());
        edit(&mut item);
        let item = self.registry.save_work_item(&item).await.unwrap();
        self.broker.enqueue(topic.as_str(), &item.id.to_string()).await.unwrap();
        item
    }

    pub async fn item(&self, id: WorkItemId) -> WorkItem {
        self.registry.get_work_item(id).await.unwrap()
    }

    /// Next delivery on `topic`; panics if none arrives within a day of
    /// (paused) time.
    pub async fn next_message(&self, topic: Topic) -> Arc<dyn QueueMessage> {
        tokio::time::timeout(
            Duration::from_secs(24 * 3600),
            self.broker.receive(topic.as_str(), CHANNEL),
        )
        .await
        .ok()
        .flatten()
        .unwrap_or_else(|| panic!("no message on {topic}"))
    }

    /// Registers `example.edu/photos` with two files stored in `bucket`.
    pub async fn stored_object(&self, bucket: &str) -> IntellectualObject {
        let files = [("data/a.txt", b"alpha".as_slice()), ("data/b.txt", b"beta".as_slice())]
            .iter()
            .map(|(path, data)| {
                let identifier = format!("example.edu/photos/{path}");
                self.storage.insert(bucket, &identifier, data, start_time());
                GenericFile {
                    identifier,
                    object_identifier: "example.edu/photos".to_string(),
                    path: path.to_string(),
                    ..GenericFile::default()
                }
            })
            .collect();
        let object = IntellectualObject {
            identifier: "example.edu/photos".to_string(),
            institution: "example.edu".to_string(),
            bag_name: "photos".to_string(),
            files,
            ..IntellectualObject::default()
        };
        self.registry.insert_object(object.clone()).await;
        object
    }
}
