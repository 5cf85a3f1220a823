//! A single node wired to the in-memory ports.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tracing::{info, warn};

use curator_core::CuratorConfig;
use curator_core::domain::{Topic, WorkerIdentity};
use curator_core::impls::{InMemoryBroker, InMemoryDirectory, InMemoryObjectStore, InMemoryRegistry, TarBagReader};
use curator_core::jsonlog::JsonLog;
use curator_core::pipeline::{
    ColdRestorePipeline, DeletePipeline, FetchPipeline, FixityPipeline, PipelineContext, RecordPipeline,
    ReplicationPipeline, RestorePipeline, Services, StorePipeline,
};
use curator_core::ports::{MessageHandler, SystemClock, UlidGenerator};
use curator_core::worker::WorkerGroup;

/// A pipeline that can drain its stages once nothing else holds it.
#[async_trait]
trait Drain: Send + Sync {
    async fn drain(self: Arc<Self>);
}

macro_rules! drain_by_shutdown {
    ($($pipeline:ty),* $(,)?) => {
        $(
            #[async_trait]
            impl Drain for $pipeline {
                async fn drain(self: Arc<Self>) {
                    match Arc::try_unwrap(self) {
                        Ok(pipeline) => pipeline.shutdown().await,
                        Err(_) => warn!("pipeline still referenced, stages left running"),
                    }
                }
            }
        )*
    };
}

drain_by_shutdown!(
    FetchPipeline,
    StorePipeline,
    RecordPipeline,
    FixityPipeline,
    DeletePipeline,
    ColdRestorePipeline,
    RestorePipeline,
    ReplicationPipeline,
);

/// Consumers plus the pipeline behind them.
pub struct Running {
    topic: Topic,
    group: WorkerGroup,
    pipeline: Arc<dyn Drain>,
}

impl Running {
    /// Stops taking messages, then lets in-flight tasks run to the end.
    pub async fn stop(self) {
        self.group.shutdown_and_join().await;
        self.pipeline.drain().await;
        info!(topic = %self.topic, "pipeline stopped");
    }
}

pub struct LocalNode {
    pub config: CuratorConfig,
    pub registry: InMemoryRegistry,
    pub storage: InMemoryObjectStore,
    pub services: Services,
}

impl LocalNode {
    pub fn new(config: CuratorConfig) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.staging_dir)
            .with_context(|| format!("creating staging dir {}", config.staging_dir.display()))?;
        let json_log = match &config.json_log {
            Some(path) => Some(Arc::new(
                JsonLog::open(path).with_context(|| format!("opening json log {}", path.display()))?,
            )),
            None => None,
        };

        let registry = InMemoryRegistry::new();
        let storage = InMemoryObjectStore::new();
        let services = Services {
            registry: Arc::new(registry.clone()),
            broker: Arc::new(InMemoryBroker::new(config.fetch.message_timeout())),
            storage: Arc::new(storage.clone()),
            clock: Arc::new(SystemClock),
            ids: Arc::new(UlidGenerator::new(SystemClock)),
            identity: WorkerIdentity::current(),
            json_log,
        };
        Ok(Self {
            config,
            registry,
            storage,
            services,
        })
    }

    fn context(&self, topic: Topic) -> Arc<PipelineContext> {
        let worker = self.config.worker(topic).clone();
        Arc::new(PipelineContext::new(self.services.clone(), &self.config, worker))
    }

    fn launch<P>(&self, topic: Topic, pipeline: P) -> Running
    where
        P: MessageHandler + Drain + 'static,
    {
        let pipeline = Arc::new(pipeline);
        let worker = self.config.worker(topic);
        let group = WorkerGroup::consume(
            Arc::clone(&self.services.broker),
            &worker.topic,
            &worker.channel,
            Arc::clone(&pipeline) as Arc<dyn MessageHandler>,
            worker.max_in_flight,
            worker.requeue_delay(),
        );
        info!(topic = %topic, channel = %worker.channel, consumers = worker.max_in_flight, "pipeline started");
        Running {
            topic,
            group,
            pipeline,
        }
    }

    /// Starts the pipeline serving `topic`.
    pub fn start(&self, topic: Topic) -> Running {
        let ctx = self.context(topic);
        match topic {
            Topic::Fetch => self.launch(topic, FetchPipeline::new(ctx, Arc::new(TarBagReader))),
            Topic::Store => self.launch(topic, StorePipeline::new(ctx)),
            Topic::Record => self.launch(topic, RecordPipeline::new(ctx)),
            Topic::Fixity => self.launch(topic, FixityPipeline::new(ctx)),
            Topic::FileDelete => self.launch(topic, DeletePipeline::new(ctx)),
            Topic::ColdRestore => self.launch(topic, ColdRestorePipeline::new(ctx)),
            Topic::Restore => self.launch(topic, RestorePipeline::new(ctx)),
            Topic::Replication => {
                let directory = InMemoryDirectory::new(self.config.sync.local_node.clone());
                self.launch(topic, ReplicationPipeline::new(ctx, Arc::new(directory)))
            }
        }
    }

    pub async fn stop_all(running: Vec<Running>) {
        for pipeline in running {
            pipeline.stop().await;
        }
    }
}

/// How often the demo polls the registry.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);
