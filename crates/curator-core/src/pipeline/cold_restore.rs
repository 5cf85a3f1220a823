//! Thaw an object's files out of the cold tier.
//!
//! One stage asks the store to restore every archived file and then looks
//! at where each file stands. While anything is still thawing the item
//! waits (requeued without counting an attempt); once all files are
//! available it moves on to the restore topic.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument};

use super::finish;
use super::lease;
use super::restore::{RestorePayload, restorable_object};
use super::stage::{Sender, StagePool, forward, persist_or_record, start};
use super::{PipelineContext, Task};
use crate::domain::{Action, FileState, Stage, StorageOption};
use crate::error::CuratorError;
use crate::ports::{MessageHandler, QueueMessage, RestoreState, RetrievalTier, StorageError};

/// Days a thawed copy stays readable.
const RESTORE_DAYS: u32 = 5;

/// How long to wait before looking again, by how deep the object sleeps.
pub fn thaw_delay(option: StorageOption) -> Duration {
    match option {
        StorageOption::GlacierDeepArchive => Duration::from_secs(8 * 3600),
        StorageOption::Glacier | StorageOption::Standard => Duration::from_secs(2 * 3600),
    }
}

/// Stages run by this pipeline.
const STAGES: &[Stage] = &[Stage::Requested];

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Thaw {
    available: usize,
    requested: usize,
    in_progress: usize,
}

struct ColdRestoreStages {
    ctx: Arc<PipelineContext>,
}

pub struct ColdRestorePipeline {
    stages: Arc<ColdRestoreStages>,
    request_tx: Sender<RestorePayload>,
    pools: Vec<StagePool>,
}

impl ColdRestorePipeline {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        let (request_tx, request_rx) = mpsc::channel(ctx.worker.network_channel_size());
        let (done_tx, done_rx) = mpsc::channel::<Task<RestorePayload>>(ctx.worker.work_channel_size());
        let network = ctx.worker.network_connections;
        let workers = ctx.worker.workers;
        let stages = Arc::new(ColdRestoreStages { ctx });

        let request = {
            let (s, done) = (Arc::clone(&stages), done_tx);
            StagePool::spawn("request", network, request_rx, move |task| {
                let (s, done) = (Arc::clone(&s), done.clone());
                async move {
                    let task = s.request(task).await;
                    forward(task, Stage::Requested, &done, &done).await;
                }
            })
        };
        let finish = {
            let s = Arc::clone(&stages);
            StagePool::spawn("finish", workers, done_rx, move |task| {
                let s = Arc::clone(&s);
                async move { finish::finish(&s.ctx, task).await }
            })
        };

        Self {
            stages,
            request_tx,
            pools: vec![request, finish],
        }
    }

    pub async fn shutdown(self) {
        drop(self.request_tx);
        for pool in self.pools {
            pool.join().await;
        }
    }
}

#[async_trait]
impl MessageHandler for ColdRestorePipeline {
    #[instrument(skip_all, fields(topic = "cold_restore", message = %message.id()))]
    async fn handle_message(&self, message: Arc<dyn QueueMessage>) -> Result<(), CuratorError> {
        let ctx = &self.stages.ctx;
        let Some(loaded) = lease::load(ctx, message, &[Action::ColdRestore]).await? else {
            return Ok(());
        };
        if loaded.item.stage != Stage::Requested {
            let key = loaded.item.id.to_string();
            lease::skip(ctx, loaded.message.as_ref(), &key, "files are already thawed").await;
            return Ok(());
        }
        let Some(task) = lease::claim::<RestorePayload>(ctx, loaded, STAGES).await? else {
            return Ok(());
        };
        start(ctx, task, &self.request_tx).await;
        Ok(())
    }
}

impl ColdRestoreStages {
    async fn thaw_file(&self, key: &str, thaw: &mut Thaw) -> Result<(), StorageError> {
        let bucket = &self.ctx.preservation.cold_bucket;
        match self.ctx.storage().head(bucket, key).await?.restore {
            RestoreState::Available => thaw.available += 1,
            RestoreState::InProgress => thaw.in_progress += 1,
            RestoreState::Archived => {
                match self
                    .ctx
                    .storage()
                    .request_restore(bucket, key, RetrievalTier::Standard, RESTORE_DAYS)
                    .await
                {
                    Ok(()) => thaw.requested += 1,
                    // someone else asked first
                    Err(StorageError::Conflict { .. }) => thaw.in_progress += 1,
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(())
    }

    async fn request(&self, mut task: Task<RestorePayload>) -> Task<RestorePayload> {
        let ctx = &self.ctx;
        task.enter_stage(Stage::Requested, ctx.now());
        if !persist_or_record(ctx, &mut task, Stage::Requested).await {
            return task;
        }
        let object = match restorable_object(ctx, task.item()).await {
            Ok(object) => object,
            Err(err) => {
                task.record_error(Stage::Requested, &err);
                return task;
            }
        };

        let mut thaw = Thaw::default();
        for file in object.files.iter().filter(|f| f.state == FileState::Active) {
            let key = file.storage_key();
            if let Err(err) = self.thaw_file(&key, &mut thaw).await {
                task.record_error(Stage::Requested, &err.into());
            }
            ctx.touch(task.message.as_ref()).await;
        }
        debug!(item = %task.item().id, ?thaw, "thaw status");
        task.envelope.payload.restore_requests += thaw.requested;

        let waiting = thaw.requested + thaw.in_progress;
        if waiting > 0 && !task.has_errors() {
            let note = format!(
                "Waiting on {waiting} file(s) to thaw; {} of {} available",
                thaw.available,
                waiting + thaw.available
            );
            info!(item = %task.item().id, waiting, "waiting on cold restore");
            task.wait = Some((thaw_delay(object.storage_option), note));
        }
        task.finish_stage(Stage::Requested, ctx.now());
        task
    }
}
