//! Copy validated payload files into preservation storage.
//!
//! Standard objects go to the primary and the secondary bucket; cold
//! objects go to the cold bucket only. Each copy is recorded on the file
//! in the saved state, so a retried delivery only copies what is missing.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument};

use super::fetch::IngestPayload;
use super::finish;
use super::lease;
use super::stage::{Sender, StagePool, forward, persist_or_record, start};
use super::{PipelineContext, Task};
use crate::domain::{Action, GenericFile, Stage, StorageOption};
use crate::error::CuratorError;
use crate::ports::{MessageHandler, QueueMessage};

/// Stages run by this pipeline.
const STAGES: &[Stage] = &[Stage::Store];

struct StoreStages {
    ctx: Arc<PipelineContext>,
}

pub struct StorePipeline {
    stages: Arc<StoreStages>,
    store_tx: Sender<IngestPayload>,
    pools: Vec<StagePool>,
}

impl StorePipeline {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        let (store_tx, store_rx) = mpsc::channel(ctx.worker.network_channel_size());
        let (done_tx, done_rx) = mpsc::channel::<Task<IngestPayload>>(ctx.worker.work_channel_size());
        let network = ctx.worker.network_connections;
        let workers = ctx.worker.workers;
        let stages = Arc::new(StoreStages { ctx });

        let store = {
            let (s, done) = (Arc::clone(&stages), done_tx);
            StagePool::spawn("store", network, store_rx, move |task| {
                let (s, done) = (Arc::clone(&s), done.clone());
                async move {
                    let task = s.store(task).await;
                    forward(task, Stage::Store, &done, &done).await;
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
            store_tx,
            pools: vec![store, finish],
        }
    }

    pub async fn shutdown(self) {
        drop(self.store_tx);
        for pool in self.pools {
            pool.join().await;
        }
    }
}

#[async_trait]
impl MessageHandler for StorePipeline {
    #[instrument(skip_all, fields(topic = "store", message = %message.id()))]
    async fn handle_message(&self, message: Arc<dyn QueueMessage>) -> Result<(), CuratorError> {
        let ctx = &self.stages.ctx;
        let Some(loaded) = lease::load(ctx, message, &[Action::Ingest]).await? else {
            return Ok(());
        };
        if loaded.item.stage != Stage::Store {
            let key = loaded.item.id.to_string();
            lease::skip(ctx, loaded.message.as_ref(), &key, "item is not at the store stage").await;
            return Ok(());
        }
        let Some(task) = lease::claim::<IngestPayload>(ctx, loaded, STAGES).await? else {
            return Ok(());
        };
        start(ctx, task, &self.store_tx).await;
        Ok(())
    }
}

/// Where one copy of a file goes, and the field recording that it is there.
struct Target<'a> {
    bucket: &'a str,
    done: fn(&mut GenericFile) -> &mut Option<String>,
}

impl StoreStages {
    fn targets(&self, option: StorageOption) -> Vec<Target<'_>> {
        let buckets = &self.ctx.preservation;
        if option.is_cold() {
            vec![Target {
                bucket: &buckets.cold_bucket,
                done: |f| &mut f.primary_url,
            }]
        } else {
            vec![
                Target {
                    bucket: &buckets.primary_bucket,
                    done: |f| &mut f.primary_url,
                },
                Target {
                    bucket: &buckets.secondary_bucket,
                    done: |f| &mut f.secondary_url,
                },
            ]
        }
    }

    async fn store(&self, mut task: Task<IngestPayload>) -> Task<IngestPayload> {
        let ctx = &self.ctx;
        task.enter_stage(Stage::Store, ctx.now());
        if !persist_or_record(ctx, &mut task, Stage::Store).await {
            return task;
        }

        let (Some(mut object), Some(unpack_dir)) = (
            task.envelope.payload.object.take(),
            task.envelope.payload.unpack_dir.clone(),
        ) else {
            task.record_fatal(Stage::Store, "no validated object in the saved state");
            return task;
        };

        let mut stored = 0;
        for file in object.files.iter_mut().filter(|f| f.stored_at.is_none()) {
            let data = match tokio::fs::read(unpack_dir.join(&file.path)).await {
                Ok(data) => data,
                Err(err) => {
                    let msg = format!("{}: {err}", file.identifier);
                    task.envelope.summary(Stage::Store).add_error(msg);
                    continue;
                }
            };
            let key = file.storage_key();
            let mut complete = true;
            for target in self.targets(object.storage_option) {
                if (target.done)(file).is_some() {
                    continue;
                }
                match ctx.storage().put(target.bucket, &key, data.clone()).await {
                    Ok(etag) => {
                        debug!(file = %key, bucket = target.bucket, etag = %etag, "stored copy");
                        *(target.done)(file) = Some(format!("{}/{key}", target.bucket));
                    }
                    Err(err) => {
                        complete = false;
                        let msg = format!("{key} -> {}: {err}", target.bucket);
                        task.envelope.summary(Stage::Store).add_error(msg);
                    }
                }
            }
            if complete {
                file.storage_option = object.storage_option;
                file.stored_at = Some(ctx.now());
                stored += 1;
            }
            ctx.touch(task.message.as_ref()).await;
        }
        info!(item = %task.item().id, stored, files = object.files.len(), "store pass finished");

        task.envelope.payload.object = Some(object);
        // progress is kept even when some copies failed
        persist_or_record(ctx, &mut task, Stage::Store).await;
        task.finish_stage(Stage::Store, ctx.now());
        task
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{IntellectualObject, Status, TaskEnvelope, Topic, WorkItem};
    use crate::pipeline::testing::Harness;
    use crate::ports::Registry;

    async fn staged_item(h: &Harness, option: StorageOption) -> WorkItem {
        let unpack = h.staging.path().join("example.edu/photos.unpacked");
        std::fs::create_dir_all(unpack.join("data")).unwrap();
        std::fs::write(unpack.join("data/a.txt"), b"alpha").unwrap();
        std::fs::write(unpack.join("data/b.txt"), b"beta").unwrap();

        let files = ["data/a.txt", "data/b.txt"]
            .iter()
            .map(|path| GenericFile {
                identifier: format!("example.edu/photos/{path}"),
                object_identifier: "example.edu/photos".to_string(),
                path: path.to_string(),
                ..GenericFile::default()
            })
            .collect();
        let object = IntellectualObject {
            identifier: "example.edu/photos".to_string(),
            institution: "example.edu".to_string(),
            bag_name: "photos".to_string(),
            storage_option: option,
            files,
            ..IntellectualObject::default()
        };

        let item = h
            .queue_item(Action::Ingest, Topic::Store, |item| {
                item.stage = Stage::Store;
                item.name = "photos.tar".to_string();
                item.institution = "example.edu".to_string();
            })
            .await;
        let payload = IngestPayload {
            unpack_dir: Some(unpack),
            object: Some(object),
            ..IngestPayload::default()
        };
        let envelope = TaskEnvelope::new(item.clone(), payload);
        h.registry
            .save_state(item.id, serde_json::to_value(&envelope).unwrap())
            .await
            .unwrap();
        item
    }

    async fn deliver(h: &Harness) {
        let pipeline = StorePipeline::new(h.context(Topic::Store));
        let message = h.next_message(Topic::Store).await;
        pipeline.handle_message(message).await.unwrap();
        pipeline.shutdown().await;
    }

    async fn saved_object(h: &Harness, item: &WorkItem) -> IntellectualObject {
        let state = h.registry.get_state(item.id).await.unwrap().unwrap();
        let envelope: TaskEnvelope<IngestPayload> = serde_json::from_value(state).unwrap();
        envelope.payload.object.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn stores_both_copies_and_moves_to_record() {
        let h = Harness::new();
        let item = staged_item(&h, StorageOption::Standard).await;

        deliver(&h).await;

        let primary = &h.config.preservation.primary_bucket;
        let secondary = &h.config.preservation.secondary_bucket;
        assert_eq!(h.storage.object(primary, "example.edu/photos/data/a.txt").unwrap(), b"alpha");
        assert!(h.storage.contains(secondary, "example.edu/photos/data/b.txt"));
        let saved = h.item(item.id).await;
        assert_eq!(saved.stage, Stage::Record);
        assert_eq!(saved.status, Status::Pending);
        assert_eq!(h.broker.published("record").await, vec![item.id.to_string()]);
        assert!(saved_object(&h, &item).await.files.iter().all(|f| f.stored_at.is_some()));
    }

    #[tokio::test(start_paused = true)]
    async fn cold_objects_go_to_the_cold_bucket() {
        let h = Harness::new();
        staged_item(&h, StorageOption::Glacier).await;

        deliver(&h).await;

        assert_eq!(h.storage.keys(&h.config.preservation.cold_bucket).len(), 2);
        assert!(h.storage.keys(&h.config.preservation.primary_bucket).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_requeues_and_retry_copies_only_the_rest() {
        let h = Harness::new();
        let item = staged_item(&h, StorageOption::Standard).await;
        h.storage.fail_key("example.edu/photos/data/b.txt");

        deliver(&h).await;

        let saved = h.item(item.id).await;
        assert_eq!(saved.stage, Stage::Store);
        assert_eq!(saved.status, Status::Pending);
        assert!(saved.retry);
        assert_eq!(h.storage.put_count(), 2);

        h.storage.clear_failures();
        deliver(&h).await;

        let saved = h.item(item.id).await;
        assert_eq!(saved.stage, Stage::Record);
        assert_eq!(h.storage.put_count(), 4);
        let state = h.registry.get_state(item.id).await.unwrap().unwrap();
        let envelope: TaskEnvelope<IngestPayload> = serde_json::from_value(state).unwrap();
        assert_eq!(envelope.results.get(Stage::Store).unwrap().attempt_number, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_transient_failure_fails_on_the_last_attempt() {
        let h = Harness::new();
        let item = staged_item(&h, StorageOption::Standard).await;
        h.storage.fail_key("example.edu/photos/data/b.txt");

        for _ in 0..2 {
            deliver(&h).await;
            assert_eq!(h.item(item.id).await.status, Status::Pending);
        }
        deliver(&h).await;

        let saved = h.item(item.id).await;
        assert_eq!(saved.status, Status::Failed);
        assert_eq!(saved.stage, Stage::Store);
        assert!(saved.needs_admin_review);
        let counts = h.broker.counts("store", crate::pipeline::testing::CHANNEL).await;
        assert_eq!(counts.requeued, 2);
        assert_eq!(counts.finished, 1);
        assert!(h.broker.published("record").await.is_empty());
    }
}
