//! Record an ingested object in the registry and clean up after it.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

use super::fetch::{IngestPayload, remove_staged};
use super::finish;
use super::lease;
use super::stage::{Sender, StagePool, forward, persist, persist_or_record, start};
use super::{PipelineContext, Task};
use crate::domain::{Action, EventType, PremisEvent, Stage};
use crate::error::CuratorError;
use crate::ports::{MessageHandler, QueueMessage, StorageError};

/// Files per registry batch call.
const FILE_BATCH: usize = 100;

/// Stages run by this pipeline.
const STAGES: &[Stage] = &[Stage::Record, Stage::Cleanup];

struct RecordStages {
    ctx: Arc<PipelineContext>,
}

pub struct RecordPipeline {
    stages: Arc<RecordStages>,
    record_tx: Sender<IngestPayload>,
    pools: Vec<StagePool>,
}

impl RecordPipeline {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        let (record_tx, record_rx) = mpsc::channel(ctx.worker.network_channel_size());
        let (cleanup_tx, cleanup_rx) = mpsc::channel(ctx.worker.work_channel_size());
        let (done_tx, done_rx) = mpsc::channel::<Task<IngestPayload>>(ctx.worker.work_channel_size());
        let network = ctx.worker.network_connections;
        let workers = ctx.worker.workers;
        let stages = Arc::new(RecordStages { ctx });

        let record = {
            let (s, next, done) = (Arc::clone(&stages), cleanup_tx, done_tx.clone());
            StagePool::spawn("record", network, record_rx, move |task| {
                let (s, next, done) = (Arc::clone(&s), next.clone(), done.clone());
                async move {
                    let task = s.record(task).await;
                    forward(task, Stage::Record, &next, &done).await;
                }
            })
        };
        let cleanup = {
            let (s, done) = (Arc::clone(&stages), done_tx);
            StagePool::spawn("cleanup", workers, cleanup_rx, move |task| {
                let (s, done) = (Arc::clone(&s), done.clone());
                async move {
                    let task = s.cleanup(task).await;
                    forward(task, Stage::Cleanup, &done, &done).await;
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
            record_tx,
            pools: vec![record, cleanup, finish],
        }
    }

    pub async fn shutdown(self) {
        drop(self.record_tx);
        for pool in self.pools {
            pool.join().await;
        }
    }
}

#[async_trait]
impl MessageHandler for RecordPipeline {
    #[instrument(skip_all, fields(topic = "record", message = %message.id()))]
    async fn handle_message(&self, message: Arc<dyn QueueMessage>) -> Result<(), CuratorError> {
        let ctx = &self.stages.ctx;
        let Some(loaded) = lease::load(ctx, message, &[Action::Ingest]).await? else {
            return Ok(());
        };
        if loaded.item.stage != Stage::Record {
            let key = loaded.item.id.to_string();
            lease::skip(ctx, loaded.message.as_ref(), &key, "item is not at the record stage").await;
            return Ok(());
        }
        let Some(task) = lease::claim::<IngestPayload>(ctx, loaded, STAGES).await? else {
            return Ok(());
        };
        start(ctx, task, &self.record_tx).await;
        Ok(())
    }
}

impl RecordStages {
    async fn record(&self, mut task: Task<IngestPayload>) -> Task<IngestPayload> {
        let ctx = &self.ctx;
        task.enter_stage(Stage::Record, ctx.now());
        if !persist_or_record(ctx, &mut task, Stage::Record).await {
            return task;
        }
        let Some(object) = task.envelope.payload.object.clone() else {
            task.record_fatal(Stage::Record, "no stored object in the saved state");
            return task;
        };
        if let Some(missing) = object.files.iter().find(|f| f.stored_at.is_none()) {
            let msg = format!("{} was never stored", missing.identifier);
            task.record_fatal(Stage::Record, msg);
            return task;
        }

        if let Err(err) = self.save_graph(&task, &object).await {
            task.record_error(Stage::Record, &err);
            return task;
        }
        if let Err(err) = self.save_events(&mut task, &object).await {
            task.record_error(Stage::Record, &err);
        }

        task.finish_stage(Stage::Record, ctx.now());
        task
    }

    async fn save_graph(
        &self,
        task: &Task<IngestPayload>,
        object: &crate::domain::IntellectualObject,
    ) -> Result<(), CuratorError> {
        let registry = self.ctx.registry();
        let existing = registry.get_object(&object.identifier).await?;
        registry.save_object(object).await?;
        for batch in object.files.chunks(FILE_BATCH) {
            registry.save_generic_files(batch).await?;
            self.ctx.touch(task.message.as_ref()).await;
        }
        info!(
            object = %object.identifier,
            files = object.files.len(),
            reingest = existing.is_some(),
            "recorded object"
        );
        Ok(())
    }

    /// Saves one ingestion event per file not yet in `recorded_events`,
    /// persisting the set after each save.
    async fn save_events(
        &self,
        task: &mut Task<IngestPayload>,
        object: &crate::domain::IntellectualObject,
    ) -> Result<(), CuratorError> {
        let now = self.ctx.now();
        for file in &object.files {
            if task.envelope.payload.recorded_events.contains(&file.identifier) {
                continue;
            }
            let event = PremisEvent {
                identifier: self.ctx.services.ids.event_id(),
                event_type: EventType::Ingestion,
                object_identifier: object.identifier.clone(),
                generic_file_identifier: Some(file.identifier.clone()),
                outcome: "Success".to_string(),
                detail: format!("Stored {} byte(s) in preservation storage", file.size),
                date_time: now,
            };
            self.ctx.registry().save_event(&event).await?;
            task.envelope
                .payload
                .recorded_events
                .insert(file.identifier.clone());
            persist(&self.ctx, task).await?;
        }
        Ok(())
    }

    /// Removes staging and the deposited tar. Not a routable position, so
    /// the item stays at `Record` until the finish pool completes it.
    async fn cleanup(&self, mut task: Task<IngestPayload>) -> Task<IngestPayload> {
        let ctx = &self.ctx;
        task.enter_stage(Stage::Cleanup, ctx.now());
        remove_staged(&task.envelope.payload).await;

        let item = task.item();
        let (bucket, name) = (item.bucket.clone(), item.name.clone());
        match ctx.storage().delete(&bucket, &name).await {
            Ok(()) | Err(StorageError::NotFound { .. }) => {}
            Err(err) => {
                warn!(bucket = %bucket, key = %name, error = %err, "cannot delete ingested bag");
                task.record_error(Stage::Cleanup, &err.into());
            }
        }
        task.finish_stage(Stage::Cleanup, ctx.now());
        task
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{GenericFile, IntellectualObject, Status, TaskEnvelope, Topic, WorkItem};
    use crate::impls::WriteKind;
    use crate::pipeline::testing::{Harness, start_time};
    use crate::ports::Registry;

    const BUCKET: &str = "receiving.example.edu";

    async fn stored_item(h: &Harness) -> WorkItem {
        let tar = h.staging.path().join("example.edu/photos.tar");
        std::fs::create_dir_all(tar.parent().unwrap()).unwrap();
        std::fs::write(&tar, b"tar bytes").unwrap();
        h.storage.insert(BUCKET, "photos.tar", b"tar bytes", start_time());

        let files = (0..3)
            .map(|n| GenericFile {
                identifier: format!("example.edu/photos/data/{n}.txt"),
                object_identifier: "example.edu/photos".to_string(),
                path: format!("data/{n}.txt"),
                size: 10,
                stored_at: Some(start_time()),
                ..GenericFile::default()
            })
            .collect();
        let object = IntellectualObject {
            identifier: "example.edu/photos".to_string(),
            institution: "example.edu".to_string(),
            bag_name: "photos".to_string(),
            files,
            ..IntellectualObject::default()
        };
        let item = h
            .queue_item(Action::Ingest, Topic::Record, |item| {
                item.stage = Stage::Record;
                item.bucket = BUCKET.to_string();
                item.name = "photos.tar".to_string();
                item.institution = "example.edu".to_string();
            })
            .await;
        let payload = IngestPayload {
            tar_path: Some(tar),
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
        let pipeline = RecordPipeline::new(h.context(Topic::Record));
        let message = h.next_message(Topic::Record).await;
        pipeline.handle_message(message).await.unwrap();
        pipeline.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn records_object_files_and_events_then_cleans_up() {
        let h = Harness::new();
        let item = stored_item(&h).await;

        deliver(&h).await;

        let saved = h.item(item.id).await;
        assert_eq!(saved.status, Status::Success);
        assert_eq!(saved.stage, Stage::Cleanup);
        assert!(saved.completed_at.is_some());
        assert_eq!(saved.note, "Item was successfully ingested");

        let object = h.registry.get_object("example.edu/photos").await.unwrap().unwrap();
        assert_eq!(object.files.len(), 3);
        assert!(h.registry.get_generic_file("example.edu/photos/data/2.txt").await.is_ok());
        let events = h.registry.events().await;
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.event_type == EventType::Ingestion));

        assert!(!h.storage.contains(BUCKET, "photos.tar"));
        assert!(!h.staging.path().join("example.edu/photos.tar").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn registry_outage_requeues_at_record() {
        let h = Harness::new();
        let item = stored_item(&h).await;
        let pipeline = RecordPipeline::new(h.context(Topic::Record));
        let message = h.next_message(Topic::Record).await;
        let loaded = lease::load(&pipeline.stages.ctx, message, &[Action::Ingest])
            .await
            .unwrap()
            .unwrap();
        let mut task = lease::claim::<IngestPayload>(&pipeline.stages.ctx, loaded, STAGES)
            .await
            .unwrap()
            .unwrap();
        task.enter_stage(Stage::Record, start_time());
        // the object save is the next write
        h.registry.fail_next_writes(1).await;
        let object = task.envelope.payload.object.clone().unwrap();
        let err = pipeline.stages.save_graph(&task, &object).await.unwrap_err();
        assert!(!err.is_fatal());
        task.record_error(Stage::Record, &err);
        finish::finish(&pipeline.stages.ctx, task).await;
        pipeline.shutdown().await;

        let saved = h.item(item.id).await;
        assert_eq!(saved.stage, Stage::Record);
        assert_eq!(saved.status, Status::Pending);
        assert!(saved.note.contains("requeued"));
        assert!(h.registry.events().await.is_empty());
        assert!(h.storage.contains(BUCKET, "photos.tar"));
    }

    #[tokio::test(start_paused = true)]
    async fn retried_record_saves_each_event_once() {
        let h = Harness::new();
        let item = stored_item(&h).await;
        h.registry.fail_write_after(WriteKind::Event, 1).await;

        deliver(&h).await;

        let saved = h.item(item.id).await;
        assert_eq!(saved.status, Status::Pending);
        assert_eq!(saved.stage, Stage::Record);
        assert_eq!(h.registry.events().await.len(), 1);

        deliver(&h).await;

        assert_eq!(h.item(item.id).await.status, Status::Success);
        let events = h.registry.events().await;
        assert_eq!(events.len(), 3);
        for n in 0..3 {
            let file = format!("example.edu/photos/data/{n}.txt");
            let count = events
                .iter()
                .filter(|e| e.generic_file_identifier.as_deref() == Some(file.as_str()))
                .count();
            assert_eq!(count, 1, "{file}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unstored_file_is_fatal() {
        let h = Harness::new();
        let item = stored_item(&h).await;
        let state = h.registry.get_state(item.id).await.unwrap().unwrap();
        let mut envelope: TaskEnvelope<IngestPayload> = serde_json::from_value(state).unwrap();
        if let Some(object) = envelope.payload.object.as_mut() {
            object.files[1].stored_at = None;
        }
        h.registry
            .save_state(item.id, serde_json::to_value(&envelope).unwrap())
            .await
            .unwrap();

        deliver(&h).await;

        let saved = h.item(item.id).await;
        assert_eq!(saved.status, Status::Failed);
        assert!(saved.note.contains("never stored"));
    }
}
