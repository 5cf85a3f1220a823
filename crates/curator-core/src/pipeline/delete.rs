//! Delete one stored file at an institution's request.
//!
//! Copies are removed tier by tier and each removal is kept in the saved
//! state, so a retried delivery resumes with the tiers still holding data.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, instrument};

use super::finish;
use super::lease;
use super::stage::{Sender, StagePool, forward, persist_or_record, start};
use super::{PipelineContext, Task};
use crate::domain::{Action, EventType, FileState, GenericFile, PremisEvent, Stage};
use crate::error::CuratorError;
use crate::ports::{MessageHandler, QueueMessage, StorageError};

/// Number of recent deletions kept for status output.
const RECENT_DELETIONS: usize = 20;

/// Stages run by this pipeline.
const STAGES: &[Stage] = &[Stage::Requested, Stage::Record];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeletePayload {
    pub file: Option<GenericFile>,
    #[serde(default)]
    pub event_recorded: bool,
}

struct DeleteStages {
    ctx: Arc<PipelineContext>,
    recent: Mutex<VecDeque<String>>,
}

pub struct DeletePipeline {
    stages: Arc<DeleteStages>,
    delete_tx: Sender<DeletePayload>,
    pools: Vec<StagePool>,
}

impl DeletePipeline {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        let (delete_tx, delete_rx) = mpsc::channel(ctx.worker.network_channel_size());
        let (record_tx, record_rx) = mpsc::channel(ctx.worker.network_channel_size());
        let (done_tx, done_rx) = mpsc::channel::<Task<DeletePayload>>(ctx.worker.work_channel_size());
        let network = ctx.worker.network_connections;
        let workers = ctx.worker.workers;
        let stages = Arc::new(DeleteStages {
            ctx,
            recent: Mutex::new(VecDeque::with_capacity(RECENT_DELETIONS)),
        });

        let delete = {
            let (s, next, done) = (Arc::clone(&stages), record_tx, done_tx.clone());
            StagePool::spawn("delete", network, delete_rx, move |task| {
                let (s, next, done) = (Arc::clone(&s), next.clone(), done.clone());
                async move {
                    let task = s.delete(task).await;
                    forward(task, Stage::Requested, &next, &done).await;
                }
            })
        };
        let record = {
            let (s, done) = (Arc::clone(&stages), done_tx);
            StagePool::spawn("record", network, record_rx, move |task| {
                let (s, done) = (Arc::clone(&s), done.clone());
                async move {
                    let task = s.record(task).await;
                    forward(task, Stage::Record, &done, &done).await;
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
            delete_tx,
            pools: vec![delete, record, finish],
        }
    }

    /// Storage keys of the latest deletions, newest last.
    pub fn recently_deleted(&self) -> Vec<String> {
        self.stages
            .recent
            .lock()
            .map(|recent| recent.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn shutdown(self) {
        drop(self.delete_tx);
        for pool in self.pools {
            pool.join().await;
        }
    }
}

#[async_trait]
impl MessageHandler for DeletePipeline {
    #[instrument(skip_all, fields(topic = "file_delete", message = %message.id()))]
    async fn handle_message(&self, message: Arc<dyn QueueMessage>) -> Result<(), CuratorError> {
        let ctx = &self.stages.ctx;
        let Some(loaded) = lease::load(ctx, message, &[Action::Delete]).await? else {
            return Ok(());
        };
        let Some(task) = lease::claim::<DeletePayload>(ctx, loaded, STAGES).await? else {
            return Ok(());
        };
        start(ctx, task, &self.delete_tx).await;
        Ok(())
    }
}

type DeletedAt = fn(&mut GenericFile) -> &mut Option<DateTime<Utc>>;

fn primary(file: &mut GenericFile) -> &mut Option<DateTime<Utc>> {
    &mut file.deleted_from_primary_at
}

fn secondary(file: &mut GenericFile) -> &mut Option<DateTime<Utc>> {
    &mut file.deleted_from_secondary_at
}

impl DeleteStages {
    fn tiers(&self, file: &GenericFile) -> Vec<(&str, DeletedAt)> {
        let buckets = &self.ctx.preservation;
        if file.storage_option.is_cold() {
            vec![(buckets.cold_bucket.as_str(), primary as DeletedAt)]
        } else {
            vec![
                (buckets.primary_bucket.as_str(), primary as DeletedAt),
                (buckets.secondary_bucket.as_str(), secondary as DeletedAt),
            ]
        }
    }

    async fn load_file(&self, task: &Task<DeletePayload>) -> Result<GenericFile, CuratorError> {
        if let Some(file) = &task.envelope.payload.file {
            return Ok(file.clone());
        }
        let Some(identifier) = &task.item().generic_file_identifier else {
            return Err(CuratorError::Validation("deletion names no file".to_string()));
        };
        Ok(self.ctx.registry().get_generic_file(identifier).await?)
    }

    async fn delete(&self, mut task: Task<DeletePayload>) -> Task<DeletePayload> {
        let ctx = &self.ctx;
        task.enter_stage(Stage::Requested, ctx.now());
        if task.item().institutional_approver.as_deref().is_none_or(str::is_empty) {
            task.record_fatal(Stage::Requested, "deletion requires an institutional approver");
            return task;
        }
        if !persist_or_record(ctx, &mut task, Stage::Requested).await {
            return task;
        }
        let mut file = match self.load_file(&task).await {
            Ok(file) => file,
            Err(err) => {
                task.record_error(Stage::Requested, &err);
                return task;
            }
        };

        let key = file.storage_key();
        for (bucket, deleted_at) in self.tiers(&file) {
            if deleted_at(&mut file).is_some() {
                continue;
            }
            match ctx.storage().delete(bucket, &key).await {
                Ok(()) | Err(StorageError::NotFound { .. }) => {
                    *deleted_at(&mut file) = Some(ctx.now());
                }
                Err(err) => {
                    let msg = format!("{bucket}/{key}: {err}");
                    task.envelope.summary(Stage::Requested).add_error(msg);
                }
            }
            ctx.touch(task.message.as_ref()).await;
        }

        task.envelope.payload.file = Some(file);
        persist_or_record(ctx, &mut task, Stage::Requested).await;
        task.finish_stage(Stage::Requested, ctx.now());
        task
    }

    async fn record(&self, mut task: Task<DeletePayload>) -> Task<DeletePayload> {
        let ctx = &self.ctx;
        task.enter_stage(Stage::Record, ctx.now());
        let Some(mut file) = task.envelope.payload.file.clone() else {
            task.record_fatal(Stage::Record, "no file in the saved state");
            return task;
        };

        if !task.envelope.payload.event_recorded {
            let event = PremisEvent {
                identifier: ctx.services.ids.event_id(),
                event_type: EventType::Deletion,
                object_identifier: file.object_identifier.clone(),
                generic_file_identifier: Some(file.identifier.clone()),
                outcome: "Success".to_string(),
                detail: format!(
                    "Deleted at the request of {}, approved by {}",
                    task.item().user,
                    task.item().institutional_approver.as_deref().unwrap_or_default()
                ),
                date_time: ctx.now(),
            };
            if let Err(err) = ctx.registry().save_event(&event).await {
                task.record_error(Stage::Record, &err.into());
                return task;
            }
            task.envelope.payload.event_recorded = true;
        }

        file.state = FileState::Deleted;
        match ctx.registry().save_generic_file(&file).await {
            Ok(saved) => {
                info!(file = %saved.identifier, "file deleted");
                self.remember(saved.storage_key());
                task.envelope.payload.file = Some(saved);
            }
            Err(err) => task.record_error(Stage::Record, &err.into()),
        }
        task.finish_stage(Stage::Record, ctx.now());
        task
    }

    fn remember(&self, key: String) {
        if let Ok(mut recent) = self.recent.lock() {
            if recent.len() == RECENT_DELETIONS {
                recent.pop_front();
            }
            recent.push_back(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Status, Topic, WorkItem};
    use crate::pipeline::testing::{CHANNEL, Harness, start_time};
    use crate::ports::Registry;

    const FILE: &str = "example.edu/photos/data/a.txt";

    async fn setup(h: &Harness, approver: Option<&str>) -> WorkItem {
        let p = &h.config.preservation;
        h.storage.insert(&p.primary_bucket, FILE, b"alpha", start_time());
        h.storage.insert(&p.secondary_bucket, FILE, b"alpha", start_time());
        h.registry
            .insert_file(GenericFile {
                identifier: FILE.to_string(),
                object_identifier: "example.edu/photos".to_string(),
                ..GenericFile::default()
            })
            .await;
        let approver = approver.map(str::to_string);
        h.queue_item(Action::Delete, Topic::FileDelete, |item| {
            item.stage = Stage::Requested;
            item.generic_file_identifier = Some(FILE.to_string());
            item.user = "depositor@example.edu".to_string();
            item.institutional_approver = approver;
        })
        .await
    }

    #[tokio::test(start_paused = true)]
    async fn approved_deletion_removes_both_copies() {
        let h = Harness::new();
        let item = setup(&h, Some("admin@example.edu")).await;
        let pipeline = DeletePipeline::new(h.context(Topic::FileDelete));
        pipeline.handle_message(h.next_message(Topic::FileDelete).await).await.unwrap();
        while h.broker.counts("file_delete", CHANNEL).await.finished == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(pipeline.recently_deleted(), vec![FILE.to_string()]);
        pipeline.shutdown().await;

        let saved = h.item(item.id).await;
        assert_eq!(saved.status, Status::Success);
        assert_eq!(saved.stage, Stage::Resolve);
        assert_eq!(h.storage.delete_count(), 2);
        let file = h.registry.get_generic_file(FILE).await.unwrap();
        assert_eq!(file.state, FileState::Deleted);
        let events = h.registry.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Deletion);
    }

    #[tokio::test(start_paused = true)]
    async fn unapproved_deletion_fails() {
        let h = Harness::new();
        let item = setup(&h, None).await;
        let pipeline = DeletePipeline::new(h.context(Topic::FileDelete));
        pipeline.handle_message(h.next_message(Topic::FileDelete).await).await.unwrap();
        pipeline.shutdown().await;

        let saved = h.item(item.id).await;
        assert_eq!(saved.status, Status::Failed);
        assert!(saved.needs_admin_review);
        assert_eq!(h.storage.delete_count(), 0);
        let file = h.registry.get_generic_file(FILE).await.unwrap();
        assert_eq!(file.state, FileState::Active);
    }

    #[test]
    fn recent_ring_keeps_the_latest() {
        let h = Harness::new();
        let ctx = h.context(Topic::FileDelete);
        let stages = DeleteStages {
            ctx,
            recent: Mutex::new(VecDeque::new()),
        };
        for n in 0..25 {
            stages.remember(format!("k{n}"));
        }
        let recent: Vec<String> = stages.recent.lock().unwrap().iter().cloned().collect();
        assert_eq!(recent.len(), RECENT_DELETIONS);
        assert_eq!(recent.first().map(String::as_str), Some("k5"));
        assert_eq!(recent.last().map(String::as_str), Some("k24"));
    }
}
