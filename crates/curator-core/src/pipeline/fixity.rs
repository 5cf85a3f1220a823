//! Periodic fixity checks of stored files.
//!
//! Messages carry a generic file identifier rather than a work item id, so
//! this pipeline keeps its own task type and takes the attempt number from
//! the message. The checksum is taken from the primary copy.

use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use super::lease::skip;
use super::{PipelineContext, StagePool};
use crate::domain::{AttemptContext, Decision, EventType, FileState, GenericFile, PremisEvent, StorageOption, WorkSummary};
use crate::error::CuratorError;
use crate::ports::{MessageHandler, QueueMessage, RegistryError};

pub struct FixityTask {
    pub file: GenericFile,
    pub message: Arc<dyn QueueMessage>,
    pub summary: WorkSummary,
    pub actual: Option<String>,
}

struct FixityStages {
    ctx: Arc<PipelineContext>,
}

pub struct FixityPipeline {
    stages: Arc<FixityStages>,
    checksum_tx: mpsc::Sender<FixityTask>,
    pools: Vec<StagePool>,
}

async fn forward(task: FixityTask, next: &mpsc::Sender<FixityTask>, done: &mpsc::Sender<FixityTask>) {
    let target = if task.summary.has_errors() { done } else { next };
    if let Err(err) = target.send(task).await {
        error!(file = %err.0.file.identifier, "downstream stage is gone");
    }
}

impl FixityPipeline {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        let (checksum_tx, checksum_rx) = mpsc::channel(ctx.worker.network_channel_size());
        let (record_tx, record_rx) = mpsc::channel(ctx.worker.network_channel_size());
        let (done_tx, done_rx) = mpsc::channel(ctx.worker.work_channel_size());
        let network = ctx.worker.network_connections;
        let workers = ctx.worker.workers;
        let stages = Arc::new(FixityStages { ctx });

        let checksum = {
            let (s, next, done) = (Arc::clone(&stages), record_tx, done_tx.clone());
            StagePool::spawn("checksum", network, checksum_rx, move |task| {
                let (s, next, done) = (Arc::clone(&s), next.clone(), done.clone());
                async move {
                    let task = s.checksum(task).await;
                    forward(task, &next, &done).await;
                }
            })
        };
        let record = {
            let (s, done) = (Arc::clone(&stages), done_tx);
            StagePool::spawn("record", network, record_rx, move |task| {
                let (s, done) = (Arc::clone(&s), done.clone());
                async move {
                    let task = s.record(task).await;
                    forward(task, &done, &done).await;
                }
            })
        };
        let finish = {
            let s = Arc::clone(&stages);
            StagePool::spawn("finish", workers, done_rx, move |task| {
                let s = Arc::clone(&s);
                async move { s.finish(task).await }
            })
        };

        Self {
            stages,
            checksum_tx,
            pools: vec![checksum, record, finish],
        }
    }

    pub async fn shutdown(self) {
        drop(self.checksum_tx);
        for pool in self.pools {
            pool.join().await;
        }
    }
}

#[async_trait]
impl MessageHandler for FixityPipeline {
    #[instrument(skip_all, fields(topic = "fixity", message = %message.id()))]
    async fn handle_message(&self, message: Arc<dyn QueueMessage>) -> Result<(), CuratorError> {
        let ctx = &self.stages.ctx;
        let identifier = message.body().trim().to_string();
        let file = match ctx.registry().get_generic_file(&identifier).await {
            Ok(file) => file,
            Err(RegistryError::NotFound(_)) => {
                skip(ctx, message.as_ref(), &identifier, "file not found").await;
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let reason = if file.state != FileState::Active {
            Some("file is deleted")
        } else if file.storage_option != StorageOption::Standard {
            Some("file is in cold storage")
        } else if !file.needs_fixity_check(ctx.now(), ctx.fixity_max_days) {
            Some("fixity check is not due")
        } else if !ctx.enter_in_flight(&identifier) {
            Some("already in process in this worker")
        } else {
            None
        };
        if let Some(reason) = reason {
            skip(ctx, message.as_ref(), &identifier, reason).await;
            return Ok(());
        }

        message.disable_auto_response();
        let mut summary = WorkSummary::new();
        summary.attempt_number = message.attempts();
        summary.start_at(ctx.now());
        let task = FixityTask {
            file,
            message,
            summary,
            actual: None,
        };
        if let Err(err) = self.checksum_tx.send(task).await {
            let task = err.0;
            ctx.leave_in_flight(&identifier);
            if let Err(err) = task.message.requeue(ctx.worker.requeue_delay()).await {
                warn!(message = %task.message.id(), error = %err, "requeue failed");
            }
        }
        Ok(())
    }
}

impl FixityStages {
    async fn checksum(&self, mut task: FixityTask) -> FixityTask {
        let ctx = &self.ctx;
        let key = task.file.storage_key();
        match ctx.storage().get(&ctx.preservation.primary_bucket, &key).await {
            Ok(data) => task.actual = Some(hex::encode(Sha256::digest(&data))),
            Err(err) => {
                let err = CuratorError::from(err);
                warn!(file = %key, error = %err, "cannot read primary copy");
                if err.is_fatal() {
                    task.summary.fatal(err.to_string());
                } else {
                    task.summary.add_error(err.to_string());
                }
            }
        }
        task
    }

    async fn record(&self, mut task: FixityTask) -> FixityTask {
        let ctx = &self.ctx;
        let now = ctx.now();
        let Some(actual) = task.actual.clone() else {
            task.summary.fatal("no checksum was computed");
            return task;
        };
        let (outcome, detail) = match task.file.sha256.as_deref() {
            Some(expected) if expected == actual => ("Success", format!("sha256 {actual} matches")),
            Some(expected) => ("Failed", format!("sha256 {actual} does not match expected {expected}")),
            None => ("Success", format!("no prior sha256, recorded {actual}")),
        };
        // the file's check time moves only after the event is saved, so a
        // newer event means an earlier delivery got this far
        let saved = match ctx
            .registry()
            .latest_event(&task.file.identifier, EventType::FixityCheck)
            .await
        {
            Ok(latest) => latest.is_some_and(|event| {
                task.file.last_fixity_check.is_none_or(|last| event.date_time > last)
            }),
            Err(err) => {
                task.summary.add_error(format!("cannot look up fixity events: {err}"));
                return task;
            }
        };
        if saved {
            debug!(file = %task.file.identifier, "fixity event already saved");
        } else {
            let event = PremisEvent {
                identifier: ctx.services.ids.event_id(),
                event_type: EventType::FixityCheck,
                object_identifier: task.file.object_identifier.clone(),
                generic_file_identifier: Some(task.file.identifier.clone()),
                outcome: outcome.to_string(),
                detail: detail.clone(),
                date_time: now,
            };
            if let Err(err) = ctx.registry().save_event(&event).await {
                task.summary.add_error(format!("cannot save fixity event: {err}"));
                return task;
            }
        }

        if task.file.sha256.is_none() {
            task.file.sha256 = Some(actual);
        }
        task.file.last_fixity_check = Some(now);
        if let Err(err) = ctx.registry().save_generic_file(&task.file).await {
            task.summary.add_error(format!("cannot save file: {err}"));
            return task;
        }
        if outcome == "Failed" {
            task.summary.fatal(detail);
        }
        task
    }

    async fn finish(&self, mut task: FixityTask) {
        let ctx = &self.ctx;
        task.summary.finish_at(ctx.now());
        let id = task.file.identifier.clone();

        if !task.summary.has_errors() {
            info!(file = %id, "fixity check passed");
            ctx.count(|s| s.succeeded.push(id.clone()));
            if let Err(err) = task.message.finish().await {
                warn!(message = %task.message.id(), error = %err, "finish failed");
            }
            ctx.leave_in_flight(&id);
            return;
        }

        let attempt = AttemptContext {
            attempt_number: task.summary.attempt_number,
            max_attempts: ctx.worker.max_attempts,
            fatal: task.summary.error_is_fatal,
        };
        let errors = task.summary.all_errors_as_string();
        match ctx.decider().decide(&attempt) {
            Decision::Requeue { delay, reason } => {
                warn!(file = %id, attempt = attempt.attempt_number, reason = %reason, errors = %errors, "requeueing fixity check");
                ctx.count(|s| s.requeued.push(id.clone()));
                if let Err(err) = task.message.requeue(delay).await {
                    warn!(message = %task.message.id(), error = %err, "requeue failed");
                }
            }
            Decision::Fail { reason } => {
                error!(file = %id, attempt = attempt.attempt_number, reason = %reason, errors = %errors, "fixity check failed");
                ctx.count(|s| s.failed.push(id.clone()));
                if let Err(err) = task.message.finish().await {
                    warn!(message = %task.message.id(), error = %err, "finish failed");
                }
            }
        }
        ctx.leave_in_flight(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Topic;
    use crate::impls::WriteKind;
    use crate::pipeline::testing::{CHANNEL, Harness, start_time};
    use crate::ports::{QueueBroker, Registry};

    const FILE: &str = "example.edu/photos/data/a.txt";

    async fn stored_file(h: &Harness, content: &[u8], sha256: Option<String>) {
        h.storage.insert(&h.config.preservation.primary_bucket, FILE, content, start_time());
        h.registry
            .insert_file(GenericFile {
                identifier: FILE.to_string(),
                object_identifier: "example.edu/photos".to_string(),
                path: "data/a.txt".to_string(),
                sha256,
                last_fixity_check: Some(start_time() - chrono::Duration::days(120)),
                ..GenericFile::default()
            })
            .await;
        h.broker.enqueue("fixity", FILE).await.unwrap();
    }

    async fn deliver(h: &Harness) {
        let pipeline = FixityPipeline::new(h.context(Topic::Fixity));
        let message = h.next_message(Topic::Fixity).await;
        pipeline.handle_message(message).await.unwrap();
        pipeline.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn matching_digest_records_success() {
        let h = Harness::new();
        stored_file(&h, b"alpha", Some(hex::encode(Sha256::digest(b"alpha")))).await;

        deliver(&h).await;

        let file = h.registry.get_generic_file(FILE).await.unwrap();
        assert_eq!(file.last_fixity_check, Some(start_time()));
        let events = h.registry.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].outcome, "Success");
        assert_eq!(h.broker.counts("fixity", CHANNEL).await.finished, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn mismatch_is_recorded_and_not_retried() {
        let h = Harness::new();
        stored_file(&h, b"alpha", Some(hex::encode(Sha256::digest(b"other")))).await;
        let ctx = h.context(Topic::Fixity);
        let pipeline = FixityPipeline::new(Arc::clone(&ctx));
        let message = h.next_message(Topic::Fixity).await;
        pipeline.handle_message(message).await.unwrap();
        pipeline.shutdown().await;

        let events = h.registry.events().await;
        assert_eq!(events[0].outcome, "Failed");
        assert_eq!(ctx.stats().unwrap().failed, vec![FILE.to_string()]);
        let counts = h.broker.counts("fixity", CHANNEL).await;
        assert_eq!(counts.finished, 1);
        assert_eq!(counts.requeued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unreadable_copy_requeues() {
        let h = Harness::new();
        stored_file(&h, b"alpha", None).await;
        h.storage.fail_key(FILE);

        deliver(&h).await;

        let counts = h.broker.counts("fixity", CHANNEL).await;
        assert_eq!(counts.requeued, 1);
        assert!(h.registry.events().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn retried_check_saves_one_event() {
        let h = Harness::new();
        stored_file(&h, b"alpha", Some(hex::encode(Sha256::digest(b"alpha")))).await;
        h.registry.fail_write_after(WriteKind::GenericFile, 0).await;

        deliver(&h).await;

        assert_eq!(h.broker.counts("fixity", CHANNEL).await.requeued, 1);
        assert_eq!(h.registry.events().await.len(), 1);
        let file = h.registry.get_generic_file(FILE).await.unwrap();
        assert_ne!(file.last_fixity_check, Some(start_time()));

        deliver(&h).await;

        let file = h.registry.get_generic_file(FILE).await.unwrap();
        assert_eq!(file.last_fixity_check, Some(start_time()));
        assert_eq!(h.registry.events().await.len(), 1);
        assert_eq!(h.broker.counts("fixity", CHANNEL).await.finished, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recent_check_is_skipped() {
        let h = Harness::new();
        h.registry
            .insert_file(GenericFile {
                identifier: FILE.to_string(),
                last_fixity_check: Some(start_time() - chrono::Duration::days(3)),
                ..GenericFile::default()
            })
            .await;
        h.broker.enqueue("fixity", FILE).await.unwrap();

        deliver(&h).await;

        assert!(h.registry.events().await.is_empty());
        assert_eq!(h.broker.counts("fixity", CHANNEL).await.finished, 1);
    }
}
