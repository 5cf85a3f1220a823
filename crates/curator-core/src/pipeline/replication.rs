//! Receive bags that partner nodes asked this node to replicate.
//!
//! Stages: `copy` confirms the transfer is still wanted and downloads the
//! bag from the transfer link (`bucket/key`), `validate` computes the
//! fixity value over the bag's tag manifest, and `record` reports the copy
//! as received to the requesting node.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

use super::finish;
use super::lease;
use super::stage::{Sender, StagePool, forward, persist_or_record, start};
use super::{PipelineContext, Task};
use crate::domain::{Action, ReplicationTransfer, Stage, TransferStatus};
use crate::error::CuratorError;
use crate::impls::{TAG_MANIFEST_SHA256, tag_manifest_digest};
use crate::ports::{MessageHandler, PartnerClient, PartnerDirectory, QueueMessage};

/// Stages run by this pipeline.
const STAGES: &[Stage] = &[Stage::Copy, Stage::Validate, Stage::Record];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplicationPayload {
    pub transfer: Option<ReplicationTransfer>,
    pub tar_path: Option<PathBuf>,
    pub fixity_value: Option<String>,
}

struct ReplicationStages {
    ctx: Arc<PipelineContext>,
    directory: Arc<dyn PartnerDirectory>,
}

pub struct ReplicationPipeline {
    stages: Arc<ReplicationStages>,
    copy_tx: Sender<ReplicationPayload>,
    pools: Vec<StagePool>,
}

impl ReplicationPipeline {
    pub fn new(ctx: Arc<PipelineContext>, directory: Arc<dyn PartnerDirectory>) -> Self {
        let (copy_tx, copy_rx) = mpsc::channel(ctx.worker.network_channel_size());
        let (validate_tx, validate_rx) = mpsc::channel(ctx.worker.work_channel_size());
        let (record_tx, record_rx) = mpsc::channel(ctx.worker.network_channel_size());
        let (done_tx, done_rx) = mpsc::channel::<Task<ReplicationPayload>>(ctx.worker.work_channel_size());
        let network = ctx.worker.network_connections;
        let workers = ctx.worker.workers;
        let stages = Arc::new(ReplicationStages { ctx, directory });

        let copy = {
            let (s, next, done) = (Arc::clone(&stages), validate_tx, done_tx.clone());
            StagePool::spawn("copy", network, copy_rx, move |task| {
                let (s, next, done) = (Arc::clone(&s), next.clone(), done.clone());
                async move {
                    let task = s.copy(task).await;
                    forward(task, Stage::Copy, &next, &done).await;
                }
            })
        };
        let validate = {
            let (s, next, done) = (Arc::clone(&stages), record_tx, done_tx.clone());
            StagePool::spawn("validate", workers, validate_rx, move |task| {
                let (s, next, done) = (Arc::clone(&s), next.clone(), done.clone());
                async move {
                    let task = s.validate(task).await;
                    forward(task, Stage::Validate, &next, &done).await;
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
                async move { s.finish(task).await }
            })
        };

        Self {
            stages,
            copy_tx,
            pools: vec![copy, validate, record, finish],
        }
    }

    pub async fn shutdown(self) {
        drop(self.copy_tx);
        for pool in self.pools {
            pool.join().await;
        }
    }
}

#[async_trait]
impl MessageHandler for ReplicationPipeline {
    #[instrument(skip_all, fields(topic = "replication", message = %message.id()))]
    async fn handle_message(&self, message: Arc<dyn QueueMessage>) -> Result<(), CuratorError> {
        let ctx = &self.stages.ctx;
        let Some(loaded) = lease::load(ctx, message, &[Action::Replication]).await? else {
            return Ok(());
        };
        let Some(task) = lease::claim::<ReplicationPayload>(ctx, loaded, STAGES).await? else {
            return Ok(());
        };
        start(ctx, task, &self.copy_tx).await;
        Ok(())
    }
}

impl ReplicationStages {
    /// The source node's client; work items keep the node in `bucket`.
    fn client(&self, task: &Task<ReplicationPayload>) -> Result<Arc<dyn PartnerClient>, CuratorError> {
        Ok(self.directory.client(&task.item().bucket)?)
    }

    fn tar_path(&self, task: &Task<ReplicationPayload>) -> PathBuf {
        self.ctx
            .staging_dir
            .join("replication")
            .join(format!("{}.tar", task.item().id))
    }

    async fn download(&self, task: &Task<ReplicationPayload>, transfer: &ReplicationTransfer) -> Result<PathBuf, CuratorError> {
        let Some((bucket, key)) = transfer.link.split_once('/') else {
            return Err(CuratorError::Validation(format!("transfer link {} is not bucket/key", transfer.link)));
        };
        let data = self.ctx.storage().get(bucket, key).await?;
        let path = self.tar_path(task);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, data).await?;
        Ok(path)
    }

    async fn copy(&self, mut task: Task<ReplicationPayload>) -> Task<ReplicationPayload> {
        let ctx = &self.ctx;
        task.enter_stage(Stage::Copy, ctx.now());
        if !persist_or_record(ctx, &mut task, Stage::Copy).await {
            return task;
        }
        let Some(replication_id) = task.item().replication_id.clone() else {
            task.record_fatal(Stage::Copy, "work item has no replication id");
            return task;
        };

        let transfer = match self.client(&task) {
            Ok(client) => client.get_replication(&replication_id).await.map_err(CuratorError::from),
            Err(err) => Err(err),
        };
        let transfer = match transfer {
            Ok(transfer) => transfer,
            Err(err) => {
                task.record_error(Stage::Copy, &err);
                return task;
            }
        };
        if matches!(transfer.status, TransferStatus::Cancelled | TransferStatus::Rejected) {
            let note = format!("Replication {replication_id} was {:?} by {}", transfer.status, transfer.from_node);
            info!(item = %task.item().id, replication = %replication_id, "transfer withdrawn");
            task.cancelled = Some(note);
            return task;
        }

        match self.download(&task, &transfer).await {
            Ok(path) => {
                task.envelope.payload.tar_path = Some(path);
                task.envelope.payload.transfer = Some(transfer);
            }
            Err(err) => task.record_error(Stage::Copy, &err),
        }
        task.finish_stage(Stage::Copy, ctx.now());
        task
    }

    async fn validate(&self, mut task: Task<ReplicationPayload>) -> Task<ReplicationPayload> {
        let ctx = &self.ctx;
        task.enter_stage(Stage::Validate, ctx.now());
        let Some(tar_path) = task.envelope.payload.tar_path.clone() else {
            task.record_fatal(Stage::Validate, "no downloaded bag to validate");
            return task;
        };
        match tokio::task::spawn_blocking(move || tag_manifest_digest(&tar_path)).await {
            Ok(Ok(Some(digest))) => task.envelope.payload.fixity_value = Some(digest),
            Ok(Ok(None)) => {
                task.record_fatal(Stage::Validate, format!("bag has no {TAG_MANIFEST_SHA256}"));
            }
            Ok(Err(err)) => task.record_error(Stage::Validate, &err.into()),
            Err(err) => task.record_error(Stage::Validate, &CuratorError::Other(format!("digest task panicked: {err}"))),
        }
        persist_or_record(ctx, &mut task, Stage::Validate).await;
        task.finish_stage(Stage::Validate, ctx.now());
        task
    }

    async fn record(&self, mut task: Task<ReplicationPayload>) -> Task<ReplicationPayload> {
        let ctx = &self.ctx;
        task.enter_stage(Stage::Record, ctx.now());
        let payload = &task.envelope.payload;
        let (Some(mut transfer), Some(fixity)) = (payload.transfer.clone(), payload.fixity_value.clone()) else {
            task.record_fatal(Stage::Record, "transfer was not copied and validated");
            return task;
        };
        transfer.status = TransferStatus::Received;
        transfer.fixity_value = Some(fixity);
        transfer.updated_at = ctx.now();

        let updated = match self.client(&task) {
            Ok(client) => client.update_replication(&transfer).await.map_err(CuratorError::from),
            Err(err) => Err(err),
        };
        match updated {
            Ok(transfer) => {
                info!(replication = %transfer.replication_id, node = %transfer.from_node, "replication received");
                task.envelope.payload.transfer = Some(transfer);
            }
            Err(err) => task.record_error(Stage::Record, &err),
        }
        task.finish_stage(Stage::Record, ctx.now());
        task
    }

    async fn finish(&self, task: Task<ReplicationPayload>) {
        // the copy is only needed until the partner knows it arrived
        let done = !task.has_errors() && task.wait.is_none();
        if done || task.has_fatal_errors() || task.cancelled.is_some() {
            let path = self.tar_path(&task);
            if let Err(err) = tokio::fs::remove_file(&path).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %err, "cannot remove replicated bag");
                }
            }
        }
        finish::finish(&self.ctx, task).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NodeEntity, Status, Topic, WorkItem};
    use crate::impls::{InMemoryDirectory, InMemoryPartner, pack_bag};
    use crate::pipeline::testing::{Harness, start_time};
    use sha2::{Digest, Sha256};

    const TAGS: &[u8] = b"0000  bagit.txt\n";

    fn partner(status: TransferStatus) -> Arc<InMemoryPartner> {
        let chron = Arc::new(InMemoryPartner::new("chron"));
        chron.put(NodeEntity::ReplicationTransfer(ReplicationTransfer {
            replication_id: "r1".to_string(),
            from_node: "chron".to_string(),
            to_node: "aptrust".to_string(),
            bag: "bag-1".to_string(),
            link: "chron.outbound/bag-1.tar".to_string(),
            status,
            fixity_value: None,
            updated_at: start_time(),
        }));
        chron
    }

    async fn run(h: &Harness, chron: Arc<InMemoryPartner>) -> WorkItem {
        let item = h
            .queue_item(Action::Replication, Topic::Replication, |item| {
                item.stage = Stage::Requested;
                item.bucket = "chron".to_string();
                item.name = "bag-1".to_string();
                item.replication_id = Some("r1".to_string());
            })
            .await;
        let directory = Arc::new(InMemoryDirectory::new("aptrust").with_partner(chron));
        let pipeline = ReplicationPipeline::new(h.context(Topic::Replication), directory);
        pipeline.handle_message(h.next_message(Topic::Replication).await).await.unwrap();
        pipeline.shutdown().await;
        h.item(item.id).await
    }

    #[tokio::test(start_paused = true)]
    async fn received_copy_is_reported_with_fixity() {
        let h = Harness::new();
        let bag = pack_bag(
            "bag-1",
            &[
                ("data/a".to_string(), b"x".to_vec()),
                (TAG_MANIFEST_SHA256.to_string(), TAGS.to_vec()),
            ],
        )
        .unwrap();
        h.storage.insert("chron.outbound", "bag-1.tar", &bag, start_time());
        let chron = partner(TransferStatus::Requested);

        let item = run(&h, Arc::clone(&chron)).await;

        assert_eq!(item.status, Status::Success);
        let transfer = chron.replication("r1").unwrap();
        assert_eq!(transfer.status, TransferStatus::Received);
        assert_eq!(transfer.fixity_value, Some(hex::encode(Sha256::digest(TAGS))));
        assert!(!h.staging.path().join("replication").join(format!("{}.tar", item.id)).exists());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_transfer_cancels_item() {
        let h = Harness::new();
        let item = run(&h, partner(TransferStatus::Cancelled)).await;
        assert_eq!(item.status, Status::Cancelled);
        assert!(!item.retry);
    }

    #[tokio::test(start_paused = true)]
    async fn bag_without_tag_manifest_fails() {
        let h = Harness::new();
        let bag = pack_bag("bag-1", &[("data/a".to_string(), b"x".to_vec())]).unwrap();
        h.storage.insert("chron.outbound", "bag-1.tar", &bag, start_time());
        let chron = partner(TransferStatus::Requested);

        let item = run(&h, Arc::clone(&chron)).await;

        assert_eq!(item.status, Status::Failed);
        assert!(item.note.contains(TAG_MANIFEST_SHA256));
        assert_eq!(chron.replication("r1").unwrap().status, TransferStatus::Requested);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_partner_requeues() {
        let h = Harness::new();
        let chron = partner(TransferStatus::Requested);
        chron.set_unreachable(true);
        let item = run(&h, chron).await;
        assert_eq!(item.status, Status::Pending);
        assert!(item.retry);
    }
}
