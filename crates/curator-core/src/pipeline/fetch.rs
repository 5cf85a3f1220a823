//! Fetch and validate bags from receiving buckets.
//!
//! Stages: `fetch` downloads the tar into staging and checks it against
//! the etag recorded when the item was created; `validate` runs the
//! [`BagReader`] and keeps the resulting object graph in the saved state
//! for the store and record pipelines. A delivery that finds the tar
//! already staged at `Validate` resumes there.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

use super::finish;
use super::lease::{self, skip};
use super::stage::{Sender, StagePool, forward, persist_or_record, start};
use super::{PipelineContext, Task, staging_path};
use crate::domain::{Action, IntellectualObject, Stage, WorkItem, normalize_etag};
use crate::error::CuratorError;
use crate::ports::{BagHeader, BagReader, MessageHandler, QueueMessage, StorageError, WorkItemQuery};

/// Downloads are retried this many times before the stage gives up.
const DOWNLOAD_TRIES: u32 = 10;
const DOWNLOAD_BACKOFF: Duration = Duration::from_millis(500);
/// Delay before looking again at a bag an older item still works on.
const OLDER_ITEM_DELAY: Duration = Duration::from_secs(8 * 3600);

/// Stages run by this pipeline.
const STAGES: &[Stage] = &[Stage::Fetch, Stage::Validate];

/// Saved state shared by the fetch, store and record pipelines.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestPayload {
    pub tar_path: Option<PathBuf>,
    pub unpack_dir: Option<PathBuf>,
    pub object: Option<IntellectualObject>,
    /// Files whose ingestion event is saved; a retried record stage
    /// skips them.
    #[serde(default)]
    pub recorded_events: BTreeSet<String>,
}

enum Upstream {
    Unchanged,
    Replaced(String),
    Gone,
}

struct FetchStages {
    ctx: Arc<PipelineContext>,
    reader: Arc<dyn BagReader>,
}

pub struct FetchPipeline {
    stages: Arc<FetchStages>,
    fetch_tx: Sender<IngestPayload>,
    validate_tx: Sender<IngestPayload>,
    pools: Vec<StagePool>,
}

impl FetchPipeline {
    pub fn new(ctx: Arc<PipelineContext>, reader: Arc<dyn BagReader>) -> Self {
        let (fetch_tx, fetch_rx) = mpsc::channel(ctx.worker.network_channel_size());
        let (validate_tx, validate_rx) = mpsc::channel(ctx.worker.work_channel_size());
        let (done_tx, done_rx) = mpsc::channel::<Task<IngestPayload>>(ctx.worker.work_channel_size());
        let network = ctx.worker.network_connections;
        let workers = ctx.worker.workers;
        let stages = Arc::new(FetchStages { ctx, reader });

        let fetch = {
            let (s, next, done) = (Arc::clone(&stages), validate_tx.clone(), done_tx.clone());
            StagePool::spawn("fetch", network, fetch_rx, move |task| {
                let (s, next, done) = (Arc::clone(&s), next.clone(), done.clone());
                async move {
                    let task = s.fetch(task).await;
                    forward(task, Stage::Fetch, &next, &done).await;
                }
            })
        };
        let validate = {
            let (s, done) = (Arc::clone(&stages), done_tx);
            StagePool::spawn("validate", workers, validate_rx, move |task| {
                let (s, done) = (Arc::clone(&s), done.clone());
                async move {
                    let task = s.validate(task).await;
                    forward(task, Stage::Validate, &done, &done).await;
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
            fetch_tx,
            validate_tx,
            pools: vec![fetch, validate, finish],
        }
    }

    /// Stops accepting tasks and waits for the stages to drain.
    pub async fn shutdown(self) {
        drop(self.fetch_tx);
        drop(self.validate_tx);
        for pool in self.pools {
            pool.join().await;
        }
    }
}

#[async_trait]
impl MessageHandler for FetchPipeline {
    #[instrument(skip_all, fields(topic = "fetch", message = %message.id()))]
    async fn handle_message(&self, message: Arc<dyn QueueMessage>) -> Result<(), CuratorError> {
        let ctx = &self.stages.ctx;
        let Some(loaded) = lease::load(ctx, message, &[Action::Ingest]).await? else {
            return Ok(());
        };
        let key = loaded.item.id.to_string();
        if loaded.item.is_past_ingest() {
            skip(ctx, loaded.message.as_ref(), &key, "item is already past ingest").await;
            return Ok(());
        }

        if let Some(older) = self.stages.older_item(&loaded.item).await? {
            info!(item = %key, older = %older, "an older item is still working on this bag");
            if let Err(err) = loaded.message.requeue(OLDER_ITEM_DELAY).await {
                warn!(message = %loaded.message.id(), error = %err, "requeue failed");
            }
            return Ok(());
        }

        if let Upstream::Replaced(etag) = self.stages.check_upstream(&loaded.item).await? {
            let mut item = loaded.item;
            let note = format!("Bag was replaced in the receiving bucket (etag {etag}); a newer item will ingest it");
            info!(item = %key, etag = %etag, "bag replaced upstream, cancelling");
            item.mark_cancelled(note, ctx.now());
            ctx.registry().save_work_item(&item).await?;
            ctx.count(|s| s.skipped.push(item.locator()));
            if let Err(err) = loaded.message.finish().await {
                warn!(message = %loaded.message.id(), error = %err, "finish failed");
            }
            return Ok(());
        }

        let Some(task) = lease::claim::<IngestPayload>(ctx, loaded, STAGES).await? else {
            return Ok(());
        };
        let staged = task.item().stage == Stage::Validate
            && task.envelope.payload.tar_path.as_ref().is_some_and(|p| p.exists());
        let first = if staged { &self.validate_tx } else { &self.fetch_tx };
        start(ctx, task, first).await;
        Ok(())
    }
}

impl FetchStages {
    /// Oldest other unfinished item for the same bag, if any.
    async fn older_item(&self, item: &WorkItem) -> Result<Option<String>, CuratorError> {
        let mut query = WorkItemQuery {
            action: Some(Action::Ingest),
            name: Some(item.name.clone()),
            ..WorkItemQuery::first_page(100)
        };
        loop {
            let page = self.ctx.registry().list_work_items(&query).await?;
            let older = page.items.iter().find(|other| {
                other.id != item.id
                    && other.bucket == item.bucket
                    && other.created_at < item.created_at
                    && !other.is_terminal()
            });
            if let Some(older) = older {
                return Ok(Some(older.id.to_string()));
            }
            if !page.has_next {
                return Ok(None);
            }
            query.page += 1;
        }
    }

    async fn check_upstream(&self, item: &WorkItem) -> Result<Upstream, CuratorError> {
        match self.ctx.storage().head(&item.bucket, &item.name).await {
            Ok(meta) => {
                let etag = normalize_etag(&meta.info.etag);
                if etag == item.etag {
                    Ok(Upstream::Unchanged)
                } else {
                    Ok(Upstream::Replaced(etag))
                }
            }
            // the fetch stage turns this into a fatal error on the item
            Err(StorageError::NotFound { .. }) => Ok(Upstream::Gone),
            Err(err) => Err(err.into()),
        }
    }

    async fn download(&self, task: &Task<IngestPayload>) -> Result<Vec<u8>, CuratorError> {
        let item = task.item();
        let mut tries = 0;
        loop {
            tries += 1;
            match self.ctx.storage().get(&item.bucket, &item.name).await {
                Ok(bytes) => return Ok(bytes),
                Err(err @ StorageError::NotFound { .. }) => return Err(err.into()),
                Err(err) if tries >= DOWNLOAD_TRIES => return Err(err.into()),
                Err(err) => {
                    warn!(item = %item.id, tries, error = %err, "download failed, retrying");
                    self.ctx.touch(task.message.as_ref()).await;
                    tokio::time::sleep(DOWNLOAD_BACKOFF * tries).await;
                }
            }
        }
    }

    async fn fetch(&self, mut task: Task<IngestPayload>) -> Task<IngestPayload> {
        let ctx = &self.ctx;
        task.enter_stage(Stage::Fetch, ctx.now());
        if !persist_or_record(ctx, &mut task, Stage::Fetch).await {
            return task;
        }

        match self.download(&task).await {
            Ok(bytes) => {
                let etag = &task.item().etag;
                let md5 = format!("{:x}", md5::compute(&bytes));
                // multipart etags are not a digest of the content
                if !etag.contains('-') && md5 != *etag {
                    let msg = format!("downloaded bag has md5 {md5}, expected etag {etag}");
                    task.record_fatal(Stage::Fetch, msg);
                } else {
                    let tar_path = staging_path(ctx, task.item());
                    match write_staged(&tar_path, &bytes).await {
                        Ok(()) => task.envelope.payload.tar_path = Some(tar_path),
                        Err(err) => task.record_error(Stage::Fetch, &err.into()),
                    }
                }
            }
            Err(err) => task.record_error(Stage::Fetch, &err),
        }

        task.finish_stage(Stage::Fetch, ctx.now());
        task
    }

    async fn validate(&self, mut task: Task<IngestPayload>) -> Task<IngestPayload> {
        let ctx = &self.ctx;
        task.enter_stage(Stage::Validate, ctx.now());
        if !persist_or_record(ctx, &mut task, Stage::Validate).await {
            return task;
        }

        let Some(tar_path) = task.envelope.payload.tar_path.clone() else {
            task.record_fatal(Stage::Validate, "no staged tar to validate");
            return task;
        };
        let item = task.item();
        let bag_name = item.name.strip_suffix(".tar").unwrap_or(&item.name).to_string();
        let header = BagHeader {
            object_identifier: item
                .object_identifier
                .clone()
                .unwrap_or_else(|| format!("{}/{bag_name}", item.institution)),
            institution: item.institution.clone(),
            bag_name,
            etag: item.etag.clone(),
        };
        let unpack_dir = tar_path.with_extension("unpacked");

        let reader = Arc::clone(&self.reader);
        let (tar, dir) = (tar_path.clone(), unpack_dir.clone());
        let result = tokio::task::spawn_blocking(move || reader.read_bag(&tar, &dir, &header)).await;
        match result {
            Ok(Ok(object)) => {
                info!(item = %task.item().id, files = object.files.len(), "bag is valid");
                task.envelope.payload.unpack_dir = Some(unpack_dir);
                task.envelope.payload.object = Some(object);
            }
            Ok(Err(err)) => task.record_error(Stage::Validate, &err.into()),
            Err(err) => task.record_error(Stage::Validate, &CuratorError::Other(format!("bag reader panicked: {err}"))),
        }

        task.finish_stage(Stage::Validate, ctx.now());
        task
    }

    async fn finish(&self, task: Task<IngestPayload>) {
        if task.has_errors() {
            remove_staged(&task.envelope.payload).await;
        }
        finish::finish(&self.ctx, task).await;
    }
}

async fn write_staged(path: &std::path::Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, bytes).await
}

/// Removes whatever a delivery left in staging; missing files are fine.
pub(crate) async fn remove_staged(payload: &IngestPayload) {
    if let Some(tar) = &payload.tar_path {
        if let Err(err) = tokio::fs::remove_file(tar).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %tar.display(), error = %err, "cannot remove staged tar");
            }
        }
    }
    if let Some(dir) = &payload.unpack_dir {
        if let Err(err) = tokio::fs::remove_dir_all(dir).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %dir.display(), error = %err, "cannot remove unpacked bag");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Status, Topic};
    use crate::impls::{TarBagReader, pack_bag};
    use crate::pipeline::testing::{Harness, start_time};
    use crate::ports::Registry;

    const BUCKET: &str = "receiving.example.edu";

    fn bag() -> Vec<u8> {
        pack_bag(
            "photos",
            &[
                ("data/a.jpg".to_string(), b"jpeg bytes".to_vec()),
                ("data/notes.txt".to_string(), b"hello".to_vec()),
            ],
        )
        .unwrap()
    }

    async fn deliver(h: &Harness) {
        let pipeline = FetchPipeline::new(h.context(Topic::Fetch), Arc::new(TarBagReader));
        let message = h.next_message(Topic::Fetch).await;
        pipeline.handle_message(message).await.unwrap();
        pipeline.shutdown().await;
    }

    async fn queue(h: &Harness, etag: &str) -> WorkItem {
        let etag = etag.to_string();
        h.queue_item(Action::Ingest, Topic::Fetch, |item| {
            item.bucket = BUCKET.to_string();
            item.name = "photos.tar".to_string();
            item.etag = etag;
            item.institution = "example.edu".to_string();
            item.object_identifier = Some("example.edu/photos".to_string());
        })
        .await
    }

    #[tokio::test(start_paused = true)]
    async fn valid_bag_moves_to_store() {
        let h = Harness::new();
        let etag = h.storage.insert(BUCKET, "photos.tar", &bag(), start_time());
        let item = queue(&h, &etag).await;

        deliver(&h).await;

        let saved = h.item(item.id).await;
        assert_eq!(saved.stage, Stage::Store);
        assert_eq!(saved.status, Status::Pending);
        assert!(saved.queued_at.is_some());
        assert!(saved.node.is_empty());
        assert_eq!(h.broker.published("store").await, vec![item.id.to_string()]);

        let state = h.registry.get_state(item.id).await.unwrap().unwrap();
        let envelope: crate::domain::TaskEnvelope<IngestPayload> = serde_json::from_value(state).unwrap();
        let object = envelope.payload.object.unwrap();
        assert_eq!(object.identifier, "example.edu/photos");
        assert_eq!(object.files.len(), 2);
        assert!(envelope.payload.tar_path.unwrap().exists());
        assert_eq!(envelope.results.get(Stage::Fetch).unwrap().attempt_number, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn replaced_bag_cancels_item() {
        let h = Harness::new();
        h.storage.insert(BUCKET, "photos.tar", &bag(), start_time());
        let item = queue(&h, "0123456789abcdef0123456789abcdef").await;

        deliver(&h).await;

        let saved = h.item(item.id).await;
        assert_eq!(saved.status, Status::Cancelled);
        assert!(!saved.retry);
        assert!(h.broker.published("store").await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_bag_fails_without_retry() {
        let h = Harness::new();
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(3);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "photos/data/a.txt", &b"abc"[..]).unwrap();
        let bytes = builder.into_inner().unwrap();
        let etag = h.storage.insert(BUCKET, "photos.tar", &bytes, start_time());
        let item = queue(&h, &etag).await;

        deliver(&h).await;

        let saved = h.item(item.id).await;
        assert_eq!(saved.status, Status::Failed);
        assert!(!saved.retry);
        assert!(saved.needs_admin_review);
        assert!(saved.note.contains("bagit.txt"));
        assert!(!staging_path(&h.context(Topic::Fetch), &saved).exists());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_bag_is_fatal() {
        let h = Harness::new();
        let item = queue(&h, "0123456789abcdef0123456789abcdef").await;

        deliver(&h).await;

        let saved = h.item(item.id).await;
        assert_eq!(saved.status, Status::Failed);
        assert!(saved.needs_admin_review);
    }

    #[tokio::test(start_paused = true)]
    async fn younger_item_waits_for_older_one() {
        let h = Harness::new();
        let etag = h.storage.insert(BUCKET, "photos.tar", &bag(), start_time());
        let mut older = WorkItem::new(h.ids.work_item_id(), Action::Ingest, start_time() - chrono::Duration::hours(1));
        older.bucket = BUCKET.to_string();
        older.name = "photos.tar".to_string();
        h.registry.save_work_item(&older).await.unwrap();
        let item = queue(&h, &etag).await;

        deliver(&h).await;

        let saved = h.item(item.id).await;
        assert_eq!(saved.status, Status::Pending);
        assert!(saved.node.is_empty());
        let counts = h.broker.counts("fetch", crate::pipeline::testing::CHANNEL).await;
        assert_eq!(counts.deferred, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn store_counts_its_own_attempts_after_fetch() {
        use crate::pipeline::StorePipeline;
        use crate::pipeline::testing::CHANNEL;

        let h = Harness::new();
        let etag = h.storage.insert(BUCKET, "photos.tar", &bag(), start_time());
        let item = queue(&h, &etag).await;
        deliver(&h).await;
        assert_eq!(h.item(item.id).await.stage, Stage::Store);

        h.storage.fail_key("example.edu/photos/data/notes.txt");
        async fn deliver_store(h: &Harness) {
            let pipeline = StorePipeline::new(h.context(Topic::Store));
            let message = h.next_message(Topic::Store).await;
            pipeline.handle_message(message).await.unwrap();
            pipeline.shutdown().await;
        }

        for expected in 1..=2 {
            deliver_store(&h).await;
            let saved = h.item(item.id).await;
            assert_eq!(saved.status, Status::Pending, "store try {expected}");
            assert!(saved.retry);
            assert!(!saved.needs_admin_review);
            let state = h.registry.get_state(item.id).await.unwrap().unwrap();
            let envelope: crate::domain::TaskEnvelope<IngestPayload> = serde_json::from_value(state).unwrap();
            assert_eq!(envelope.results.get(Stage::Store).unwrap().attempt_number, expected);
            assert_eq!(envelope.results.get(Stage::Fetch).unwrap().attempt_number, 1);
        }

        deliver_store(&h).await;
        let saved = h.item(item.id).await;
        assert_eq!(saved.status, Status::Failed);
        assert!(saved.needs_admin_review);
        let counts = h.broker.counts("store", CHANNEL).await;
        assert_eq!(counts.requeued, 2);
        assert_eq!(counts.finished, 1);
    }
}
