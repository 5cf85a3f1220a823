//! Restore an object to its institution's restore bucket.
//!
//! Stages: `fetch` copies every active file out of preservation storage
//! into staging, `package` builds a tarred bag from them, `copy` uploads
//! the tar, and `record` clears staging. Cold restores arrive here once
//! the cold restore pipeline saw every file thawed.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

use super::finish;
use super::lease;
use super::stage::{Sender, StagePool, forward, persist_or_record, start};
use super::{PipelineContext, Task};
use crate::domain::{Action, FileState, Institution, IntellectualObject, Stage, WorkItem};
use crate::error::CuratorError;
use crate::impls::pack_bag;
use crate::ports::{MessageHandler, QueueMessage};

/// Stages run by this pipeline.
const STAGES: &[Stage] = &[Stage::Fetch, Stage::Package, Stage::Copy, Stage::Record];

/// Saved state of restores, shared with the cold restore pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestorePayload {
    /// Files restore requests were sent for, by the cold restore pipeline.
    #[serde(default)]
    pub restore_requests: usize,
    pub files_dir: Option<PathBuf>,
    pub package: Option<PathBuf>,
    pub restore_url: Option<String>,
}

/// Object named by a restore item, or a fatal error for the stage.
pub(crate) async fn restorable_object(
    ctx: &PipelineContext,
    item: &WorkItem,
) -> Result<IntellectualObject, CuratorError> {
    let Some(identifier) = &item.object_identifier else {
        return Err(CuratorError::Validation("restore names no object".to_string()));
    };
    match ctx.registry().get_object(identifier).await? {
        Some(object) => Ok(object),
        None => Err(CuratorError::Validation(format!("object {identifier} is not in the registry"))),
    }
}

fn bag_name(object: &IntellectualObject) -> &str {
    if object.bag_name.is_empty() {
        object.identifier.rsplit('/').next().unwrap_or(&object.identifier)
    } else {
        &object.bag_name
    }
}

struct RestoreStages {
    ctx: Arc<PipelineContext>,
}

pub struct RestorePipeline {
    stages: Arc<RestoreStages>,
    fetch_tx: Sender<RestorePayload>,
    pools: Vec<StagePool>,
}

impl RestorePipeline {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        let (fetch_tx, fetch_rx) = mpsc::channel(ctx.worker.network_channel_size());
        let (package_tx, package_rx) = mpsc::channel(ctx.worker.work_channel_size());
        let (copy_tx, copy_rx) = mpsc::channel(ctx.worker.network_channel_size());
        let (record_tx, record_rx) = mpsc::channel(ctx.worker.work_channel_size());
        let (done_tx, done_rx) = mpsc::channel::<Task<RestorePayload>>(ctx.worker.work_channel_size());
        let network = ctx.worker.network_connections;
        let workers = ctx.worker.workers;
        let stages = Arc::new(RestoreStages { ctx });

        let fetch = {
            let (s, next, done) = (Arc::clone(&stages), package_tx, done_tx.clone());
            StagePool::spawn("fetch", network, fetch_rx, move |task| {
                let (s, next, done) = (Arc::clone(&s), next.clone(), done.clone());
                async move {
                    let task = s.fetch(task).await;
                    forward(task, Stage::Fetch, &next, &done).await;
                }
            })
        };
        let package = {
            let (s, next, done) = (Arc::clone(&stages), copy_tx, done_tx.clone());
            StagePool::spawn("package", workers, package_rx, move |task| {
                let (s, next, done) = (Arc::clone(&s), next.clone(), done.clone());
                async move {
                    let task = s.package(task).await;
                    forward(task, Stage::Package, &next, &done).await;
                }
            })
        };
        let copy = {
            let (s, next, done) = (Arc::clone(&stages), record_tx, done_tx.clone());
            StagePool::spawn("copy", network, copy_rx, move |task| {
                let (s, next, done) = (Arc::clone(&s), next.clone(), done.clone());
                async move {
                    let task = s.copy(task).await;
                    forward(task, Stage::Copy, &next, &done).await;
                }
            })
        };
        let record = {
            let (s, done) = (Arc::clone(&stages), done_tx);
            StagePool::spawn("record", workers, record_rx, move |task| {
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
            fetch_tx,
            pools: vec![fetch, package, copy, record, finish],
        }
    }

    pub async fn shutdown(self) {
        drop(self.fetch_tx);
        for pool in self.pools {
            pool.join().await;
        }
    }
}

#[async_trait]
impl MessageHandler for RestorePipeline {
    #[instrument(skip_all, fields(topic = "restore", message = %message.id()))]
    async fn handle_message(&self, message: Arc<dyn QueueMessage>) -> Result<(), CuratorError> {
        let ctx = &self.stages.ctx;
        let Some(loaded) = lease::load(ctx, message, &[Action::Restore, Action::ColdRestore]).await? else {
            return Ok(());
        };
        if loaded.item.action == Action::ColdRestore && loaded.item.stage == Stage::Requested {
            let key = loaded.item.id.to_string();
            lease::skip(ctx, loaded.message.as_ref(), &key, "cold restore is not thawed yet").await;
            return Ok(());
        }
        let Some(task) = lease::claim::<RestorePayload>(ctx, loaded, STAGES).await? else {
            return Ok(());
        };
        start(ctx, task, &self.fetch_tx).await;
        Ok(())
    }
}

impl RestoreStages {
    fn work_dir(&self, item: &WorkItem) -> PathBuf {
        self.ctx
            .staging_dir
            .join("restore")
            .join(item.id.to_string())
    }

    fn source_bucket(&self, item: &WorkItem) -> &str {
        match item.action {
            Action::ColdRestore => &self.ctx.preservation.cold_bucket,
            _ => &self.ctx.preservation.primary_bucket,
        }
    }

    async fn fetch(&self, mut task: Task<RestorePayload>) -> Task<RestorePayload> {
        let ctx = &self.ctx;
        task.enter_stage(Stage::Fetch, ctx.now());
        if !persist_or_record(ctx, &mut task, Stage::Fetch).await {
            return task;
        }
        let object = match restorable_object(ctx, task.item()).await {
            Ok(object) => object,
            Err(err) => {
                task.record_error(Stage::Fetch, &err);
                return task;
            }
        };

        let files_dir = self.work_dir(task.item()).join("files");
        let bucket = self.source_bucket(task.item()).to_string();
        let mut fetched = 0;
        for file in object.files.iter().filter(|f| f.state == FileState::Active) {
            let key = file.storage_key();
            let result = match ctx.storage().get(&bucket, &key).await {
                Ok(data) => write_file(&files_dir.join(&file.path), &data).await.map_err(CuratorError::from),
                Err(err) => Err(err.into()),
            };
            match result {
                Ok(()) => fetched += 1,
                Err(err) => task.record_error(Stage::Fetch, &err),
            }
            ctx.touch(task.message.as_ref()).await;
        }
        info!(item = %task.item().id, fetched, bucket = %bucket, "fetched files for restore");
        task.envelope.payload.files_dir = Some(files_dir);
        task.finish_stage(Stage::Fetch, ctx.now());
        task
    }

    async fn package(&self, mut task: Task<RestorePayload>) -> Task<RestorePayload> {
        let ctx = &self.ctx;
        task.enter_stage(Stage::Package, ctx.now());
        let object = match restorable_object(ctx, task.item()).await {
            Ok(object) => object,
            Err(err) => {
                task.record_error(Stage::Package, &err);
                return task;
            }
        };
        let Some(files_dir) = task.envelope.payload.files_dir.clone() else {
            task.record_fatal(Stage::Package, "no fetched files to package");
            return task;
        };

        let paths: Vec<String> = object
            .files
            .iter()
            .filter(|f| f.state == FileState::Active)
            .map(|f| f.path.clone())
            .collect();
        let name = bag_name(&object).to_string();
        let package = self.work_dir(task.item()).join(format!("{name}.tar"));
        let target = package.clone();
        let built = tokio::task::spawn_blocking(move || -> Result<(), CuratorError> {
            let mut files = Vec::with_capacity(paths.len());
            for path in paths {
                let data = std::fs::read(files_dir.join(&path))?;
                files.push((path, data));
            }
            let tar = pack_bag(&name, &files)?;
            std::fs::write(&target, tar)?;
            Ok(())
        })
        .await;
        match built {
            Ok(Ok(())) => task.envelope.payload.package = Some(package),
            Ok(Err(err)) => task.record_error(Stage::Package, &err),
            Err(err) => task.record_error(Stage::Package, &CuratorError::Other(format!("packaging panicked: {err}"))),
        }
        task.finish_stage(Stage::Package, ctx.now());
        task
    }

    async fn restore_bucket(&self, institution: &str) -> Result<String, CuratorError> {
        let institutions = self.ctx.registry().list_institutions().await?;
        Ok(institutions
            .into_iter()
            .find(|i| i.identifier == institution)
            .unwrap_or_else(|| Institution::new(institution))
            .restore_bucket)
    }

    async fn copy(&self, mut task: Task<RestorePayload>) -> Task<RestorePayload> {
        let ctx = &self.ctx;
        task.enter_stage(Stage::Copy, ctx.now());
        let Some(package) = task.envelope.payload.package.clone() else {
            task.record_fatal(Stage::Copy, "no package to copy");
            return task;
        };
        let key = match package.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => {
                task.record_fatal(Stage::Copy, "package path has no file name");
                return task;
            }
        };

        let result = async {
            let bucket = self.restore_bucket(&task.item().institution).await?;
            let data = tokio::fs::read(&package).await?;
            ctx.storage().put(&bucket, &key, data).await?;
            Ok::<_, CuratorError>(format!("{bucket}/{key}"))
        }
        .await;
        match result {
            Ok(url) => {
                info!(item = %task.item().id, url = %url, "restored bag copied");
                task.envelope.payload.restore_url = Some(url);
                persist_or_record(ctx, &mut task, Stage::Copy).await;
            }
            Err(err) => task.record_error(Stage::Copy, &err),
        }
        task.finish_stage(Stage::Copy, ctx.now());
        task
    }

    async fn record(&self, mut task: Task<RestorePayload>) -> Task<RestorePayload> {
        let ctx = &self.ctx;
        task.enter_stage(Stage::Record, ctx.now());
        remove_work_dir(&self.work_dir(task.item())).await;
        task.finish_stage(Stage::Record, ctx.now());
        task
    }

    async fn finish(&self, task: Task<RestorePayload>) {
        if task.has_errors() {
            remove_work_dir(&self.work_dir(task.item())).await;
        }
        finish::finish(&self.ctx, task).await;
    }
}

async fn write_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, data).await
}

async fn remove_work_dir(dir: &Path) {
    if let Err(err) = tokio::fs::remove_dir_all(dir).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %dir.display(), error = %err, "cannot remove restore staging");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Status, TaskEnvelope, Topic};
    use crate::impls::TarBagReader;
    use crate::pipeline::testing::{Harness, start_time};
    use crate::ports::{BagHeader, BagReader, Registry};

    #[tokio::test(start_paused = true)]
    async fn restores_a_valid_bag_to_the_restore_bucket() {
        let h = Harness::new();
        h.registry.add_institution(Institution::new("example.edu")).await;
        h.stored_object(&h.config.preservation.primary_bucket).await;
        let item = h
            .queue_item(Action::Restore, Topic::Restore, |item| {
                item.stage = Stage::Requested;
                item.institution = "example.edu".to_string();
                item.object_identifier = Some("example.edu/photos".to_string());
            })
            .await;

        let pipeline = RestorePipeline::new(h.context(Topic::Restore));
        pipeline.handle_message(h.next_message(Topic::Restore).await).await.unwrap();
        pipeline.shutdown().await;

        let saved = h.item(item.id).await;
        assert_eq!(saved.status, Status::Success);
        assert_eq!(saved.stage, Stage::Resolve);

        let tar = h.storage.object("restore.example.edu", "photos.tar").unwrap();
        let tar_path = h.staging.path().join("check.tar");
        std::fs::write(&tar_path, tar).unwrap();
        let header = BagHeader {
            object_identifier: "example.edu/photos".to_string(),
            institution: "example.edu".to_string(),
            bag_name: "photos".to_string(),
            etag: String::new(),
        };
        let object = TarBagReader
            .read_bag(&tar_path, &h.staging.path().join("check"), &header)
            .unwrap();
        assert_eq!(object.files.len(), 2);

        let state = h.registry.get_state(item.id).await.unwrap().unwrap();
        let envelope: TaskEnvelope<RestorePayload> = serde_json::from_value(state).unwrap();
        assert_eq!(envelope.payload.restore_url.as_deref(), Some("restore.example.edu/photos.tar"));
        assert!(!h.staging.path().join("restore").join(item.id.to_string()).exists());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_object_fails() {
        let h = Harness::new();
        let item = h
            .queue_item(Action::Restore, Topic::Restore, |item| {
                item.stage = Stage::Requested;
                item.object_identifier = Some("example.edu/missing".to_string());
            })
            .await;

        let pipeline = RestorePipeline::new(h.context(Topic::Restore));
        pipeline.handle_message(h.next_message(Topic::Restore).await).await.unwrap();
        pipeline.shutdown().await;

        let saved = h.item(item.id).await;
        assert_eq!(saved.status, Status::Failed);
        assert!(saved.note.contains("not in the registry"));
    }

    #[tokio::test(start_paused = true)]
    async fn unthawed_cold_restore_is_skipped() {
        let h = Harness::new();
        let item = h
            .queue_item(Action::ColdRestore, Topic::Restore, |item| {
                item.stage = Stage::Requested;
            })
            .await;

        let pipeline = RestorePipeline::new(h.context(Topic::Restore));
        pipeline.handle_message(h.next_message(Topic::Restore).await).await.unwrap();
        pipeline.shutdown().await;

        assert_eq!(h.item(item.id).await.status, Status::Pending);
    }
}
