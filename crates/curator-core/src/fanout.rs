//! Bucket audit: list a bucket and fetch metadata for every key.
//!
//! Each listing page is split into batches of `concurrency` keys; a batch
//! is one fork-join of `head` calls. Records gather in a shared buffer and
//! are written out once per page.

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::{AuditConfig, AuditFormat, MAX_AUDIT_CONCURRENCY};
use crate::error::CuratorError;
use crate::ports::{ObjectMetadata, ObjectPage, ObjectStore, RestoreState, StorageError};

const MAX_PAGE_SIZE: usize = 100;
const LIST_ATTEMPTS: u32 = 3;
const LIST_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditRecord {
    pub bucket: String,
    pub key: String,
    pub etag: String,
    pub size: u64,
    pub last_modified: String,
    pub restore: &'static str,
}

impl AuditRecord {
    fn new(bucket: &str, meta: &ObjectMetadata) -> Self {
        Self {
            bucket: bucket.to_string(),
            key: meta.info.key.clone(),
            etag: meta.info.etag.clone(),
            size: meta.info.size,
            last_modified: timestamp(meta.info.last_modified),
            restore: match meta.restore {
                RestoreState::Available => "available",
                RestoreState::Archived => "archived",
                RestoreState::InProgress => "in_progress",
            },
        }
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn delimited(record: &AuditRecord, delimiter: u8, headers: bool) -> Result<String, CuratorError> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(delimiter)
        .has_headers(headers)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    writer
        .serialize(record)
        .map_err(|e| CuratorError::Other(format!("cannot format record: {e}")))?;
    let bytes = writer
        .into_inner()
        .map_err(|e| CuratorError::Other(format!("cannot format record: {e}")))?;
    let text = String::from_utf8_lossy(&bytes);
    Ok(text.trim_end_matches('\n').to_string())
}

/// One output line for `record`.
pub fn format_record(record: &AuditRecord, format: AuditFormat) -> Result<String, CuratorError> {
    match format {
        AuditFormat::Json => Ok(serde_json::to_string(record)?),
        AuditFormat::Csv => delimited(record, b',', false),
        AuditFormat::Tsv => delimited(record, b'\t', false),
    }
}

fn header(format: AuditFormat) -> Option<String> {
    let columns = ["bucket", "key", "etag", "size", "last_modified", "restore"];
    match format {
        AuditFormat::Json => None,
        AuditFormat::Csv => Some(columns.join(",")),
        AuditFormat::Tsv => Some(columns.join("\t")),
    }
}

pub struct AuditList<W: Write> {
    storage: Arc<dyn ObjectStore>,
    config: AuditConfig,
    out: W,
    records: Arc<Mutex<Vec<String>>>,
    batches: usize,
}

impl<W: Write> AuditList<W> {
    pub fn new(storage: Arc<dyn ObjectStore>, mut config: AuditConfig, out: W) -> Self {
        if config.concurrency == 0 {
            config.concurrency = AuditConfig::default().concurrency;
        }
        config.concurrency = config.concurrency.min(MAX_AUDIT_CONCURRENCY);
        Self {
            storage,
            config,
            out,
            records: Arc::new(Mutex::new(Vec::new())),
            batches: 0,
        }
    }

    /// Fork-join batches run so far.
    pub fn batches(&self) -> usize {
        self.batches
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn page_size(&self) -> usize {
        match self.config.limit {
            0 => MAX_PAGE_SIZE,
            limit => limit.min(MAX_PAGE_SIZE),
        }
    }

    async fn list_page(&self, token: Option<&str>) -> Result<ObjectPage, StorageError> {
        let mut attempt = 1;
        loop {
            match self
                .storage
                .list_objects(&self.config.bucket, &self.config.prefix, self.page_size(), token)
                .await
            {
                Ok(page) => return Ok(page),
                Err(err) if attempt < LIST_ATTEMPTS => {
                    warn!(bucket = %self.config.bucket, attempt, error = %err, "list failed, retrying");
                    tokio::time::sleep(LIST_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Heads every key in `keys` at once; false if any of them failed.
    async fn run_batch(&mut self, keys: &[String]) -> bool {
        self.batches += 1;
        let mut set = JoinSet::new();
        for key in keys {
            let storage = Arc::clone(&self.storage);
            let records = Arc::clone(&self.records);
            let (bucket, key, format) = (self.config.bucket.clone(), key.clone(), self.config.format);
            set.spawn(async move {
                let meta = storage.head(&bucket, &key).await?;
                let line = format_record(&AuditRecord::new(&bucket, &meta), format)?;
                if let Ok(mut records) = records.lock() {
                    records.push(line);
                }
                Ok::<(), CuratorError>(())
            });
        }

        let mut ok = true;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(bucket = %self.config.bucket, error = %err, "cannot audit key");
                    ok = false;
                }
                Err(err) => {
                    warn!(bucket = %self.config.bucket, error = %err, "audit task failed");
                    ok = false;
                }
            }
        }
        ok
    }

    fn flush(&mut self) -> Result<usize, CuratorError> {
        let lines = match self.records.lock() {
            Ok(mut records) => std::mem::take(&mut *records),
            Err(_) => return Err(CuratorError::Other("audit buffer poisoned".to_string())),
        };
        for line in &lines {
            writeln!(self.out, "{line}")?;
        }
        self.out.flush()?;
        Ok(lines.len())
    }

    /// Audits the configured bucket. Returns the records written and
    /// whether any key or listing failed.
    pub async fn run(&mut self) -> Result<(usize, bool), CuratorError> {
        let limit = self.config.limit;
        let mut written = 0;
        let mut listed = 0;
        let mut error_occurred = false;
        let mut token: Option<String> = None;

        if let Some(header) = header(self.config.format) {
            writeln!(self.out, "{header}")?;
        }

        loop {
            let page = match self.list_page(token.as_deref()).await {
                Ok(page) => page,
                Err(err) => {
                    warn!(bucket = %self.config.bucket, error = %err, "giving up on listing");
                    error_occurred = true;
                    break;
                }
            };
            let mut keys: Vec<String> = page.objects.into_iter().map(|o| o.key).collect();
            if limit > 0 {
                keys.truncate(limit - listed);
            }
            listed += keys.len();

            let concurrency = self.config.concurrency;
            for batch in keys.chunks(concurrency) {
                if !self.run_batch(batch).await {
                    error_occurred = true;
                }
            }
            written += self.flush()?;
            debug!(bucket = %self.config.bucket, written, batches = self.batches, "audit page done");

            if limit > 0 && listed >= limit {
                break;
            }
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        info!(bucket = %self.config.bucket, written, batches = self.batches, error_occurred, "audit finished");
        Ok((written, error_occurred))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemoryObjectStore;
    use chrono::TimeZone;
    use rstest::rstest;

    const BUCKET: &str = "aptrust.preservation";

    fn when() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn store_with(n: usize) -> InMemoryObjectStore {
        let storage = InMemoryObjectStore::new();
        for i in 0..n {
            storage.insert(BUCKET, &format!("inst/bag/data/{i:04}.txt"), b"x", when());
        }
        storage
    }

    fn audit(storage: &InMemoryObjectStore, concurrency: usize, limit: usize, format: AuditFormat) -> AuditList<Vec<u8>> {
        let config = AuditConfig {
            bucket: BUCKET.to_string(),
            prefix: String::new(),
            concurrency,
            limit,
            format,
        };
        AuditList::new(Arc::new(storage.clone()), config, Vec::new())
    }

    #[tokio::test(start_paused = true)]
    async fn pages_split_into_bounded_batches() {
        let storage = store_with(250).with_head_delay(Duration::from_millis(20));
        let mut list = audit(&storage, 10, 0, AuditFormat::Json);

        let (count, failed) = list.run().await.unwrap();

        assert_eq!(count, 250);
        assert!(!failed);
        assert_eq!(list.batches(), 25);
        assert!(storage.peak_concurrent_heads() <= 10);
        let out = String::from_utf8(list.into_inner()).unwrap();
        assert_eq!(out.lines().count(), 250);
        let first: serde_json::Value = serde_json::from_str(out.lines().next().unwrap()).unwrap();
        assert_eq!(first["bucket"], BUCKET);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_at_limit() {
        let storage = store_with(30);
        let mut list = audit(&storage, 4, 7, AuditFormat::Json);
        let (count, _) = list.run().await.unwrap();
        assert_eq!(count, 7);
        assert_eq!(storage.head_calls(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_head_sets_the_flag_and_keeps_going() {
        let storage = store_with(5);
        storage.fail_key("inst/bag/data/0002.txt");
        let mut list = audit(&storage, 2, 0, AuditFormat::Json);

        let (count, failed) = list.run().await.unwrap();

        assert_eq!(count, 4);
        assert!(failed);
    }

    #[tokio::test(start_paused = true)]
    async fn listing_errors_are_retried() {
        let storage = store_with(3);
        storage.fail_next_lists(2);
        let mut list = audit(&storage, 4, 0, AuditFormat::Json);
        assert_eq!(list.run().await.unwrap(), (3, false));

        let storage = store_with(3);
        storage.fail_next_lists(3);
        let mut list = audit(&storage, 4, 0, AuditFormat::Json);
        assert_eq!(list.run().await.unwrap(), (0, true));
    }

    #[rstest]
    #[case(AuditFormat::Csv, "bucket,key,etag,size,last_modified,restore", ',')]
    #[case(AuditFormat::Tsv, "bucket\tkey\tetag\tsize\tlast_modified\trestore", '\t')]
    #[tokio::test(start_paused = true)]
    async fn delimited_output_has_a_header(#[case] format: AuditFormat, #[case] head: &str, #[case] sep: char) {
        let storage = store_with(2);
        let mut list = audit(&storage, 4, 0, format);
        list.run().await.unwrap();

        let out = String::from_utf8(list.into_inner()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], head);
        assert_eq!(lines.len(), 3);
        let fields: Vec<&str> = lines[1].split(sep).collect();
        assert_eq!(fields[0], BUCKET);
        assert_eq!(fields[3], "1");
        assert_eq!(fields[4], "2024-03-01T12:00:00Z");
    }

    #[test]
    fn concurrency_is_clamped() {
        let storage = InMemoryObjectStore::new();
        let list = audit(&storage, 100, 0, AuditFormat::Json);
        assert_eq!(list.config.concurrency, MAX_AUDIT_CONCURRENCY);
        let list = audit(&storage, 0, 0, AuditFormat::Json);
        assert_eq!(list.config.concurrency, 4);
    }
}
