//! Append-only diagnostic log of finished envelopes.
//!
//! Each record is framed by BEGIN/END marker lines carrying the item's
//! fingerprint, so the latest state of one item can be recovered by
//! scanning for the last complete block with that fingerprint.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, Write};
use std::path::Path;
use std::sync::Mutex;

use chrono::SecondsFormat;
use serde::Serialize;

use crate::domain::WorkItem;

const RULE: &str = "--------";

/// Marker text identifying one work item version.
pub fn item_marker(item: &WorkItem) -> String {
    format!(
        "{} | Etag: {} | Time: {}",
        item.locator(),
        item.etag,
        item.bag_date.to_rfc3339_opts(SecondsFormat::Secs, true)
    )
}

fn begin_line(marker: &str) -> String {
    format!("{RULE} BEGIN {marker} {RULE}")
}

fn end_line(marker: &str) -> String {
    format!("{RULE} END {marker} {RULE}")
}

/// Shared writer. Blocks are written under one lock so concurrent stages
/// never interleave lines.
pub struct JsonLog<W: Write + Send = File> {
    out: Mutex<W>,
}

impl JsonLog<File> {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::new(file))
    }
}

impl<W: Write + Send> JsonLog<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn write_record<T: Serialize>(&self, marker: &str, record: &T) -> std::io::Result<()> {
        let body = serde_json::to_string_pretty(record)?;
        let block = format!("{}\n{}\n{}\n", begin_line(marker), body, end_line(marker));
        let mut out = self
            .out
            .lock()
            .map_err(|_| std::io::Error::other("json log writer poisoned"))?;
        out.write_all(block.as_bytes())?;
        out.flush()
    }

    pub fn into_inner(self) -> Option<W> {
        self.out.into_inner().ok()
    }
}

/// Body of the last complete block for `marker`, if any.
///
/// A block cut short by a crash (BEGIN without END) is ignored.
pub fn find_latest<R: BufRead>(reader: R, marker: &str) -> std::io::Result<Option<String>> {
    let begin = begin_line(marker);
    let end = end_line(marker);
    let mut latest = None;
    let mut current: Option<Vec<String>> = None;

    for line in reader.lines() {
        let line = line?;
        if line == begin {
            current = Some(Vec::new());
        } else if line == end {
            if let Some(lines) = current.take() {
                latest = Some(lines.join("\n"));
            }
        } else if line.starts_with(RULE) && line.ends_with(RULE) {
            // another item's marker; an unterminated block ends here
            current = None;
        } else if let Some(lines) = current.as_mut() {
            lines.push(line);
        }
    }
    Ok(latest)
}
