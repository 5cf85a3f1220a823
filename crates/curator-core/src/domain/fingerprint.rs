//! Fingerprint: composite key used to detect duplicate work.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// `key | etag | timestamp`, with etag quotes stripped.
///
/// The key is escaped so that a `|` inside it cannot shift the field
/// boundaries; two different triples never render to the same string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    pub key: String,
    pub etag: String,
    pub timestamp: DateTime<Utc>,
}

impl Fingerprint {
    pub fn new(key: impl Into<String>, etag: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            etag: normalize_etag(etag),
            timestamp,
        }
    }

    pub fn as_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let key = self.key.replace('\\', "\\\\").replace('|', "\\|");
        write!(
            f,
            "{}|{}|{}",
            key,
            self.etag,
            self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
        )
    }
}

/// Storage services wrap etags in double quotes; compare without them.
pub fn normalize_etag(etag: &str) -> String {
    etag.trim().trim_matches('"').to_string()
}
