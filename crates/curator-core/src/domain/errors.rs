//! Error classification shared by every pipeline.

use serde::{Deserialize, Serialize};

/// How a failure should be treated.
///
/// - `Transient`: network, timeout, remote 5xx. Requeue with delay.
/// - `Validation`: bad input (malformed object, bad fingerprint). Retrying
///   cannot fix it, so it is handled as fatal.
/// - `Fatal`: stop, flag for review, acknowledge the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Validation,
    Fatal,
}

impl ErrorKind {
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ErrorKind::Transient)
    }
}
