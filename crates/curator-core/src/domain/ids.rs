//! Strongly-typed identifiers.
//!
//! Every id wraps a ULID and carries a zero-sized marker type, so a
//! `WorkItemId` can never be passed where a `MessageId` is expected.
//! ULIDs sort by creation time and can be minted on any node without
//! coordination, which is what a fleet of independent workers needs.
//!
//! The display form is `<prefix><ulid>` (for example `item-01J...`). Queue
//! message bodies carry that string, and `FromStr` accepts it back.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// Marker trait supplying the display prefix of an id family.
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic ULID-backed id. `T` only exists at compile time.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Error returned when a message body is not a valid id.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {expected} id: {input:?}")]
pub struct ParseIdError {
    pub expected: &'static str,
    pub input: String,
}

impl<T: IdMarker> FromStr for Id<T> {
    type Err = ParseIdError;

    /// Accepts both `<prefix><ulid>` and a bare ULID.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let raw = trimmed.strip_prefix(T::prefix()).unwrap_or(trimmed);
        Ulid::from_string(raw)
            .map(Self::from_ulid)
            .map_err(|_| ParseIdError {
                expected: T::prefix().trim_end_matches('-'),
                input: s.to_string(),
            })
    }
}

/// Marker for work items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkItem {}

impl IdMarker for WorkItem {
    fn prefix() -> &'static str {
        "item-"
    }
}

/// Marker for broker messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Message {}

impl IdMarker for Message {
    fn prefix() -> &'static str {
        "msg-"
    }
}

/// Marker for preservation events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Event {}

impl IdMarker for Event {
    fn prefix() -> &'static str {
        "event-"
    }
}

/// Identifier of a work item (one durable unit of work).
pub type WorkItemId = Id<WorkItem>;

/// Identifier of one broker message delivery record.
pub type MessageId = Id<Message>;

/// Identifier of a preservation event.
pub type EventId = Id<Event>;
