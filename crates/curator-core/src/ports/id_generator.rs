//! IdGenerator port.
//!
//! Work items are minted by producers on any node, so ids must be unique
//! without coordination. ULIDs give that and still sort by creation time.

use ulid::Ulid;

use crate::domain::ids::{EventId, WorkItemId};
use crate::ports::Clock;

pub trait IdGenerator: Send + Sync {
    fn work_item_id(&self) -> WorkItemId;

    fn event_id(&self) -> EventId;
}

/// ULID generator whose timestamp part comes from `C`.
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next_ulid(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn work_item_id(&self) -> WorkItemId {
        WorkItemId::from(self.next_ulid())
    }

    fn event_id(&self) -> EventId {
        EventId::from(self.next_ulid())
    }
}
