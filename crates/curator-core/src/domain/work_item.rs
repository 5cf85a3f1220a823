//! WorkItem: the durable record of one unit of work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::fingerprint::Fingerprint;
use super::ids::WorkItemId;
use super::lifecycle::{Action, Lifecycle, Next, Stage, Status};

/// Identity of a worker process, used for the soft lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerIdentity {
    pub node: String,
    pub pid: u32,
}

impl WorkerIdentity {
    pub fn new(node: impl Into<String>, pid: u32) -> Self {
        Self {
            node: node.into(),
            pid,
        }
    }

    /// Hostname and pid of the running process.
    pub fn current() -> Self {
        let node = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        Self::new(node, std::process::id())
    }
}

/// Durable description of a unit of work, stored in the registry.
///
/// Design:
/// - The pipeline never deletes a work item; it only moves it to a
///   terminal status.
/// - `node`/`pid` form a soft lease. Empty node or zero pid means free.
/// - All status changes go through the `mark_*` methods below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,

    // source locator
    pub bucket: String,
    pub name: String,
    pub etag: String,
    pub size: u64,
    pub bag_date: DateTime<Utc>,
    pub institution: String,
    pub object_identifier: Option<String>,
    pub generic_file_identifier: Option<String>,
    pub replication_id: Option<String>,

    // lifecycle position
    pub action: Action,
    pub stage: Stage,
    pub status: Status,
    pub outcome: String,
    pub note: String,

    // lease
    pub node: String,
    pub pid: u32,
    pub leased_at: Option<DateTime<Utc>>,

    // scheduling
    pub queued_at: Option<DateTime<Utc>>,
    pub stage_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    pub retry: bool,
    pub needs_admin_review: bool,

    pub user: String,
    pub institutional_approver: Option<String>,
}

impl WorkItem {
    /// A fresh item at the first stage of `action`, pending.
    pub fn new(id: WorkItemId, action: Action, now: DateTime<Utc>) -> Self {
        Self {
            id,
            bucket: String::new(),
            name: String::new(),
            etag: String::new(),
            size: 0,
            bag_date: now,
            institution: String::new(),
            object_identifier: None,
            generic_file_identifier: None,
            replication_id: None,
            action,
            stage: Lifecycle::first_stage(action),
            status: Status::Pending,
            outcome: String::new(),
            note: String::new(),
            node: String::new(),
            pid: 0,
            leased_at: None,
            queued_at: None,
            stage_started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
            retry: true,
            needs_admin_review: false,
            user: "system@localhost".to_string(),
            institutional_approver: None,
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::new(self.name.clone(), &self.etag, self.bag_date)
    }

    /// `bucket/name`, used in log lines and diagnostic records.
    pub fn locator(&self) -> String {
        format!("{}/{}", self.bucket, self.name)
    }

    pub fn is_in_progress(&self) -> bool {
        !self.node.is_empty() && self.pid != 0
    }

    pub fn belongs_to_another_worker(&self, me: &WorkerIdentity) -> bool {
        self.is_in_progress() && (self.node != me.node || self.pid != me.pid)
    }

    pub fn is_terminal(&self) -> bool {
        match self.status {
            Status::Success | Status::Cancelled => true,
            Status::Failed => !self.retry,
            Status::Pending | Status::Started => false,
        }
    }

    pub fn has_been_stored(&self) -> bool {
        self.action == Action::Ingest
            && (self.stage > Stage::Store
                || (self.stage == Stage::Store && self.status == Status::Success))
    }

    pub fn is_storing(&self) -> bool {
        self.action == Action::Ingest
            && self.stage == Stage::Store
            && self.status == Status::Started
    }

    /// True once the item moved beyond receive/fetch/validate.
    pub fn is_past_ingest(&self) -> bool {
        self.action == Action::Ingest && self.stage >= Stage::Store
    }

    pub fn should_try_ingest(&self) -> bool {
        !self.has_been_stored() && !self.is_storing() && self.retry
    }

    pub fn set_lease(&mut self, me: &WorkerIdentity, now: DateTime<Utc>) {
        self.node = me.node.clone();
        self.pid = me.pid;
        self.leased_at = Some(now);
    }

    pub fn clear_lease(&mut self) {
        self.node.clear();
        self.pid = 0;
        self.leased_at = None;
        self.stage_started_at = None;
    }

    /// Claims the lease and records the stage now running.
    pub fn mark_started(&mut self, stage: Stage, me: &WorkerIdentity, now: DateTime<Utc>) {
        self.set_lease(me, now);
        self.stage = stage;
        self.status = Status::Started;
        self.stage_started_at = Some(now);
        self.note = format!("{stage} started");
        self.updated_at = now;
    }

    /// Releases the lease and moves to `next`.
    pub fn mark_succeeded(&mut self, next: Next, now: DateTime<Utc>) {
        self.clear_lease();
        self.retry = true;
        self.needs_admin_review = false;
        self.stage = next.stage();
        match next {
            Next::Done(_) => {
                self.status = Status::Success;
                self.outcome = "Success".to_string();
                self.completed_at = Some(now);
                self.note = match self.action {
                    Action::Ingest => "Item was successfully ingested".to_string(),
                    _ => format!("{:?} completed", self.action),
                };
            }
            Next::Continue(stage) => {
                self.status = Status::Pending;
                self.queued_at = None;
                self.note = format!("Item is ready for {stage}");
            }
        }
        self.updated_at = now;
    }

    /// Transient failure: same stage, pending again, lease released.
    pub fn mark_requeued(&mut self, errors: &str, now: DateTime<Utc>) {
        self.clear_lease();
        self.status = Status::Pending;
        self.retry = true;
        self.needs_admin_review = false;
        self.note = format!("Item has been requeued due to transient errors. {errors}");
        self.updated_at = now;
    }

    /// Fatal failure: halts forward progress until an operator steps in.
    pub fn mark_failed(&mut self, errors: &str, now: DateTime<Utc>) {
        self.clear_lease();
        self.status = Status::Failed;
        self.outcome = "Failed".to_string();
        self.retry = false;
        self.needs_admin_review = true;
        self.note = format!("Processing failed. {errors}");
        self.updated_at = now;
    }

    pub fn mark_cancelled(&mut self, note: impl Into<String>, now: DateTime<Utc>) {
        self.clear_lease();
        self.status = Status::Cancelled;
        self.outcome = "Cancelled".to_string();
        self.retry = false;
        self.note = note.into();
        self.updated_at = now;
    }

    /// Leaves the item pending at its current stage without counting a
    /// failure, e.g. while waiting on a cold-tier restore.
    pub fn mark_waiting(&mut self, note: impl Into<String>, now: DateTime<Utc>) {
        self.clear_lease();
        self.status = Status::Pending;
        self.note = note.into();
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ulid::Ulid;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
    }

    fn item() -> WorkItem {
        WorkItem::new(WorkItemId::from_ulid(Ulid::new()), Action::Ingest, now())
    }

    fn me() -> WorkerIdentity {
        WorkerIdentity::new("node-a", 42)
    }

    #[test]
    fn new_item_is_pending_at_first_stage() {
        let item = item();
        assert_eq!(item.stage, Stage::Receive);
        assert_eq!(item.status, Status::Pending);
        assert!(item.retry);
        assert!(!item.is_in_progress());
    }

    #[test]
    fn lease_detects_other_workers() {
        let mut item = item();
        item.mark_started(Stage::Fetch, &me(), now());
        assert!(item.is_in_progress());
        assert!(!item.belongs_to_another_worker(&me()));
        assert!(item.belongs_to_another_worker(&WorkerIdentity::new("node-a", 43)));
        assert!(item.belongs_to_another_worker(&WorkerIdentity::new("node-b", 42)));
    }

    #[test]
    fn success_releases_lease_and_advances() {
        let mut item = item();
        item.mark_started(Stage::Fetch, &me(), now());
        item.mark_succeeded(Next::Continue(Stage::Store), now());
        assert_eq!(item.stage, Stage::Store);
        assert_eq!(item.status, Status::Pending);
        assert!(!item.is_in_progress());
        assert_eq!(item.note, "Item is ready for Store");
        assert!(!item.is_terminal());
    }

    #[test]
    fn final_success_is_terminal() {
        let mut item = item();
        item.mark_succeeded(Next::Done(Stage::Cleanup), now());
        assert_eq!(item.status, Status::Success);
        assert_eq!(item.completed_at, Some(now()));
        assert!(item.is_terminal());
    }

    #[test]
    fn requeue_keeps_stage_and_retry() {
        let mut item = item();
        item.mark_started(Stage::Fetch, &me(), now());
        item.mark_requeued("timeout", now());
        assert_eq!(item.stage, Stage::Fetch);
        assert_eq!(item.status, Status::Pending);
        assert!(item.retry);
        assert!(!item.needs_admin_review);
        assert!(item.note.ends_with("timeout"));
    }

    #[test]
    fn failure_flags_for_review() {
        let mut item = item();
        item.mark_started(Stage::Validate, &me(), now());
        item.mark_failed("bad manifest", now());
        assert_eq!(item.status, Status::Failed);
        assert!(!item.retry);
        assert!(item.needs_admin_review);
        assert!(item.is_terminal());
        assert!(!item.is_in_progress());
    }

    #[test]
    fn storage_predicates() {
        let mut item = item();
        assert!(item.should_try_ingest());
        item.mark_started(Stage::Store, &me(), now());
        assert!(item.is_storing());
        assert!(!item.should_try_ingest());
        item.mark_succeeded(Next::Continue(Stage::Record), now());
        assert!(item.has_been_stored());
        assert!(item.is_past_ingest());
    }
}
