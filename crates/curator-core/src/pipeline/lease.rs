//! Loading, screening and leasing work items for a delivery.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use super::{PipelineContext, Task};
use crate::domain::{Action, Stage, TaskEnvelope, WorkItem, WorkItemId, WorkerIdentity};
use crate::error::CuratorError;
use crate::ports::{QueueMessage, RegistryError};

/// Who holds an item's soft lease, as seen by one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseCheck {
    Free,
    HeldByUs,
    HeldElsewhere,
    /// Held by another worker for longer than the configured expiry.
    Stale,
}

impl LeaseCheck {
    pub fn evaluate(
        item: &WorkItem,
        me: &WorkerIdentity,
        now: DateTime<Utc>,
        expiry: Option<Duration>,
    ) -> Self {
        if !item.is_in_progress() {
            return LeaseCheck::Free;
        }
        if !item.belongs_to_another_worker(me) {
            return LeaseCheck::HeldByUs;
        }
        match expiry {
            Some(expiry) if item.leased_at.is_none_or(|at| now - at >= expiry) => LeaseCheck::Stale,
            _ => LeaseCheck::HeldElsewhere,
        }
    }

    pub fn may_claim(self) -> bool {
        !matches!(self, LeaseCheck::HeldElsewhere)
    }
}

/// A delivery whose work item passed the generic checks.
pub struct Loaded {
    pub item: WorkItem,
    pub message: Arc<dyn QueueMessage>,
}

/// Answers a delivery that needs no work.
pub(crate) async fn skip(ctx: &PipelineContext, message: &dyn QueueMessage, key: &str, reason: &str) {
    info!(message = %message.id(), key, reason, "skipping delivery");
    ctx.count(|s| s.skipped.push(key.to_string()));
    if let Err(err) = message.finish().await {
        warn!(message = %message.id(), error = %err, "finish failed");
    }
}

/// Parses the message, loads the work item and screens it.
///
/// `Ok(None)` means the message was already answered. Registry outages
/// surface as `Err` so the consumer loop requeues the message.
pub async fn load(
    ctx: &PipelineContext,
    message: Arc<dyn QueueMessage>,
    actions: &[Action],
) -> Result<Option<Loaded>, CuratorError> {
    let body = message.body().trim().to_string();
    let id: WorkItemId = match body.parse() {
        Ok(id) => id,
        Err(err) => {
            warn!(message = %message.id(), body = %body, error = %err, "unparseable message body");
            skip(ctx, message.as_ref(), &body, "bad message body").await;
            return Ok(None);
        }
    };

    let item = match ctx.registry().get_work_item(id).await {
        Ok(item) => item,
        Err(RegistryError::NotFound(_)) => {
            skip(ctx, message.as_ref(), &body, "work item not found").await;
            return Ok(None);
        }
        Err(err) => return Err(err.into()),
    };

    let key = item.id.to_string();
    if !actions.contains(&item.action) {
        skip(ctx, message.as_ref(), &key, "action is not served by this pipeline").await;
        return Ok(None);
    }
    if item.is_terminal() {
        skip(ctx, message.as_ref(), &key, "work item is already finished").await;
        return Ok(None);
    }
    if ctx.is_in_flight(&key) {
        skip(ctx, message.as_ref(), &key, "already in process in this worker").await;
        return Ok(None);
    }
    match LeaseCheck::evaluate(&item, &ctx.services.identity, ctx.now(), ctx.lease_expiry) {
        LeaseCheck::HeldElsewhere => {
            debug!(item = %key, node = %item.node, pid = item.pid, "lease held by another worker");
            skip(ctx, message.as_ref(), &key, "leased by another worker").await;
            return Ok(None);
        }
        LeaseCheck::Stale => {
            warn!(item = %key, node = %item.node, pid = item.pid, "reclaiming stale lease");
        }
        LeaseCheck::Free | LeaseCheck::HeldByUs => {}
    }

    Ok(Some(Loaded { item, message }))
}

/// Restores the saved envelope (fresh one if none or unreadable), claims
/// the lease, persists `Started` and takes over the message response.
///
/// The attempt number counts only `stages`, the stages the claiming
/// pipeline runs.
pub async fn claim<P>(
    ctx: &PipelineContext,
    loaded: Loaded,
    stages: &[Stage],
) -> Result<Option<Task<P>>, CuratorError>
where
    P: Serialize + DeserializeOwned + Default,
{
    let Loaded { mut item, message } = loaded;
    let key = item.id.to_string();
    if !ctx.enter_in_flight(&key) {
        skip(ctx, message.as_ref(), &key, "already in process in this worker").await;
        return Ok(None);
    }

    let saved = match ctx.registry().get_state(item.id).await {
        Ok(saved) => saved,
        Err(err) => {
            ctx.leave_in_flight(&key);
            return Err(err.into());
        }
    };
    let (results, payload) = match saved.map(serde_json::from_value::<TaskEnvelope<P>>) {
        Some(Ok(saved)) => (saved.results, saved.payload),
        Some(Err(err)) => {
            warn!(item = %key, error = %err, "saved state unreadable, starting over");
            Default::default()
        }
        None => Default::default(),
    };

    let entry_stage = item.stage;
    item.mark_started(entry_stage, &ctx.services.identity, ctx.now());
    let mut envelope = TaskEnvelope::new(item, payload);
    envelope.results = results;
    let attempt = envelope.results.max_attempt_number_in(stages).saturating_add(1);

    let task = Task {
        envelope,
        message,
        entry_stage,
        attempt,
        ran: Vec::new(),
        wait: None,
        cancelled: None,
    };
    if let Err(err) = ctx.services.registry.save_work_item(task.item()).await {
        ctx.leave_in_flight(&key);
        return Err(err.into());
    }
    task.message.disable_auto_response();
    debug!(item = %key, stage = %entry_stage, attempt, "claimed work item");
    Ok(Some(task))
}
