//! Terminal stage shared by the work-item pipelines.
//!
//! Exactly one of the functions below answers each claimed delivery.

use serde::Serialize;
use tracing::{error, info, warn};

use super::stage::persist;
use super::{PipelineContext, Task};
use crate::domain::{AttemptContext, Decision, Lifecycle, Next};
use crate::jsonlog::item_marker;

/// Dispatches on what the stages left in the task.
pub async fn finish<P: Serialize>(ctx: &PipelineContext, mut task: Task<P>) {
    if let Some(note) = task.cancelled.take() {
        finish_cancelled(ctx, task, note).await;
    } else if task.has_errors() {
        finish_with_error(ctx, task).await;
    } else if let Some((delay, note)) = task.wait.take() {
        finish_waiting(ctx, task, delay, note).await;
    } else {
        finish_with_success(ctx, task).await;
    }
}

fn release<P>(ctx: &PipelineContext, task: &Task<P>) {
    ctx.leave_in_flight(&task.envelope.item.id.to_string());
}

/// Persistence failed after the work was done: requeue so a later delivery
/// records the outcome. The stages are idempotent.
async fn retry_persist<P>(ctx: &PipelineContext, task: &Task<P>, err: &crate::error::CuratorError) {
    error!(item = %task.envelope.item.id, error = %err, "cannot persist outcome, requeueing");
    if let Err(err) = task.message.requeue(ctx.worker.requeue_delay()).await {
        warn!(message = %task.message.id(), error = %err, "requeue failed");
    }
    release(ctx, task);
}

/// Moves the item to its next position, pushes it to the next topic when
/// there is one, and acknowledges the message.
pub async fn finish_with_success<P: Serialize>(ctx: &PipelineContext, mut task: Task<P>) {
    let now = ctx.now();
    let item = &task.envelope.item;
    let next = match Lifecycle::advance(item.action, task.entry_stage) {
        Ok(next) => next,
        Err(err) => {
            let stage = item.stage;
            task.record_fatal(stage, err.to_string());
            return finish_with_error(ctx, task).await;
        }
    };

    let next_topic = match next {
        Next::Continue(stage) => Lifecycle::route(item.action, stage).ok(),
        Next::Done(_) => None,
    };
    task.envelope.item.mark_succeeded(next, now);
    if next_topic.is_some() {
        task.envelope.item.queued_at = Some(now);
    }
    if let Err(err) = persist(ctx, &task).await {
        return retry_persist(ctx, &task, &err).await;
    }

    if let Some(topic) = next_topic {
        let id = task.envelope.item.id.to_string();
        if let Err(err) = ctx.services.broker.enqueue(topic.as_str(), &id).await {
            // the work item queuer picks up items without `queued_at`
            warn!(item = %id, topic = %topic, error = %err, "cannot push to next topic");
            task.envelope.item.queued_at = None;
            if let Err(err) = ctx.registry().save_work_item(&task.envelope.item).await {
                warn!(item = %id, error = %err, "cannot clear queued_at");
            }
        }
    }

    let item = &task.envelope.item;
    info!(item = %item.id, locator = %item.locator(), stage = %item.stage, status = ?item.status, "item succeeded");
    ctx.write_json_log(&item_marker(item), &task.envelope);
    ctx.count(|s| s.succeeded.push(item.locator()));
    if let Err(err) = task.message.finish().await {
        warn!(message = %task.message.id(), error = %err, "finish failed");
    }
    release(ctx, &task);
}

/// Requeues or fails the item as the decider says.
pub async fn finish_with_error<P: Serialize>(ctx: &PipelineContext, mut task: Task<P>) {
    let now = ctx.now();
    let fatal = task.has_fatal_errors();
    let attempt = AttemptContext {
        attempt_number: task.attempt,
        max_attempts: ctx.worker.max_attempts,
        fatal,
    };
    let decision = ctx.decider().decide(&attempt);
    let stage = task.envelope.item.stage;

    match decision {
        Decision::Requeue { delay, reason } => {
            let errors = task.envelope.results.all_errors();
            task.envelope.item.mark_requeued(&errors, now);
            if let Err(err) = persist(ctx, &task).await {
                return retry_persist(ctx, &task, &err).await;
            }
            let item = &task.envelope.item;
            warn!(item = %item.id, stage = %stage, attempt = task.attempt, reason = %reason, errors = %errors, "requeueing item");
            ctx.write_json_log(&item_marker(item), &task.envelope);
            ctx.count(|s| s.requeued.push(item.locator()));
            if let Err(err) = task.message.requeue(delay).await {
                warn!(message = %task.message.id(), error = %err, "requeue failed");
            }
        }
        Decision::Fail { reason } => {
            if !fatal {
                task.envelope.summary(stage).fatal(reason.clone());
            }
            let errors = task.envelope.results.all_errors();
            task.envelope.item.mark_failed(&errors, now);
            if let Err(err) = persist(ctx, &task).await {
                return retry_persist(ctx, &task, &err).await;
            }
            let item = &task.envelope.item;
            error!(item = %item.id, stage = %stage, attempt = task.attempt, reason = %reason, errors = %errors, "item failed");
            ctx.write_json_log(&item_marker(item), &task.envelope);
            ctx.count(|s| s.failed.push(item.locator()));
            if let Err(err) = task.message.finish().await {
                warn!(message = %task.message.id(), error = %err, "finish failed");
            }
        }
    }
    release(ctx, &task);
}

/// Nothing to do yet; come back later. The attempt is not counted.
pub async fn finish_waiting<P: Serialize>(
    ctx: &PipelineContext,
    mut task: Task<P>,
    delay: std::time::Duration,
    note: String,
) {
    let previous = task.attempt.saturating_sub(1);
    for stage in task.ran.clone() {
        task.envelope.summary(stage).attempt_number = previous;
    }
    task.envelope.item.mark_waiting(note, ctx.now());
    if let Err(err) = persist(ctx, &task).await {
        return retry_persist(ctx, &task, &err).await;
    }
    info!(item = %task.envelope.item.id, delay = ?delay, note = %task.envelope.item.note, "item waiting");
    if let Err(err) = task.message.requeue(delay).await {
        warn!(message = %task.message.id(), error = %err, "requeue failed");
    }
    release(ctx, &task);
}

pub async fn finish_cancelled<P: Serialize>(ctx: &PipelineContext, mut task: Task<P>, note: String) {
    task.envelope.item.mark_cancelled(note, ctx.now());
    if let Err(err) = persist(ctx, &task).await {
        return retry_persist(ctx, &task, &err).await;
    }
    let item = &task.envelope.item;
    info!(item = %item.id, note = %item.note, "item cancelled");
    ctx.write_json_log(&item_marker(item), &task.envelope);
    ctx.count(|s| s.skipped.push(item.locator()));
    if let Err(err) = task.message.finish().await {
        warn!(message = %task.message.id(), error = %err, "finish failed");
    }
    release(ctx, &task);
}

/// The first stage could not take the task (pipeline shutting down).
/// Releases the lease and returns the message to the queue.
pub async fn abandon<P: Serialize>(ctx: &PipelineContext, mut task: Task<P>) {
    warn!(item = %task.envelope.item.id, "pipeline stopped before the task started");
    task.envelope.item.mark_requeued("Worker shut down before processing", ctx.now());
    if let Err(err) = ctx.registry().save_work_item(&task.envelope.item).await {
        warn!(item = %task.envelope.item.id, error = %err, "cannot release lease");
    }
    if let Err(err) = task.message.requeue(ctx.worker.requeue_delay()).await {
        warn!(message = %task.message.id(), error = %err, "requeue failed");
    }
    release(ctx, &task);
}
