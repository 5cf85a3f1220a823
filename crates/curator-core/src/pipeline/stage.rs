use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::{PipelineContext, Task};
use crate::domain::Stage;
use crate::error::CuratorError;

/// Fixed number of tasks draining one stage channel.
///
/// The receiver is shared behind a mutex; whichever worker holds the lock
/// waits for the next envelope, the others wait for the lock. Pools end
/// when every sender of their channel is gone.
pub struct StagePool {
    name: &'static str,
    handles: Vec<JoinHandle<()>>,
}

impl StagePool {
    pub fn spawn<T, F, Fut>(name: &'static str, size: usize, rx: mpsc::Receiver<T>, work: F) -> Self
    where
        T: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let rx = Arc::new(Mutex::new(rx));
        let work = Arc::new(work);
        let handles = (0..size.max(1))
            .map(|worker| {
                let rx = Arc::clone(&rx);
                let work = Arc::clone(&work);
                tokio::spawn(async move {
                    loop {
                        let next = rx.lock().await.recv().await;
                        let Some(task) = next else { break };
                        work(task).await;
                    }
                    debug!(stage = name, worker, "stage worker stopped");
                })
            })
            .collect();
        Self { name, handles }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub async fn join(self) {
        for handle in self.handles {
            if let Err(err) = handle.await {
                error!(stage = self.name, error = %err, "stage worker panicked");
            }
        }
    }
}

/// Hands `task` to `next`, or to `done` when `stage` recorded errors or
/// asked to wait.
pub async fn forward<P>(
    task: Task<P>,
    stage: Stage,
    next: &mpsc::Sender<Task<P>>,
    done: &mpsc::Sender<Task<P>>,
) {
    let failed = task
        .envelope
        .results
        .get(stage)
        .is_some_and(|s| s.has_errors());
    let target = if failed || task.wait.is_some() || task.cancelled.is_some() {
        done
    } else {
        next
    };
    if let Err(err) = target.send(task).await {
        // the message stays in flight and is redelivered after its timeout
        error!(stage = %stage, item = %err.0.envelope.item.id, "downstream stage is gone");
    }
}

/// Saves the item and its envelope so a crash resumes from here.
pub async fn persist<P: Serialize>(ctx: &PipelineContext, task: &Task<P>) -> Result<(), CuratorError> {
    let registry = ctx.registry();
    registry.save_work_item(&task.envelope.item).await?;
    let state = serde_json::to_value(&task.envelope)?;
    registry.save_state(task.envelope.item.id, state).await?;
    Ok(())
}

/// Saves after entering a stage; a failed save becomes an error of that
/// stage.
pub async fn persist_or_record<P: Serialize>(ctx: &PipelineContext, task: &mut Task<P>, stage: Stage) -> bool {
    match persist(ctx, task).await {
        Ok(()) => true,
        Err(err) => {
            task.record_error(stage, &err);
            false
        }
    }
}

/// Shorthand for the stage-to-stage closures.
pub type Sender<P> = mpsc::Sender<Task<P>>;

/// Hands a freshly claimed task to the first stage of its pipeline.
pub async fn start<P: Serialize>(ctx: &PipelineContext, task: Task<P>, first: &Sender<P>) {
    if let Err(err) = first.send(task).await {
        super::finish::abandon(ctx, err.0).await;
    }
}
