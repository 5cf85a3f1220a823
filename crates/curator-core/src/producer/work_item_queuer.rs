use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument};

use super::{Producer, ProducerReport, RunLog};
use crate::domain::{Lifecycle, WorkItem};
use crate::error::CuratorError;
use crate::ports::{Clock, QueueBroker, Registry, WorkItemQuery};

const PAGE_SIZE: u32 = 100;

/// Requeues registry items that are waiting but not on any queue, such as
/// items advanced by a stage whose push to the next topic failed, or items
/// an operator reset for retry.
pub struct WorkItemQueuer {
    registry: Arc<dyn Registry>,
    broker: Arc<dyn QueueBroker>,
    clock: Arc<dyn Clock>,
    collect_stats: bool,
}

impl WorkItemQueuer {
    pub fn new(
        registry: Arc<dyn Registry>,
        broker: Arc<dyn QueueBroker>,
        clock: Arc<dyn Clock>,
        collect_stats: bool,
    ) -> Self {
        Self {
            registry,
            broker,
            clock,
            collect_stats,
        }
    }

    /// Snapshot first: queueing changes `queued_at`, which would shift the
    /// pages of a live listing.
    async fn unqueued_items(&self) -> Result<Vec<WorkItem>, CuratorError> {
        let mut query = WorkItemQuery {
            queued: Some(false),
            retry: Some(true),
            ..WorkItemQuery::first_page(PAGE_SIZE)
        };
        let mut items = Vec::new();
        loop {
            let page = self.registry.list_work_items(&query).await?;
            items.extend(page.items);
            if !page.has_next {
                break;
            }
            query.page += 1;
        }
        Ok(items)
    }

    async fn queue(&self, mut item: WorkItem) -> Result<WorkItem, CuratorError> {
        let topic = Lifecycle::route(item.action, item.stage)?;
        self.broker.enqueue(topic.as_str(), &item.id.to_string()).await?;
        item.queued_at = Some(self.clock.now());
        Ok(self.registry.save_work_item(&item).await?)
    }
}

#[async_trait]
impl Producer for WorkItemQueuer {
    #[instrument(skip(self))]
    async fn run(&mut self) -> Result<ProducerReport, CuratorError> {
        let mut log = RunLog::new(self.collect_stats);
        for item in self.unqueued_items().await? {
            if item.is_terminal() || item.is_in_progress() {
                log.skipped(&item.id.to_string());
                continue;
            }
            let id = item.id;
            match self.queue(item).await {
                Ok(_) => log.queued(Some(id)),
                Err(err) => log.error(format!("{id}: {err}")),
            }
        }
        info!(queued = log.report.queued, errors = log.report.errors.len(), "work item queuer finished");
        Ok(log.report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Action, Stage, Status, WorkItemId, WorkerIdentity};
    use crate::impls::{InMemoryBroker, InMemoryRegistry};
    use crate::ports::FixedClock;
    use chrono::{TimeZone, Utc};
    use ulid::Ulid;

    fn item(action: Action) -> WorkItem {
        let now = Utc.with_ymd_and_hms(2024, 2, 2, 0, 0, 0).unwrap();
        WorkItem::new(WorkItemId::from_ulid(Ulid::new()), action, now)
    }

    #[tokio::test]
    async fn queues_waiting_items_on_their_routed_topic() {
        let registry = InMemoryRegistry::new();
        let broker = Arc::new(InMemoryBroker::default());

        let mut stored = item(Action::Ingest);
        stored.stage = Stage::Store;
        registry.save_work_item(&stored).await.unwrap();
        let delete = item(Action::Delete);
        registry.save_work_item(&delete).await.unwrap();

        let mut done = item(Action::Ingest);
        done.status = Status::Success;
        done.retry = true;
        registry.save_work_item(&done).await.unwrap();

        let mut leased = item(Action::Ingest);
        leased.set_lease(&WorkerIdentity::new("n", 1), Utc::now());
        registry.save_work_item(&leased).await.unwrap();

        let clock = Arc::new(FixedClock::new(Utc::now()));
        let mut queuer = WorkItemQueuer::new(Arc::new(registry.clone()), broker.clone(), clock, false);
        let report = queuer.run().await.unwrap();

        assert_eq!(report.queued, 2);
        assert_eq!(report.skipped, 2);
        assert_eq!(broker.published("store").await, vec![stored.id.to_string()]);
        assert_eq!(broker.published("file_delete").await, vec![delete.id.to_string()]);

        let again = queuer.run().await.unwrap();
        assert_eq!(again.queued, 0);
    }

    #[tokio::test]
    async fn unroutable_position_is_reported() {
        let registry = InMemoryRegistry::new();
        let mut odd = item(Action::Delete);
        odd.stage = Stage::Package;
        registry.save_work_item(&odd).await.unwrap();

        let mut queuer = WorkItemQueuer::new(
            Arc::new(registry),
            Arc::new(InMemoryBroker::default()),
            Arc::new(FixedClock::new(Utc::now())),
            false,
        );
        let report = queuer.run().await.unwrap();
        assert_eq!(report.queued, 0);
        assert_eq!(report.errors.len(), 1);
    }
}
