use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use super::{Producer, ProducerReport, RunLog};
use crate::domain::{
    Action, EntityKind, Lifecycle, NodeEntity, ReplicationTransfer, TransferStatus, WorkItem,
};
use crate::error::CuratorError;
use crate::ports::{Clock, IdGenerator, PartnerClient, PartnerDirectory, QueueBroker, Registry, WorkItemQuery};

/// Queues replication requests that partners addressed to this node.
///
/// Each transfer gets one replication work item (`bucket` holds the source
/// node, `name` the bag). The item's `queued_at` keeps a transfer from
/// being queued twice.
pub struct ReplicationQueuer {
    registry: Arc<dyn Registry>,
    broker: Arc<dyn QueueBroker>,
    directory: Arc<dyn PartnerDirectory>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    page_size: u32,
    collect_stats: bool,
}

impl ReplicationQueuer {
    pub fn new(
        registry: Arc<dyn Registry>,
        broker: Arc<dyn QueueBroker>,
        directory: Arc<dyn PartnerDirectory>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        page_size: u32,
        collect_stats: bool,
    ) -> Self {
        Self {
            registry,
            broker,
            directory,
            ids,
            clock,
            page_size,
            collect_stats,
        }
    }

    async fn requested_transfers(&self, client: &dyn PartnerClient) -> Result<Vec<ReplicationTransfer>, CuratorError> {
        let local = self.directory.local_node();
        let mut transfers = Vec::new();
        let mut page_number = 1;
        loop {
            let page = client
                .list_changed(EntityKind::ReplicationTransfer, None, page_number, self.page_size)
                .await?;
            transfers.extend(page.items.into_iter().filter_map(|entity| match entity {
                NodeEntity::ReplicationTransfer(t)
                    if t.status == TransferStatus::Requested && t.to_node == local =>
                {
                    Some(t)
                }
                _ => None,
            }));
            if !page.has_next {
                break;
            }
            page_number += 1;
        }
        Ok(transfers)
    }

    async fn item_for(&self, transfer: &ReplicationTransfer, log: &mut RunLog) -> Result<WorkItem, CuratorError> {
        let query = WorkItemQuery {
            action: Some(Action::Replication),
            replication_id: Some(transfer.replication_id.clone()),
            ..WorkItemQuery::first_page(1)
        };
        if let Some(existing) = self.registry.find_work_item(&query).await? {
            log.found(existing.id);
            return Ok(existing);
        }

        let now = self.clock.now();
        let mut item = WorkItem::new(self.ids.work_item_id(), Action::Replication, now);
        item.bucket = transfer.from_node.clone();
        item.name = transfer.bag.clone();
        item.replication_id = Some(transfer.replication_id.clone());
        item.institution = transfer.from_node.clone();
        item.note = format!("Replication requested by {}", transfer.from_node);
        let item = self.registry.save_work_item(&item).await?;
        log.created(item.id);
        Ok(item)
    }

    async fn queue_transfer(&self, transfer: &ReplicationTransfer, log: &mut RunLog) -> Result<(), CuratorError> {
        let mut item = self.item_for(transfer, log).await?;
        if item.queued_at.is_some() || item.is_terminal() {
            return Ok(());
        }
        let topic = Lifecycle::route(item.action, item.stage)?;
        self.broker.enqueue(topic.as_str(), &item.id.to_string()).await?;
        item.queued_at = Some(self.clock.now());
        let item = self.registry.save_work_item(&item).await?;
        log.queued(Some(item.id));
        Ok(())
    }
}

#[async_trait]
impl Producer for ReplicationQueuer {
    #[instrument(skip(self), fields(local = self.directory.local_node()))]
    async fn run(&mut self) -> Result<ProducerReport, CuratorError> {
        let mut log = RunLog::new(self.collect_stats);
        let local = self.directory.local_node().to_string();

        for node in self.directory.nodes().into_iter().filter(|n| *n != local) {
            let transfers = match self.directory.client(&node) {
                Ok(client) => self.requested_transfers(client.as_ref()).await,
                Err(err) => Err(err.into()),
            };
            let transfers = match transfers {
                Ok(transfers) => transfers,
                Err(err) => {
                    warn!(node = %node, error = %err, "cannot list replication requests");
                    log.error(format!("{node}: {err}"));
                    continue;
                }
            };
            for transfer in &transfers {
                if let Err(err) = self.queue_transfer(transfer, &mut log).await {
                    log.error(format!("{}: {err}", transfer.replication_id));
                }
            }
        }

        info!(created = log.report.created, queued = log.report.queued, "replication queuer finished");
        Ok(log.report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::{InMemoryBroker, InMemoryDirectory, InMemoryPartner, InMemoryRegistry};
    use crate::ports::{FixedClock, UlidGenerator};
    use chrono::{TimeZone, Utc};

    fn transfer(id: &str, to: &str, status: TransferStatus) -> NodeEntity {
        NodeEntity::ReplicationTransfer(ReplicationTransfer {
            replication_id: id.to_string(),
            from_node: "chron".to_string(),
            to_node: to.to_string(),
            bag: format!("bag-{id}"),
            link: format!("chron/outbound/{id}.tar"),
            status,
            fixity_value: None,
            updated_at: Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap(),
        })
    }

    #[tokio::test]
    async fn queues_requests_for_this_node_once() {
        let chron = Arc::new(InMemoryPartner::new("chron"));
        chron.put(transfer("r1", "aptrust", TransferStatus::Requested));
        chron.put(transfer("r2", "hathi", TransferStatus::Requested));
        chron.put(transfer("r3", "aptrust", TransferStatus::Stored));
        let down = Arc::new(InMemoryPartner::new("sdr"));
        down.set_unreachable(true);
        let directory = Arc::new(
            InMemoryDirectory::new("aptrust")
                .with_partner(chron)
                .with_partner(down),
        );

        let registry = InMemoryRegistry::new();
        let broker = Arc::new(InMemoryBroker::default());
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let mut queuer = ReplicationQueuer::new(
            Arc::new(registry.clone()),
            broker.clone(),
            directory,
            Arc::new(UlidGenerator::new(clock.clone())),
            clock,
            50,
            false,
        );

        let report = queuer.run().await.unwrap();
        assert_eq!(report.created, 1);
        assert_eq!(report.queued, 1);
        assert_eq!(report.errors.len(), 1);

        let items = registry.work_items().await;
        assert_eq!(items[0].replication_id.as_deref(), Some("r1"));
        assert_eq!(items[0].bucket, "chron");
        assert_eq!(broker.published("replication").await, vec![items[0].id.to_string()]);

        let again = queuer.run().await.unwrap();
        assert_eq!(again.created, 0);
        assert_eq!(again.found, 1);
        assert_eq!(again.queued, 0);
    }
}
