use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use tracing::{info, instrument};

use super::{Producer, ProducerReport, RunLog};
use crate::domain::{StorageOption, Topic};
use crate::error::CuratorError;
use crate::ports::{Clock, FileQuery, QueueBroker, Registry};

const PAGE_SIZE: u32 = 100;

/// Queues files whose last fixity check is older than `max_days`.
///
/// Messages carry the file identifier; fixity checks have no work item.
pub struct FixityQueuer {
    registry: Arc<dyn Registry>,
    broker: Arc<dyn QueueBroker>,
    clock: Arc<dyn Clock>,
    max_days: i64,
    max_files: usize,
    collect_stats: bool,
}

impl FixityQueuer {
    pub fn new(
        registry: Arc<dyn Registry>,
        broker: Arc<dyn QueueBroker>,
        clock: Arc<dyn Clock>,
        max_days: i64,
        max_files: usize,
        collect_stats: bool,
    ) -> Self {
        Self {
            registry,
            broker,
            clock,
            max_days,
            max_files,
            collect_stats,
        }
    }
}

#[async_trait]
impl Producer for FixityQueuer {
    #[instrument(skip(self), fields(max_days = self.max_days, max_files = self.max_files))]
    async fn run(&mut self) -> Result<ProducerReport, CuratorError> {
        let mut log = RunLog::new(self.collect_stats);
        let cutoff = self.clock.now() - Duration::days(self.max_days);
        let mut query = FileQuery {
            not_checked_since: Some(cutoff),
            page: 1,
            per_page: PAGE_SIZE,
            ..FileQuery::default()
        };

        'pages: loop {
            let page = self.registry.list_generic_files(&query).await?;
            for file in &page.items {
                if log.report.queued >= self.max_files {
                    break 'pages;
                }
                // cold-tier files are verified by the storage service
                if file.storage_option != StorageOption::Standard {
                    log.skipped(&file.identifier);
                    continue;
                }
                match self.broker.enqueue(Topic::Fixity.as_str(), &file.identifier).await {
                    Ok(()) => log.queued(None),
                    Err(err) => log.error(format!("{}: {err}", file.identifier)),
                }
            }
            if !page.has_next {
                break;
            }
            query.page += 1;
        }

        info!(queued = log.report.queued, skipped = log.report.skipped, "fixity queuer finished");
        Ok(log.report)
    }
}
