use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::ports::{MessageHandler, QueueBroker};

/// Consumer loops for one topic/channel.
///
/// - `max_in_flight` loops each hold at most one message in their handler.
/// - A handler that called `disable_auto_response` owns the response;
///   otherwise `Ok` finishes the message and `Err` requeues it.
/// - Shutdown stops taking new messages; it does not cancel handlers or
///   pipeline stages already holding messages.
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    pub fn consume(
        broker: Arc<dyn QueueBroker>,
        topic: &str,
        channel: &str,
        handler: Arc<dyn MessageHandler>,
        max_in_flight: usize,
        requeue_delay: Duration,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(max_in_flight);
        for worker_id in 0..max_in_flight {
            let consumer = Consumer {
                worker_id,
                broker: Arc::clone(&broker),
                topic: topic.to_string(),
                channel: channel.to_string(),
                handler: Arc::clone(&handler),
                requeue_delay,
            };
            let mut rx = shutdown_rx.clone();
            joins.push(tokio::spawn(async move {
                consumer.run(&mut rx).await;
            }));
        }

        Self { shutdown_tx, joins }
    }

    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            let _ = join.await;
        }
    }

    /// Waits until every loop ends on its own (broker closed).
    pub async fn join(self) {
        for join in self.joins {
            let _ = join.await;
        }
    }
}

struct Consumer {
    worker_id: usize,
    broker: Arc<dyn QueueBroker>,
    topic: String,
    channel: String,
    handler: Arc<dyn MessageHandler>,
    requeue_delay: Duration,
}

impl Consumer {
    async fn run(&self, shutdown_rx: &mut watch::Receiver<bool>) {
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let message = tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                message = self.broker.receive(&self.topic, &self.channel) => message,
            };

            let Some(message) = message else {
                debug!(worker = self.worker_id, topic = %self.topic, "broker closed");
                break;
            };

            let result = self.handler.handle_message(Arc::clone(&message)).await;

            if message.auto_response_disabled() || message.has_responded() {
                if let Err(err) = result {
                    warn!(worker = self.worker_id, message = %message.id(), error = %err, "handler failed after taking over response");
                }
                continue;
            }

            match result {
                Ok(()) => {
                    if let Err(err) = message.finish().await {
                        warn!(worker = self.worker_id, message = %message.id(), error = %err, "finish failed");
                    }
                }
                Err(err) => {
                    warn!(worker = self.worker_id, message = %message.id(), error = %err, "handler failed, requeueing");
                    if let Err(err) = message.requeue(self.requeue_delay).await {
                        warn!(worker = self.worker_id, message = %message.id(), error = %err, "requeue failed");
                    }
                }
            }
        }
    }
}
