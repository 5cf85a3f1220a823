//! In-memory broker with NSQ-like semantics.
//!
//! - A topic fans out to every channel; messages published before any
//!   channel exists wait in the topic backlog.
//! - A delivered message is in flight until finished, requeued, or its
//!   visibility timeout lapses (then it is redelivered).
//! - `requeue(delay)` parks the message in a min-heap; it is not
//!   redelivered before `delay` elapses.
//!
//! Time comes from `tokio::time`, so tests can pause and advance it.

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use ulid::Ulid;

use crate::domain::MessageId;
use crate::ports::{BrokerError, QueueBroker, QueueMessage};

#[derive(Debug, Clone)]
struct StoredMessage {
    id: MessageId,
    body: String,
    attempts: u16,
}

/// Deferred entry; reversed ordering turns `BinaryHeap` into a min-heap.
#[derive(Debug)]
struct Deferred {
    ready_at: Instant,
    message: StoredMessage,
}

impl PartialEq for Deferred {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at
    }
}

impl Eq for Deferred {}

impl PartialOrd for Deferred {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Deferred {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.ready_at.cmp(&self.ready_at)
    }
}

#[derive(Debug)]
struct InFlight {
    message: StoredMessage,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct ChannelState {
    ready: VecDeque<StoredMessage>,
    deferred: BinaryHeap<Deferred>,
    in_flight: HashMap<MessageId, InFlight>,
    finished: usize,
    requeued: usize,
    timed_out: usize,
}

impl ChannelState {
    /// Moves due deferred messages and expired in-flight messages to ready.
    fn promote(&mut self, now: Instant) {
        while let Some(entry) = self.deferred.peek() {
            if entry.ready_at > now {
                break;
            }
            if let Some(entry) = self.deferred.pop() {
                self.ready.push_back(entry.message);
            }
        }

        let expired: Vec<MessageId> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(flight) = self.in_flight.remove(&id) {
                self.timed_out += 1;
                self.ready.push_back(flight.message);
            }
        }
    }

    fn next_wake(&self) -> Option<Instant> {
        let deferred = self.deferred.peek().map(|d| d.ready_at);
        let deadline = self.in_flight.values().map(|f| f.deadline).min();
        match (deferred, deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

#[derive(Debug, Default)]
struct TopicState {
    backlog: VecDeque<StoredMessage>,
    channels: HashMap<String, ChannelState>,
    published: Vec<String>,
}

#[derive(Debug, Default)]
struct BrokerState {
    topics: HashMap<String, TopicState>,
    closed: bool,
    unavailable: bool,
}

/// Snapshot of one channel, for tests and status output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelCounts {
    pub ready: usize,
    pub deferred: usize,
    pub in_flight: usize,
    pub finished: usize,
    pub requeued: usize,
    pub timed_out: usize,
}

pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
    message_timeout: Duration,
}

impl InMemoryBroker {
    pub fn new(message_timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            notify: Arc::new(Notify::new()),
            message_timeout,
        }
    }

    /// Wakes all waiting consumers with `None`.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.notify.notify_waiters();
    }

    /// Makes `enqueue` fail until switched back.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }

    /// Every body ever published to `topic`, in order.
    pub async fn published(&self, topic: &str) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .topics
            .get(topic)
            .map(|t| t.published.clone())
            .unwrap_or_default()
    }

    pub async fn counts(&self, topic: &str, channel: &str) -> ChannelCounts {
        let state = self.state.lock().await;
        let Some(topic) = state.topics.get(topic) else {
            return ChannelCounts::default();
        };
        match topic.channels.get(channel) {
            Some(ch) => ChannelCounts {
                ready: ch.ready.len(),
                deferred: ch.deferred.len(),
                in_flight: ch.in_flight.len(),
                finished: ch.finished,
                requeued: ch.requeued,
                timed_out: ch.timed_out,
            },
            None => ChannelCounts {
                ready: topic.backlog.len(),
                ..ChannelCounts::default()
            },
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(Duration::from_secs(600))
    }
}

#[async_trait]
impl QueueBroker for InMemoryBroker {
    async fn enqueue(&self, topic: &str, body: &str) -> Result<(), BrokerError> {
        {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(BrokerError::Closed);
            }
            if state.unavailable {
                return Err(BrokerError::Unavailable(format!("publish to {topic} refused")));
            }
            let message = StoredMessage {
                id: MessageId::from_ulid(Ulid::new()),
                body: body.to_string(),
                attempts: 0,
            };
            let topic_state = state.topics.entry(topic.to_string()).or_default();
            topic_state.published.push(body.to_string());
            if topic_state.channels.is_empty() {
                topic_state.backlog.push_back(message);
            } else {
                for channel in topic_state.channels.values_mut() {
                    channel.ready.push_back(message.clone());
                }
            }
        }
        // notify outside the lock
        self.notify.notify_waiters();
        Ok(())
    }

    async fn receive(&self, topic: &str, channel: &str) -> Option<Arc<dyn QueueMessage>> {
        loop {
            // register interest before looking, so a publish between the
            // check and the wait is not lost
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_wake = {
                let mut state = self.state.lock().await;
                if state.closed {
                    return None;
                }
                let now = Instant::now();
                let topic_state = state.topics.entry(topic.to_string()).or_default();
                if !topic_state.channels.contains_key(channel) {
                    let backlog: VecDeque<StoredMessage> = topic_state.backlog.drain(..).collect();
                    topic_state.channels.insert(
                        channel.to_string(),
                        ChannelState {
                            ready: backlog,
                            ..ChannelState::default()
                        },
                    );
                }
                let Some(ch) = topic_state.channels.get_mut(channel) else {
                    return None;
                };
                ch.promote(now);

                if let Some(mut message) = ch.ready.pop_front() {
                    message.attempts = message.attempts.saturating_add(1);
                    ch.in_flight.insert(
                        message.id,
                        InFlight {
                            message: message.clone(),
                            deadline: now + self.message_timeout,
                        },
                    );
                    return Some(Arc::new(InMemoryMessage {
                        message,
                        topic: topic.to_string(),
                        channel: channel.to_string(),
                        state: Arc::clone(&self.state),
                        notify: Arc::clone(&self.notify),
                        message_timeout: self.message_timeout,
                        auto_response_disabled: AtomicBool::new(false),
                        responded: AtomicBool::new(false),
                    }));
                }
                ch.next_wake()
            };

            match next_wake {
                Some(wake) => {
                    tokio::select! {
                        _ = &mut notified => {},
                        _ = tokio::time::sleep_until(wake) => {},
                    }
                }
                None => notified.await,
            }
        }
    }
}

/// One delivery handed out by `InMemoryBroker`.
struct InMemoryMessage {
    message: StoredMessage,
    topic: String,
    channel: String,
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
    message_timeout: Duration,
    auto_response_disabled: AtomicBool,
    responded: AtomicBool,
}

impl InMemoryMessage {
    /// Removes this delivery from the in-flight set.
    async fn take_in_flight(&self) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        let ch = state
            .topics
            .get_mut(&self.topic)
            .and_then(|t| t.channels.get_mut(&self.channel))
            .ok_or(BrokerError::NotInFlight(self.message.id))?;
        ch.in_flight
            .remove(&self.message.id)
            .map(|_| ())
            .ok_or(BrokerError::NotInFlight(self.message.id))
    }
}

#[async_trait]
impl QueueMessage for InMemoryMessage {
    fn id(&self) -> MessageId {
        self.message.id
    }

    fn body(&self) -> &str {
        &self.message.body
    }

    fn attempts(&self) -> u16 {
        self.message.attempts
    }

    async fn finish(&self) -> Result<(), BrokerError> {
        self.take_in_flight().await?;
        self.responded.store(true, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        if let Some(ch) = state
            .topics
            .get_mut(&self.topic)
            .and_then(|t| t.channels.get_mut(&self.channel))
        {
            ch.finished += 1;
        }
        Ok(())
    }

    async fn requeue(&self, delay: Duration) -> Result<(), BrokerError> {
        {
            let mut state = self.state.lock().await;
            let ch = state
                .topics
                .get_mut(&self.topic)
                .and_then(|t| t.channels.get_mut(&self.channel))
                .ok_or(BrokerError::NotInFlight(self.message.id))?;
            let flight = ch
                .in_flight
                .remove(&self.message.id)
                .ok_or(BrokerError::NotInFlight(self.message.id))?;
            ch.requeued += 1;
            if delay.is_zero() {
                ch.ready.push_back(flight.message);
            } else {
                ch.deferred.push(Deferred {
                    ready_at: Instant::now() + delay,
                    message: flight.message,
                });
            }
        }
        self.responded.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn touch(&self) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        let flight = state
            .topics
            .get_mut(&self.topic)
            .and_then(|t| t.channels.get_mut(&self.channel))
            .and_then(|ch| ch.in_flight.get_mut(&self.message.id))
            .ok_or(BrokerError::NotInFlight(self.message.id))?;
        flight.deadline = Instant::now() + self.message_timeout;
        Ok(())
    }

    fn disable_auto_response(&self) {
        self.auto_response_disabled.store(true, Ordering::SeqCst);
    }

    fn auto_response_disabled(&self) -> bool {
        self.auto_response_disabled.load(Ordering::SeqCst)
    }

    fn has_responded(&self) -> bool {
        self.responded.load(Ordering::SeqCst)
    }
}
