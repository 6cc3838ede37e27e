use crate::broker::{Broker, DeliveryTag};
use crate::errlog::ErrorLog;
use crate::records::PublishRecord;
use crate::retry::{RetryQueue, RetryRecord};
use crate::stats::NodeStats;
use crate::store::RecordId;
use bytes::Bytes;
use chrono::Utc;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    /// How long a started attempt may wait for the broker to accept the session.
    pub connect_timeout: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(5),
            max: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    fn next(&self, backoff: Duration) -> Duration {
        backoff.saturating_mul(2).min(self.max)
    }
}

/// `backoff` is the delay applied after the next failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected {
        next_attempt: Instant,
        backoff: Duration,
    },
    Connecting {
        started: Instant,
        backoff: Duration,
    },
    Connected,
}

/// A record the broker has taken but not yet confirmed.
enum InFlight {
    /// Sent straight from a tick; parked in the retry queue if the session
    /// ends before the broker confirms it.
    Live(PublishRecord),
    /// Resent from the retry queue, where it stays until confirmed.
    Replay(RecordId),
}

struct Link<B> {
    broker: B,
    state: LinkState,
    policy: BackoffPolicy,
    in_flight: BTreeMap<DeliveryTag, InFlight>,
}

impl<B: Broker> Link<B> {
    async fn maintain(&mut self, now: Instant) {
        match self.state {
            LinkState::Connected => {
                if !self.broker.is_connected() {
                    tracing::warn!("broker connection lost");
                    self.mark_down(now);
                }
            }
            LinkState::Disconnected {
                next_attempt,
                backoff,
            } if now >= next_attempt => match self.broker.connect().await {
                Ok(()) => {
                    self.state = LinkState::Connecting {
                        started: now,
                        backoff,
                    };
                }
                Err(err) => {
                    tracing::warn!(error = %err, retry_in = ?backoff, "broker connect failed");
                    self.state = LinkState::Disconnected {
                        next_attempt: now + backoff,
                        backoff: self.policy.next(backoff),
                    };
                }
            },
            LinkState::Disconnected { .. } | LinkState::Connecting { .. } => {}
        }

        if let LinkState::Connecting { started, backoff } = self.state {
            if self.broker.is_connected() {
                tracing::info!("broker connected");
                self.state = LinkState::Connected;
            } else if now.saturating_duration_since(started) >= self.policy.connect_timeout {
                tracing::warn!(retry_in = ?backoff, "broker did not accept the session in time");
                self.state = LinkState::Disconnected {
                    next_attempt: now + backoff,
                    backoff: self.policy.next(backoff),
                };
            }
        }
    }

    fn mark_down(&mut self, now: Instant) {
        self.state = LinkState::Disconnected {
            next_attempt: now + self.policy.initial,
            backoff: self.policy.next(self.policy.initial),
        };
    }

    fn is_up(&self) -> bool {
        self.state == LinkState::Connected
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub sent: usize,
    pub remaining: usize,
}

/// Delivers telemetry to the broker, parking anything undeliverable in the
/// retry queue. Nothing here returns an error to the caller.
///
/// Lock order: link, then queue.
pub struct Publisher<B> {
    link: Mutex<Link<B>>,
    queue: RetryQueue,
    stats: Arc<NodeStats>,
    errors: Arc<ErrorLog>,
}

impl<B: Broker> Publisher<B> {
    pub fn new(
        broker: B,
        policy: BackoffPolicy,
        queue: RetryQueue,
        stats: Arc<NodeStats>,
        errors: Arc<ErrorLog>,
        now: Instant,
    ) -> Self {
        Self {
            link: Mutex::new(Link {
                broker,
                state: LinkState::Disconnected {
                    next_attempt: now,
                    backoff: policy.initial,
                },
                policy,
                in_flight: BTreeMap::new(),
            }),
            queue,
            stats,
            errors,
        }
    }

    pub async fn maintain(&self, now: Instant) {
        let mut link = self.link.lock().await;
        link.maintain(now).await;
        self.settle(&mut link).await;
        self.stats.set_broker_connected(link.is_up());
    }

    pub async fn publish(&self, record: &PublishRecord, now: Instant) {
        let mut link = self.link.lock().await;
        if link.is_up() {
            let payload = encode(&record.payload);
            match link.broker.send(&record.topic, payload).await {
                Ok(tag) => {
                    link.in_flight.insert(tag, InFlight::Live(record.clone()));
                    self.settle(&mut link).await;
                    return;
                }
                Err(err) => {
                    link.mark_down(now);
                    self.stats.set_broker_connected(false);
                    self.errors
                        .record(format!("publish to {} failed: {err:#}", record.topic));
                    self.settle(&mut link).await;
                }
            }
        } else {
            tracing::debug!(topic = %record.topic, "broker not connected; queueing record");
        }
        self.defer(record).await;
    }

    /// Applies broker confirmations. Once the link is down nothing still in
    /// flight can be confirmed, so live records go to the retry queue and
    /// replays are left where they are.
    async fn settle(&self, link: &mut Link<B>) {
        let mut confirmed_replays = Vec::new();
        for tag in link.broker.acknowledged() {
            match link.in_flight.remove(&tag) {
                Some(InFlight::Live(_)) => {
                    self.stats.published.fetch_add(1, Ordering::Relaxed);
                }
                Some(InFlight::Replay(id)) => confirmed_replays.push(id),
                None => {}
            }
        }
        if !confirmed_replays.is_empty() {
            let mut store = self.queue.lock().await;
            match store.remove(&confirmed_replays) {
                Ok(removed) => {
                    self.stats.replayed.fetch_add(removed as u64, Ordering::Relaxed);
                }
                Err(err) => {
                    // Still queued; they will be sent again.
                    tracing::warn!(error = %err, "failed to remove confirmed records from retry queue");
                    self.stats.record_error(err.to_string());
                }
            }
            self.stats.set_queue_depth(store.len());
        }

        if link.is_up() || link.in_flight.is_empty() {
            return;
        }
        let mut requeued = 0usize;
        for (_, lost) in std::mem::take(&mut link.in_flight) {
            if let InFlight::Live(record) = lost {
                self.defer(&record).await;
                requeued += 1;
            }
        }
        if requeued > 0 {
            tracing::warn!(requeued, "session ended before the broker confirmed publishes");
        }
    }

    async fn defer(&self, record: &PublishRecord) {
        self.stats.deferred.fetch_add(1, Ordering::Relaxed);
        let retry = RetryRecord {
            topic: record.topic.clone(),
            payload: record.payload.clone(),
            enqueued_at: Utc::now(),
        };
        match self.queue.enqueue(&retry).await {
            Ok(outcome) if outcome.dropped > 0 => {
                self.stats
                    .dropped_records
                    .fetch_add(outcome.dropped as u64, Ordering::Relaxed);
                self.errors.record(format!(
                    "retry queue full; dropped {} oldest records",
                    outcome.dropped
                ));
            }
            Ok(_) => {}
            Err(err) => {
                self.stats.dropped_records.fetch_add(1, Ordering::Relaxed);
                self.stats.record_error(err.to_string());
                self.errors
                    .record(format!("retry queue rejected {} record: {err:#}", record.topic));
            }
        }
        self.stats.set_queue_depth(self.queue.len().await);
    }

    /// Resends every queued record once, oldest first. Records leave the
    /// queue when the broker confirms them, which may be on a later call.
    /// Stops at the first send failure.
    pub async fn drain_one_pass(&self, now: Instant) -> DrainSummary {
        let mut link = self.link.lock().await;
        self.settle(&mut link).await;
        if !link.is_up() {
            return DrainSummary {
                sent: 0,
                remaining: self.queue.len().await,
            };
        }
        let awaiting: HashSet<RecordId> = link
            .in_flight
            .values()
            .filter_map(|pending| match pending {
                InFlight::Replay(id) => Some(*id),
                InFlight::Live(_) => None,
            })
            .collect();

        let mut store = self.queue.lock().await;
        if store.is_empty() {
            return DrainSummary::default();
        }
        let pending = match store.records() {
            Ok(pending) => pending,
            Err(err) => {
                tracing::warn!(error = %err, "retry queue unreadable");
                self.stats.record_error(err.to_string());
                return DrainSummary {
                    sent: 0,
                    remaining: store.len(),
                };
            }
        };

        let mut undecodable: Vec<RecordId> = Vec::new();
        let mut sent = 0usize;
        for stored in pending.iter().filter(|stored| !awaiting.contains(&stored.id)) {
            let retry = match RetryRecord::decode(&stored.body) {
                Ok(retry) => retry,
                Err(err) => {
                    tracing::warn!(error = %err, id = stored.id, "discarding undecodable retry record");
                    undecodable.push(stored.id);
                    continue;
                }
            };
            match link.broker.send(&retry.topic, encode(&retry.payload)).await {
                Ok(tag) => {
                    link.in_flight.insert(tag, InFlight::Replay(stored.id));
                    sent += 1;
                }
                Err(err) => {
                    tracing::warn!(error = %err, topic = %retry.topic, "resend failed");
                    link.mark_down(now);
                    self.stats.set_broker_connected(false);
                    break;
                }
            }
        }
        if !undecodable.is_empty() {
            if let Err(err) = store.remove(&undecodable) {
                tracing::warn!(error = %err, "failed to drop undecodable retry records");
                self.stats.record_error(err.to_string());
            }
        }
        drop(store);

        self.settle(&mut link).await;
        let remaining = self.queue.len().await;
        self.stats.set_queue_depth(remaining);
        if sent > 0 {
            tracing::info!(sent, remaining, "resent queued records");
        }
        DrainSummary { sent, remaining }
    }

    #[cfg(test)]
    pub async fn queued(&self) -> usize {
        self.queue.len().await
    }

    #[cfg(test)]
    pub async fn link_state(&self) -> LinkState {
        self.link.lock().await.state
    }

    #[cfg(test)]
    pub async fn with_broker<R>(&self, f: impl FnOnce(&mut B) -> R) -> R {
        let mut link = self.link.lock().await;
        f(&mut link.broker)
    }
}

fn encode(payload: &serde_json::Value) -> Bytes {
    Bytes::from(payload.to_string())
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use anyhow::{anyhow, Result};
    use std::sync::atomic::AtomicBool;

    /// In-process broker whose availability is flipped by the test.
    #[derive(Clone, Default)]
    pub struct FakeBroker {
        pub up: Arc<AtomicBool>,
        /// When cleared, sends are taken but never confirmed.
        pub confirming: Arc<AtomicBool>,
        connected: bool,
        pub delivered: Vec<(String, serde_json::Value)>,
        pub connect_attempts: usize,
        next_tag: DeliveryTag,
        confirmed: Vec<DeliveryTag>,
    }

    impl FakeBroker {
        pub fn new(up: bool) -> Self {
            Self {
                up: Arc::new(AtomicBool::new(up)),
                confirming: Arc::new(AtomicBool::new(true)),
                ..Self::default()
            }
        }
    }

    impl Broker for FakeBroker {
        async fn connect(&mut self) -> Result<()> {
            self.connect_attempts += 1;
            self.confirmed.clear();
            self.connected = self.up.load(Ordering::SeqCst);
            if self.connected {
                Ok(())
            } else {
                Err(anyhow!("broker unreachable"))
            }
        }

        fn is_connected(&self) -> bool {
            self.connected && self.up.load(Ordering::SeqCst)
        }

        async fn send(&mut self, topic: &str, payload: Bytes) -> Result<DeliveryTag> {
            if !self.is_connected() {
                self.connected = false;
                return Err(anyhow!("connection reset"));
            }
            let value = serde_json::from_slice(&payload)?;
            self.delivered.push((topic.to_string(), value));
            self.next_tag += 1;
            if self.confirming.load(Ordering::SeqCst) {
                self.confirmed.push(self.next_tag);
            }
            Ok(self.next_tag)
        }

        fn acknowledged(&mut self) -> Vec<DeliveryTag> {
            std::mem::take(&mut self.confirmed)
        }
    }
}
