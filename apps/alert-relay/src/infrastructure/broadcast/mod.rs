//! Distribution Hub
//!
//! In-process fan-out of accepted alerts to any number of subscribers.
//!
//! # Architecture
//!
//! Every subscriber owns a bounded mailbox registered in the hub. Publishing
//! snapshots the registry under a short read lock and pushes into each
//! mailbox without awaiting, so a stalled subscriber can never hold up the
//! poller or its peers. A full mailbox drops its oldest pending event.
//!
//! A keep-alive task periodically queues a [`HubEvent::KeepAlive`] for every
//! idle subscriber so downstream connections stay distinguishable from dead
//! ones. Keep-alives are only queued into empty mailboxes and never evict a
//! pending alert.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::application::ports::AlertPublisher;
use crate::domain::alert::Alert;
use crate::infrastructure::metrics;

/// Default per-subscriber queue capacity.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 64;

/// Default keep-alive period.
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

// =============================================================================
// Events
// =============================================================================

/// An item delivered to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubEvent {
    /// A newly accepted alert.
    Alert(Arc<Alert>),
    /// Periodic liveness marker.
    KeepAlive,
}

/// Identifier of a registered subscriber.
pub type SubscriberId = u64;

// =============================================================================
// Configuration
// =============================================================================

/// Hub configuration.
#[derive(Debug, Clone, Copy)]
pub struct HubConfig {
    /// Maximum pending events per subscriber.
    pub subscriber_capacity: usize,
    /// Period between keep-alive markers.
    pub keep_alive_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
        }
    }
}

/// Hub counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    /// Currently registered subscribers.
    pub subscribers: usize,
    /// Alerts published since start.
    pub published_total: u64,
    /// Events dropped from full mailboxes since start.
    pub dropped_total: u64,
}

// =============================================================================
// Mailbox
// =============================================================================

#[derive(Debug)]
struct Mailbox {
    queue: Mutex<VecDeque<HubEvent>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl Mailbox {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Queue `event`, evicting the oldest entry when full. Returns whether an
    /// entry was evicted.
    fn push(&self, event: HubEvent) -> bool {
        let evicted = {
            let mut queue = self.queue.lock();
            let evicted = if queue.len() >= self.capacity {
                queue.pop_front().is_some()
            } else {
                false
            };
            queue.push_back(event);
            evicted
        };
        if evicted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        evicted
    }

    /// Queue a keep-alive only if nothing is pending.
    fn push_keep_alive(&self) -> bool {
        let queued = {
            let mut queue = self.queue.lock();
            if queue.is_empty() {
                queue.push_back(HubEvent::KeepAlive);
                true
            } else {
                false
            }
        };
        if queued {
            self.notify.notify_one();
        }
        queued
    }

    fn pop(&self) -> Option<HubEvent> {
        self.queue.lock().pop_front()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

// =============================================================================
// Hub
// =============================================================================

#[derive(Debug)]
struct HubInner {
    config: HubConfig,
    subscribers: RwLock<HashMap<SubscriberId, Arc<Mailbox>>>,
    next_id: AtomicU64,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl HubInner {
    fn remove(&self, id: SubscriberId) -> bool {
        let removed = self.subscribers.write().remove(&id);
        removed.is_some_and(|mailbox| {
            mailbox.close();
            metrics::set_subscribers(self.subscribers.read().len());
            true
        })
    }
}

/// Per-subscriber bounded fan-out. Cheap to clone; clones share the registry.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use alert_relay::domain::alert::Alert;
/// use alert_relay::infrastructure::broadcast::{DistributionHub, HubEvent};
///
/// # tokio_test::block_on(async {
/// let hub = DistributionHub::with_defaults();
/// let mut subscription = hub.subscribe();
///
/// let alert = Alert::new("1", 1, vec!["Ashkelon".into()], "Rockets", chrono::Utc::now());
/// hub.publish(Arc::new(alert));
///
/// assert!(matches!(subscription.recv().await, Some(HubEvent::Alert(_))));
/// # });
/// ```
#[derive(Debug, Clone)]
pub struct DistributionHub {
    inner: Arc<HubInner>,
}

impl DistributionHub {
    /// Create a hub with the given configuration.
    #[must_use]
    pub fn new(config: HubConfig) -> Self {
        Self {
            inner: Arc::new(HubInner {
                config: HubConfig {
                    subscriber_capacity: config.subscriber_capacity.max(1),
                    ..config
                },
                subscribers: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                published: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Create a hub with default configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(HubConfig::default())
    }

    /// Register a new subscriber.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mailbox = Arc::new(Mailbox::new(self.inner.config.subscriber_capacity));
        let count = {
            let mut subscribers = self.inner.subscribers.write();
            subscribers.insert(id, Arc::clone(&mailbox));
            subscribers.len()
        };
        metrics::set_subscribers(count);
        tracing::debug!(subscriber_id = id, subscribers = count, "Subscriber registered");

        Subscription {
            id,
            mailbox,
            hub: Arc::downgrade(&self.inner),
        }
    }

    /// Remove a subscriber. Its pending `recv` returns `None` once drained.
    ///
    /// Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.inner.remove(id);
        if removed {
            tracing::debug!(subscriber_id = id, "Subscriber removed");
        }
        removed
    }

    /// Queue `alert` for every current subscriber. Never blocks on a
    /// subscriber; returns the number of subscribers reached.
    pub fn publish(&self, alert: Arc<Alert>) -> usize {
        let mailboxes = self.snapshot();
        let mut dropped = 0_u64;
        for mailbox in &mailboxes {
            if mailbox.push(HubEvent::Alert(Arc::clone(&alert))) {
                dropped += 1;
            }
        }

        self.inner.published.fetch_add(1, Ordering::Relaxed);
        metrics::record_alert_published(mailboxes.len());
        if dropped > 0 {
            self.inner.dropped.fetch_add(dropped, Ordering::Relaxed);
            metrics::record_events_dropped(dropped);
            tracing::warn!(
                alert_id = %alert.id,
                dropped,
                "Slow subscribers lost their oldest pending events"
            );
        }
        mailboxes.len()
    }

    /// Queue a keep-alive for every idle subscriber. Returns how many got one.
    pub fn send_keep_alive(&self) -> usize {
        self.snapshot()
            .iter()
            .filter(|mailbox| mailbox.push_keep_alive())
            .count()
    }

    /// Number of registered subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        HubStats {
            subscribers: self.subscriber_count(),
            published_total: self.inner.published.load(Ordering::Relaxed),
            dropped_total: self.inner.dropped.load(Ordering::Relaxed),
        }
    }

    /// Close every subscription, e.g. on shutdown.
    pub fn close_all(&self) {
        let drained: Vec<Arc<Mailbox>> = self
            .inner
            .subscribers
            .write()
            .drain()
            .map(|(_, mailbox)| mailbox)
            .collect();
        for mailbox in drained {
            mailbox.close();
        }
        metrics::set_subscribers(0);
    }

    /// Run the keep-alive loop until cancelled.
    pub async fn run_keep_alive(self, cancel: CancellationToken) {
        let period = self.inner.config.keep_alive_interval;
        if period.is_zero() {
            tracing::info!("Keep-alive disabled");
            cancel.cancelled().await;
            return;
        }
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::debug!("Keep-alive task cancelled");
                    break;
                }
                _ = interval.tick() => {
                    let sent = self.send_keep_alive();
                    tracing::trace!(sent, "Keep-alive sent");
                }
            }
        }
    }

    /// Spawn [`Self::run_keep_alive`] on the current runtime.
    #[must_use]
    pub fn spawn_keep_alive(&self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.clone().run_keep_alive(cancel))
    }

    fn snapshot(&self) -> Vec<Arc<Mailbox>> {
        self.inner.subscribers.read().values().cloned().collect()
    }
}

impl AlertPublisher for DistributionHub {
    fn publish(&self, alert: Arc<Alert>) -> usize {
        Self::publish(self, alert)
    }
}

// =============================================================================
// Subscription
// =============================================================================

/// A registered subscriber. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    mailbox: Arc<Mailbox>,
    hub: Weak<HubInner>,
}

impl Subscription {
    /// This subscriber's id.
    #[must_use]
    pub const fn id(&self) -> SubscriberId {
        self.id
    }

    /// Wait for the next event. Returns `None` once the subscription was
    /// removed from the hub and its queue is drained.
    pub async fn recv(&mut self) -> Option<HubEvent> {
        loop {
            if let Some(event) = self.mailbox.pop() {
                return Some(event);
            }
            if self.mailbox.is_closed() {
                return None;
            }
            self.mailbox.notify.notified().await;
        }
    }

    /// Take the next event if one is pending.
    #[must_use]
    pub fn try_recv(&mut self) -> Option<HubEvent> {
        self.mailbox.pop()
    }

    /// Events dropped from this subscriber's queue.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.mailbox.dropped.load(Ordering::Relaxed)
    }

    /// Number of pending events.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.mailbox.queue.lock().len()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.remove(self.id);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use chrono::Utc;

    use super::*;

    fn alert(id: &str) -> Arc<Alert> {
        Arc::new(Alert::new(id, 1, vec!["Ashkelon".to_string()], "t", Utc::now()))
    }

    fn alert_id(event: Option<HubEvent>) -> String {
        match event {
            Some(HubEvent::Alert(alert)) => alert.id.clone(),
            other => panic!("expected alert, got {other:?}"),
        }
    }

    fn small_hub(capacity: usize) -> DistributionHub {
        DistributionHub::new(HubConfig {
            subscriber_capacity: capacity,
            ..HubConfig::default()
        })
    }

    #[test]
    fn publish_without_subscribers() {
        let hub = DistributionHub::with_defaults();
        assert_eq!(hub.publish(alert("1")), 0);
        assert_eq!(hub.stats().published_total, 1);
    }

    #[test]
    fn each_subscriber_receives_once() {
        let hub = DistributionHub::with_defaults();
        let mut subs: Vec<Subscription> = (0..5).map(|_| hub.subscribe()).collect();

        assert_eq!(hub.publish(alert("1")), 5);

        for sub in &mut subs {
            assert_eq!(alert_id(sub.try_recv()), "1");
            assert!(sub.try_recv().is_none());
        }
    }

    #[test]
    fn unsubscribed_receive_nothing() {
        let hub = DistributionHub::with_defaults();
        let mut kept = hub.subscribe();
        let mut removed = hub.subscribe();
        assert!(hub.unsubscribe(removed.id()));
        assert!(!hub.unsubscribe(removed.id()));

        assert_eq!(hub.publish(alert("1")), 1);
        assert_eq!(alert_id(kept.try_recv()), "1");
        assert!(removed.try_recv().is_none());
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let hub = DistributionHub::with_defaults();
        let first = hub.subscribe();
        let _second = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 2);

        drop(first);
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[test]
    fn delivery_is_fifo_per_subscriber() {
        let hub = DistributionHub::with_defaults();
        let mut sub = hub.subscribe();
        for id in ["1", "2", "3"] {
            hub.publish(alert(id));
        }
        assert_eq!(alert_id(sub.try_recv()), "1");
        assert_eq!(alert_id(sub.try_recv()), "2");
        assert_eq!(alert_id(sub.try_recv()), "3");
    }

    #[test]
    fn full_mailbox_drops_oldest() {
        let hub = small_hub(2);
        let mut slow = hub.subscribe();
        let mut fast = hub.subscribe();

        hub.publish(alert("1"));
        assert_eq!(alert_id(fast.try_recv()), "1");
        hub.publish(alert("2"));
        assert_eq!(alert_id(fast.try_recv()), "2");
        hub.publish(alert("3"));
        assert_eq!(alert_id(fast.try_recv()), "3");

        assert_eq!(slow.pending(), 2);
        assert_eq!(slow.dropped(), 1);
        assert_eq!(alert_id(slow.try_recv()), "2");
        assert_eq!(alert_id(slow.try_recv()), "3");
        assert_eq!(hub.stats().dropped_total, 1);
        assert_eq!(fast.dropped(), 0);
    }

    #[test]
    fn stalled_subscriber_does_not_stall_publish() {
        let hub = small_hub(4);
        let _stalled = hub.subscribe();

        let started = Instant::now();
        for i in 0..10_000 {
            hub.publish(alert(&i.to_string()));
        }
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(hub.stats().dropped_total, 10_000 - 4);
    }

    #[test]
    fn keep_alive_only_fills_idle_mailboxes() {
        let hub = small_hub(1);
        let mut busy = hub.subscribe();
        let mut idle = hub.subscribe();

        hub.publish(alert("1"));
        assert!(idle.try_recv().is_some());

        assert_eq!(hub.send_keep_alive(), 1);
        assert_eq!(alert_id(busy.try_recv()), "1");
        assert_eq!(idle.try_recv(), Some(HubEvent::KeepAlive));
        assert_eq!(busy.dropped(), 0);
    }

    #[test]
    fn keep_alive_does_not_stack() {
        let hub = DistributionHub::with_defaults();
        let mut sub = hub.subscribe();
        hub.send_keep_alive();
        hub.send_keep_alive();
        assert_eq!(sub.pending(), 1);
        assert_eq!(sub.try_recv(), Some(HubEvent::KeepAlive));
    }

    #[tokio::test]
    async fn recv_wakes_on_publish() {
        let hub = DistributionHub::with_defaults();
        let mut sub = hub.subscribe();

        let publisher = hub.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish(alert("late"));
        });

        let event = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .expect("should receive event");
        assert_eq!(alert_id(event), "late");
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn recv_ends_after_unsubscribe() {
        let hub = DistributionHub::with_defaults();
        let mut sub = hub.subscribe();
        hub.publish(alert("1"));
        hub.unsubscribe(sub.id());

        assert_eq!(alert_id(sub.recv().await), "1");
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn close_all_ends_subscriptions() {
        let hub = DistributionHub::with_defaults();
        let mut sub = hub.subscribe();
        hub.close_all();
        assert!(sub.recv().await.is_none());
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_task_ticks_on_period() {
        let hub = DistributionHub::new(HubConfig {
            subscriber_capacity: 8,
            keep_alive_interval: Duration::from_secs(30),
        });
        let mut sub = hub.subscribe();
        let cancel = CancellationToken::new();
        let handle = hub.spawn_keep_alive(cancel.clone());

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(sub.try_recv().is_none());

        let event = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .expect("keep-alive within period");
        assert_eq!(event, Some(HubEvent::KeepAlive));

        cancel.cancel();
        handle.await.unwrap();
    }
}
