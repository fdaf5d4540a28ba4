//! MessageBus: topic-pattern pub/sub with bounded per-subscriber queues
//!
//! Every subscription owns a FIFO queue drained by its own worker task, so a
//! slow handler only ever delays itself. Publication never waits: when a queue
//! is full the oldest undelivered event is dropped and a backpressure signal
//! goes out on [`Topics::BUS_BACKPRESSURE`].

use super::{BusConfig, BusStats, Event, EventHandler, SubscriptionHandle, TopicPattern, Topics};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Producer id used for events the bus emits itself
pub const BUS_PRODUCER: &str = "message_bus";

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    unrouted: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    failed_deliveries: AtomicU64,
    /// Queued plus in-delivery events across all subscriptions
    outstanding: AtomicU64,
}

struct Subscription {
    handle: SubscriptionHandle,
    pattern: TopicPattern,
    handler_name: String,
    queue: Mutex<VecDeque<Event>>,
    notify: Notify,
    cancel: CancellationToken,
}

impl Subscription {
    /// Push an event, returning whatever had to be dropped to make room.
    ///
    /// The cancellation check happens under the queue lock, and
    /// `discard_pending` only runs after cancellation, so a publisher holding
    /// a stale target can never strand an event in a dead queue.
    fn enqueue(&self, event: Event, capacity: usize, counters: &Counters) -> Option<Event> {
        let dropped = {
            let mut queue = self.queue.lock();
            if self.cancel.is_cancelled() {
                return None;
            }
            counters.outstanding.fetch_add(1, Ordering::SeqCst);
            let dropped = if queue.len() >= capacity.max(1) {
                queue.pop_front()
            } else {
                None
            };
            queue.push_back(event);
            if dropped.is_some() {
                counters.outstanding.fetch_sub(1, Ordering::SeqCst);
            }
            dropped
        };
        self.notify.notify_one();
        dropped
    }

    fn next(&self) -> Option<Event> {
        self.queue.lock().pop_front()
    }

    fn discard_pending(&self, counters: &Counters) {
        let discarded = {
            let mut queue = self.queue.lock();
            let n = queue.len();
            queue.clear();
            n
        };
        if discarded > 0 {
            counters
                .outstanding
                .fetch_sub(discarded as u64, Ordering::SeqCst);
        }
    }
}

/// Publish/subscribe event distribution between agents and the workflow engine
pub struct MessageBus {
    config: BusConfig,
    subscriptions: RwLock<HashMap<SubscriptionHandle, Arc<Subscription>>>,
    next_id: AtomicU64,
    counters: Arc<Counters>,
    shutdown: CancellationToken,
}

impl MessageBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            subscriptions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            counters: Arc::new(Counters::default()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Hand an event to every matching subscriber and return how many got it.
    ///
    /// Events with no matching subscriber are dropped; the bus keeps nothing
    /// for subscribers that arrive later.
    pub fn publish(&self, event: Event) -> usize {
        if self.shutdown.is_cancelled() {
            debug!(topic = %event.topic, "Bus is shut down, event dropped");
            return 0;
        }
        self.counters.published.fetch_add(1, Ordering::Relaxed);

        let targets: Vec<Arc<Subscription>> = {
            let subscriptions = self.subscriptions.read();
            subscriptions
                .values()
                .filter(|s| s.pattern.matches(&event.topic))
                .cloned()
                .collect()
        };

        if targets.is_empty() {
            self.counters.unrouted.fetch_add(1, Ordering::Relaxed);
            debug!(topic = %event.topic, event_id = %event.id, "No subscribers, event dropped");
            return 0;
        }

        let mut signals = Vec::new();
        for subscription in &targets {
            let Some(dropped) =
                subscription.enqueue(event.clone(), self.config.queue_size, &self.counters)
            else {
                continue;
            };

            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(
                subscription = %subscription.handle,
                handler = %subscription.handler_name,
                dropped_topic = %dropped.topic,
                dropped_event_id = %dropped.id,
                "Subscriber queue full, dropped oldest event"
            );

            if event.topic != Topics::BUS_BACKPRESSURE {
                signals.push(Event::new(
                    Topics::BUS_BACKPRESSURE,
                    BUS_PRODUCER,
                    serde_json::json!({
                        "subscription": subscription.handle.0,
                        "handler": subscription.handler_name,
                        "dropped_event_id": dropped.id,
                        "dropped_topic": dropped.topic,
                        "queue_size": self.config.queue_size,
                    }),
                ));
            }
        }

        for signal in signals {
            self.publish(signal);
        }

        targets.len()
    }

    /// Register a handler for a topic pattern (`*`, `prefix.*` or an exact topic).
    ///
    /// Spawns the subscriber's worker, so this must run inside a Tokio runtime.
    pub fn subscribe(
        &self,
        pattern: impl Into<TopicPattern>,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionHandle {
        let handle = SubscriptionHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        let subscription = Arc::new(Subscription {
            handle,
            pattern: pattern.into(),
            handler_name: handler.name(),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            cancel: self.shutdown.child_token(),
        });

        info!(
            subscription = %handle,
            handler = %subscription.handler_name,
            pattern = %subscription.pattern,
            "Handler subscribed"
        );

        self.subscriptions
            .write()
            .insert(handle, Arc::clone(&subscription));

        tokio::spawn(run_subscriber(
            subscription,
            handler,
            self.config.max_delivery_attempts.max(1),
            Arc::clone(&self.counters),
        ));

        handle
    }

    /// Stop delivering to a subscription. Queued but undelivered events are discarded.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let removed = self.subscriptions.write().remove(&handle);
        match removed {
            Some(subscription) => {
                subscription.cancel.cancel();
                subscription.discard_pending(&self.counters);
                info!(subscription = %handle, handler = %subscription.handler_name, "Handler unsubscribed");
                true
            }
            None => false,
        }
    }

    /// Number of active subscriptions whose pattern matches `topic`
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subscriptions
            .read()
            .values()
            .filter(|s| s.pattern.matches(topic))
            .count()
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.counters.published.load(Ordering::Relaxed),
            unrouted: self.counters.unrouted.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            failed_deliveries: self.counters.failed_deliveries.load(Ordering::Relaxed),
            active_subscriptions: self.subscriptions.read().len(),
        }
    }

    /// Wait until every queued event has been handled. Returns false on timeout.
    pub async fn flush(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.counters.outstanding.load(Ordering::SeqCst) == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    /// Stop every subscriber worker and refuse further publications
    pub fn shutdown(&self) {
        info!("Shutting down message bus");
        self.shutdown.cancel();
        let drained: Vec<Arc<Subscription>> =
            self.subscriptions.write().drain().map(|(_, s)| s).collect();
        for subscription in drained {
            subscription.discard_pending(&self.counters);
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

async fn run_subscriber(
    subscription: Arc<Subscription>,
    handler: Arc<dyn EventHandler>,
    max_attempts: u32,
    counters: Arc<Counters>,
) {
    loop {
        if subscription.cancel.is_cancelled() {
            break;
        }
        let event = match subscription.next() {
            Some(event) => event,
            None => {
                tokio::select! {
                    _ = subscription.notify.notified() => {}
                    _ = subscription.cancel.cancelled() => break,
                }
                continue;
            }
        };

        deliver(&subscription, handler.as_ref(), event, max_attempts, &counters).await;
        counters.outstanding.fetch_sub(1, Ordering::SeqCst);
    }

    subscription.discard_pending(&counters);
    debug!(subscription = %subscription.handle, "Subscriber worker stopped");
}

async fn deliver(
    subscription: &Subscription,
    handler: &dyn EventHandler,
    event: Event,
    max_attempts: u32,
    counters: &Counters,
) {
    for attempt in 1..=max_attempts {
        match handler.handle(event.clone()).await {
            Ok(()) => {
                counters.delivered.fetch_add(1, Ordering::Relaxed);
                debug!(
                    handler = %subscription.handler_name,
                    topic = %event.topic,
                    event_id = %event.id,
                    attempt,
                    "Event delivered"
                );
                return;
            }
            Err(e) if attempt < max_attempts => {
                debug!(
                    handler = %subscription.handler_name,
                    topic = %event.topic,
                    attempt,
                    error = %e,
                    "Delivery failed, redelivering"
                );
            }
            Err(e) => {
                counters.failed_deliveries.fetch_add(1, Ordering::Relaxed);
                warn!(
                    handler = %subscription.handler_name,
                    topic = %event.topic,
                    event_id = %event.id,
                    attempts = max_attempts,
                    error = %e,
                    "Delivery failed permanently"
                );
            }
        }
    }
}
