//! Bounded publish/subscribe event bus.
//!
//! # Architecture
//!
//! ```text
//! publish() ──► bounded VecDeque ──► worker 1..N ──┬──► handler A (ticket order)
//!   (never blocks;                                 ├──► handler B
//!    overflow counted)                             └──► ...
//! ```
//!
//! The bus is an explicit instance shared through `Arc`; nothing is global.
//! Publishing takes a short queue lock and returns [`PublishOutcome`]
//! immediately. When the queue is full the configured [`OverflowPolicy`]
//! decides between rejecting the new event and evicting the oldest one. Both
//! paths, and any publish refused because the bus is stopping, increment
//! `overflow_events` and `events_dropped` once.
//!
//! Workers take the highest [`EventPriority`] first and, within a priority,
//! the oldest event. While still holding the queue lock a worker
//! draws a ticket from every matching subscription, and each subscription
//! serves tickets strictly in order. Handlers for the same event run
//! concurrently, but a given subscriber always sees events in dequeue order.
//! Handlers run in their own tasks: an error, panic or timeout is logged and
//! counted without affecting the worker or other subscribers.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::telemetry::RollingWindow;

// =============================================================================
// Events
// =============================================================================

/// Dispatch priority carried on every event. Queued `Critical` events are
/// dispatched before `High`, and so on down to `Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventPriority {
    Critical,
    High,
    Normal,
    Low,
}

/// Event type, serialized as a dotted string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum EventType {
    SessionStarted,
    SessionStopped,
    SessionError,
    SessionRestarted,
    PromptDetected,
    ResponseSent,
    PerformanceMetrics,
    PerformanceAlert,
    SystemShutdown,
    Custom(String),
}

impl EventType {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::SessionStarted => "session.started",
            Self::SessionStopped => "session.stopped",
            Self::SessionError => "session.error",
            Self::SessionRestarted => "session.restarted",
            Self::PromptDetected => "prompt.detected",
            Self::ResponseSent => "response.sent",
            Self::PerformanceMetrics => "performance.metrics",
            Self::PerformanceAlert => "performance.alert",
            Self::SystemShutdown => "system.shutdown",
            Self::Custom(name) => name,
        }
    }
}

impl From<String> for EventType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "session.started" => Self::SessionStarted,
            "session.stopped" => Self::SessionStopped,
            "session.error" => Self::SessionError,
            "session.restarted" => Self::SessionRestarted,
            "prompt.detected" => Self::PromptDetected,
            "response.sent" => Self::ResponseSent,
            "performance.metrics" => Self::PerformanceMetrics,
            "performance.alert" => Self::PerformanceAlert,
            "system.shutdown" => Self::SystemShutdown,
            _ => Self::Custom(value),
        }
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        match value {
            EventType::Custom(name) => name,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(rename = "data")]
    pub payload: serde_json::Map<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub priority: EventPriority,
}

impl Event {
    #[must_use]
    pub fn new(event_type: EventType, source: impl Into<String>) -> Self {
        Self {
            event_type,
            payload: serde_json::Map::new(),
            timestamp: Utc::now(),
            source: source.into(),
            priority: EventPriority::Normal,
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Payload field accessor.
    #[must_use]
    pub fn field(&self, key: &str) -> Option<&serde_json::Value> {
        self.payload.get(key)
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// What `publish` does when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Reject the incoming event; the publisher sees `Rejected`.
    #[default]
    RejectNew,
    /// Evict the oldest queued event to admit the new one.
    DropOldest,
}

/// Event bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    pub capacity: usize,
    pub workers: usize,
    pub overflow_policy: OverflowPolicy,
    /// Per-handler deadline; exceeding it counts as a handler error.
    pub handler_timeout_ms: u64,
    /// Deadline for draining the queue on shutdown.
    pub shutdown_timeout_ms: u64,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            workers: 4,
            overflow_policy: OverflowPolicy::RejectNew,
            handler_timeout_ms: 5_000,
            shutdown_timeout_ms: 5_000,
        }
    }
}

const PROCESSING_SAMPLES: usize = 1000;
const DEPTH_SAMPLES: usize = 100;

// =============================================================================
// Subscriptions
// =============================================================================

/// Error returned by a failing handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Boxed future returned by a handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>>;

type HandlerFn = dyn Fn(Arc<Event>) -> HandlerFuture + Send + Sync;

/// Which events a subscription receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventFilter {
    Type(EventType),
    All,
}

impl EventFilter {
    fn matches(&self, event: &Event) -> bool {
        match self {
            Self::Type(t) => *t == event.event_type,
            Self::All => true,
        }
    }
}

impl From<EventType> for EventFilter {
    fn from(value: EventType) -> Self {
        Self::Type(value)
    }
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

struct Subscription {
    id: u64,
    filter: EventFilter,
    handler: Arc<HandlerFn>,
    active: AtomicBool,
    /// Next ticket to hand out (taken under the queue lock)
    next_ticket: AtomicU64,
    /// Ticket currently allowed to run
    serving: watch::Sender<u64>,
}

impl Subscription {
    async fn wait_turn(&self, ticket: u64) {
        let mut rx = self.serving.subscribe();
        let _ = rx.wait_for(|serving| *serving >= ticket).await;
    }

    fn finish_turn(&self, ticket: u64) {
        self.serving.send_replace(ticket + 1);
    }
}

// =============================================================================
// Bus
// =============================================================================

/// Result of a publish attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishOutcome {
    Accepted,
    Rejected,
}

impl PublishOutcome {
    #[must_use]
    pub fn is_accepted(self) -> bool {
        self == Self::Accepted
    }
}

/// Point-in-time bus metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMetrics {
    pub capacity: usize,
    pub current_depth: usize,
    pub peak_depth: usize,
    pub utilization_percent: f64,
    pub overflow_events: u64,
    pub estimated_backlog_ms: f64,
    pub events_published: u64,
    pub events_processed: u64,
    pub events_dropped: u64,
    pub handler_errors: u64,
    pub avg_processing_ms: f64,
    pub subscriber_count: usize,
    /// Most recent queue depths, oldest first
    pub depth_history: Vec<usize>,
}

/// Summary returned by [`EventBus::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    pub processed: u64,
    /// Events still queued when the drain deadline passed
    pub abandoned: usize,
    pub timed_out: bool,
}

struct Dequeued {
    event: Arc<Event>,
    deliveries: Vec<(Arc<Subscription>, u64)>,
}

struct Stats {
    processing_ms: RollingWindow<f64>,
    completions: RollingWindow<Instant>,
    depth_history: RollingWindow<usize>,
}

/// Bounded multi-worker event bus.
pub struct EventBus {
    config: EventBusConfig,
    queue: Mutex<VecDeque<Arc<Event>>>,
    notify: Notify,
    subscriptions: RwLock<HashMap<u64, Arc<Subscription>>>,
    next_subscription: AtomicU64,
    stopping: AtomicBool,
    peak_depth: AtomicUsize,
    published: AtomicU64,
    processed: AtomicU64,
    overflow: AtomicU64,
    dropped: AtomicU64,
    handler_errors: AtomicU64,
    stats: Mutex<Stats>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.config.capacity)
            .field("workers", &self.config.workers)
            .field("overflow_policy", &self.config.overflow_policy)
            .finish()
    }
}

impl EventBus {
    /// Create a bus without starting workers.
    #[must_use]
    pub fn new(config: EventBusConfig) -> Arc<Self> {
        let config = EventBusConfig {
            capacity: config.capacity.max(1),
            workers: config.workers.max(1),
            ..config
        };
        Arc::new(Self {
            queue: Mutex::new(VecDeque::with_capacity(config.capacity.min(1024))),
            config,
            notify: Notify::new(),
            subscriptions: RwLock::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
            stopping: AtomicBool::new(false),
            peak_depth: AtomicUsize::new(0),
            published: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            overflow: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            handler_errors: AtomicU64::new(0),
            stats: Mutex::new(Stats {
                processing_ms: RollingWindow::new(PROCESSING_SAMPLES),
                completions: RollingWindow::new(PROCESSING_SAMPLES),
                depth_history: RollingWindow::new(DEPTH_SAMPLES),
            }),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Create a bus and start its workers. Requires a tokio runtime.
    #[must_use]
    pub fn start(config: EventBusConfig) -> Arc<Self> {
        let bus = Self::new(config);
        bus.spawn_workers();
        bus
    }

    /// Spawn the worker pool. Calling this twice is a no-op.
    pub fn spawn_workers(self: &Arc<Self>) {
        let mut workers = self.workers.lock().expect("worker list lock poisoned");
        if !workers.is_empty() {
            return;
        }
        for worker_id in 0..self.config.workers {
            let bus = Arc::clone(self);
            workers.push(tokio::spawn(async move { bus.worker_loop(worker_id).await }));
        }
        info!(
            workers = self.config.workers,
            capacity = self.config.capacity,
            policy = ?self.config.overflow_policy,
            "Event bus started"
        );
    }

    #[must_use]
    pub fn config(&self) -> &EventBusConfig {
        &self.config
    }

    /// Enqueue an event without blocking.
    pub fn publish(&self, event: Event) -> PublishOutcome {
        if self.stopping.load(Ordering::SeqCst) {
            self.overflow.fetch_add(1, Ordering::Relaxed);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(event_type = %event.event_type, "Publish rejected: bus stopping");
            return PublishOutcome::Rejected;
        }

        let depth = {
            let mut queue = self.queue.lock().expect("event queue lock poisoned");
            if queue.len() >= self.config.capacity {
                self.overflow.fetch_add(1, Ordering::Relaxed);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                match self.config.overflow_policy {
                    OverflowPolicy::RejectNew => {
                        debug!(event_type = %event.event_type, "Publish rejected: queue full");
                        return PublishOutcome::Rejected;
                    }
                    OverflowPolicy::DropOldest => {
                        if let Some(evicted) = queue.pop_front() {
                            debug!(
                                evicted = %evicted.event_type,
                                "Queue full; evicted oldest event"
                            );
                        }
                    }
                }
            }
            queue.push_back(Arc::new(event));
            queue.len()
        };

        self.published.fetch_add(1, Ordering::Relaxed);
        self.peak_depth.fetch_max(depth, Ordering::Relaxed);
        self.notify.notify_one();
        PublishOutcome::Accepted
    }

    /// Register a handler for events matching `filter`.
    pub fn subscribe<F, Fut>(&self, filter: impl Into<EventFilter>, handler: F) -> SubscriptionHandle
    where
        F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let handler: Arc<HandlerFn> =
            Arc::new(move |event| -> HandlerFuture { Box::pin(handler(event)) });
        let (serving, _) = watch::channel(0);
        let subscription = Arc::new(Subscription {
            id,
            filter: filter.into(),
            handler,
            active: AtomicBool::new(true),
            next_ticket: AtomicU64::new(0),
            serving,
        });
        self.subscriptions
            .write()
            .expect("subscription lock poisoned")
            .insert(id, subscription);
        debug!(subscription = id, "Subscribed");
        SubscriptionHandle(id)
    }

    /// Register a synchronous handler.
    pub fn subscribe_fn<F>(&self, filter: impl Into<EventFilter>, handler: F) -> SubscriptionHandle
    where
        F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        self.subscribe(filter, move |event| {
            let handler = Arc::clone(&handler);
            async move { handler(&event) }
        })
    }

    /// Remove a subscription. Returns false if the handle was unknown.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let removed = self
            .subscriptions
            .write()
            .expect("subscription lock poisoned")
            .remove(&handle.0);
        if let Some(sub) = &removed {
            sub.active.store(false, Ordering::SeqCst);
            debug!(subscription = sub.id, "Unsubscribed");
        }
        removed.is_some()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscriptions
            .read()
            .expect("subscription lock poisoned")
            .len()
    }

    /// Snapshot of queued events, oldest first.
    #[must_use]
    pub fn queued(&self) -> Vec<Arc<Event>> {
        self.queue
            .lock()
            .expect("event queue lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn metrics(&self) -> BusMetrics {
        let current_depth = self.queue.lock().expect("event queue lock poisoned").len();
        let stats = self.stats.lock().expect("bus stats lock poisoned");
        let avg_processing_ms = stats.processing_ms.stats().avg;
        let throughput = recent_throughput(&stats.completions);
        let estimated_backlog_ms = if current_depth == 0 {
            0.0
        } else if let Some(per_sec) = throughput {
            current_depth as f64 / per_sec * 1000.0
        } else {
            current_depth as f64 * avg_processing_ms / self.config.workers as f64
        };
        let depth_history = stats.depth_history.iter().copied().collect();

        BusMetrics {
            capacity: self.config.capacity,
            current_depth,
            peak_depth: self.peak_depth.load(Ordering::Relaxed),
            utilization_percent: current_depth as f64 / self.config.capacity as f64 * 100.0,
            overflow_events: self.overflow.load(Ordering::Relaxed),
            estimated_backlog_ms,
            events_published: self.published.load(Ordering::Relaxed),
            events_processed: self.processed.load(Ordering::Relaxed),
            events_dropped: self.dropped.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            avg_processing_ms,
            subscriber_count: self.subscriber_count(),
            depth_history,
        }
    }

    /// Stop accepting events, drain the queue and wait for workers.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.stopping.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();

        let workers: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.workers.lock().expect("worker list lock poisoned"));
        let deadline = tokio::time::Instant::now()
            + Duration::from_millis(self.config.shutdown_timeout_ms);
        let mut timed_out = false;
        for handle in workers {
            let abort = handle.abort_handle();
            if tokio::time::timeout_at(deadline, handle).await.is_err() {
                abort.abort();
                timed_out = true;
            }
        }

        let abandoned = {
            let mut queue = self.queue.lock().expect("event queue lock poisoned");
            let n = queue.len();
            queue.clear();
            n
        };
        let report = ShutdownReport {
            processed: self.processed.load(Ordering::Relaxed),
            abandoned,
            timed_out,
        };
        info!(
            processed = report.processed,
            abandoned = report.abandoned,
            timed_out = report.timed_out,
            "Event bus stopped"
        );
        report
    }

    // -------------------------------------------------------------------------
    // Workers
    // -------------------------------------------------------------------------

    fn dequeue(&self) -> Option<Dequeued> {
        let mut queue = self.queue.lock().expect("event queue lock poisoned");
        let next = queue
            .iter()
            .enumerate()
            .min_by_key(|(index, event)| (event.priority, *index))
            .map(|(index, _)| index)?;
        let event = queue.remove(next)?;
        let depth = queue.len();
        let subscriptions = self.subscriptions.read().expect("subscription lock poisoned");
        let mut deliveries: Vec<(Arc<Subscription>, u64)> = subscriptions
            .values()
            .filter(|sub| sub.filter.matches(&event))
            .map(|sub| {
                let ticket = sub.next_ticket.fetch_add(1, Ordering::SeqCst);
                (Arc::clone(sub), ticket)
            })
            .collect();
        drop(subscriptions);
        drop(queue);

        deliveries.sort_by_key(|(sub, _)| sub.id);
        self.stats
            .lock()
            .expect("bus stats lock poisoned")
            .depth_history
            .push(depth);
        Some(Dequeued { event, deliveries })
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        debug!(worker_id, "Event worker started");
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.dequeue() {
                self.dispatch(item).await;
                continue;
            }
            if self.stopping.load(Ordering::SeqCst) {
                break;
            }
            notified.await;
        }
        debug!(worker_id, "Event worker exited");
    }

    async fn dispatch(&self, item: Dequeued) {
        let started = Instant::now();
        let handler_timeout = Duration::from_millis(self.config.handler_timeout_ms);
        let event_type = item.event.event_type.clone();

        let tasks: Vec<_> = item
            .deliveries
            .into_iter()
            .map(|(sub, ticket)| {
                let event = Arc::clone(&item.event);
                tokio::spawn(async move {
                    sub.wait_turn(ticket).await;
                    let outcome = if sub.active.load(Ordering::SeqCst) {
                        let handler = Arc::clone(&sub.handler);
                        let mut task = tokio::spawn(async move { handler(event).await });
                        match tokio::time::timeout(handler_timeout, &mut task).await {
                            Ok(Ok(Ok(()))) => Ok(()),
                            Ok(Ok(Err(e))) => Err(e.to_string()),
                            Ok(Err(join)) => Err(format!("handler panicked: {join}")),
                            Err(_) => {
                                task.abort();
                                Err(format!(
                                    "handler timed out after {} ms",
                                    handler_timeout.as_millis()
                                ))
                            }
                        }
                    } else {
                        Ok(())
                    };
                    sub.finish_turn(ticket);
                    (sub.id, outcome)
                })
            })
            .collect();

        for task in tasks {
            match task.await {
                Ok((_, Ok(()))) => {}
                Ok((subscription, Err(error))) => {
                    self.handler_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        event_type = %event_type,
                        subscription,
                        error = %error,
                        "Event handler failed"
                    );
                }
                Err(join) => {
                    self.handler_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(event_type = %event_type, error = %join, "Event delivery task failed");
                }
            }
        }

        self.processed.fetch_add(1, Ordering::Relaxed);
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let mut stats = self.stats.lock().expect("bus stats lock poisoned");
        stats.processing_ms.push(elapsed_ms);
        stats.completions.push(Instant::now());
    }
}

/// Completions per second across the retained window.
fn recent_throughput(completions: &RollingWindow<Instant>) -> Option<f64> {
    if completions.len() < 2 {
        return None;
    }
    let first = *completions.iter().next()?;
    let last = *completions.latest()?;
    let span = last.duration_since(first).as_secs_f64();
    if span <= 0.0 {
        return None;
    }
    Some((completions.len() - 1) as f64 / span)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn custom(n: u64) -> Event {
        Event::new(EventType::Custom("test".into()), "tests").with_field("n", n)
    }

    fn config(capacity: usize, policy: OverflowPolicy) -> EventBusConfig {
        EventBusConfig {
            capacity,
            workers: 2,
            overflow_policy: policy,
            handler_timeout_ms: 1_000,
            shutdown_timeout_ms: 1_000,
        }
    }

    fn queued_ns(bus: &EventBus) -> Vec<u64> {
        bus.queued()
            .iter()
            .filter_map(|e| e.field("n").and_then(|v| v.as_u64()))
            .collect()
    }

    #[test]
    fn drop_oldest_keeps_newest() {
        let bus = EventBus::new(config(2, OverflowPolicy::DropOldest));
        for n in 1..=3 {
            assert_eq!(bus.publish(custom(n)), PublishOutcome::Accepted);
        }
        assert_eq!(queued_ns(&bus), vec![2, 3]);
        assert_eq!(bus.metrics().overflow_events, 1);
    }

    #[test]
    fn reject_new_keeps_oldest() {
        let bus = EventBus::new(config(2, OverflowPolicy::RejectNew));
        assert!(bus.publish(custom(1)).is_accepted());
        assert!(bus.publish(custom(2)).is_accepted());
        assert_eq!(bus.publish(custom(3)), PublishOutcome::Rejected);
        assert_eq!(queued_ns(&bus), vec![1, 2]);
        let m = bus.metrics();
        assert_eq!(m.overflow_events, 1);
        assert_eq!(m.current_depth, 2);
        assert_eq!(m.peak_depth, 2);
        assert!((m.utilization_percent - 100.0).abs() < 1e-9);
        assert_eq!(m.events_published, 2);
    }

    #[test]
    fn event_serializes_with_wire_names() {
        let event = Event::new(EventType::PerformanceMetrics, "monitor")
            .with_priority(EventPriority::High)
            .with_field("session", "work");
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["type"], "performance.metrics");
        assert_eq!(json["data"]["session"], "work");
        assert_eq!(json["priority"], "high");
        assert_eq!(json["source"], "monitor");

        let back: Event = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back.event_type, EventType::PerformanceMetrics);
    }

    #[test]
    fn unknown_event_type_is_custom() {
        assert_eq!(
            EventType::from("dashboard.update".to_string()),
            EventType::Custom("dashboard.update".into())
        );
        assert_eq!(
            EventType::from("session.error".to_string()),
            EventType::SessionError
        );
    }

    #[tokio::test]
    async fn handlers_receive_matching_events() {
        let bus = EventBus::start(config(16, OverflowPolicy::RejectNew));
        let hits = Arc::new(AtomicUsize::new(0));
        let all = Arc::new(AtomicUsize::new(0));
        {
            let hits = Arc::clone(&hits);
            bus.subscribe_fn(EventType::SessionStarted, move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        {
            let all = Arc::clone(&all);
            bus.subscribe_fn(EventFilter::All, move |_| {
                all.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        bus.publish(Event::new(EventType::SessionStarted, "t"));
        bus.publish(Event::new(EventType::SessionStopped, "t"));
        let report = bus.shutdown().await;
        assert!(!report.timed_out);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(all.load(Ordering::SeqCst), 2);
        assert_eq!(bus.metrics().events_processed, 2);
    }

    #[tokio::test]
    async fn failing_and_panicking_handlers_are_isolated() {
        let bus = EventBus::start(config(16, OverflowPolicy::RejectNew));
        let ok = Arc::new(AtomicUsize::new(0));
        bus.subscribe_fn(EventFilter::All, |_| Err("boom".into()));
        bus.subscribe_fn(EventFilter::All, |_| panic!("handler panic"));
        {
            let ok = Arc::clone(&ok);
            bus.subscribe_fn(EventFilter::All, move |_| {
                ok.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        for n in 0..3 {
            bus.publish(custom(n));
        }
        bus.shutdown().await;
        assert_eq!(ok.load(Ordering::SeqCst), 3);
        assert_eq!(bus.metrics().handler_errors, 6);
    }

    #[tokio::test]
    async fn delivery_is_fifo_per_subscriber() {
        let bus = EventBus::start(EventBusConfig {
            workers: 4,
            ..config(256, OverflowPolicy::RejectNew)
        });
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            bus.subscribe(EventFilter::All, move |event| {
                let seen = Arc::clone(&seen);
                async move {
                    // uneven delays tempt reordering across workers
                    let n = event.field("n").and_then(|v| v.as_u64()).unwrap_or(0);
                    if n % 3 == 0 {
                        tokio::time::sleep(Duration::from_millis(2)).await;
                    }
                    seen.lock().expect("lock").push(n);
                    Ok(())
                }
            });
        }
        for n in 0..50 {
            bus.publish(custom(n));
        }
        bus.shutdown().await;
        let seen = seen.lock().expect("lock").clone();
        assert_eq!(seen, (0..50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = EventBus::start(config(16, OverflowPolicy::RejectNew));
        let hits = Arc::new(AtomicUsize::new(0));
        let handle = {
            let hits = Arc::clone(&hits);
            bus.subscribe_fn(EventFilter::All, move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };
        assert!(bus.unsubscribe(handle));
        assert!(!bus.unsubscribe(handle));
        bus.publish(custom(1));
        bus.shutdown().await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn publish_after_shutdown_is_rejected() {
        let bus = EventBus::start(config(4, OverflowPolicy::RejectNew));
        bus.shutdown().await;
        assert_eq!(bus.publish(custom(1)), PublishOutcome::Rejected);
        let m = bus.metrics();
        assert_eq!(m.overflow_events, 1);
        assert_eq!(m.events_dropped, 1);
        assert_eq!(m.events_published, 0);
    }

    #[tokio::test]
    async fn higher_priority_is_dispatched_first() {
        let bus = EventBus::new(EventBusConfig {
            workers: 1,
            ..config(16, OverflowPolicy::RejectNew)
        });
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            bus.subscribe_fn(EventFilter::All, move |event| {
                let n = event.field("n").and_then(|v| v.as_u64()).unwrap_or(0);
                seen.lock().expect("lock").push(n);
                Ok(())
            });
        }
        for (n, priority) in [
            (0, EventPriority::Normal),
            (1, EventPriority::Low),
            (2, EventPriority::Critical),
            (3, EventPriority::High),
            (4, EventPriority::Normal),
            (5, EventPriority::Critical),
        ] {
            bus.publish(custom(n).with_priority(priority));
        }
        // queued() keeps publish order
        assert_eq!(queued_ns(&bus), vec![0, 1, 2, 3, 4, 5]);

        bus.spawn_workers();
        bus.shutdown().await;
        assert_eq!(*seen.lock().expect("lock"), vec![2, 5, 3, 0, 4, 1]);
    }

    #[tokio::test]
    async fn shutdown_drains_queued_events() {
        let bus = EventBus::new(config(8, OverflowPolicy::RejectNew));
        let hits = Arc::new(AtomicUsize::new(0));
        {
            let hits = Arc::clone(&hits);
            bus.subscribe_fn(EventFilter::All, move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        for n in 0..5 {
            bus.publish(custom(n));
        }
        bus.spawn_workers();
        let report = bus.shutdown().await;
        assert_eq!(hits.load(Ordering::SeqCst), 5);
        assert_eq!(report.abandoned, 0);
        assert_eq!(bus.metrics().depth_history.len(), 5);
    }

    #[test]
    fn backlog_estimate_is_zero_when_empty() {
        let bus = EventBus::new(config(4, OverflowPolicy::RejectNew));
        assert_eq!(bus.metrics().estimated_backlog_ms, 0.0);
    }
}
