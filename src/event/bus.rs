//! Event bus: subscription matching, fan-out, and the bounded event log.
//!
//! Subscribers register with a [`Matcher`] (exact kind, glob pattern on
//! the kind name, or arbitrary predicate) and a [`Handler`] (sync or
//! async). Emission never blocks on subscribers: sync handlers run with
//! panics caught and logged, async handlers are spawned and not awaited,
//! bounded by a fan-out semaphore. One subscriber's failure never
//! suppresses delivery to the others.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use regex::Regex;
use tokio::sync::Semaphore;

use crate::entity::EcsId;
use crate::error::{EventError, KhepriResult};

use super::context::EventContext;
use super::{Event, EventId, EventKind};

/// Subscription predicate.
pub enum Matcher {
    /// Exact kind match.
    Kind(EventKind),
    /// Glob pattern over the kind name (`student.*`).
    Pattern { raw: String, regex: Regex },
    /// Arbitrary predicate over event fields.
    Predicate(Box<dyn Fn(&Event) -> bool + Send + Sync>),
}

impl Matcher {
    /// Exact kind matcher.
    pub fn kind(kind: EventKind) -> Self {
        Self::Kind(kind)
    }

    /// Compile a glob pattern (`*` matches any run of characters; all
    /// other characters are literal) into an anchored regex.
    pub fn pattern(glob: &str) -> KhepriResult<Self> {
        let mut expr = String::with_capacity(glob.len() + 8);
        expr.push('^');
        for c in glob.chars() {
            if c == '*' {
                expr.push_str(".*");
            } else {
                expr.push_str(&regex::escape(&c.to_string()));
            }
        }
        expr.push('$');
        let regex = Regex::new(&expr).map_err(|e| EventError::BadPattern {
            pattern: glob.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self::Pattern {
            raw: glob.to_string(),
            regex,
        })
    }

    /// Arbitrary predicate matcher.
    pub fn predicate(f: impl Fn(&Event) -> bool + Send + Sync + 'static) -> Self {
        Self::Predicate(Box::new(f))
    }

    /// Whether an event passes this matcher.
    pub fn matches(&self, event: &Event) -> bool {
        match self {
            Self::Kind(kind) => *kind == event.kind,
            Self::Pattern { regex, .. } => regex.is_match(&event.kind.to_string()),
            Self::Predicate(f) => f(event),
        }
    }
}

impl std::fmt::Debug for Matcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Kind(kind) => write!(f, "Matcher::Kind({kind})"),
            Self::Pattern { raw, .. } => write!(f, "Matcher::Pattern({raw})"),
            Self::Predicate(_) => write!(f, "Matcher::Predicate(..)"),
        }
    }
}

/// Subscriber callback: synchronous or spawned-async.
pub enum Handler {
    /// Runs inline at emission; panics are caught and logged.
    Sync(Box<dyn Fn(&Event) + Send + Sync>),
    /// Spawned onto the runtime at emission; never awaited by the emitter.
    Async(Box<dyn Fn(Event) -> BoxFuture<'static, ()> + Send + Sync>),
}

impl Handler {
    /// Wrap a synchronous callback.
    pub fn sync(f: impl Fn(&Event) + Send + Sync + 'static) -> Self {
        Self::Sync(Box::new(f))
    }

    /// Wrap an async callback.
    pub fn asynchronous(
        f: impl Fn(Event) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    ) -> Self {
        Self::Async(Box::new(f))
    }
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

struct Subscription {
    matcher: Matcher,
    handler: Handler,
}

/// Process-wide (but freely constructable) event delivery fabric.
pub struct EventBus {
    subscriptions: DashMap<u64, Subscription>,
    next_subscription: AtomicU64,
    /// Bounded retention window of emitted events, oldest first.
    log: Mutex<VecDeque<Event>>,
    log_capacity: usize,
    /// Bounds concurrently running async subscriber tasks.
    fanout: Arc<Semaphore>,
}

impl EventBus {
    /// Create a bus with the given log retention window and async fan-out
    /// concurrency bound.
    pub fn new(log_capacity: usize, fanout_concurrency: usize) -> Self {
        Self {
            subscriptions: DashMap::new(),
            next_subscription: AtomicU64::new(1),
            log: Mutex::new(VecDeque::with_capacity(log_capacity.min(1024))),
            log_capacity,
            fanout: Arc::new(Semaphore::new(fanout_concurrency.max(1))),
        }
    }

    /// Register a subscriber.
    pub fn subscribe(&self, matcher: Matcher, handler: Handler) -> SubscriptionHandle {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.subscriptions.insert(id, Subscription { matcher, handler });
        SubscriptionHandle(id)
    }

    /// Remove a subscriber. Returns whether it existed.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.subscriptions.remove(&handle.0).is_some()
    }

    /// Number of active subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Emit an event exactly as given (linkage already applied).
    ///
    /// The event lands in the log first, then fans out. Sync subscribers
    /// run inline with panics contained; async subscribers are spawned on
    /// the ambient tokio runtime (or driven to completion inline when
    /// emission happens outside any runtime).
    pub fn emit(&self, event: Event) -> EventId {
        let id = event.id;
        {
            let mut log = self.log.lock().expect("event log lock poisoned");
            if log.len() == self.log_capacity {
                log.pop_front();
            }
            log.push_back(event.clone());
        }

        for entry in self.subscriptions.iter() {
            let sub = entry.value();
            if !sub.matcher.matches(&event) {
                continue;
            }
            match &sub.handler {
                Handler::Sync(f) => {
                    if catch_unwind(AssertUnwindSafe(|| f(&event))).is_err() {
                        tracing::warn!(
                            event = %id,
                            kind = %event.kind,
                            "sync subscriber panicked; delivery to others continues"
                        );
                    }
                }
                Handler::Async(f) => {
                    let fut = f(event.clone());
                    let fanout = Arc::clone(&self.fanout);
                    match tokio::runtime::Handle::try_current() {
                        Ok(handle) => {
                            handle.spawn(async move {
                                let _permit = fanout.acquire_owned().await;
                                fut.await;
                            });
                        }
                        Err(_) => {
                            // No runtime: drive inline so delivery is not lost.
                            futures_util::future::FutureExt::now_or_never(fut)
                                .unwrap_or_else(|| {
                                    tracing::warn!(
                                        event = %id,
                                        "async subscriber pending outside a runtime; dropped"
                                    );
                                });
                        }
                    }
                }
            }
        }

        id
    }

    /// Link against the context stack, then emit.
    pub fn emit_in(&self, ctx: &EventContext, mut event: Event) -> EventId {
        ctx.link(&mut event);
        self.emit(event)
    }

    // -----------------------------------------------------------------------
    // Log queries
    // -----------------------------------------------------------------------

    /// The most recent `n` events, oldest first.
    pub fn recent(&self, n: usize) -> Vec<Event> {
        let log = self.log.lock().expect("event log lock poisoned");
        log.iter().rev().take(n).rev().cloned().collect()
    }

    /// Events in the retention window whose subject is the given entity.
    pub fn events_for_subject(&self, subject_id: EcsId) -> Vec<Event> {
        let log = self.log.lock().expect("event log lock poisoned");
        log.iter()
            .filter(|e| e.subject_id == Some(subject_id))
            .cloned()
            .collect()
    }

    /// Number of events currently retained.
    pub fn log_len(&self) -> usize {
        self.log.lock().expect("event log lock poisoned").len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriptions", &self.subscriptions.len())
            .field("log_len", &self.log_len())
            .field("log_capacity", &self.log_capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn bus() -> EventBus {
        EventBus::new(8, 4)
    }

    #[test]
    fn exact_kind_subscription_receives_matching_events() {
        let bus = bus();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        bus.subscribe(
            Matcher::kind(EventKind::Created),
            Handler::sync(move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );

        bus.emit(Event::new(EventKind::Created, "S"));
        bus.emit(Event::new(EventKind::Modified, "S"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn glob_pattern_matches_custom_kinds() {
        let bus = bus();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        bus.subscribe(
            Matcher::pattern("student.*").unwrap(),
            Handler::sync(move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );

        bus.emit(Event::new(EventKind::Custom("student.enrolled".into()), "S"));
        bus.emit(Event::new(EventKind::Custom("student.graduated".into()), "S"));
        bus.emit(Event::new(EventKind::Custom("teacher.hired".into()), "T"));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn glob_star_does_not_cross_literals() {
        let m = Matcher::pattern("a.*.z").unwrap();
        assert!(m.matches(&Event::new(EventKind::Custom("a.b.z".into()), "S")));
        assert!(!m.matches(&Event::new(EventKind::Custom("a.b.c".into()), "S")));
    }

    #[test]
    fn predicate_subscription_sees_event_fields() {
        let bus = bus();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        bus.subscribe(
            Matcher::predicate(|e| e.subject_kind == "Student"),
            Handler::sync(move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );

        bus.emit(Event::new(EventKind::Created, "Student"));
        bus.emit(Event::new(EventKind::Created, "Teacher"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_subscriber_does_not_suppress_others() {
        let bus = bus();
        bus.subscribe(
            Matcher::kind(EventKind::Created),
            Handler::sync(|_| panic!("subscriber bug")),
        );
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        bus.subscribe(
            Matcher::kind(EventKind::Created),
            Handler::sync(move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );

        bus.emit(Event::new(EventKind::Created, "S"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = bus();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let handle = bus.subscribe(
            Matcher::kind(EventKind::Created),
            Handler::sync(move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );

        bus.emit(Event::new(EventKind::Created, "S"));
        assert!(bus.unsubscribe(handle));
        bus.emit(Event::new(EventKind::Created, "S"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!bus.unsubscribe(handle));
    }

    #[test]
    fn log_respects_retention_window() {
        let bus = EventBus::new(3, 4);
        for i in 0..5i64 {
            bus.emit(Event::new(EventKind::Created, "S").with_metadata("i", i));
        }
        let recent = bus.recent(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(
            recent[0].metadata["i"],
            crate::event::MetadataValue::Int(2)
        );
    }

    #[test]
    fn events_for_subject_filters() {
        let bus = bus();
        let subject = EcsId::fresh();
        let lineage = crate::entity::LineageId::fresh();
        bus.emit(Event::new(EventKind::Created, "S").with_subject(subject, lineage));
        bus.emit(Event::new(EventKind::Created, "S"));
        assert_eq!(bus.events_for_subject(subject).len(), 1);
    }

    #[tokio::test]
    async fn async_subscribers_are_spawned_and_all_receive() {
        let bus = bus();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let h = Arc::clone(&hits);
            bus.subscribe(
                Matcher::kind(EventKind::Processed),
                Handler::asynchronous(move |_event| {
                    let h = Arc::clone(&h);
                    Box::pin(async move {
                        tokio::task::yield_now().await;
                        h.fetch_add(1, Ordering::SeqCst);
                    })
                }),
            );
        }

        bus.emit(Event::new(EventKind::Processed, "Job"));
        // Fan-out is dispatched, not awaited: give the tasks a moment.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}
