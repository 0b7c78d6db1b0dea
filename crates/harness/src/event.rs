//! Lifecycle events and timeout-guarded waits.
//!
//! A [`LifecycleEvent`] is a named broadcast point. Firing it hands the
//! payload to every pending listener and latches it, so a listener that
//! registers after the fact still observes the most recent firing until
//! the event is [`reset`](LifecycleEvent::reset) for the next run.
//!
//! Listeners are futures. Dropping one before the event fires removes its
//! registration, which is what keeps [`wait_with_timeout`] from leaking a
//! listener every time a wait expires.

use futures::future::join_all;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Default wait for a secondary event before the chain degrades
pub const DEFAULT_WRAPPED_EVENT_TIMEOUT_MS: u64 = 30_000;

struct EventState<T> {
    next_id: u64,
    listeners: Vec<(u64, oneshot::Sender<T>)>,
    latched: Option<T>,
    fire_count: u64,
}

struct EventInner<T> {
    name: String,
    state: Mutex<EventState<T>>,
}

impl<T> EventInner<T> {
    fn lock(&self) -> MutexGuard<'_, EventState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A named broadcast point with once-listeners
pub struct LifecycleEvent<T> {
    inner: Arc<EventInner<T>>,
}

impl<T> Clone for LifecycleEvent<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for LifecycleEvent<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("LifecycleEvent")
            .field("name", &self.inner.name)
            .field("listeners", &state.listeners.len())
            .field("fired", &state.latched.is_some())
            .field("fire_count", &state.fire_count)
            .finish()
    }
}

impl<T: Clone> LifecycleEvent<T> {
    /// Create an event that has not fired
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventInner {
                name: name.into(),
                state: Mutex::new(EventState {
                    next_id: 0,
                    listeners: Vec::new(),
                    latched: None,
                    fire_count: 0,
                }),
            }),
        }
    }

    /// Event name, used in log lines
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Deliver `payload` to every pending listener and latch it
    pub fn fire(&self, payload: T) {
        let listeners = {
            let mut state = self.inner.lock();
            state.fire_count += 1;
            state.latched = Some(payload.clone());
            std::mem::take(&mut state.listeners)
        };
        debug!(event = %self.inner.name, listeners = listeners.len(), "event fired");
        for (_, tx) in listeners {
            let _ = tx.send(payload.clone());
        }
    }

    /// Register a once-listener.
    ///
    /// Resolves immediately if the event has already fired since the last
    /// reset. Dropping the returned future deregisters it.
    #[must_use]
    pub fn listen(&self) -> EventListener<T> {
        let mut state = self.inner.lock();
        if let Some(payload) = state.latched.clone() {
            return EventListener {
                event: None,
                id: 0,
                slot: ListenerSlot::Latched(Some(payload)),
            };
        }
        let id = state.next_id;
        state.next_id += 1;
        let (tx, rx) = oneshot::channel();
        state.listeners.push((id, tx));
        EventListener {
            event: Some(Arc::clone(&self.inner)),
            id,
            slot: ListenerSlot::Waiting(rx),
        }
    }

    /// Forget the latched payload so the next run waits afresh
    pub fn reset(&self) {
        self.inner.lock().latched = None;
    }

    /// Whether the event fired since the last reset
    #[must_use]
    pub fn has_fired(&self) -> bool {
        self.inner.lock().latched.is_some()
    }

    /// Total number of firings over the event's lifetime
    #[must_use]
    pub fn fire_count(&self) -> u64 {
        self.inner.lock().fire_count
    }

    /// Listeners currently waiting
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.lock().listeners.len()
    }
}

enum ListenerSlot<T> {
    Latched(Option<T>),
    Waiting(oneshot::Receiver<T>),
}

/// Future returned by [`LifecycleEvent::listen`]
pub struct EventListener<T> {
    event: Option<Arc<EventInner<T>>>,
    id: u64,
    slot: ListenerSlot<T>,
}

impl<T> fmt::Debug for EventListener<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventListener")
            .field("id", &self.id)
            .field("latched", &matches!(self.slot, ListenerSlot::Latched(_)))
            .finish()
    }
}

// The payload is never pinned in place.
impl<T> Unpin for EventListener<T> {}

impl<T> Future for EventListener<T> {
    type Output = Option<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.slot {
            ListenerSlot::Latched(payload) => Poll::Ready(payload.take()),
            ListenerSlot::Waiting(rx) => Pin::new(rx).poll(cx).map(Result::ok),
        }
    }
}

impl<T> Drop for EventListener<T> {
    fn drop(&mut self) {
        if let Some(event) = self.event.take() {
            let id = self.id;
            event.lock().listeners.retain(|(listener, _)| *listener != id);
        }
    }
}

/// Wait for `event`, giving up after `timeout`.
///
/// Returns the payload if the event fired in time and `None` otherwise.
/// Either way the listener registered for the wait is gone when this
/// returns.
pub async fn wait_with_timeout<T: Clone>(event: &LifecycleEvent<T>, timeout: Duration) -> Option<T> {
    match tokio::time::timeout(timeout, event.listen()).await {
        Ok(payload) => payload,
        Err(_) => {
            warn!(
                event = %event.name(),
                timeout_ms = timeout.as_millis() as u64,
                "event did not fire in time, continuing without it"
            );
            None
        }
    }
}

/// Wait until every event in `events` has fired, giving up after `timeout`.
pub async fn wait_for_all<T: Clone>(
    events: &[LifecycleEvent<T>],
    timeout: Duration,
) -> Option<Vec<T>> {
    let listeners = join_all(events.iter().map(LifecycleEvent::listen));
    match tokio::time::timeout(timeout, listeners).await {
        Ok(payloads) => payloads.into_iter().collect(),
        Err(_) => {
            let pending: Vec<&str> = events
                .iter()
                .filter(|e| !e.has_fired())
                .map(LifecycleEvent::name)
                .collect();
            warn!(
                pending = %pending.join(", "),
                timeout_ms = timeout.as_millis() as u64,
                "events did not fire in time, continuing without them"
            );
            None
        }
    }
}
