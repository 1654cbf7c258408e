//! The event bus: listener chain, dispatch and the blocking wait.

use std::sync::Arc;

use parking_lot::Mutex;

use fiber::switch::{ContextSwitch, HostedSwitch};
use fiber::{Error, Scheduler};

use crate::event::{Event, EventValue, SourceId};
use crate::listener::{Handler, Listener, ListenerArg};

/// Memoized dispatch position for a recurring `(source, value)` pair.
///
/// A cache records the event pair it last served and where in the listener
/// chain that pair's first match sits, together with the chain sequence the
/// observation was made under. A cached send skips the non-matching prefix
/// only when both the pair and the sequence still match; a different pair
/// or any chain mutation (which bumps the sequence) falls back to a full
/// scan and re-primes the cache.
#[derive(Debug, Clone, Copy)]
pub struct DispatchCache {
    key: Option<(SourceId, EventValue)>,
    seq: u64,
    first_match: usize,
}

impl DispatchCache {
    /// Creates a cache in the invalid state; the first send through it
    /// performs a full scan.
    pub fn new() -> Self {
        Self {
            key: None,
            seq: u64::MAX,
            first_match: 0,
        }
    }
}

impl Default for DispatchCache {
    fn default() -> Self {
        Self::new()
    }
}

struct BusState {
    listeners: Vec<Listener>,
    /// Bumped on every chain mutation; validates outstanding caches.
    seq: u64,
}

/// A synchronous event bus over a fiber scheduler.
///
/// Listeners are invoked in registration order, on the sending fiber,
/// before `send` returns. The listener chain is snapshotted under the bus
/// lock and invoked outside it, so a handler may freely send further
/// events or register listeners; such registrations take effect from the
/// next send.
pub struct EventBus<S: ContextSwitch = HostedSwitch> {
    scheduler: Arc<Scheduler<S>>,
    state: Mutex<BusState>,
}

impl<S: ContextSwitch> EventBus<S> {
    /// Creates a bus bound to `scheduler`, which stamps event timestamps
    /// and hosts blocking waits.
    pub fn new(scheduler: Arc<Scheduler<S>>) -> Arc<Self> {
        Arc::new(Self {
            scheduler,
            state: Mutex::new(BusState {
                listeners: Vec::new(),
                seq: 0,
            }),
        })
    }

    /// Registers `handler` for events matching `(source, value)`, either
    /// axis a wildcard. Multiple registrations for the same pair all fire,
    /// in registration order.
    pub fn listen(
        &self,
        source: SourceId,
        value: EventValue,
        handler: impl Fn(Event) + Send + Sync + 'static,
    ) {
        self.push_listener(Listener {
            source,
            value,
            handler: Handler::Plain(Arc::new(handler)),
            one_shot: false,
        });
    }

    /// Like [`listen`](Self::listen), with an opaque payload forwarded to
    /// the handler on every delivery.
    pub fn listen_with(
        &self,
        source: SourceId,
        value: EventValue,
        handler: impl Fn(Event, ListenerArg) + Send + Sync + 'static,
        arg: ListenerArg,
    ) {
        self.push_listener(Listener {
            source,
            value,
            handler: Handler::WithArg(Arc::new(handler), arg),
            one_shot: false,
        });
    }

    fn push_listener(&self, listener: Listener) {
        let (source, value) = (listener.source, listener.value);
        let mut st = self.state.lock();
        st.listeners.push(listener);
        st.seq += 1;
        log::trace!(
            "listener for {source}/{value} registered ({} total)",
            st.listeners.len()
        );
    }

    /// Builds an event stamped with the scheduler clock and sends it.
    pub fn post(&self, source: SourceId, value: EventValue) {
        self.send(Event::new(source, value, self.scheduler.millis()));
    }

    /// Delivers `event` to every matching listener, in registration order,
    /// before returning. An event nothing listens for is dropped silently.
    pub fn send(&self, event: Event) {
        self.dispatch(event, None);
    }

    /// Like [`send`](Self::send), resuming the chain scan from `cache`
    /// when the chain is unchanged since the cache was last validated.
    pub fn send_cached(&self, event: Event, cache: &mut DispatchCache) {
        self.dispatch(event, Some(cache));
    }

    /// Blocks the calling fiber until an event matching `(source, value)`
    /// is sent, either axis a wildcard. The waker registration is one-shot
    /// and unlinks itself on delivery.
    pub fn wait_for(&self, source: SourceId, value: EventValue) -> Result<(), Error> {
        let me = self.scheduler.current_fiber()?;
        self.push_listener(Listener {
            source,
            value,
            handler: Handler::Waker(me),
            one_shot: true,
        });
        // A send between registration and the park marks the fiber with a
        // pending wake, which the park consumes instead of blocking.
        self.scheduler.park_current_for_event();
        Ok(())
    }

    fn dispatch(&self, event: Event, mut cache: Option<&mut DispatchCache>) {
        let matched: Vec<Handler> = {
            let st = &mut *self.state.lock();
            let total = st.listeners.len();
            let key = (event.source, event.value);
            let start = match cache.as_deref() {
                Some(hint) if hint.key == Some(key) && hint.seq == st.seq => {
                    hint.first_match.min(total)
                }
                _ => 0,
            };

            let mut matched = Vec::new();
            let mut matched_at = Vec::new();
            for (index, listener) in st.listeners.iter().enumerate().skip(start) {
                if listener.matches(&event) {
                    matched.push(listener.handler.clone());
                    matched_at.push(index);
                }
            }

            // Validate the cache against the chain as scanned; one-shot
            // removal below bumps the sequence and re-invalidates it.
            if let Some(hint) = cache.as_deref_mut() {
                hint.key = Some(key);
                hint.seq = st.seq;
                hint.first_match = matched_at.first().copied().unwrap_or(total);
            }

            let fired_one_shots: Vec<usize> = matched_at
                .iter()
                .copied()
                .filter(|&index| st.listeners[index].one_shot)
                .collect();
            if !fired_one_shots.is_empty() {
                for &index in fired_one_shots.iter().rev() {
                    st.listeners.remove(index);
                }
                st.seq += 1;
            }
            matched
        };

        if matched.is_empty() {
            return;
        }
        log::trace!(
            "event {}/{} delivered to {} listener(s)",
            event.source,
            event.value,
            matched.len()
        );
        for handler in matched {
            match handler {
                Handler::Plain(callback) => callback(event),
                Handler::WithArg(callback, arg) => callback(event, arg),
                Handler::Waker(id) => self.scheduler.wake_event_waiter(id),
            }
        }
    }
}
