//! Listener records and handler variants.

use std::any::Any;
use std::sync::Arc;

use fiber::FiberId;

use crate::event::{Event, EventValue, SourceId, EVENT_ANY, ID_ANY};

/// Opaque payload forwarded to a parameterised handler on every delivery.
pub type ListenerArg = Arc<dyn Any + Send + Sync>;

/// How a matching event reaches its listener. The variant is fixed at
/// registration, so dispatch never re-inspects the handler shape.
#[derive(Clone)]
pub(crate) enum Handler {
    /// Plain callback.
    Plain(Arc<dyn Fn(Event) + Send + Sync>),
    /// Callback with a payload bound at registration.
    WithArg(Arc<dyn Fn(Event, ListenerArg) + Send + Sync>, ListenerArg),
    /// Internal one-shot waker for a fiber blocked in a wait.
    Waker(FiberId),
}

/// One registration on the bus chain.
#[derive(Clone)]
pub(crate) struct Listener {
    pub(crate) source: SourceId,
    pub(crate) value: EventValue,
    pub(crate) handler: Handler,
    /// One-shot listeners are unlinked after their first delivery.
    pub(crate) one_shot: bool,
}

impl Listener {
    /// Wildcard-aware match against a concrete event.
    pub(crate) fn matches(&self, event: &Event) -> bool {
        (self.source == ID_ANY || self.source == event.source)
            && (self.value == EVENT_ANY || self.value == event.value)
    }
}
