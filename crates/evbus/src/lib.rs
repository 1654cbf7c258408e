//! # evbus
//!
//! A synchronous event bus for the [`fiber`] scheduler. Components post
//! `(source, value)` events; listeners register for exact pairs or with
//! per-axis wildcards and run in registration order, on the sending fiber,
//! before the send returns. A small per-caller dispatch cache skips the
//! non-matching chain prefix for recurring events, and `wait_for` lets a
//! fiber block until a matching event arrives.
//!
//! ## Module Overview
//! - [`event`]    – Source/value identifiers, wildcards and the event record.
//! - [`listener`] – Listener records and handler variants.
//! - [`bus`]      – The bus itself: registration, dispatch, cached dispatch
//!   and the blocking wait.

pub mod bus;
pub mod event;
pub mod listener;

pub use bus::{DispatchCache, EventBus};
pub use event::{Event, EventValue, SourceId, EVENT_ANY, ID_ANY};
pub use fiber::Error;
pub use listener::ListenerArg;
