//! Fiber representation: identifiers, lifecycle states, entry points and
//! creation options.
//!
//! Fibers live in an arena owned by the scheduler; a [`FiberId`] is an index
//! into that arena and queue membership is tracked by the [`FiberState`]
//! tag rather than intrusive links, so a recycled fiber can never be reached
//! through a stale queue pointer.

use std::any::Any;
use std::sync::Arc;

/// Default logical stack footprint of a fiber, in bytes. The live stack of a
/// cooperatively scheduled fiber at its suspension point is typically tiny.
pub const FIBER_STACK_SIZE: usize = 64;

/// Identifier of a fiber within its scheduler's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FiberId(pub usize);

/// Lifecycle state of a fiber; doubles as its queue-membership tag.
///
/// A fiber is in exactly one queue at any instant (`Ready` on the run queue,
/// `Sleeping` on the sleep queue, `Waiting` on the wait queue), or is the
/// single `Running` fiber, or sits `Recycled` in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    /// On the run queue, ready to execute.
    Ready,
    /// Currently executing. At most one fiber per scheduler.
    Running,
    /// On the sleep queue until its wake deadline passes.
    Sleeping,
    /// On the wait queue, blocked on a bus event.
    Waiting,
    /// Completed and returned to the pool for reuse.
    Recycled,
}

/// Opaque argument handed to a parameterised fiber entry function.
pub type FiberArg = Arc<dyn Any + Send + Sync>;

/// Completion hook invoked after a fiber's entry function returns, before
/// the fiber is recycled.
pub type Completion = Box<dyn FnOnce() + Send + 'static>;

/// Entry-function shape, resolved at creation time rather than at the call
/// site: either a plain closure or one taking an opaque argument.
pub enum EntryPoint {
    Plain(Box<dyn FnOnce() + Send + 'static>),
    WithArg(Box<dyn FnOnce(FiberArg) + Send + 'static>, FiberArg),
}

impl EntryPoint {
    pub(crate) fn invoke(self) {
        match self {
            Self::Plain(entry) => entry(),
            Self::WithArg(entry, arg) => entry(arg),
        }
    }
}

/// Options for creating a fiber.
pub struct FiberConfig {
    pub(crate) entry: EntryPoint,
    pub(crate) completion: Option<Completion>,
    pub(crate) stack_size: usize,
}

impl FiberConfig {
    /// Creates a configuration around a plain entry function.
    pub fn new(entry: impl FnOnce() + Send + 'static) -> Self {
        Self {
            entry: EntryPoint::Plain(Box::new(entry)),
            completion: None,
            stack_size: FIBER_STACK_SIZE,
        }
    }

    /// Creates a configuration around a parameterised entry function.
    pub fn with_arg(entry: impl FnOnce(FiberArg) + Send + 'static, arg: FiberArg) -> Self {
        Self {
            entry: EntryPoint::WithArg(Box::new(entry), arg),
            completion: None,
            stack_size: FIBER_STACK_SIZE,
        }
    }

    /// Sets the logical stack footprint for the fiber.
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    /// Installs a completion hook, run in the fiber's context after the
    /// entry function returns and before the fiber is recycled.
    pub fn on_completion(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.completion = Some(Box::new(hook));
        self
    }
}

/// One fiber record in the scheduler arena.
pub(crate) struct Fiber<C> {
    /// Saved execution context (registers + stack buffer on bare metal; a
    /// parked host thread on hosted targets).
    pub(crate) ctx: C,
    pub(crate) state: FiberState,
    /// Absolute wake deadline in milliseconds; meaningful while `Sleeping`.
    pub(crate) wake_at: u64,
    /// Stack footprint this fiber's context was sized for. Grows across
    /// reuse, never shrinks.
    pub(crate) stack_size: usize,
    /// Set when an event wake arrived before the fiber reached the wait
    /// queue, so the park returns immediately.
    pub(crate) pending_wake: bool,
}

impl<C> Fiber<C> {
    pub(crate) fn new(ctx: C, stack_size: usize) -> Self {
        Self {
            ctx,
            state: FiberState::Ready,
            wake_at: 0,
            stack_size,
            pending_wake: false,
        }
    }
}

/// Counters describing the fiber arena and pool.
///
/// `active` counts live (non-recycled) fibers including the one running;
/// after every spawned fiber has run to completion it returns to the value
/// observed before the spawns, and `pooled` never exceeds the configured
/// pool capacity.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FiberStats {
    /// Fibers created since `init`, the initial fiber included.
    pub created: u64,
    /// Entry functions run to completion and recycled.
    pub recycled: u64,
    /// Live fibers: running, ready, sleeping or waiting.
    pub active: usize,
    /// Recycled fibers currently held for reuse.
    pub pooled: usize,
    /// High-water mark of `active`.
    pub peak_active: usize,
}
