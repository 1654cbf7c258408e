//! The context-switch seam between the scheduler and the target machine.
//!
//! Everything architecture-specific about transferring execution between two
//! fibers lives behind [`ContextSwitch`]. On bare metal an implementation
//! saves the non-volatile register set of the suspending context, copies the
//! live stack bytes (between the stack pointer and the context's stack
//! bounds) into the context's private buffer, and restores the resuming
//! context the same way in reverse. That stack duplication keeps the
//! steady-state footprint of a suspended fiber down to the few dozen bytes
//! it actually had live, instead of a full dedicated stack per fiber.
//!
//! The in-tree [`HostedSwitch`] backend targets ordinary operating systems:
//! each context is a parked OS thread, and a single run token guarantees
//! that exactly one context executes at a time. The thread's own stack plays
//! the role of the private buffer, so recycling a context (and assigning it
//! a new entry body) reuses that stack the same way an embedded port reuses
//! a heap buffer.

use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};

use crate::error::Error;

/// An entry body installed into a context: the fiber's entry function,
/// completion hook and release path composed into one call.
pub type Body = Box<dyn FnOnce() + Send + 'static>;

/// Saves and restores execution contexts on behalf of the scheduler.
///
/// The scheduler is the only caller; none of these operations may be invoked
/// from interrupt context. `transfer` and `resume` assume the caller has
/// already updated scheduler bookkeeping: once the target is resumed it may
/// begin executing immediately.
pub trait ContextSwitch: Send + Sync + 'static {
    /// Handle to one execution context. Cheap to clone; clones refer to the
    /// same underlying context.
    type Context: Clone + Send + Sync + 'static;

    /// Wraps the calling execution context so it can later be suspended and
    /// resumed like any other fiber. Used once, by `Scheduler::init`.
    fn capture(&self) -> Self::Context;

    /// Allocates a fresh, suspended context with (at least) the requested
    /// stack footprint.
    fn create(&self, stack_size: usize) -> Result<Self::Context, Error>;

    /// Installs the next entry body into a fresh or recycled context. The
    /// body starts running the first time the context is resumed.
    fn assign(&self, ctx: &Self::Context, body: Body);

    /// Suspends the calling context (`from`) and resumes `to`. Returns when
    /// somebody transfers back into `from`.
    fn transfer(&self, from: &Self::Context, to: &Self::Context);

    /// Resumes `to` without suspending the caller. Terminal path of a
    /// finishing fiber: the caller's body is about to return and its context
    /// goes back to waiting for the next assignment.
    fn resume(&self, to: &Self::Context);

    /// Releases a context's resources once the scheduler evicts it from the
    /// fiber pool. The context must not be resumed afterwards.
    fn retire(&self, ctx: &Self::Context);
}

/// Counting run gate. One token circulates per scheduler instance: a context
/// runs while it holds the token and parks in `wait` otherwise.
struct Gate {
    tokens: Mutex<usize>,
    ready: Condvar,
}

impl Gate {
    fn new() -> Self {
        Self {
            tokens: Mutex::new(0),
            ready: Condvar::new(),
        }
    }

    fn signal(&self) {
        let mut tokens = self.tokens.lock();
        *tokens += 1;
        self.ready.notify_one();
    }

    fn wait(&self) {
        let mut tokens = self.tokens.lock();
        while *tokens == 0 {
            self.ready.wait(&mut tokens);
        }
        *tokens -= 1;
    }
}

/// Hand-off slot for the next entry body of a recycled context.
struct JobSlot {
    state: Mutex<JobState>,
    filled: Condvar,
}

struct JobState {
    body: Option<Body>,
    closed: bool,
}

impl JobSlot {
    fn new() -> Self {
        Self {
            state: Mutex::new(JobState {
                body: None,
                closed: false,
            }),
            filled: Condvar::new(),
        }
    }

    fn put(&self, body: Body) {
        let mut state = self.state.lock();
        debug_assert!(state.body.is_none(), "context already has a pending body");
        state.body = Some(body);
        self.filled.notify_one();
    }

    /// Blocks until a body is assigned; `None` once the slot is retired.
    fn take(&self) -> Option<Body> {
        let mut state = self.state.lock();
        loop {
            if let Some(body) = state.body.take() {
                return Some(body);
            }
            if state.closed {
                return None;
            }
            self.filled.wait(&mut state);
        }
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.filled.notify_one();
    }
}

struct ContextInner {
    gate: Gate,
    jobs: JobSlot,
}

/// Handle to one hosted execution context.
#[derive(Clone)]
pub struct HostedContext {
    inner: Arc<ContextInner>,
}

/// [`ContextSwitch`] backend for hosted targets (one parked OS thread per
/// context).
#[derive(Debug, Default, Clone, Copy)]
pub struct HostedSwitch;

/// Logical fiber stacks are tiny (tens of bytes live at a suspension
/// point); a host thread still needs a real stack underneath them.
const HOST_STACK_FLOOR: usize = 128 * 1024;

fn worker_loop(inner: Arc<ContextInner>) {
    while let Some(body) = inner.jobs.take() {
        inner.gate.wait();
        body();
    }
}

impl ContextSwitch for HostedSwitch {
    type Context = HostedContext;

    fn capture(&self) -> HostedContext {
        HostedContext {
            inner: Arc::new(ContextInner {
                gate: Gate::new(),
                jobs: JobSlot::new(),
            }),
        }
    }

    fn create(&self, stack_size: usize) -> Result<HostedContext, Error> {
        let inner = Arc::new(ContextInner {
            gate: Gate::new(),
            jobs: JobSlot::new(),
        });
        let worker = Arc::clone(&inner);
        thread::Builder::new()
            .name("fiber-context".into())
            .stack_size(stack_size.max(HOST_STACK_FLOOR))
            .spawn(move || worker_loop(worker))
            .map_err(|_| Error::OutOfMemory("context allocation"))?;
        Ok(HostedContext { inner })
    }

    fn assign(&self, ctx: &HostedContext, body: Body) {
        ctx.inner.jobs.put(body);
    }

    fn transfer(&self, from: &HostedContext, to: &HostedContext) {
        to.inner.gate.signal();
        from.inner.gate.wait();
    }

    fn resume(&self, to: &HostedContext) {
        to.inner.gate.signal();
    }

    fn retire(&self, ctx: &HostedContext) {
        ctx.inner.jobs.close();
    }
}
