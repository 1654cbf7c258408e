//! # fiber
//!
//! A cooperative (non-preemptive) fiber scheduler in the style of small
//! embedded runtimes: fibers run until they yield, sleep, wait or finish,
//! exactly one fiber executes at a time, and a periodic tick drives the
//! millisecond clock and sleep wake-ups. Finished fibers are recycled
//! through a small pool so short-lived workloads reuse warm contexts.
//!
//! ## Module Overview
//! - [`switch`]    – The context-switch seam and the hosted backend.
//! - [`fiber`]     – Per-fiber records, entry points and arena statistics.
//! - [`scheduler`] – Run/sleep/wait queues, tick processing, fiber lifecycle.
//! - [`component`] – Periodic and idle component registries.
//! - [`error`]     – Error taxonomy and the fatal-fault path.
//!
//! The scheduler never assumes a particular switching mechanism: anything
//! implementing [`ContextSwitch`] can host it, so tests and hosted builds
//! share the same scheduling core an embedded port would use.

pub mod component;
pub mod error;
pub mod fiber;
pub mod scheduler;
pub mod switch;

pub use component::{ComponentRef, SystemComponent};
pub use error::{default_fault_handler, Error, Fault, FaultHandler};
pub use fiber::{FiberArg, FiberConfig, FiberId, FiberState, FiberStats, FIBER_STACK_SIZE};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerConfigBuilder, TICK_PERIOD_MS};
pub use switch::{ContextSwitch, HostedSwitch};
