//! Error and fault taxonomy for the fiber runtime.

use core::fmt;

use thiserror::Error;

/// Recoverable error conditions surfaced synchronously to callers.
///
/// The scheduler never retries internally; every recoverable condition is
/// reported as a return value at the call that raised it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// A stack buffer or execution context could not be allocated.
    ///
    /// Normally routed through the [`FaultHandler`] rather than returned:
    /// the scheduler cannot continue without a context to switch to.
    #[error("out of memory: {0}")]
    OutOfMemory(&'static str),

    /// A bounded registry is full; the registration did not take effect.
    #[error("no resources: registry capacity exhausted")]
    NoResources,

    /// A malformed argument; the operation was a no-op.
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    /// A scheduler operation was attempted before `init`, or `init` was
    /// called twice.
    #[error("scheduler not initialised")]
    NotInitialized,
}

/// Fatal fault classes that halt forward progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Fiber pool or stack-buffer exhaustion.
    OutOfMemory,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of memory"),
        }
    }
}

/// Terminal handler for fatal faults. Must not return.
pub type FaultHandler = fn(Fault) -> !;

/// Default fault handler: reports the fault and halts the calling context.
///
/// On hardware this corresponds to the terminal fault display loop; panicking
/// is the hosted equivalent of that intentional, non-returning halt.
pub fn default_fault_handler(fault: Fault) -> ! {
    log::error!("fatal scheduler fault: {fault}");
    panic!("fatal scheduler fault: {fault}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        assert_eq!(
            Error::OutOfMemory("fiber stack").to_string(),
            "out of memory: fiber stack"
        );
        assert_eq!(
            Error::NotInitialized.to_string(),
            "scheduler not initialised"
        );
    }

    #[test]
    fn fault_display() {
        assert_eq!(Fault::OutOfMemory.to_string(), "out of memory");
    }
}
