//! Periodic and idle component hooks.
//!
//! Drivers register against the scheduler to receive time-driven callbacks
//! (`system_tick`, once per tick period from non-interrupt context) and
//! idle-priority callbacks (`idle_tick`, whenever the run queue drains).
//! A component with pending background work can raise
//! `idle_callback_needed` so the next scheduling decision services idle
//! work before the next ready fiber.

use std::sync::Arc;

use crate::error::Error;

/// Capability set implemented by collaborating drivers. Every member is
/// optional; the defaults do nothing.
pub trait SystemComponent: Send + Sync {
    /// Called once per tick period, after scheduler bookkeeping, from
    /// ordinary (non-interrupt) context.
    fn system_tick(&self) {}

    /// Called from the idle sweep when no fiber is ready to run, and ahead
    /// of ready fibers while `idle_callback_needed` reports true.
    fn idle_tick(&self) {}

    /// Polled each system tick; return true to prioritise idle work.
    fn idle_callback_needed(&self) -> bool {
        false
    }
}

/// Shared handle to a registered component.
pub type ComponentRef = Arc<dyn SystemComponent>;

/// An ordered, growable component registry with an optional capacity bound.
pub(crate) struct Registry {
    slots: Vec<ComponentRef>,
    capacity: Option<usize>,
}

impl Registry {
    pub(crate) fn new(capacity: Option<usize>) -> Self {
        Self {
            slots: Vec::new(),
            capacity,
        }
    }

    pub(crate) fn add(&mut self, component: ComponentRef) -> Result<(), Error> {
        if let Some(limit) = self.capacity {
            if self.slots.len() >= limit {
                return Err(Error::NoResources);
            }
        }
        self.slots.push(component);
        Ok(())
    }

    /// Removes a registration by identity. Returns whether it was present.
    pub(crate) fn remove(&mut self, component: &ComponentRef) -> bool {
        let before = self.slots.len();
        self.slots.retain(|slot| !Arc::ptr_eq(slot, component));
        self.slots.len() != before
    }

    /// Clones the registration list so callbacks run without the registry
    /// lock held; iteration order is registration order.
    pub(crate) fn snapshot(&self) -> Vec<ComponentRef> {
        self.slots.clone()
    }
}
