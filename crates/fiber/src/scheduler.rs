//! Cooperative fiber scheduler.
//!
//! The scheduler owns the fiber arena, the run/sleep/wait queues and the
//! millisecond clock, and it is the only caller of the context-switch
//! backend. Scheduling is strictly FIFO among ready fibers: a yielding
//! fiber is appended at the run-queue tail and the next fiber is taken from
//! the head, so fibers with equal claim on the processor proceed in rounds.
//!
//! Concurrency model: exactly one fiber runs at a time, so almost all
//! mutation is sequential. The single true concurrency point is the tick
//! source (a timer interrupt on hardware, any thread here), which only
//! advances the clock and relinks expired sleepers onto the run queue; that
//! handoff is guarded by the state mutex and never performs a context
//! switch. The clock is an `AtomicU64` written with `Release` by the tick
//! source and read with `Acquire` everywhere else; the idle-pending flag
//! follows the same single-writer ordering contract.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::component::{ComponentRef, Registry};
use crate::error::{default_fault_handler, Error, Fault, FaultHandler};
use crate::fiber::{Fiber, FiberArg, FiberConfig, FiberId, FiberState, FiberStats};
use crate::switch::{Body, ContextSwitch, HostedSwitch};

/// Default period of the scheduler tick, in milliseconds.
pub const TICK_PERIOD_MS: u64 = 6;

/// Sizing and policy knobs for a scheduler instance.
#[derive(Clone)]
pub struct SchedulerConfig {
    /// Milliseconds the clock advances per `tick`.
    pub tick_period_ms: u64,
    /// Maximum number of recycled fibers kept warm for reuse.
    pub pool_capacity: usize,
    /// Optional bound on the system-component registry.
    pub system_capacity: Option<usize>,
    /// Optional bound on the idle-component registry.
    pub idle_capacity: Option<usize>,
    /// Terminal handler for fatal faults.
    pub fault_handler: FaultHandler,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_period_ms: TICK_PERIOD_MS,
            pool_capacity: 4,
            system_capacity: None,
            idle_capacity: None,
            fault_handler: default_fault_handler,
        }
    }
}

impl SchedulerConfig {
    /// Creates a new scheduler configuration builder.
    pub fn builder() -> SchedulerConfigBuilder {
        SchedulerConfigBuilder::default()
    }
}

/// Builder for ergonomic scheduler configuration construction.
#[derive(Default)]
pub struct SchedulerConfigBuilder {
    config: SchedulerConfig,
}

impl SchedulerConfigBuilder {
    /// Sets the tick period in milliseconds.
    pub fn tick_period_ms(mut self, period: u64) -> Self {
        self.config.tick_period_ms = period;
        self
    }

    /// Sets how many recycled fibers are kept for reuse.
    pub fn pool_capacity(mut self, capacity: usize) -> Self {
        self.config.pool_capacity = capacity;
        self
    }

    /// Bounds the system- and idle-component registries. `None` leaves a
    /// registry unbounded.
    pub fn registry_capacities(mut self, system: Option<usize>, idle: Option<usize>) -> Self {
        self.config.system_capacity = system;
        self.config.idle_capacity = idle;
        self
    }

    /// Sets the terminal fault handler.
    pub fn fault_handler(mut self, handler: FaultHandler) -> Self {
        self.config.fault_handler = handler;
        self
    }

    /// Builds the scheduler configuration.
    pub fn build(self) -> SchedulerConfig {
        self.config
    }
}

struct SchedState<C> {
    initialized: bool,
    fibers: Vec<Option<Fiber<C>>>,
    free_slots: Vec<usize>,
    run_queue: VecDeque<FiberId>,
    sleep_queue: Vec<FiberId>,
    wait_queue: Vec<FiberId>,
    pool: Vec<FiberId>,
    current: Option<FiberId>,
    stats: FiberStats,
}

impl<C> SchedState<C> {
    fn new() -> Self {
        Self {
            initialized: false,
            fibers: Vec::new(),
            free_slots: Vec::new(),
            run_queue: VecDeque::new(),
            sleep_queue: Vec::new(),
            wait_queue: Vec::new(),
            pool: Vec::new(),
            current: None,
            stats: FiberStats::default(),
        }
    }
}

/// Wakes contexts parked in the idle task when a tick arrives.
struct TickGate {
    generation: Mutex<u64>,
    pulsed: Condvar,
}

impl TickGate {
    fn new() -> Self {
        Self {
            generation: Mutex::new(0),
            pulsed: Condvar::new(),
        }
    }

    fn pulse(&self) {
        *self.generation.lock() += 1;
        self.pulsed.notify_all();
    }

    /// Waits for the next pulse, bounded by `timeout` so an idle context
    /// re-examines the run queue even without a tick source.
    fn wait(&self, timeout: Duration) {
        let mut generation = self.generation.lock();
        let start = *generation;
        while *generation == start {
            if self.pulsed.wait_for(&mut generation, timeout).timed_out() {
                break;
            }
        }
    }
}

/// A cooperative scheduler instance.
///
/// Each instance is independent: the clock, queues, component registries
/// and fiber arena all belong to the instance, so tests can run several
/// schedulers side by side.
pub struct Scheduler<S: ContextSwitch = HostedSwitch> {
    switch: S,
    config: SchedulerConfig,
    clock_ms: AtomicU64,
    idle_pending: AtomicBool,
    tick_gate: TickGate,
    state: Mutex<SchedState<S::Context>>,
    system_components: Mutex<Registry>,
    idle_components: Mutex<Registry>,
}

impl Scheduler<HostedSwitch> {
    /// Creates a scheduler on the hosted context-switch backend.
    pub fn new(config: SchedulerConfig) -> Arc<Self> {
        Self::with_switch(config, HostedSwitch)
    }
}

impl<S: ContextSwitch> Scheduler<S> {
    /// Creates a scheduler on an explicit context-switch backend.
    pub fn with_switch(config: SchedulerConfig, switch: S) -> Arc<Self> {
        let system_components = Mutex::new(Registry::new(config.system_capacity));
        let idle_components = Mutex::new(Registry::new(config.idle_capacity));
        Arc::new(Self {
            switch,
            config,
            clock_ms: AtomicU64::new(0),
            idle_pending: AtomicBool::new(false),
            tick_gate: TickGate::new(),
            state: Mutex::new(SchedState::new()),
            system_components,
            idle_components,
        })
    }

    /// Captures the calling context as the first fiber and marks it
    /// running. Must be called exactly once, before any other operation.
    pub fn init(&self) -> Result<FiberId, Error> {
        let mut st = self.state.lock();
        if st.initialized {
            log::warn!("scheduler initialised twice");
            return Err(Error::NotInitialized);
        }
        let ctx = self.switch.capture();
        let mut fiber = Fiber::new(ctx, crate::fiber::FIBER_STACK_SIZE);
        fiber.state = FiberState::Running;
        st.fibers.push(Some(fiber));
        let id = FiberId(st.fibers.len() - 1);
        st.current = Some(id);
        st.stats.created = 1;
        st.stats.active = 1;
        st.stats.peak_active = 1;
        st.initialized = true;
        log::debug!("scheduler initialised; calling context captured as {id:?}");
        Ok(id)
    }

    /// Creates a fiber around a plain entry function and places it on the
    /// run queue. The fiber starts lazily, when the scheduler selects it.
    pub fn create_fiber(
        self: &Arc<Self>,
        entry: impl FnOnce() + Send + 'static,
    ) -> Result<FiberId, Error> {
        self.create_fiber_with(FiberConfig::new(entry))
    }

    /// Creates a fiber around a parameterised entry function.
    pub fn create_fiber_with_arg(
        self: &Arc<Self>,
        entry: impl FnOnce(FiberArg) + Send + 'static,
        arg: FiberArg,
    ) -> Result<FiberId, Error> {
        self.create_fiber_with(FiberConfig::with_arg(entry, arg))
    }

    /// Creates a fiber from an explicit [`FiberConfig`].
    ///
    /// Allocation is pool-first: a recycled fiber whose context was sized
    /// for an equal or larger stack footprint is reused, stack buffer and
    /// all. Contexts that cannot be allocated are fatal and routed to the
    /// configured fault handler.
    pub fn create_fiber_with(self: &Arc<Self>, config: FiberConfig) -> Result<FiberId, Error> {
        if config.stack_size == 0 {
            return Err(Error::InvalidParameter("stack size must be non-zero"));
        }
        let FiberConfig {
            entry,
            completion,
            stack_size,
        } = config;

        let reused = {
            let st = &mut *self.state.lock();
            if !st.initialized {
                return Err(Error::NotInitialized);
            }
            let mut found = None;
            for (slot, &id) in st.pool.iter().enumerate() {
                let fits = st.fibers[id.0]
                    .as_ref()
                    .map_or(false, |fiber| fiber.stack_size >= stack_size);
                if fits {
                    found = Some(slot);
                    break;
                }
            }
            found.map(|slot| {
                let id = st.pool.remove(slot);
                st.stats.pooled -= 1;
                let fiber = st.fibers[id.0]
                    .as_mut()
                    .expect("pooled fiber missing from arena");
                fiber.pending_wake = false;
                (id, fiber.ctx.clone())
            })
        };

        let (id, ctx) = match reused {
            Some(hit) => hit,
            None => {
                let ctx = match self.switch.create(stack_size) {
                    Ok(ctx) => ctx,
                    Err(_) => (self.config.fault_handler)(Fault::OutOfMemory),
                };
                let mut st = self.state.lock();
                let index = match st.free_slots.pop() {
                    Some(index) => {
                        st.fibers[index] = Some(Fiber::new(ctx.clone(), stack_size));
                        index
                    }
                    None => {
                        st.fibers.push(Some(Fiber::new(ctx.clone(), stack_size)));
                        st.fibers.len() - 1
                    }
                };
                (FiberId(index), ctx)
            }
        };

        let sched = Arc::clone(self);
        let body: Body = Box::new(move || {
            let outcome = catch_unwind(AssertUnwindSafe(move || {
                entry.invoke();
                if let Some(hook) = completion {
                    hook();
                }
            }));
            if outcome.is_err() {
                log::error!("fiber {id:?} panicked; recycling its context");
            }
            sched.release_current(id);
        });
        self.switch.assign(&ctx, body);

        {
            let mut st = self.state.lock();
            let fiber = st.fibers[id.0]
                .as_mut()
                .expect("created fiber missing from arena");
            fiber.state = FiberState::Ready;
            st.run_queue.push_back(id);
            st.stats.created += 1;
            st.stats.active += 1;
            if st.stats.active > st.stats.peak_active {
                st.stats.peak_active = st.stats.active;
            }
        }
        log::debug!("fiber {id:?} created (stack {stack_size} bytes)");
        Ok(id)
    }

    /// Voluntary yield point: the caller moves to the run-queue tail and
    /// the head fiber runs next. Returns when the caller is re-selected.
    pub fn schedule(&self) {
        let parked = {
            let st = &mut *self.state.lock();
            debug_assert!(st.initialized, "scheduler used before init");
            if !st.initialized {
                return;
            }
            let Some(me) = st.current else { return };
            let ctx = {
                let fiber = st.fibers[me.0]
                    .as_mut()
                    .expect("current fiber missing from arena");
                fiber.state = FiberState::Ready;
                fiber.ctx.clone()
            };
            st.run_queue.push_back(me);
            Some((me, ctx))
        };
        self.suspend_until_selected(parked);
    }

    /// Blocks the calling fiber for at least `ms` milliseconds. The wake
    /// deadline is rounded up to the next tick boundary; the fiber is made
    /// runnable by the first tick at or past the deadline and resumes when
    /// the scheduler next selects it.
    pub fn sleep(&self, ms: u64) {
        let period = self.config.tick_period_ms.max(1);
        let parked = {
            let st = &mut *self.state.lock();
            debug_assert!(st.initialized, "scheduler used before init");
            if !st.initialized {
                return;
            }
            let Some(me) = st.current else { return };
            let now = self.clock_ms.load(Ordering::Acquire);
            let deadline = now.saturating_add(ms);
            let wake_at = deadline.saturating_add(period - 1) / period * period;
            let ctx = {
                let fiber = st.fibers[me.0]
                    .as_mut()
                    .expect("current fiber missing from arena");
                fiber.state = FiberState::Sleeping;
                fiber.wake_at = wake_at;
                fiber.ctx.clone()
            };
            st.sleep_queue.push(me);
            Some((me, ctx))
        };
        self.suspend_until_selected(parked);
    }

    /// Scheduler half of the periodic tick. Advances the clock and relinks
    /// expired sleepers onto the run-queue tail in their sleep order.
    ///
    /// Safe to call from the tick source while a fiber runs: it takes the
    /// state lock, touches no queue read side, never context-switches and
    /// does not allocate (the sleep queue is partitioned in place).
    pub fn tick(&self) {
        let period = self.config.tick_period_ms.max(1);
        let now = self.clock_ms.fetch_add(period, Ordering::AcqRel) + period;
        {
            let st = &mut *self.state.lock();
            if st.initialized && !st.sleep_queue.is_empty() {
                let mut sleepers = std::mem::take(&mut st.sleep_queue);
                sleepers.retain(|&id| {
                    let awake = st.fibers[id.0]
                        .as_ref()
                        .map_or(false, |fiber| fiber.wake_at <= now);
                    if awake {
                        if let Some(fiber) = st.fibers[id.0].as_mut() {
                            fiber.state = FiberState::Ready;
                        }
                        st.run_queue.push_back(id);
                        log::trace!("fiber {id:?} woken at {now}ms");
                    }
                    !awake
                });
                st.sleep_queue = sleepers;
            }
        }
        self.tick_gate.pulse();
    }

    /// Full periodic tick: scheduler bookkeeping, then the system-component
    /// sweep, then the idle-work poll. Invoked from non-interrupt context.
    pub fn system_tick(&self) {
        self.tick();
        let components = self.system_components.lock().snapshot();
        for component in &components {
            component.system_tick();
        }
        let idlers = self.idle_components.lock().snapshot();
        if idlers.iter().any(|idler| idler.idle_callback_needed()) {
            self.idle_pending.store(true, Ordering::Release);
        }
    }

    /// Registers a component for the per-tick sweep.
    pub fn add_system_component(&self, component: ComponentRef) -> Result<(), Error> {
        self.system_components.lock().add(component)
    }

    /// Removes a per-tick component registration.
    pub fn remove_system_component(&self, component: &ComponentRef) -> bool {
        self.system_components.lock().remove(component)
    }

    /// Registers a component for the idle sweep.
    pub fn add_idle_component(&self, component: ComponentRef) -> Result<(), Error> {
        self.idle_components.lock().add(component)
    }

    /// Removes an idle component registration.
    pub fn remove_idle_component(&self, component: &ComponentRef) -> bool {
        self.idle_components.lock().remove(component)
    }

    /// Milliseconds of scheduler clock elapsed since `init`.
    pub fn millis(&self) -> u64 {
        self.clock_ms.load(Ordering::Acquire)
    }

    /// Arena and pool counters.
    pub fn stats(&self) -> FiberStats {
        self.state.lock().stats
    }

    /// The configured tick period in milliseconds.
    pub fn tick_period_ms(&self) -> u64 {
        self.config.tick_period_ms
    }

    /// Identifier of the fiber executing this call.
    ///
    /// Part of the event-wait handoff surface used by the bus, together
    /// with [`park_current_for_event`](Self::park_current_for_event) and
    /// [`wake_event_waiter`](Self::wake_event_waiter).
    pub fn current_fiber(&self) -> Result<FiberId, Error> {
        let st = self.state.lock();
        if !st.initialized {
            return Err(Error::NotInitialized);
        }
        st.current.ok_or(Error::NotInitialized)
    }

    /// Moves the calling fiber to the wait queue until
    /// [`wake_event_waiter`](Self::wake_event_waiter) names it. A wake that
    /// already arrived (between listener registration and this call) makes
    /// this a no-op.
    pub fn park_current_for_event(&self) {
        let parked = {
            let st = &mut *self.state.lock();
            let Some(me) = st.current else { return };
            let ctx = {
                let fiber = st.fibers[me.0]
                    .as_mut()
                    .expect("current fiber missing from arena");
                if fiber.pending_wake {
                    fiber.pending_wake = false;
                    return;
                }
                fiber.state = FiberState::Waiting;
                fiber.ctx.clone()
            };
            st.wait_queue.push(me);
            Some((me, ctx))
        };
        self.suspend_until_selected(parked);
    }

    /// Moves an event waiter from the wait queue to the run-queue tail.
    /// Wakes aimed at a fiber that has not parked yet are retained; stale
    /// identifiers are ignored.
    pub fn wake_event_waiter(&self, id: FiberId) {
        let st = &mut *self.state.lock();
        let Some(fiber) = st.fibers.get_mut(id.0).and_then(|slot| slot.as_mut()) else {
            return;
        };
        match fiber.state {
            FiberState::Waiting => fiber.state = FiberState::Ready,
            FiberState::Running => {
                fiber.pending_wake = true;
                return;
            }
            _ => return,
        }
        st.wait_queue.retain(|&waiter| waiter != id);
        st.run_queue.push_back(id);
        log::trace!("event waiter {id:?} made runnable");
    }

    /// Suspends a parked caller until the scheduler selects it again. No
    /// switch happens if the caller is immediately re-selected.
    fn suspend_until_selected(&self, parked: Option<(FiberId, S::Context)>) {
        let Some((me, my_ctx)) = parked else { return };
        let (next, next_ctx) = self.pick_next();
        if next != me {
            self.switch.transfer(&my_ctx, &next_ctx);
        }
    }

    /// Selects the next running fiber, servicing pending idle work first
    /// and falling back to the idle task while the run queue is empty.
    fn pick_next(&self) -> (FiberId, S::Context) {
        loop {
            if self.idle_pending.swap(false, Ordering::AcqRel) {
                self.run_idle_components();
            }
            {
                let st = &mut *self.state.lock();
                if let Some(id) = st.run_queue.pop_front() {
                    let ctx = {
                        let fiber = st.fibers[id.0]
                            .as_mut()
                            .expect("queued fiber missing from arena");
                        fiber.state = FiberState::Running;
                        fiber.ctx.clone()
                    };
                    st.current = Some(id);
                    log::trace!("fiber {id:?} selected");
                    return (id, ctx);
                }
            }
            self.idle_task();
        }
    }

    /// Runs only when the run queue is empty: services idle components,
    /// then performs a bounded low-power wait for the next tick pulse.
    fn idle_task(&self) {
        self.run_idle_components();
        let period = self.config.tick_period_ms.max(1);
        self.tick_gate.wait(Duration::from_millis(period));
    }

    fn run_idle_components(&self) {
        let idlers = self.idle_components.lock().snapshot();
        for idler in &idlers {
            idler.idle_tick();
        }
    }

    /// Terminal path of every fiber body: recycles the finishing fiber and
    /// resumes the next runnable one, so a finishing fiber never falls off
    /// the end without re-entering the scheduler.
    fn release_current(&self, id: FiberId) {
        let evicted = {
            let st = &mut *self.state.lock();
            debug_assert_eq!(st.current, Some(id), "release from a non-current fiber");
            {
                let fiber = st.fibers[id.0]
                    .as_mut()
                    .expect("finishing fiber missing from arena");
                fiber.state = FiberState::Recycled;
                fiber.pending_wake = false;
            }
            st.stats.recycled += 1;
            st.stats.active -= 1;
            if st.pool.len() < self.config.pool_capacity {
                st.pool.push(id);
                st.stats.pooled += 1;
                None
            } else {
                let fiber = st.fibers[id.0]
                    .take()
                    .expect("finishing fiber missing from arena");
                st.free_slots.push(id.0);
                Some(fiber.ctx)
            }
        };
        if let Some(ctx) = evicted {
            self.switch.retire(&ctx);
        }
        log::trace!("fiber {id:?} recycled");
        let (_, next_ctx) = self.pick_next();
        self.switch.resume(&next_ctx);
    }
}

impl<S: ContextSwitch> Drop for Scheduler<S> {
    /// Retires pooled contexts so their backing resources are reclaimed.
    /// Fibers suspended mid-body cannot be retired from here; on the hosted
    /// backend their parked threads end with the process.
    fn drop(&mut self) {
        let st = self.state.get_mut();
        for &id in &st.pool {
            if let Some(fiber) = st.fibers[id.0].as_ref() {
                self.switch.retire(&fiber.ctx);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_builder_applies_options() {
        let config = SchedulerConfig::builder()
            .tick_period_ms(2)
            .pool_capacity(1)
            .registry_capacities(Some(10), Some(6))
            .build();
        assert_eq!(config.tick_period_ms, 2);
        assert_eq!(config.pool_capacity, 1);
        assert_eq!(config.system_capacity, Some(10));
        assert_eq!(config.idle_capacity, Some(6));
    }

    #[test]
    fn create_before_init_is_rejected() {
        let sched = Scheduler::new(SchedulerConfig::default());
        let result = sched.create_fiber(|| {});
        assert_eq!(result, Err(Error::NotInitialized));
    }

    #[test]
    fn init_twice_is_rejected() {
        let sched = Scheduler::new(SchedulerConfig::default());
        sched.init().unwrap();
        assert_eq!(sched.init(), Err(Error::NotInitialized));
    }

    #[test]
    fn zero_stack_size_is_rejected() {
        let sched = Scheduler::new(SchedulerConfig::default());
        sched.init().unwrap();
        let result = sched.create_fiber_with(FiberConfig::new(|| {}).stack_size(0));
        assert_eq!(result, Err(Error::InvalidParameter("stack size must be non-zero")));
    }

    #[test]
    fn clock_advances_by_tick_period() {
        let sched = Scheduler::new(SchedulerConfig::builder().tick_period_ms(5).build());
        sched.init().unwrap();
        assert_eq!(sched.millis(), 0);
        sched.tick();
        sched.tick();
        assert_eq!(sched.millis(), 10);
    }

    /// Runs assigned bodies synchronously inside `transfer`/`resume` and
    /// records retirements, so pool bookkeeping is observable without any
    /// host threads.
    #[derive(Default)]
    struct InlineSwitch {
        next_id: std::sync::atomic::AtomicUsize,
        retired: Arc<Mutex<Vec<usize>>>,
    }

    #[derive(Clone)]
    struct InlineContext {
        id: usize,
        body: Arc<Mutex<Option<Body>>>,
    }

    impl InlineSwitch {
        fn fresh(&self) -> InlineContext {
            InlineContext {
                id: self.next_id.fetch_add(1, Ordering::SeqCst),
                body: Arc::new(Mutex::new(None)),
            }
        }
    }

    impl ContextSwitch for InlineSwitch {
        type Context = InlineContext;

        fn capture(&self) -> InlineContext {
            self.fresh()
        }

        fn create(&self, _stack_size: usize) -> Result<InlineContext, Error> {
            Ok(self.fresh())
        }

        fn assign(&self, ctx: &InlineContext, body: Body) {
            *ctx.body.lock() = Some(body);
        }

        fn transfer(&self, _from: &InlineContext, to: &InlineContext) {
            let body = to.body.lock().take();
            if let Some(body) = body {
                body();
            }
        }

        fn resume(&self, to: &InlineContext) {
            let body = to.body.lock().take();
            if let Some(body) = body {
                body();
            }
        }

        fn retire(&self, ctx: &InlineContext) {
            self.retired.lock().push(ctx.id);
        }
    }

    #[test]
    fn dropping_the_scheduler_retires_pooled_contexts() {
        let switch = InlineSwitch::default();
        let retired = Arc::clone(&switch.retired);
        {
            let sched = Scheduler::with_switch(SchedulerConfig::default(), switch);
            sched.init().unwrap();
            sched.create_fiber(|| {}).unwrap();
            sched.schedule();
            assert_eq!(sched.stats().pooled, 1);
            assert!(retired.lock().is_empty());
        }
        assert_eq!(retired.lock().len(), 1);
    }

    #[test]
    fn init_captures_the_calling_context() {
        let sched = Scheduler::new(SchedulerConfig::default());
        let id = sched.init().unwrap();
        assert_eq!(sched.current_fiber().unwrap(), id);
        let stats = sched.stats();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.active, 1);
    }
}
