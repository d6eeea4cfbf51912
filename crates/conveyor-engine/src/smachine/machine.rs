//! Machine: owns the slots, runs them on the worker pool and routes adapter
//! results back to them
//!
//! A slot is executed by at most one worker at a time: a worker claims it by
//! moving its status from `Queued` to `Running`. Adapter results never touch
//! the slot state directly. They are queued on the slot and applied by the
//! next turn, before any step runs, so results always land strictly after the
//! step that started the call.

use crate::config::MachineConfig;
use crate::smachine::context::{
    AsyncResultContext, AsyncResultFn, ContextMarker, ExecutionContext,
};
use crate::smachine::error::{describe_payload, is_fatal, IllegalState, MachineError, SlotError};
use crate::smachine::slot::{PendingUpdate, Slot, SlotPool, SlotState, SlotStatus};
use crate::smachine::slot_link::{SlotId, SlotLink, StepLink};
use crate::smachine::transition::{Next, Resume, StateMachine, StepOutcome, TransitionFn};
use crate::smachine::worker::{Worker, WorkerHandle};
use crate::smachine::{Event, Payload, Recovered};
use crossbeam_deque::{Injector, Worker as CWorker};
use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex, MutexGuard};
use rustc_hash::FxHashMap;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How a slot ended
pub enum SlotOutcome {
    /// The last step returned `Complete`; carries the final payload
    Completed(Option<Payload>),
    /// The slot was terminated by an error
    Failed(SlotError),
}

impl SlotOutcome {
    /// True for `Completed`
    pub fn is_completed(&self) -> bool {
        matches!(self, SlotOutcome::Completed(_))
    }

    /// Final payload checked against `T`
    pub fn payload<T: Any>(&self) -> Option<&T> {
        match self {
            SlotOutcome::Completed(Some(payload)) => payload.downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Failure reason, if any
    pub fn error(&self) -> Option<&SlotError> {
        match self {
            SlotOutcome::Failed(error) => Some(error),
            SlotOutcome::Completed(_) => None,
        }
    }
}

impl fmt::Debug for SlotOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotOutcome::Completed(payload) => f
                .debug_tuple("Completed")
                .field(&payload.is_some())
                .finish(),
            SlotOutcome::Failed(error) => f.debug_tuple("Failed").field(error).finish(),
        }
    }
}

/// Machine statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MachineStats {
    /// Total slots added
    pub slots_spawned: u64,

    /// Slots that completed
    pub slots_completed: u64,

    /// Slots terminated by an error
    pub slots_failed: u64,

    /// Currently live slots
    pub active_slots: usize,

    /// Async adapter calls dispatched
    pub async_calls_started: u64,

    /// Async results applied to their slot
    pub results_applied: u64,

    /// Results dropped because their slot moved on
    pub stale_results_dropped: u64,
}

#[derive(Default)]
struct Counters {
    spawned: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    async_calls: AtomicU64,
    applied: AtomicU64,
    stale: AtomicU64,
}

#[derive(Default)]
struct Registry {
    live: FxHashMap<SlotId, Arc<Slot>>,
    outcomes: FxHashMap<SlotId, SlotOutcome>,
}

/// State shared between the Machine, its workers and adapter callbacks
pub(crate) struct MachineShared {
    config: MachineConfig,

    /// Global run queue
    injector: Injector<Arc<Slot>>,

    /// Recycled slot allocations
    pool: SlotPool,

    /// Live slots and unclaimed outcomes
    registry: Mutex<Registry>,

    /// Signalled whenever a slot terminates
    settled: Condvar,

    /// Handles of every worker, for stopping blocked sync calls
    workers: OnceCell<Vec<WorkerHandle>>,

    next_id: AtomicU32,
    stopping: AtomicBool,
    counters: Counters,
}

impl MachineShared {
    fn new(config: MachineConfig) -> Self {
        Self {
            injector: Injector::new(),
            pool: SlotPool::new(config.slot_pool_size),
            registry: Mutex::new(Registry::default()),
            settled: Condvar::new(),
            workers: OnceCell::new(),
            next_id: AtomicU32::new(1),
            stopping: AtomicBool::new(false),
            counters: Counters::default(),
            config,
        }
    }

    pub(crate) fn config(&self) -> &MachineConfig {
        &self.config
    }

    pub(crate) fn injector(&self) -> &Injector<Arc<Slot>> {
        &self.injector
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Refuse new slots and abort every blocked sync call
    fn stop_workers(&self) {
        if !self.stopping.swap(true, Ordering::AcqRel) {
            log::warn!("emergency stop");
        }
        for worker in self.workers.get().into_iter().flatten() {
            worker.emergency_stop();
        }
    }

    /// A fatal panic leaves the machine unusable: stop it and fail every
    /// live slot before the panic unwinds the worker
    fn halt(&self, slot: SlotId, error: &SlotError) {
        log::error!("{} hit a fatal error, halting machine: {}", slot, error);
        self.stop_workers();
        self.fail_remaining();
    }

    pub(crate) fn note_async_call_started(&self) {
        self.counters.async_calls.fetch_add(1, Ordering::Relaxed);
    }

    fn next_slot_id(&self, registry: &Registry) -> SlotId {
        loop {
            let raw = self.next_id.fetch_add(1, Ordering::Relaxed);
            if raw == 0 {
                continue;
            }
            let id = SlotId::from_u32(raw);
            if !registry.live.contains_key(&id) && !registry.outcomes.contains_key(&id) {
                return id;
            }
        }
    }

    fn add_slot(
        self: &Arc<Self>,
        definition: Arc<StateMachine>,
        event: Option<Event>,
        payload: Option<Payload>,
    ) -> Result<SlotLink, MachineError> {
        if self.is_stopping() {
            return Err(MachineError::ShutDown);
        }
        if definition.step_count() == 0 {
            return Err(MachineError::EmptyStateMachine(definition.name().to_string()));
        }

        let mut registry = self.registry.lock();
        if let Some(max) = self.config.max_slots {
            if registry.live.len() >= max {
                return Err(MachineError::SlotLimitReached(max));
            }
        }

        let id = self.next_slot_id(&registry);
        let slot = self.pool.acquire(&Arc::downgrade(self));
        {
            let mut state = slot.state.lock();
            *state = SlotState {
                definition: Some(definition),
                step_index: 0,
                payload,
                input_event: event,
                parked: None,
            };
        }
        slot.assign(id);
        registry.live.insert(id, slot.clone());
        drop(registry);

        self.counters.spawned.fetch_add(1, Ordering::Relaxed);
        log::trace!("{} added", id);

        let link = slot.new_link();
        slot.set_status(SlotStatus::Queued);
        self.injector.push(slot);
        Ok(link)
    }

    /// Entry point of adapter completion callbacks for async calls
    pub(crate) fn complete_async_call(
        link: StepLink,
        result: AsyncResultFn,
        recovered: Option<Recovered>,
    ) {
        let slot = match link.slot() {
            Some(slot) => slot,
            None => {
                log::trace!("result for released {:?} discarded", link);
                return;
            }
        };
        match slot.machine() {
            Some(machine) => {
                machine.deliver(&slot, link, result, recovered, true);
            }
            None => {
                slot.end_async_call();
            }
        }
    }

    /// Queue a result on `slot`. `counted` results release one in-flight
    /// async call once they are applied or dropped.
    fn deliver(
        &self,
        slot: &Arc<Slot>,
        link: StepLink,
        result: AsyncResultFn,
        recovered: Option<Recovered>,
        counted: bool,
    ) -> bool {
        if !link.is_at_step() {
            self.drop_stale(&link);
            if counted {
                self.finish_async_call(slot);
            }
            return false;
        }

        let link_id = link.slot_id();
        slot.pending.lock().push_back(PendingUpdate {
            link,
            result,
            recovered,
            counted,
        });
        self.schedule(slot);

        // Terminated between the link check and the push
        if slot.status() == SlotStatus::Terminated {
            self.discard_pending(slot, link_id);
        }
        true
    }

    fn drop_stale(&self, link: &StepLink) {
        self.counters.stale.fetch_add(1, Ordering::Relaxed);
        log::trace!("stale result for {:?} dropped", link);
    }

    fn schedule(&self, slot: &Arc<Slot>) {
        if slot.transition_status(SlotStatus::Parked, SlotStatus::Queued) {
            self.injector.push(slot.clone());
        }
    }

    fn park(&self, slot: &Arc<Slot>) {
        slot.set_status(SlotStatus::Parked);
        if slot.has_pending() {
            self.schedule(slot);
        }
    }

    fn finish_async_call(&self, slot: &Arc<Slot>) {
        if slot.end_async_call() == 0 {
            self.try_release(slot);
        }
    }

    /// Drop what is queued for instance `id`. The allocation may already
    /// carry a newer instance whose updates must survive.
    fn discard_pending(&self, slot: &Arc<Slot>, id: SlotId) {
        for update in slot.take_pending_of(id) {
            if update.counted {
                slot.end_async_call();
            }
        }
        self.try_release(slot);
    }

    fn try_release(&self, slot: &Arc<Slot>) {
        if slot.try_claim_release() {
            self.pool.release(slot.clone());
        }
    }

    /// Run one turn of `slot`. Returns the slot if it should run again right
    /// away on the same worker.
    pub(crate) fn run_slot(
        self: &Arc<Self>,
        slot: &Arc<Slot>,
        worker: &WorkerHandle,
    ) -> Option<Arc<Slot>> {
        if !slot.transition_status(SlotStatus::Queued, SlotStatus::Running) {
            return None;
        }

        let mut state = slot.state.lock();
        if self.is_stopping() {
            self.terminate(slot, state, SlotOutcome::Failed(SlotError::Stopped));
            return None;
        }

        if let Err(error) = self.apply_pending(slot, &mut state) {
            self.terminate(slot, state, SlotOutcome::Failed(error));
            return None;
        }

        if state.parked.is_some() {
            drop(state);
            self.park(slot);
            return None;
        }

        self.run_step(slot, state, worker)
    }

    /// Apply queued results in arrival order, re-checking each link
    fn apply_pending(&self, slot: &Arc<Slot>, state: &mut SlotState) -> Result<(), SlotError> {
        let mut failure = None;
        let mut woken = false;

        for update in slot.take_pending() {
            let PendingUpdate {
                link,
                result,
                recovered,
                counted,
            } = update;

            if failure.is_none() {
                if !link.is_at_step() {
                    self.drop_stale(&link);
                } else if let Some(recovered) = recovered {
                    failure = Some(SlotError::AdapterFailure(describe_payload(
                        recovered.as_ref(),
                    )));
                } else {
                    let step = state.step_index;
                    let mut ctx = AsyncResultContext::new(slot.id(), state);
                    match panic::catch_unwind(AssertUnwindSafe(|| result.apply(&mut ctx))) {
                        Ok(()) => {
                            woken |= ctx.is_woken();
                            self.counters.applied.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(payload) => {
                            failure = Some(SlotError::Panicked {
                                step,
                                message: describe_payload(payload.as_ref()),
                            });
                        }
                    }
                }
            }

            if counted {
                slot.end_async_call();
            }
        }

        if let Some(error) = failure {
            return Err(error);
        }

        if woken {
            if let Some(Resume::Jump(index)) = state.parked.take() {
                state.step_index = index;
                slot.advance_step();
            }
        }
        Ok(())
    }

    fn lookup_transition(state: &SlotState, index: usize) -> Result<TransitionFn, SlotError> {
        let definition = state
            .definition
            .as_ref()
            .ok_or(SlotError::MissingTransition(index))?;
        let step = definition.step(index).ok_or(SlotError::StepOutOfRange {
            index,
            count: definition.step_count(),
        })?;
        step.transition()
            .cloned()
            .ok_or(SlotError::MissingTransition(index))
    }

    fn run_step(
        self: &Arc<Self>,
        slot: &Arc<Slot>,
        mut state: MutexGuard<'_, SlotState>,
        worker: &WorkerHandle,
    ) -> Option<Arc<Slot>> {
        let index = state.step_index;
        let transition = match Self::lookup_transition(&state, index) {
            Ok(transition) => transition,
            Err(error) => {
                self.terminate(slot, state, SlotOutcome::Failed(error));
                return None;
            }
        };

        let (result, marker) = {
            let mut ctx = ExecutionContext::new(slot, &mut *state, worker);
            let marker = ctx.marker();
            let result = panic::catch_unwind(AssertUnwindSafe(|| transition(&mut ctx)));
            (result, marker)
        };

        match result {
            Ok(Ok(outcome)) => self.apply_outcome(slot, state, outcome, marker),
            Ok(Err(error)) => {
                let error = SlotError::Transition {
                    step: index,
                    source: error,
                };
                self.terminate(slot, state, SlotOutcome::Failed(error));
                None
            }
            Err(payload) => {
                let error = SlotError::Panicked {
                    step: index,
                    message: describe_payload(payload.as_ref()),
                };
                if is_fatal(payload.as_ref()) {
                    let id = slot.id();
                    self.terminate(slot, state, SlotOutcome::Failed(error.clone()));
                    self.halt(id, &error);
                    panic::resume_unwind(payload);
                }
                self.terminate(slot, state, SlotOutcome::Failed(error));
                None
            }
        }
    }

    fn apply_outcome(
        self: &Arc<Self>,
        slot: &Arc<Slot>,
        mut state: MutexGuard<'_, SlotState>,
        outcome: StepOutcome,
        marker: ContextMarker,
    ) -> Option<Arc<Slot>> {
        let StepOutcome { payload, next } = outcome;
        if let Some(payload) = payload {
            state.payload = Some(payload);
        }

        match next {
            Next::Jump(index) => {
                state.step_index = index;
                slot.advance_step();
                drop(state);
                slot.set_status(SlotStatus::Queued);
                Some(slot.clone())
            }
            Next::Repeat => {
                drop(state);
                slot.set_status(SlotStatus::Queued);
                self.injector.push(slot.clone());
                None
            }
            Next::Sleep { then } => {
                state.parked = Some(then);
                drop(state);
                self.park(slot);
                None
            }
            Next::Wait { update, then } => {
                if update.marker() != marker {
                    let error = SlotError::Panicked {
                        step: state.step_index,
                        message: "conditional update returned from another context".to_string(),
                    };
                    let id = slot.id();
                    self.terminate(slot, state, SlotOutcome::Failed(error.clone()));
                    self.halt(id, &error);
                    panic::panic_any(IllegalState(
                        "conditional update returned from another context",
                    ));
                }
                state.parked = Some(then);
                drop(state);

                if !update.kick_off(slot) {
                    // Cancelled before dispatch; let the step observe it
                    let wake = AsyncResultFn::wake();
                    self.deliver(slot, slot.new_any_step_link(), wake, None, false);
                }
                self.park(slot);
                None
            }
            Next::Complete => {
                let payload = state.payload.take();
                self.terminate(slot, state, SlotOutcome::Completed(payload));
                None
            }
        }
    }

    /// End the slot instance, record its outcome and recycle it once no
    /// async call is in flight
    fn terminate(&self, slot: &Arc<Slot>, mut state: MutexGuard<'_, SlotState>, outcome: SlotOutcome) {
        let id = slot.id();
        let step = state.step_index;
        *state = SlotState::default();
        drop(state);
        slot.terminate();

        match &outcome {
            SlotOutcome::Completed(_) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                log::trace!("{} completed", id);
            }
            SlotOutcome::Failed(error) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                log::debug!("{} failed at step {}: {}", id, step, error);
            }
        }

        {
            let mut registry = self.registry.lock();
            registry.live.remove(&id);
            registry.outcomes.insert(id, outcome);
            self.settled.notify_all();
        }

        self.discard_pending(slot, id);
    }

    fn fail_remaining(&self) {
        let slots: Vec<Arc<Slot>> = self.registry.lock().live.values().cloned().collect();
        for slot in slots {
            let state = slot.state.lock();
            if slot.status() != SlotStatus::Terminated {
                self.terminate(&slot, state, SlotOutcome::Failed(SlotError::Stopped));
            }
        }
    }

    fn wait_slot(&self, id: SlotId, timeout: Duration) -> Option<SlotOutcome> {
        let deadline = Instant::now() + timeout;
        let mut registry = self.registry.lock();
        loop {
            if let Some(outcome) = registry.outcomes.remove(&id) {
                return Some(outcome);
            }
            if !registry.live.contains_key(&id) {
                return None;
            }
            if self.settled.wait_until(&mut registry, deadline).timed_out() {
                return registry.outcomes.remove(&id);
            }
        }
    }

    fn wait_all(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut registry = self.registry.lock();
        while !registry.live.is_empty() {
            if self.settled.wait_until(&mut registry, deadline).timed_out() {
                return registry.live.is_empty();
            }
        }
        true
    }

    fn stats(&self) -> MachineStats {
        let active_slots = self.registry.lock().live.len();
        MachineStats {
            slots_spawned: self.counters.spawned.load(Ordering::Relaxed),
            slots_completed: self.counters.completed.load(Ordering::Relaxed),
            slots_failed: self.counters.failed.load(Ordering::Relaxed),
            active_slots,
            async_calls_started: self.counters.async_calls.load(Ordering::Relaxed),
            results_applied: self.counters.applied.load(Ordering::Relaxed),
            stale_results_dropped: self.counters.stale.load(Ordering::Relaxed),
        }
    }
}

/// Cooperative slot scheduler over a fixed pool of worker threads
pub struct Machine {
    /// Worker threads
    workers: Vec<Worker>,

    /// State shared with workers and adapter callbacks
    shared: Arc<MachineShared>,

    /// Whether the workers have been started
    started: bool,

    /// Whether the workers have been stopped for good
    stopped: bool,
}

impl Machine {
    /// Create a machine; no thread runs until [`start`](Self::start)
    pub fn new(config: MachineConfig) -> Self {
        let worker_count = config.effective_worker_count();
        let shared = Arc::new(MachineShared::new(config));

        // Create worker deques to get stealers
        let deques: Vec<CWorker<Arc<Slot>>> =
            (0..worker_count).map(|_| CWorker::new_lifo()).collect();
        let stealers: Vec<_> = deques.iter().map(CWorker::stealer).collect();

        let workers: Vec<Worker> = deques
            .into_iter()
            .enumerate()
            .map(|(id, local)| {
                // Get stealers from other workers (exclude self)
                let others: Vec<_> = stealers
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i != id)
                    .map(|(_, s)| s.clone())
                    .collect();
                Worker::new(id, local, others, shared.clone())
            })
            .collect();

        let handles = workers.iter().map(|w| w.handle().clone()).collect();
        let _ = shared.workers.set(handles);

        Self {
            workers,
            shared,
            started: false,
            stopped: false,
        }
    }

    /// Start all worker threads
    pub fn start(&mut self) -> Result<(), MachineError> {
        if self.stopped || self.shared.is_stopping() {
            return Err(MachineError::ShutDown);
        }
        if self.started {
            return Ok(());
        }

        for worker in &mut self.workers {
            worker
                .start()
                .map_err(|e| MachineError::Spawn(e.to_string()))?;
        }
        self.started = true;
        log::debug!("machine started with {} workers", self.workers.len());
        Ok(())
    }

    /// Add a slot running `definition` from its first step
    pub fn add_slot(
        &self,
        definition: Arc<StateMachine>,
        event: Option<Event>,
        payload: Option<Payload>,
    ) -> Result<SlotLink, MachineError> {
        self.shared.add_slot(definition, event, payload)
    }

    /// Hand an adapter result back to the slot `link` points at. Returns
    /// false if the link is stale and the result was dropped.
    pub fn apply_async_state_update(
        &self,
        link: StepLink,
        result: AsyncResultFn,
        recovered: Option<Recovered>,
    ) -> bool {
        match link.slot() {
            Some(slot) => self.shared.deliver(&slot, link, result, recovered, false),
            None => {
                self.shared.drop_stale(&link);
                false
            }
        }
    }

    /// Wake a sleeping slot
    pub fn wake(&self, link: StepLink) -> bool {
        self.apply_async_state_update(link, AsyncResultFn::wake(), None)
    }

    /// Abort every synchronous call blocked on a worker and refuse new slots.
    /// Slots still live fail with [`SlotError::Stopped`] on their next turn.
    pub fn emergency_stop(&self) {
        self.shared.stop_workers();
    }

    /// True after [`emergency_stop`](Self::emergency_stop) or shutdown
    pub fn is_stopping(&self) -> bool {
        self.shared.is_stopping()
    }

    /// Give live slots `stop_timeout_millis` to finish, then stop the
    /// workers and fail whatever is left
    pub fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        if self.started {
            let grace = Duration::from_millis(self.shared.config.stop_timeout_millis);
            if !self.shared.wait_all(grace) {
                log::warn!(
                    "{} slots still live at shutdown",
                    self.shared.registry.lock().live.len()
                );
            }
        }
        self.stop_now();
    }

    fn stop_now(&mut self) {
        if self.stopped {
            return;
        }
        self.emergency_stop();
        for worker in &mut self.workers {
            worker.stop();
        }
        self.shared.fail_remaining();
        self.started = false;
        self.stopped = true;
    }

    /// Wait for `id` to terminate and take its outcome. Returns `None` on
    /// timeout, for unknown ids and for outcomes already taken.
    pub fn wait_slot(&self, id: SlotId, timeout: Duration) -> Option<SlotOutcome> {
        self.shared.wait_slot(id, timeout)
    }

    /// Take the outcome of `id` if it has terminated
    pub fn take_outcome(&self, id: SlotId) -> Option<SlotOutcome> {
        self.shared.registry.lock().outcomes.remove(&id)
    }

    /// Wait for every live slot to terminate (with timeout)
    pub fn wait_all(&self, timeout: Duration) -> bool {
        self.shared.wait_all(timeout)
    }

    /// Machine statistics
    pub fn stats(&self) -> MachineStats {
        self.shared.stats()
    }

    /// Number of live slots
    pub fn slot_count(&self) -> usize {
        self.shared.registry.lock().live.len()
    }

    /// Number of workers
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Check if the machine has been started
    pub fn is_started(&self) -> bool {
        self.started && self.workers.iter().all(Worker::is_running)
    }

    /// Machine configuration
    pub fn config(&self) -> &MachineConfig {
        &self.shared.config
    }
}

impl Default for Machine {
    fn default() -> Self {
        Self::new(MachineConfig::default())
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        self.stop_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smachine::error::TransitionError;
    use std::sync::atomic::AtomicUsize;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn machine(workers: usize) -> Machine {
        let mut machine = Machine::new(MachineConfig {
            worker_count: workers,
            idle_sleep_micros: 50,
            stop_timeout_millis: 0,
            ..MachineConfig::default()
        });
        machine.start().unwrap();
        machine
    }

    fn counter_sm(limit: u32) -> Arc<StateMachine> {
        StateMachine::builder(1, "counter")
            .step("count", move |ctx| {
                let n = ctx.payload_mut::<u32>()?;
                *n += 1;
                if *n < limit {
                    Ok(StepOutcome::repeat())
                } else {
                    Ok(StepOutcome::jump(1))
                }
            })
            .step("done", |_| Ok(StepOutcome::complete()))
            .build()
    }

    #[test]
    fn test_discard_spares_recycled_instance() {
        let shared = Arc::new(MachineShared::new(MachineConfig::default()));
        let slot = shared.pool.acquire(&Arc::downgrade(&shared));

        // Old instance ends with one call in flight
        slot.assign(SlotId::from_u32(1));
        let old = slot.new_any_step_link();
        slot.begin_async_call();
        slot.terminate();
        assert_eq!(slot.end_async_call(), 0);
        assert!(slot.try_claim_release());
        shared.pool.release(slot.clone());

        // Handed out again before the old teardown finished
        let slot = shared.pool.acquire(&Arc::downgrade(&shared));
        slot.assign(SlotId::from_u32(2));
        slot.begin_async_call();
        let new = slot.new_any_step_link();
        {
            let mut pending = slot.pending.lock();
            pending.push_back(PendingUpdate {
                link: old,
                result: AsyncResultFn::noop(),
                recovered: None,
                counted: false,
            });
            pending.push_back(PendingUpdate {
                link: new,
                result: AsyncResultFn::wake(),
                recovered: None,
                counted: true,
            });
        }

        shared.discard_pending(&slot, SlotId::from_u32(1));
        assert_eq!(slot.async_call_count(), 1);
        let left = slot.take_pending();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].link.slot_id(), SlotId::from_u32(2));
        assert!(left[0].counted);
    }

    #[test]
    fn test_slot_runs_to_completion() {
        let machine = machine(2);
        let link = machine
            .add_slot(counter_sm(5), None, Some(Box::new(0u32)))
            .unwrap();
        assert!(!link.slot_id().is_unknown());

        let outcome = machine.wait_slot(link.slot_id(), TIMEOUT).unwrap();
        assert_eq!(outcome.payload::<u32>(), Some(&5));
        // Terminated slots are no longer reachable
        assert!(!link.is_valid());
        assert!(machine.wait_slot(link.slot_id(), Duration::ZERO).is_none());
    }

    #[test]
    fn test_many_slots() {
        let machine = machine(4);
        let ids: Vec<_> = (0..200)
            .map(|_| {
                machine
                    .add_slot(counter_sm(3), None, Some(Box::new(0u32)))
                    .unwrap()
                    .slot_id()
            })
            .collect();

        assert!(machine.wait_all(TIMEOUT));
        for id in ids {
            assert!(machine.take_outcome(id).unwrap().is_completed());
        }
        let stats = machine.stats();
        assert_eq!(stats.slots_spawned, 200);
        assert_eq!(stats.slots_completed, 200);
        assert_eq!(stats.active_slots, 0);
    }

    #[test]
    fn test_wrong_input_event_is_task_fatal() {
        struct Custom;

        let machine = machine(2);
        let sm = StateMachine::builder(2, "typed")
            .step("init", |ctx| {
                ctx.input_event::<Custom>()?;
                Ok(StepOutcome::complete())
            })
            .build();

        let bad = machine
            .add_slot(sm.clone(), Some(Box::new("not custom")), None)
            .unwrap();
        let good = machine.add_slot(sm, Some(Box::new(Custom)), None).unwrap();

        let bad = machine.wait_slot(bad.slot_id(), TIMEOUT).unwrap();
        assert!(matches!(
            bad.error(),
            Some(SlotError::Transition {
                step: 0,
                source: TransitionError::WrongInputEvent { .. }
            })
        ));
        assert!(machine
            .wait_slot(good.slot_id(), TIMEOUT)
            .unwrap()
            .is_completed());
    }

    #[test]
    fn test_panicking_step_fails_only_its_slot() {
        let machine = machine(1);
        let sm = StateMachine::builder(3, "panics")
            .step("boom", |_| panic!("boom"))
            .build();

        let bad = machine.add_slot(sm, None, None).unwrap();
        let good = machine
            .add_slot(counter_sm(2), None, Some(Box::new(0u32)))
            .unwrap();

        let outcome = machine.wait_slot(bad.slot_id(), TIMEOUT).unwrap();
        assert_eq!(
            outcome.error(),
            Some(&SlotError::Panicked {
                step: 0,
                message: "boom".to_string()
            })
        );
        assert!(machine
            .wait_slot(good.slot_id(), TIMEOUT)
            .unwrap()
            .is_completed());
        assert!(machine.is_started());
    }

    #[test]
    fn test_missing_and_out_of_range_steps() {
        let machine = machine(1);
        let future = StateMachine::builder(4, "future").empty_step("init").build();
        let jumper = StateMachine::builder(5, "jumper")
            .step("init", |_| Ok(StepOutcome::jump(7)))
            .build();

        let a = machine.add_slot(future, None, None).unwrap();
        let b = machine.add_slot(jumper, None, None).unwrap();

        assert_eq!(
            machine.wait_slot(a.slot_id(), TIMEOUT).unwrap().error(),
            Some(&SlotError::MissingTransition(0))
        );
        assert_eq!(
            machine.wait_slot(b.slot_id(), TIMEOUT).unwrap().error(),
            Some(&SlotError::StepOutOfRange { index: 7, count: 1 })
        );
    }

    #[test]
    fn test_sleep_and_wake() {
        let machine = machine(2);
        let (tx, rx) = crossbeam::channel::unbounded();
        let sm = StateMachine::builder(6, "sleeper")
            .step("publish", move |ctx| {
                tx.send(ctx.slot_link()).unwrap();
                Ok(StepOutcome::sleep_then(1))
            })
            .step("woken", |_| Ok(StepOutcome::complete().with_value("woken")))
            .build();

        let link = machine.add_slot(sm, None, None).unwrap();
        let published = rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(published, link);

        // Applying a result without wake_up leaves the slot asleep
        assert!(machine.apply_async_state_update(
            StepLink::any(published.clone()),
            AsyncResultFn::noop(),
            None
        ));
        assert!(machine.wait_slot(link.slot_id(), Duration::from_millis(50)).is_none());

        assert!(machine.wake(StepLink::any(published)));
        let outcome = machine.wait_slot(link.slot_id(), TIMEOUT).unwrap();
        assert_eq!(outcome.payload::<&str>(), Some(&"woken"));
    }

    #[test]
    fn test_stale_exact_step_result_is_dropped() {
        let machine = machine(1);
        let (tx, rx) = crossbeam::channel::unbounded();
        let applied = Arc::new(AtomicUsize::new(0));
        let sm = StateMachine::builder(7, "mover")
            .step("first", move |ctx| {
                tx.send(ctx.step_link()).unwrap();
                Ok(StepOutcome::jump(1))
            })
            .step("second", |_| Ok(StepOutcome::sleep()))
            .build();

        let link = machine.add_slot(sm, None, None).unwrap();
        let first_step = rx.recv_timeout(TIMEOUT).unwrap();

        // Wait until the slot sleeps in its second step
        let deadline = Instant::now() + TIMEOUT;
        while first_step.is_at_step() {
            assert!(Instant::now() < deadline);
            std::thread::yield_now();
        }
        assert!(link.is_valid());

        let counter = applied.clone();
        let accepted = machine.apply_async_state_update(
            first_step,
            AsyncResultFn::new(move |ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                ctx.wake_up();
            }),
            None,
        );
        assert!(!accepted);
        assert_eq!(applied.load(Ordering::SeqCst), 0);
        assert_eq!(machine.stats().stale_results_dropped, 1);
        assert!(link.is_valid());
    }

    #[test]
    fn test_slot_limit() {
        let machine = Machine::new(MachineConfig {
            worker_count: 1,
            max_slots: Some(1),
            ..MachineConfig::default()
        });
        let sm = counter_sm(1);
        machine.add_slot(sm.clone(), None, Some(Box::new(0u32))).unwrap();
        assert_eq!(
            machine.add_slot(sm, None, Some(Box::new(0u32))).unwrap_err(),
            MachineError::SlotLimitReached(1)
        );
        assert_eq!(machine.slot_count(), 1);
    }

    #[test]
    fn test_empty_state_machine_rejected() {
        let machine = Machine::new(MachineConfig::with_workers(1));
        let sm = StateMachine::builder(8, "empty").build();
        assert_eq!(
            machine.add_slot(sm, None, None).unwrap_err(),
            MachineError::EmptyStateMachine("empty".to_string())
        );
    }

    #[test]
    fn test_shutdown_fails_parked_slots() {
        let mut machine = machine(1);
        let sm = StateMachine::builder(9, "forever")
            .step("sleep", |_| Ok(StepOutcome::sleep()))
            .build();
        let link = machine.add_slot(sm, None, None).unwrap();

        machine.shutdown();
        assert!(!machine.is_started());
        assert_eq!(
            machine.take_outcome(link.slot_id()).unwrap().error(),
            Some(&SlotError::Stopped)
        );
        assert_eq!(
            machine.add_slot(counter_sm(1), None, None).unwrap_err(),
            MachineError::ShutDown
        );
    }

    #[test]
    fn test_slot_reuse_invalidates_old_links() {
        let mut machine = Machine::new(MachineConfig {
            worker_count: 1,
            slot_pool_size: 1,
            ..MachineConfig::default()
        });
        machine.start().unwrap();

        let first = machine
            .add_slot(counter_sm(1), None, Some(Box::new(0u32)))
            .unwrap();
        assert!(machine.wait_slot(first.slot_id(), TIMEOUT).is_some());

        let second = machine
            .add_slot(counter_sm(1), None, Some(Box::new(0u32)))
            .unwrap();
        assert_ne!(first.slot_id(), second.slot_id());
        assert!(!first.is_valid());
        assert!(machine.wait_slot(second.slot_id(), TIMEOUT).is_some());
    }
}
