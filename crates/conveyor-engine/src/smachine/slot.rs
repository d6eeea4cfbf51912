//! Slot: the unit of scheduled work
//!
//! The `(id, step)` pair lives in one `AtomicU64` so any thread can take a
//! consistent snapshot of it without locking. Everything else a step touches
//! sits behind `state`, which only the worker running the slot locks. Adapter
//! completions never take that lock: they go through `pending`.

use crate::smachine::context::AsyncResultFn;
use crate::smachine::machine::MachineShared;
use crate::smachine::slot_link::{SlotId, SlotLink, StepLink};
use crate::smachine::transition::{Resume, StateMachine};
use crate::smachine::{Event, Payload, Recovered};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// First step generation of every slot instance
pub(crate) const FIRST_STEP: u32 = 1;

#[inline]
fn pack(id: SlotId, step: u32) -> u64 {
    ((id.as_u32() as u64) << 32) | step as u64
}

#[inline]
fn unpack(value: u64) -> (SlotId, u32) {
    (SlotId::from_u32((value >> 32) as u32), value as u32)
}

/// Scheduling status of a slot
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotStatus {
    /// Not queued; waits for a result or wake-up
    Parked = 0,
    /// Sitting in a run queue
    Queued = 1,
    /// A worker is executing it
    Running = 2,
    /// Finished or pooled; links to it are stale
    Terminated = 3,
}

impl SlotStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SlotStatus::Parked,
            1 => SlotStatus::Queued,
            2 => SlotStatus::Running,
            _ => SlotStatus::Terminated,
        }
    }
}

/// An async result waiting to be applied by the slot's next turn
pub(crate) struct PendingUpdate {
    pub(crate) link: StepLink,
    pub(crate) result: AsyncResultFn,
    pub(crate) recovered: Option<Recovered>,
    /// Counted in the slot's in-flight async calls
    pub(crate) counted: bool,
}

/// State owned by whichever worker currently runs the slot
#[derive(Default)]
pub(crate) struct SlotState {
    pub(crate) definition: Option<Arc<StateMachine>>,
    pub(crate) step_index: usize,
    pub(crate) payload: Option<Payload>,
    pub(crate) input_event: Option<Event>,
    /// Set while the slot sleeps; says what to do once woken
    pub(crate) parked: Option<Resume>,
}

impl SlotState {
    fn reset(&mut self) {
        *self = SlotState::default();
    }
}

/// One logical task instance
pub struct Slot {
    /// Packed `(id, step)`
    id_and_step: AtomicU64,

    /// [`SlotStatus`] as u8
    status: AtomicU8,

    /// Adapter calls started but not yet completed
    async_calls: AtomicUsize,

    /// Guards the hand-back to the pool after termination
    released: AtomicBool,

    /// Owning machine
    machine: Weak<MachineShared>,

    pub(crate) state: Mutex<SlotState>,

    pub(crate) pending: Mutex<VecDeque<PendingUpdate>>,
}

impl Slot {
    pub(crate) fn new(machine: Weak<MachineShared>) -> Self {
        Self {
            id_and_step: AtomicU64::new(pack(SlotId::UNKNOWN, 0)),
            status: AtomicU8::new(SlotStatus::Parked as u8),
            async_calls: AtomicUsize::new(0),
            released: AtomicBool::new(false),
            machine,
            state: Mutex::new(SlotState::default()),
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// A slot that belongs to no machine
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self::new(Weak::new())
    }

    /// Atomic snapshot of the live `(id, step)` pair
    #[inline]
    pub fn id_and_step(&self) -> (SlotId, u32) {
        unpack(self.id_and_step.load(Ordering::Acquire))
    }

    /// Current slot id
    pub fn id(&self) -> SlotId {
        self.id_and_step().0
    }

    /// Current step generation
    pub fn step(&self) -> u32 {
        self.id_and_step().1
    }

    /// Current scheduling status
    pub fn status(&self) -> SlotStatus {
        SlotStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Number of adapter calls still in flight
    pub fn async_call_count(&self) -> usize {
        self.async_calls.load(Ordering::Acquire)
    }

    /// Link to the current instance
    pub fn new_link(self: &Arc<Self>) -> SlotLink {
        SlotLink::new(self.id(), self)
    }

    /// Link scoped to the current step generation only
    pub fn new_exact_step_link(self: &Arc<Self>) -> StepLink {
        let (id, step) = self.id_and_step();
        StepLink::exact(SlotLink::new(id, self), step)
    }

    /// Link accepting whatever step the instance is on later
    pub fn new_any_step_link(self: &Arc<Self>) -> StepLink {
        StepLink::any(SlotLink::new(self.id(), self))
    }

    pub(crate) fn machine(&self) -> Option<Arc<MachineShared>> {
        self.machine.upgrade()
    }

    /// Bind the slot to a fresh instance id at its first step
    pub(crate) fn assign(&self, id: SlotId) {
        self.released.store(false, Ordering::Release);
        self.id_and_step.store(pack(id, FIRST_STEP), Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn set_id_and_step(&self, id: SlotId, step: u32) {
        self.id_and_step.store(pack(id, step), Ordering::Release);
    }

    /// Move to the next step generation, skipping 0 on wrap
    pub(crate) fn advance_step(&self) -> u32 {
        let mut current = self.id_and_step.load(Ordering::Acquire);
        loop {
            let (id, step) = unpack(current);
            let next = match step.wrapping_add(1) {
                0 => FIRST_STEP,
                n => n,
            };
            match self.id_and_step.compare_exchange_weak(
                current,
                pack(id, next),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn set_status(&self, status: SlotStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// CAS the status; false if it was not `from`
    pub(crate) fn transition_status(&self, from: SlotStatus, to: SlotStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn begin_async_call(&self) {
        self.async_calls.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns the number of calls still in flight
    pub(crate) fn end_async_call(&self) -> usize {
        let previous = self.async_calls.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "async call counter underflow");
        previous.saturating_sub(1)
    }

    /// Invalidate every link and mark the slot finished
    pub(crate) fn terminate(&self) {
        self.id_and_step
            .store(pack(SlotId::UNKNOWN, 0), Ordering::Release);
        self.set_status(SlotStatus::Terminated);
    }

    /// Claim the right to recycle this slot. Succeeds once, and only when the
    /// slot is terminated and has no adapter call in flight.
    pub(crate) fn try_claim_release(&self) -> bool {
        self.status() == SlotStatus::Terminated
            && self.async_call_count() == 0
            && self
                .released
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.pending.lock().is_empty()
    }

    /// Pending updates in arrival order, leaving the queue empty
    pub(crate) fn take_pending(&self) -> VecDeque<PendingUpdate> {
        std::mem::take(&mut *self.pending.lock())
    }

    /// Pending updates addressed to instance `id`. Updates for any other
    /// instance stay queued in order.
    pub(crate) fn take_pending_of(&self, id: SlotId) -> VecDeque<PendingUpdate> {
        let mut pending = self.pending.lock();
        let (taken, kept): (VecDeque<_>, VecDeque<_>) = pending
            .drain(..)
            .partition(|update| update.link.slot_id() == id);
        *pending = kept;
        taken
    }

    // Status stays Terminated until the slot is handed out again
    fn reset(&self) {
        self.state.lock().reset();
        self.pending.lock().clear();
        self.async_calls.store(0, Ordering::Release);
    }
}

/// Pool of reusable slot allocations.
///
/// A recycled slot keeps its allocation but receives a new id, so links into
/// the previous instance read as stale.
pub(crate) struct SlotPool {
    slots: Mutex<Vec<Arc<Slot>>>,
    max_size: usize,
}

impl SlotPool {
    /// Create a new pool that holds up to `max_size` slots.
    pub(crate) fn new(max_size: usize) -> Self {
        Self {
            slots: Mutex::new(Vec::with_capacity(max_size.min(1024))),
            max_size,
        }
    }

    /// Get a slot from the pool, or create a new one.
    pub(crate) fn acquire(&self, machine: &Weak<MachineShared>) -> Arc<Slot> {
        self.slots
            .lock()
            .pop()
            .unwrap_or_else(|| Arc::new(Slot::new(machine.clone())))
    }

    /// Return a slot to the pool for reuse.
    pub(crate) fn release(&self, slot: Arc<Slot>) {
        slot.reset();
        let mut pool = self.slots.lock();
        if pool.len() < self.max_size {
            pool.push(slot);
        }
        // else: drop, outstanding links stop resolving
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_roundtrip_extremes() {
        let id = SlotId::from_u32(u32::MAX);
        assert_eq!(unpack(pack(id, u32::MAX)), (id, u32::MAX));
        assert_eq!(unpack(pack(SlotId::UNKNOWN, 0)), (SlotId::UNKNOWN, 0));
    }

    #[test]
    fn test_new_slot_is_unassigned() {
        let slot = Slot::detached();
        assert!(slot.id().is_unknown());
        assert_eq!(slot.step(), 0);
        assert_eq!(slot.status(), SlotStatus::Parked);
        assert!(slot.machine().is_none());
    }

    #[test]
    fn test_assign_and_advance() {
        let slot = Slot::detached();
        slot.assign(SlotId::from_u32(12));
        assert_eq!(slot.id_and_step(), (SlotId::from_u32(12), FIRST_STEP));
        assert_eq!(slot.advance_step(), 2);
        assert_eq!(slot.advance_step(), 3);
        assert_eq!(slot.id(), SlotId::from_u32(12));
    }

    #[test]
    fn test_step_wraps_past_zero() {
        let slot = Slot::detached();
        slot.set_id_and_step(SlotId::from_u32(1), u32::MAX);
        assert_eq!(slot.advance_step(), FIRST_STEP);
    }

    #[test]
    fn test_status_transition() {
        let slot = Slot::detached();
        assert!(slot.transition_status(SlotStatus::Parked, SlotStatus::Queued));
        assert!(!slot.transition_status(SlotStatus::Parked, SlotStatus::Queued));
        assert_eq!(slot.status(), SlotStatus::Queued);
    }

    #[test]
    fn test_release_waits_for_async_calls() {
        let slot = Slot::detached();
        slot.assign(SlotId::from_u32(2));
        slot.begin_async_call();
        slot.terminate();
        assert!(slot.id().is_unknown());
        assert!(!slot.try_claim_release());

        assert_eq!(slot.end_async_call(), 0);
        assert!(slot.try_claim_release());
        // Only once
        assert!(!slot.try_claim_release());
    }

    fn update_for(link: StepLink, counted: bool) -> PendingUpdate {
        PendingUpdate {
            link,
            result: AsyncResultFn::noop(),
            recovered: None,
            counted,
        }
    }

    #[test]
    fn test_take_pending_of_one_instance() {
        let slot = Arc::new(Slot::detached());
        slot.assign(SlotId::from_u32(3));
        let old = slot.new_any_step_link();
        slot.assign(SlotId::from_u32(4));
        let new = slot.new_any_step_link();

        {
            let mut pending = slot.pending.lock();
            pending.push_back(update_for(new.clone(), true));
            pending.push_back(update_for(old, false));
            pending.push_back(update_for(new, false));
        }

        let taken = slot.take_pending_of(SlotId::from_u32(3));
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].link.slot_id(), SlotId::from_u32(3));

        let left = slot.take_pending();
        assert_eq!(left.len(), 2);
        assert!(left[0].counted);
        assert!(left.iter().all(|u| u.link.slot_id() == SlotId::from_u32(4)));
    }

    #[test]
    fn test_pool_acquire_release() {
        let pool = SlotPool::new(2);
        let machine = Weak::new();

        let slot = pool.acquire(&machine);
        slot.assign(SlotId::from_u32(1));
        slot.state.lock().step_index = 4;
        slot.terminate();
        pool.release(slot.clone());
        assert_eq!(pool.len(), 1);

        let recycled = pool.acquire(&machine);
        assert!(Arc::ptr_eq(&slot, &recycled));
        // A pooled slot cannot be woken into a run queue
        assert_eq!(recycled.status(), SlotStatus::Terminated);
        assert!(!recycled.transition_status(SlotStatus::Parked, SlotStatus::Queued));
        assert_eq!(recycled.state.lock().step_index, 0);
    }

    #[test]
    fn test_pool_max_size() {
        let pool = SlotPool::new(1);
        let machine = Weak::new();

        let s1 = pool.acquire(&machine);
        let s2 = pool.acquire(&machine);
        pool.release(s1);
        pool.release(s2); // exceeds max_size, dropped
        assert_eq!(pool.len(), 1);
    }
}
