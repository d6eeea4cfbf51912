//! Contexts handed to step transitions and to adapter results

use crate::smachine::error::TransitionError;
use crate::smachine::slot::{Slot, SlotState};
use crate::smachine::slot_link::{SlotId, SlotLink, StepLink};
use crate::smachine::worker::WorkerHandle;
use crate::smachine::Payload;
use std::any::{type_name, Any};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_MARKER: AtomicU64 = AtomicU64::new(1);

/// Identifies one execution context; deferred updates must come back to the
/// context that created them
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ContextMarker(u64);

impl ContextMarker {
    fn next() -> Self {
        ContextMarker(NEXT_MARKER.fetch_add(1, Ordering::Relaxed))
    }
}

fn downcast_payload<'p, T: Any>(
    payload: &'p Option<Payload>,
) -> Result<&'p T, TransitionError> {
    payload
        .as_ref()
        .and_then(|p| p.downcast_ref::<T>())
        .ok_or(TransitionError::WrongPayload {
            expected: type_name::<T>(),
        })
}

fn downcast_payload_mut<'p, T: Any>(
    payload: &'p mut Option<Payload>,
) -> Result<&'p mut T, TransitionError> {
    payload
        .as_mut()
        .and_then(|p| p.downcast_mut::<T>())
        .ok_or(TransitionError::WrongPayload {
            expected: type_name::<T>(),
        })
}

/// Slot view available to a step transition
pub struct ExecutionContext<'a> {
    slot: &'a Arc<Slot>,
    state: &'a mut SlotState,
    worker: &'a WorkerHandle,
    marker: ContextMarker,
    count_async_calls: usize,
}

impl<'a> ExecutionContext<'a> {
    pub(crate) fn new(
        slot: &'a Arc<Slot>,
        state: &'a mut SlotState,
        worker: &'a WorkerHandle,
    ) -> Self {
        Self {
            slot,
            state,
            worker,
            marker: ContextMarker::next(),
            count_async_calls: 0,
        }
    }

    /// Id of the running slot
    pub fn slot_id(&self) -> SlotId {
        self.slot.id()
    }

    /// Link to the running slot instance
    pub fn slot_link(&self) -> SlotLink {
        self.slot.new_link()
    }

    /// Link to the running step generation
    pub fn step_link(&self) -> StepLink {
        self.slot.new_exact_step_link()
    }

    /// Index of the running step in its state machine
    pub fn step_index(&self) -> usize {
        self.state.step_index
    }

    /// Marker of this context
    pub fn marker(&self) -> ContextMarker {
        self.marker
    }

    /// Adapter calls started from this context so far
    pub fn async_calls_started(&self) -> usize {
        self.count_async_calls
    }

    /// Input event the slot was created with, checked against `T`
    pub fn input_event<T: Any>(&self) -> Result<&T, TransitionError> {
        self.state
            .input_event
            .as_ref()
            .and_then(|e| e.downcast_ref::<T>())
            .ok_or(TransitionError::WrongInputEvent {
                expected: type_name::<T>(),
            })
    }

    /// Current payload, checked against `T`
    pub fn payload<T: Any>(&self) -> Result<&T, TransitionError> {
        downcast_payload(&self.state.payload)
    }

    /// Current payload for in-place update, checked against `T`
    pub fn payload_mut<T: Any>(&mut self) -> Result<&mut T, TransitionError> {
        downcast_payload_mut(&mut self.state.payload)
    }

    /// Take the payload out, leaving the slot without one
    pub fn take_payload(&mut self) -> Option<Payload> {
        self.state.payload.take()
    }

    /// True if the slot currently holds a payload
    pub fn has_payload(&self) -> bool {
        self.state.payload.is_some()
    }

    pub(crate) fn slot(&self) -> &Arc<Slot> {
        self.slot
    }

    pub(crate) fn worker(&self) -> &WorkerHandle {
        self.worker
    }

    pub(crate) fn count_async_call(&mut self) {
        self.count_async_calls += 1;
    }

    /// Result context over this slot, for results applied in-line
    pub(crate) fn result_context(&mut self) -> AsyncResultContext<'_> {
        AsyncResultContext::new(self.slot.id(), &mut *self.state)
    }
}

/// Slot view available to an adapter result when it is applied
pub struct AsyncResultContext<'a> {
    slot_id: SlotId,
    state: &'a mut SlotState,
    wake: bool,
}

impl<'a> AsyncResultContext<'a> {
    pub(crate) fn new(slot_id: SlotId, state: &'a mut SlotState) -> Self {
        Self {
            slot_id,
            state,
            wake: false,
        }
    }

    /// Id of the receiving slot
    pub fn slot_id(&self) -> SlotId {
        self.slot_id
    }

    /// Current payload, checked against `T`
    pub fn payload<T: Any>(&self) -> Result<&T, TransitionError> {
        downcast_payload(&self.state.payload)
    }

    /// Current payload for in-place update, checked against `T`
    pub fn payload_mut<T: Any>(&mut self) -> Result<&mut T, TransitionError> {
        downcast_payload_mut(&mut self.state.payload)
    }

    /// Replace the payload
    pub fn set_payload(&mut self, payload: Payload) {
        self.state.payload = Some(payload);
    }

    /// Resume a sleeping slot once this result is applied
    pub fn wake_up(&mut self) {
        self.wake = true;
    }

    pub(crate) fn is_woken(&self) -> bool {
        self.wake
    }
}

/// Result produced by an adapter, applied on the slot's side
pub struct AsyncResultFn(Box<dyn FnOnce(&mut AsyncResultContext<'_>) + Send>);

impl AsyncResultFn {
    /// Wrap a result closure
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(&mut AsyncResultContext<'_>) + Send + 'static,
    {
        AsyncResultFn(Box::new(f))
    }

    /// A result that changes nothing and wakes nobody
    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    /// A result that only wakes the slot
    pub fn wake() -> Self {
        Self::new(|ctx| ctx.wake_up())
    }

    pub(crate) fn apply(self, ctx: &mut AsyncResultContext<'_>) {
        (self.0)(ctx)
    }

    /// Apply against an empty, throwaway slot state
    #[cfg(test)]
    pub(crate) fn invoke_detached(self) {
        let mut state = SlotState::default();
        let mut ctx = AsyncResultContext::new(SlotId::UNKNOWN, &mut state);
        self.apply(&mut ctx);
    }
}

impl fmt::Debug for AsyncResultFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AsyncResultFn")
    }
}
