//! Adapter call protocol
//!
//! A step reaches an external adapter through a single-use
//! [`AdapterCallContext`]. Configuration methods consume the context and return
//! a modified copy; terminal methods (`start`, `wait`, `try_call`, `call`)
//! dispose it. Any use after disposal, or a terminal method of the wrong mode,
//! panics with [`IllegalState`].
//!
//! Async calls are delivered back through the Machine and re-located with a
//! step link: exact-step links drop results that arrive after the slot moved
//! on, any-step links deliver to whatever step the slot is on. Sync calls block
//! only the calling worker, on that worker's condition variable.

use crate::smachine::cancel::{CancelFn, ChainedCancel};
use crate::smachine::context::{AsyncResultFn, ContextMarker, ExecutionContext};
use crate::smachine::error::{CallAborted, IllegalState};
use crate::smachine::machine::MachineShared;
use crate::smachine::slot::Slot;
use crate::smachine::slot_link::StepLink;
use crate::smachine::transition::StepOutcome;
use crate::smachine::Recovered;
use std::any::{type_name, Any};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Adapter identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct AdapterId(String);

impl AdapterId {
    /// Create an adapter id
    pub fn new(id: impl Into<String>) -> Self {
        AdapterId(id.into())
    }

    /// True for the empty id
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Id text
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AdapterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque task handed to an adapter's processing function
pub struct AdapterTask {
    /// Adapter the task is addressed to
    pub adapter_id: AdapterId,
    /// Adapter-defined payload
    pub payload: Box<dyn Any + Send>,
}

impl AdapterTask {
    /// Create a task for `adapter_id`
    pub fn new<T: Any + Send>(adapter_id: AdapterId, payload: T) -> Self {
        Self {
            adapter_id,
            payload: Box::new(payload),
        }
    }

    /// Payload checked against `T`
    pub fn payload<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }
}

impl fmt::Debug for AdapterTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterTask")
            .field("adapter_id", &self.adapter_id)
            .finish_non_exhaustive()
    }
}

/// Adapter service as seen by a call
pub type AdapterService = dyn Any + Send + Sync;

/// Call payload: runs against the adapter's service and produces the result
/// to apply on the slot side
pub struct AdapterCall(Box<dyn FnOnce(&AdapterService) -> AsyncResultFn + Send>);

impl AdapterCall {
    /// Wrap a call over an untyped service
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(&AdapterService) -> AsyncResultFn + Send + 'static,
    {
        AdapterCall(Box::new(f))
    }

    /// Wrap a call over a service of type `S`. Running it against any other
    /// service panics inside the adapter, which reports it as recovered.
    pub fn for_service<S, F>(f: F) -> Self
    where
        S: Any + Send + Sync,
        F: FnOnce(&S) -> AsyncResultFn + Send + 'static,
    {
        Self::new(move |service| match service.downcast_ref::<S>() {
            Some(service) => f(service),
            None => panic!("adapter service is not {}", type_name::<S>()),
        })
    }

    /// Run the call
    pub fn invoke(self, service: &AdapterService) -> AsyncResultFn {
        (self.0)(service)
    }
}

impl fmt::Debug for AdapterCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AdapterCall")
    }
}

/// Completion callback given to an adapter. The recovered value, when set,
/// is a failure caught on the adapter side.
pub type AdapterCallback = Arc<dyn Fn(AsyncResultFn, Option<Recovered>) + Send + Sync>;

/// External executor behind an adapter
pub trait AdapterExecutor: Send + Sync {
    /// Dispatch `call` asynchronously and invoke `callback` with its result.
    /// `link` is where the result will be delivered. Returns a function to
    /// cancel the call when `wants_cancel` is set and cancellation is supported.
    fn start_call(
        &self,
        link: StepLink,
        call: AdapterCall,
        callback: AdapterCallback,
        wants_cancel: bool,
    ) -> Option<CancelFn>;

    /// Run `call` in-line if cheap enough; hand it back otherwise.
    fn try_sync_call(&self, call: AdapterCall) -> Result<AsyncResultFn, AdapterCall> {
        Err(call)
    }
}

/// Binds an adapter id to its executor and prepares calls from steps
#[derive(Clone)]
pub struct ExecutionAdapter {
    adapter_id: AdapterId,
    executor: Arc<dyn AdapterExecutor>,
}

impl ExecutionAdapter {
    /// Create an adapter over `executor`
    pub fn new(adapter_id: AdapterId, executor: Arc<dyn AdapterExecutor>) -> Self {
        Self {
            adapter_id,
            executor,
        }
    }

    /// True if the adapter has no id
    pub fn is_empty(&self) -> bool {
        self.adapter_id.is_empty()
    }

    /// Adapter id
    pub fn adapter_id(&self) -> &AdapterId {
        &self.adapter_id
    }

    /// Prepare a call that blocks the current worker for its result
    pub fn prepare_sync<'c, 'a>(
        &self,
        ctx: &'c mut ExecutionContext<'a>,
        call: AdapterCall,
    ) -> AdapterCallContext<'c, 'a> {
        AdapterCallContext::new(ctx, call, self.executor.clone(), CallMode::SyncPending)
    }

    /// Prepare a call whose result is delivered back to the slot
    pub fn prepare_async<'c, 'a>(
        &self,
        ctx: &'c mut ExecutionContext<'a>,
        call: AdapterCall,
    ) -> AdapterCallContext<'c, 'a> {
        AdapterCallContext::new(ctx, call, self.executor.clone(), CallMode::AsyncPending)
    }
}

impl fmt::Debug for ExecutionAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionAdapter")
            .field("adapter_id", &self.adapter_id)
            .finish_non_exhaustive()
    }
}

/// Mode of a call context; moves only forward to `Disposed`
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CallMode {
    /// Prepared with `prepare_sync`
    SyncPending,
    /// Prepared with `prepare_async`
    AsyncPending,
    /// A terminal method was called
    Disposed,
}

/// Single-use builder for one adapter call
pub struct AdapterCallContext<'c, 'a> {
    ctx: &'c mut ExecutionContext<'a>,
    call: Option<AdapterCall>,
    executor: Arc<dyn AdapterExecutor>,
    mode: CallMode,

    step_bound: bool,
    cancel: Option<ChainedCancel>,
}

impl<'c, 'a> AdapterCallContext<'c, 'a> {
    fn new(
        ctx: &'c mut ExecutionContext<'a>,
        call: AdapterCall,
        executor: Arc<dyn AdapterExecutor>,
        mode: CallMode,
    ) -> Self {
        Self {
            ctx,
            call: Some(call),
            executor,
            mode,
            step_bound: false,
            cancel: None,
        }
    }

    /// Current mode
    pub fn mode(&self) -> CallMode {
        self.mode
    }

    fn discard(&mut self) {
        self.mode = CallMode::Disposed;
    }

    fn ensure_mode(&self, mode: CallMode) {
        if self.mode != mode {
            std::panic::panic_any(IllegalState(match self.mode {
                CallMode::Disposed => "call context already disposed",
                _ => "call context used in the wrong mode",
            }));
        }
    }

    fn ensure_live(&self) {
        if self.mode == CallMode::Disposed {
            std::panic::panic_any(IllegalState("call context already disposed"));
        }
    }

    /// Make the call cancellable. Returns the context with a cancel token
    /// attached and the function that triggers it. Calling it again reuses
    /// the same token.
    pub fn get_cancel(mut self) -> (Self, CancelFn) {
        self.ensure_live();
        let cancel = self.cancel.get_or_insert_with(ChainedCancel::new);
        let cancel_fn = cancel.cancel_fn();
        (self, cancel_fn)
    }

    /// Scope the result to the current step (`true`) or to the slot
    /// instance at whatever step it reaches (`false`, the default)
    pub fn cancel_on_step(mut self, attach: bool) -> Self {
        self.ensure_live();
        self.step_bound = attach;
        self
    }

    /// Fire the call and return without waiting
    pub fn start(&mut self) {
        self.ensure_mode(CallMode::AsyncPending);
        self.discard();

        let launch = self.take_launch();
        if launch.launch(self.ctx.slot()) {
            self.ctx.count_async_call();
        }
    }

    /// Defer the call until the step's outcome is applied. The call is issued
    /// only if the returned update is handed back to the scheduler from this
    /// same context.
    pub fn wait(&mut self) -> ConditionalUpdate {
        self.ensure_mode(CallMode::AsyncPending);
        self.discard();

        ConditionalUpdate {
            marker: self.ctx.marker(),
            launch: Some(self.take_launch()),
        }
    }

    /// Run the call, blocking this worker until the result is applied.
    /// Returns false if the wait was aborted.
    pub fn try_call(&mut self) -> bool {
        self.ensure_mode(CallMode::SyncPending);
        self.discard();

        self.start_sync()
    }

    /// Like [`try_call`](Self::try_call), but an abort is fatal
    pub fn call(&mut self) {
        self.ensure_mode(CallMode::SyncPending);
        self.discard();

        if !self.start_sync() {
            std::panic::panic_any(CallAborted);
        }
    }

    fn take_call(&mut self) -> AdapterCall {
        match self.call.take() {
            Some(call) => call,
            None => std::panic::panic_any(IllegalState("call payload already consumed")),
        }
    }

    fn take_launch(&mut self) -> AsyncLaunch {
        AsyncLaunch {
            executor: self.executor.clone(),
            call: self.take_call(),
            cancel: self.cancel.clone(),
            step_bound: self.step_bound,
        }
    }

    fn start_sync(&mut self) -> bool {
        match self.start_sync_with_result() {
            Some(result) => {
                let mut rc = self.ctx.result_context();
                result.apply(&mut rc);
                true
            }
            None => false,
        }
    }

    fn start_sync_with_result(&mut self) -> Option<AsyncResultFn> {
        let call = self.take_call();
        if let Some(cancel) = &self.cancel {
            if cancel.is_cancelled() {
                return None;
            }
        }

        let call = match self.executor.try_sync_call(call) {
            Ok(result) => return Some(result),
            Err(call) => call,
        };

        let link = self.ctx.slot().new_exact_step_link();
        let waiter = self.ctx.worker().get_cond()?;

        let completer = waiter.completer();
        let callback: AdapterCallback = Arc::new(move |result: AsyncResultFn, recovered: Option<Recovered>| {
            completer.complete(result, recovered);
        });
        let cancel_fn = self
            .executor
            .start_call(link, call, callback, self.cancel.is_some());

        if let Some(cancel) = &self.cancel {
            let aborter = waiter.completer();
            let adapter_cancel = cancel_fn.clone();
            cancel.set_chain(Arc::new(move || {
                aborter.abort();
                if let Some(adapter_cancel) = &adapter_cancel {
                    adapter_cancel();
                }
            }));
        }

        match waiter.wait() {
            Some((result, recovered)) => {
                if let Some(recovered) = recovered {
                    std::panic::resume_unwind(recovered);
                }
                Some(result)
            }
            None => {
                let already_cancelled = self
                    .cancel
                    .as_ref()
                    .map(ChainedCancel::is_cancelled)
                    .unwrap_or(false);
                if !already_cancelled {
                    if let Some(cancel_fn) = cancel_fn {
                        cancel_fn();
                    }
                }
                None
            }
        }
    }
}

impl fmt::Debug for AdapterCallContext<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterCallContext")
            .field("mode", &self.mode)
            .field("step_bound", &self.step_bound)
            .field("cancellable", &self.cancel.is_some())
            .finish()
    }
}

/// Everything needed to issue an async call, detached from the step context
struct AsyncLaunch {
    executor: Arc<dyn AdapterExecutor>,
    call: AdapterCall,
    cancel: Option<ChainedCancel>,
    step_bound: bool,
}

impl AsyncLaunch {
    /// Returns false if the call was cancelled before dispatch
    fn launch(self, slot: &Arc<Slot>) -> bool {
        let link = if self.step_bound {
            slot.new_exact_step_link()
        } else {
            slot.new_any_step_link()
        };

        if let Some(cancel) = &self.cancel {
            if cancel.is_cancelled() {
                return false;
            }
        }

        slot.begin_async_call();
        if let Some(machine) = slot.machine() {
            machine.note_async_call_started();
        }

        let fired = AtomicBool::new(false);
        let delivery = link.clone();
        let callback: AdapterCallback = Arc::new(move |result: AsyncResultFn, recovered: Option<Recovered>| {
            if fired.swap(true, Ordering::AcqRel) {
                log::warn!("duplicate completion for {:?} ignored", delivery);
                return;
            }
            MachineShared::complete_async_call(delivery.clone(), result, recovered);
        });

        let cancel_fn = self
            .executor
            .start_call(link, self.call, callback, self.cancel.is_some());

        if let (Some(cancel), Some(cancel_fn)) = (self.cancel, cancel_fn) {
            cancel.set_chain(cancel_fn);
        }
        true
    }
}

/// Deferred adapter call returned by [`AdapterCallContext::wait`]
pub struct ConditionalUpdate {
    marker: ContextMarker,
    launch: Option<AsyncLaunch>,
}

impl ConditionalUpdate {
    /// Marker of the context that created the update
    pub fn marker(&self) -> ContextMarker {
        self.marker
    }

    /// Park the slot, issue the call, repeat this step when woken
    pub fn then_repeat(self) -> StepOutcome {
        StepOutcome::wait(self)
    }

    /// Park the slot, issue the call, continue at `step` when woken
    pub fn then_jump(self, step: usize) -> StepOutcome {
        StepOutcome::wait_then(self, step)
    }

    /// Issue the deferred call for `slot`
    pub(crate) fn kick_off(mut self, slot: &Arc<Slot>) -> bool {
        match self.launch.take() {
            Some(launch) => launch.launch(slot),
            None => false,
        }
    }
}

impl fmt::Debug for ConditionalUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionalUpdate")
            .field("marker", &self.marker)
            .field("pending", &self.launch.is_some())
            .finish()
    }
}
