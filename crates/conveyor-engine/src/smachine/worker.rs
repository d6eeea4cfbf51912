//! Worker threads that execute slot steps
//!
//! Workers pick up slots from their local deque, refill from the global
//! injector or steal from siblings, then run one step per turn. Each worker
//! also owns the condition variable that a synchronous adapter call blocks
//! on, so an emergency stop can wake every blocked worker at once.

use crate::smachine::context::AsyncResultFn;
use crate::smachine::machine::MachineShared;
use crate::smachine::slot::Slot;
use crate::smachine::Recovered;
use crossbeam_deque::{Injector, Steal, Stealer, Worker as CWorker};
use parking_lot::{Condvar, Mutex};
use rand::Rng;
use std::iter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Result handed from an adapter completion to a blocked worker
pub(crate) type CallResult = (AsyncResultFn, Option<Recovered>);

/// Progress of the synchronous call currently owning the condition
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum CallState {
    Idle,
    Pending,
    Completed,
    Aborted,
}

struct CondState {
    /// Identifies the current call; completions of older calls are ignored
    seq: u64,
    call: CallState,
    result: Option<CallResult>,
    stopping: bool,
}

/// Per-worker lock and condition variable used by synchronous adapter calls
pub(crate) struct WorkerCond {
    state: Mutex<CondState>,
    cond: Condvar,
}

impl WorkerCond {
    fn new() -> Self {
        Self {
            state: Mutex::new(CondState {
                seq: 0,
                call: CallState::Idle,
                result: None,
                stopping: false,
            }),
            cond: Condvar::new(),
        }
    }
}

struct WorkerShared {
    id: usize,
    cond: WorkerCond,
    shutdown: AtomicBool,
}

/// Cheap handle to a worker, given to execution contexts
#[derive(Clone)]
pub struct WorkerHandle {
    shared: Arc<WorkerShared>,
}

impl WorkerHandle {
    /// Create a handle that is not attached to a running thread
    pub fn new(id: usize) -> Self {
        Self {
            shared: Arc::new(WorkerShared {
                id,
                cond: WorkerCond::new(),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// Worker ID
    pub fn id(&self) -> usize {
        self.shared.id
    }

    /// Prepare the worker's condition for one synchronous call.
    ///
    /// Returns `None` once the worker is stopping; no blocking wait should be
    /// attempted then.
    pub fn get_cond(&self) -> Option<CallWaiter> {
        let mut state = self.shared.cond.state.lock();
        if state.stopping {
            return None;
        }
        state.seq = state.seq.wrapping_add(1);
        state.call = CallState::Pending;
        state.result = None;
        Some(CallWaiter {
            worker: self.clone(),
            seq: state.seq,
        })
    }

    /// Wake every call blocked on this worker and refuse new ones
    pub fn emergency_stop(&self) {
        let mut state = self.shared.cond.state.lock();
        state.stopping = true;
        self.shared.cond.cond.notify_all();
    }

    /// True after `emergency_stop`
    pub fn is_stopping(&self) -> bool {
        self.shared.cond.state.lock().stopping
    }

    fn request_shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
    }

    fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }
}

/// One synchronous call waiting on a worker's condition
pub struct CallWaiter {
    worker: WorkerHandle,
    seq: u64,
}

impl CallWaiter {
    /// Completion side; only the first invocation records a result
    pub(crate) fn completer(&self) -> CallCompleter {
        CallCompleter {
            worker: self.worker.clone(),
            seq: self.seq,
        }
    }

    /// Block until a completion arrives or the worker is stopped.
    ///
    /// On abort the call is marked aborted under the lock, so a completion
    /// racing with the stop is discarded.
    pub(crate) fn wait(self) -> Option<CallResult> {
        let cond = &self.worker.shared.cond;
        let mut state = cond.state.lock();
        while state.seq == self.seq && state.call == CallState::Pending && !state.stopping {
            cond.cond.wait(&mut state);
        }

        if state.seq == self.seq && state.call == CallState::Completed {
            state.call = CallState::Idle;
            return state.result.take();
        }

        // Cond can be triggered by the worker for emergency stop
        if state.seq == self.seq {
            state.call = CallState::Aborted;
            state.result = None;
        }
        None
    }
}

/// Delivers a result to a blocked [`CallWaiter`]
#[derive(Clone)]
pub(crate) struct CallCompleter {
    worker: WorkerHandle,
    seq: u64,
}

impl CallCompleter {
    /// Returns true if this invocation's result was recorded
    pub(crate) fn complete(&self, result: AsyncResultFn, recovered: Option<Recovered>) -> bool {
        let cond = &self.worker.shared.cond;
        let mut state = cond.state.lock();
        if state.seq != self.seq || state.call != CallState::Pending {
            return false;
        }
        state.result = Some((result, recovered));
        state.call = CallState::Completed;
        cond.cond.notify_all();
        true
    }

    /// Abort the waiting call, if it is still pending
    pub(crate) fn abort(&self) {
        let cond = &self.worker.shared.cond;
        let mut state = cond.state.lock();
        if state.seq == self.seq && state.call == CallState::Pending {
            state.call = CallState::Aborted;
            state.result = None;
            cond.cond.notify_all();
        }
    }
}

/// Worker thread that executes slots
pub(crate) struct Worker {
    /// Handle shared with execution contexts
    handle: WorkerHandle,

    /// Local deque, moved into the thread on start
    local: Option<CWorker<Arc<Slot>>>,

    /// Stealers from other workers
    stealers: Vec<Stealer<Arc<Slot>>>,

    /// Shared machine state
    machine: Arc<MachineShared>,

    /// Worker thread handle
    thread: Option<thread::JoinHandle<()>>,
}

impl Worker {
    /// Create a new Worker
    pub(crate) fn new(
        id: usize,
        local: CWorker<Arc<Slot>>,
        stealers: Vec<Stealer<Arc<Slot>>>,
        machine: Arc<MachineShared>,
    ) -> Self {
        Self {
            handle: WorkerHandle::new(id),
            local: Some(local),
            stealers,
            machine,
            thread: None,
        }
    }

    pub(crate) fn handle(&self) -> &WorkerHandle {
        &self.handle
    }

    /// Start the worker thread
    pub(crate) fn start(&mut self) -> std::io::Result<()> {
        let local = match self.local.take() {
            Some(local) => local,
            None => return Ok(()),
        };
        let handle = self.handle.clone();
        let stealers = self.stealers.clone();
        let machine = self.machine.clone();

        let thread = thread::Builder::new()
            .name(format!("conveyor-worker-{}", handle.id()))
            .spawn(move || {
                Worker::run_loop(handle, local, stealers, machine);
            })?;

        self.thread = Some(thread);
        Ok(())
    }

    /// Stop the worker thread, waking it first if it is blocked in a call
    pub(crate) fn stop(&mut self) {
        self.handle.request_shutdown();
        self.handle.emergency_stop();

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("worker {} terminated by a fatal panic", self.handle.id());
            }
        }
    }

    /// Worker thread main loop
    fn run_loop(
        handle: WorkerHandle,
        local: CWorker<Arc<Slot>>,
        stealers: Vec<Stealer<Arc<Slot>>>,
        machine: Arc<MachineShared>,
    ) {
        log::debug!("worker {} started", handle.id());
        let idle = Duration::from_micros(machine.config().idle_sleep_micros);

        while !handle.is_shutdown() {
            match Self::next_slot(&local, &stealers, machine.injector()) {
                Some(slot) => {
                    if let Some(again) = machine.run_slot(&slot, &handle) {
                        local.push(again);
                    }
                }
                None => thread::sleep(idle),
            }
        }

        log::debug!("worker {} shutting down", handle.id());
    }

    /// Own deque first; otherwise refill from the injector or take one slot
    /// from a sibling, retrying while either source reports contention
    fn next_slot(
        local: &CWorker<Arc<Slot>>,
        stealers: &[Stealer<Arc<Slot>>],
        injector: &Injector<Arc<Slot>>,
    ) -> Option<Arc<Slot>> {
        local.pop().or_else(|| {
            iter::repeat_with(|| {
                injector
                    .steal_batch_and_pop(local)
                    .or_else(|| Self::steal_sibling(stealers))
            })
            .find(|attempt| !attempt.is_retry())
            .and_then(Steal::success)
        })
    }

    /// One attempt over every sibling, starting at a random one
    fn steal_sibling(stealers: &[Stealer<Arc<Slot>>]) -> Steal<Arc<Slot>> {
        if stealers.is_empty() {
            return Steal::Empty;
        }
        let first = rand::thread_rng().gen_range(0..stealers.len());
        stealers[first..]
            .iter()
            .chain(&stealers[..first])
            .map(Stealer::steal)
            .collect()
    }

    /// Check if the worker is running
    pub(crate) fn is_running(&self) -> bool {
        let alive = self
            .thread
            .as_ref()
            .is_some_and(|thread| !thread.is_finished());
        alive && !self.handle.is_shutdown()
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smachine::context::AsyncResultFn;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn noop_result() -> AsyncResultFn {
        AsyncResultFn::new(|_| {})
    }

    #[test]
    fn test_next_slot_sources() {
        let injector = Injector::new();
        let local = CWorker::new_lifo();
        let sibling = CWorker::new_lifo();
        let stealers = vec![sibling.stealer()];

        assert!(Worker::next_slot(&local, &stealers, &injector).is_none());

        let stolen = Arc::new(Slot::detached());
        sibling.push(stolen.clone());
        let found = Worker::next_slot(&local, &stealers, &injector).unwrap();
        assert!(Arc::ptr_eq(&found, &stolen));

        injector.push(Arc::new(Slot::detached()));
        injector.push(Arc::new(Slot::detached()));
        assert!(Worker::next_slot(&local, &stealers, &injector).is_some());
        assert!(Worker::next_slot(&local, &stealers, &injector).is_some());
        assert!(injector.is_empty());
        assert!(local.is_empty());
        assert!(Worker::next_slot(&local, &stealers, &injector).is_none());
    }

    #[test]
    fn test_completion_before_wait() {
        let worker = WorkerHandle::new(0);
        let waiter = worker.get_cond().expect("worker is not stopping");
        assert!(waiter.completer().complete(noop_result(), None));

        let result = waiter.wait();
        assert!(result.is_some());
    }

    #[test]
    fn test_completion_from_other_thread() {
        let worker = WorkerHandle::new(0);
        let waiter = worker.get_cond().unwrap();
        let completer = waiter.completer();

        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            completer.complete(noop_result(), None)
        });

        assert!(waiter.wait().is_some());
        assert!(t.join().unwrap());
    }

    #[test]
    fn test_second_completion_is_ignored() {
        let applied = Arc::new(AtomicUsize::new(0));
        let worker = WorkerHandle::new(0);
        let waiter = worker.get_cond().unwrap();
        let completer = waiter.completer();

        let counting = |applied: &Arc<AtomicUsize>| {
            let applied = applied.clone();
            AsyncResultFn::new(move |_| {
                applied.fetch_add(1, Ordering::SeqCst);
            })
        };

        assert!(completer.complete(counting(&applied), None));
        assert!(!completer.complete(counting(&applied), None));

        let (result, recovered) = waiter.wait().unwrap();
        assert!(recovered.is_none());
        result.invoke_detached();
        assert_eq!(applied.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_emergency_stop_unblocks_wait() {
        let worker = WorkerHandle::new(3);
        let waiter = worker.get_cond().unwrap();
        let stopper = worker.clone();

        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            stopper.emergency_stop();
        });

        let started = Instant::now();
        assert!(waiter.wait().is_none());
        assert!(started.elapsed() < Duration::from_secs(5));
        t.join().unwrap();

        assert!(worker.is_stopping());
        assert!(worker.get_cond().is_none());
    }

    #[test]
    fn test_late_completion_after_abort_is_dropped() {
        let worker = WorkerHandle::new(0);
        let waiter = worker.get_cond().unwrap();
        let completer = waiter.completer();
        worker.emergency_stop();

        assert!(waiter.wait().is_none());
        assert!(!completer.complete(noop_result(), None));
    }

    #[test]
    fn test_abort_wakes_waiter() {
        let worker = WorkerHandle::new(0);
        let waiter = worker.get_cond().unwrap();
        let completer = waiter.completer();
        let aborter = waiter.completer();

        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            aborter.abort();
        });

        assert!(waiter.wait().is_none());
        t.join().unwrap();
        assert!(!completer.complete(noop_result(), None));
        // The worker itself is still usable
        assert!(worker.get_cond().is_some());
    }

    #[test]
    fn test_stale_completer_cannot_complete_next_call() {
        let worker = WorkerHandle::new(0);
        let first = worker.get_cond().unwrap();
        let stale = first.completer();
        drop(first);

        let second = worker.get_cond().unwrap();
        assert!(!stale.complete(noop_result(), None));
        assert!(second.completer().complete(noop_result(), None));
        assert!(second.wait().is_some());
    }
}
