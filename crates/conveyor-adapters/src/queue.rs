//! Thread-pool backed adapter executor
//!
//! Calls are queued on a channel and run by the adapter's own threads against
//! a shared service value. Each call is checked for cancellation and for a
//! stale target right before it runs; a skipped call still completes, with a
//! no-op result, so the slot's in-flight accounting stays balanced.

use crate::error::AdapterError;
use conveyor_engine::{
    AdapterCall, AdapterCallback, AdapterExecutor, AdapterId, AsyncResultFn, CancelFn,
    ChainedCancel, ExecutionAdapter, StepLink,
};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

/// Queue adapter settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueAdapterConfig {
    /// Thread name prefix
    pub name: String,

    /// Processing threads
    pub thread_count: usize,

    /// Run sync calls in-line on the calling worker instead of queueing them
    pub inline_sync: bool,
}

impl Default for QueueAdapterConfig {
    fn default() -> Self {
        Self {
            name: "adapter".to_string(),
            thread_count: 1,
            inline_sync: false,
        }
    }
}

struct Job {
    link: StepLink,
    call: AdapterCall,
    callback: AdapterCallback,
    cancel: Option<ChainedCancel>,
}

/// Adapter that runs calls on its own threads
pub struct QueueAdapter<S> {
    id: AdapterId,
    service: Arc<S>,
    sender: Mutex<Option<Sender<Job>>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    inline_sync: bool,
    processed: Arc<AtomicU64>,
}

impl<S: Any + Send + Sync> QueueAdapter<S> {
    /// Start the processing threads
    pub fn start(
        id: AdapterId,
        service: S,
        config: QueueAdapterConfig,
    ) -> Result<Arc<Self>, AdapterError> {
        let (sender, receiver) = channel::unbounded();
        let service = Arc::new(service);
        let processed = Arc::new(AtomicU64::new(0));

        let mut threads = Vec::with_capacity(config.thread_count.max(1));
        for i in 0..config.thread_count.max(1) {
            let receiver = receiver.clone();
            let service = service.clone();
            let processed = processed.clone();
            let thread = thread::Builder::new()
                .name(format!("{}-{}", config.name, i))
                .spawn(move || Self::run_loop(receiver, service, processed))
                .map_err(|e| AdapterError::Spawn(e.to_string()))?;
            threads.push(thread);
        }
        log::debug!("adapter {} started with {} threads", id, threads.len());

        Ok(Arc::new(Self {
            id,
            service,
            sender: Mutex::new(Some(sender)),
            threads: Mutex::new(threads),
            inline_sync: config.inline_sync,
            processed,
        }))
    }

    /// Adapter id
    pub fn id(&self) -> &AdapterId {
        &self.id
    }

    /// Shared service
    pub fn service(&self) -> &S {
        &self.service
    }

    /// Handle for steps to prepare calls against this adapter
    pub fn execution_adapter(self: &Arc<Self>) -> ExecutionAdapter {
        ExecutionAdapter::new(self.id.clone(), self.clone())
    }

    /// Calls run (or skipped) so far
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Acquire)
    }

    /// Calls waiting in the queue
    pub fn queued(&self) -> usize {
        self.sender.lock().as_ref().map(Sender::len).unwrap_or(0)
    }

    /// Stop accepting calls, drain the queue and join the threads
    pub fn shutdown(&self) {
        if self.sender.lock().take().is_none() {
            return;
        }
        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        for thread in threads {
            if join_other(thread).is_err() {
                log::error!("adapter {} thread panicked", self.id);
            }
        }
        log::debug!("adapter {} stopped", self.id);
    }

    fn run_loop(receiver: Receiver<Job>, service: Arc<S>, processed: Arc<AtomicU64>) {
        for job in receiver.iter() {
            Self::execute(&service, job);
            processed.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn execute(service: &S, job: Job) {
        let Job {
            link,
            call,
            callback,
            cancel,
        } = job;

        if cancel.as_ref().is_some_and(ChainedCancel::is_cancelled) {
            log::trace!("cancelled call for {:?} skipped", link);
            callback(AsyncResultFn::noop(), None);
            return;
        }
        if !link.is_at_step() {
            log::trace!("call for stale {:?} skipped", link);
            callback(AsyncResultFn::noop(), None);
            return;
        }

        match panic::catch_unwind(AssertUnwindSafe(|| call.invoke(service))) {
            Ok(result) => callback(result, None),
            Err(recovered) => {
                log::warn!("call for {:?} panicked", link);
                callback(AsyncResultFn::noop(), Some(recovered));
            }
        }
    }
}

impl<S: Any + Send + Sync> AdapterExecutor for QueueAdapter<S> {
    fn start_call(
        &self,
        link: StepLink,
        call: AdapterCall,
        callback: AdapterCallback,
        wants_cancel: bool,
    ) -> Option<CancelFn> {
        let cancel = wants_cancel.then(ChainedCancel::new);
        let cancel_fn = cancel.as_ref().map(ChainedCancel::cancel_fn);

        let job = Job {
            link,
            call,
            callback,
            cancel,
        };
        let rejected = match self.sender.lock().as_ref() {
            Some(sender) => sender.send(job).err().map(|e| e.into_inner()),
            None => Some(job),
        };

        if let Some(job) = rejected {
            log::warn!("adapter {} is stopped, call rejected", self.id);
            let reason = AdapterError::Stopped(self.id.clone()).to_string();
            (job.callback)(AsyncResultFn::noop(), Some(Box::new(reason)));
        }
        cancel_fn
    }

    fn try_sync_call(&self, call: AdapterCall) -> Result<AsyncResultFn, AdapterCall> {
        if self.inline_sync {
            Ok(call.invoke(self.service.as_ref()))
        } else {
            Err(call)
        }
    }
}

impl<S> Drop for QueueAdapter<S> {
    fn drop(&mut self) {
        // Closing the channel lets the threads drain and exit
        self.sender.get_mut().take();
        for thread in self.threads.get_mut().drain(..) {
            let _ = join_other(thread);
        }
    }
}

/// Join `thread` unless it is the current one; the last handle to an adapter
/// can be released from one of its own threads
fn join_other(thread: thread::JoinHandle<()>) -> thread::Result<()> {
    if thread.thread().id() == thread::current().id() {
        return Ok(());
    }
    thread.join()
}
