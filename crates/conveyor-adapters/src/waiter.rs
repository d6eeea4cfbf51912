//! Processors and the waiting adapter

use crate::error::AdapterError;
use crate::queue::{QueueAdapter, QueueAdapterConfig};
use conveyor_engine::{AdapterCall, AdapterId, AdapterTask, AsyncResultContext, AsyncResultFn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Work performed by a queue adapter for one [`AdapterTask`]
pub trait Processor: Send + Sync + 'static {
    /// Result handed back to the slot
    type Output: Send + 'static;

    /// Process one task
    fn process(&self, task: &AdapterTask) -> Self::Output;
}

/// Build a call that runs `task` through processor `P` and hands its output
/// to `apply` on the slot side
pub fn process_call<P, F>(task: AdapterTask, apply: F) -> AdapterCall
where
    P: Processor,
    F: FnOnce(&mut AsyncResultContext<'_>, P::Output) + Send + 'static,
{
    AdapterCall::for_service::<P, _>(move |processor| {
        let output = processor.process(&task);
        AsyncResultFn::new(move |ctx| apply(ctx, output))
    })
}

/// Task for the waiting adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaiterTask {
    /// How long to wait
    pub wait_period_millis: u64,
}

impl WaiterTask {
    /// Wait for `millis` milliseconds
    pub fn new(millis: u64) -> Self {
        Self {
            wait_period_millis: millis,
        }
    }
}

/// Processor that sleeps for the requested period
#[derive(Debug, Default)]
pub struct Waiter;

impl Processor for Waiter {
    type Output = Result<String, AdapterError>;

    fn process(&self, task: &AdapterTask) -> Self::Output {
        log::info!("[ Waiter::process ] start");

        let payload = task
            .payload::<WaiterTask>()
            .ok_or_else(|| AdapterError::IncorrectPayload {
                adapter: task.adapter_id.clone(),
                expected: "WaiterTask",
            })?;

        thread::sleep(Duration::from_millis(payload.wait_period_millis));
        let msg = format!(
            "Work completed successfully. Waited {} millisecond",
            payload.wait_period_millis
        );
        log::info!("[ Waiter::process ] {}", msg);
        Ok(msg)
    }
}

/// Start a queue adapter running [`Waiter`]
pub fn new_wait_adapter(
    id: AdapterId,
    config: QueueAdapterConfig,
) -> Result<Arc<QueueAdapter<Waiter>>, AdapterError> {
    QueueAdapter::start(id, Waiter, config)
}
