//! Conveyor Adapters
//!
//! Adapter executors that plug into the conveyor engine's call protocol:
//! - **Queue adapter**: runs calls against a shared service on its own
//!   thread pool (`queue` module)
//! - **Waiter**: a processor that waits for a requested period (`waiter` module)

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod error;
pub mod queue;
pub mod waiter;

pub use error::AdapterError;
pub use queue::{QueueAdapter, QueueAdapterConfig};
pub use waiter::{new_wait_adapter, process_call, Processor, Waiter, WaiterTask};
