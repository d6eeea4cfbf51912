//! Conveyor Engine
//!
//! The execution core of a ledger node:
//! - **Slot machine**: slots, step links, the worker pool and the `Machine`
//!   that schedules them (`smachine` module)
//! - **Adapter protocol**: sync and async calls into external executors with
//!   cooperative cancellation (`smachine` module)
//! - **Configuration** and **logging** bootstrap (`config`, `logging`)
//!
//! # Example
//!
//! ```rust,ignore
//! use conveyor_engine::{Machine, MachineConfig, StateMachine, StepOutcome};
//! use std::time::Duration;
//!
//! let sm = StateMachine::builder(1, "hello")
//!     .step("greet", |_| Ok(StepOutcome::complete().with_value("hello")))
//!     .build();
//!
//! let mut machine = Machine::new(MachineConfig::with_workers(2));
//! machine.start()?;
//! let link = machine.add_slot(sm, None, None)?;
//! let outcome = machine.wait_slot(link.slot_id(), Duration::from_secs(1));
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod logging;
pub mod smachine;

pub use config::{ConfigError, MachineConfig};
pub use smachine::{
    AdapterCall, AdapterCallContext, AdapterCallback, AdapterExecutor, AdapterId, AdapterTask,
    AsyncResultContext, AsyncResultFn, CancelFn, ChainedCancel, ExecutionAdapter,
    ExecutionContext, Machine, MachineError, MachineStats, SlotError, SlotId, SlotLink,
    SlotOutcome, StateMachine, StepLink, StepOutcome, TransitionError,
};
