//! Slot Machine: cooperative scheduler core
//!
//! Many lightweight slots, each walking through the steps of a
//! [`StateMachine`], are multiplexed over a small pool of worker threads.
//! Long-latency work is delegated to adapters through the call protocol in
//! [`ExecutionAdapter`], either blocking only the calling worker (sync) or
//! handing the result back later (async).

mod adapter;
mod cancel;
mod context;
mod error;
mod machine;
mod slot;
mod slot_link;
mod transition;
mod worker;

pub use adapter::{
    AdapterCall, AdapterCallContext, AdapterCallback, AdapterExecutor, AdapterId, AdapterService,
    AdapterTask, CallMode, ConditionalUpdate, ExecutionAdapter,
};
pub use cancel::{CancelFn, ChainedCancel};
pub use context::{AsyncResultContext, AsyncResultFn, ContextMarker, ExecutionContext};
pub use error::{CallAborted, IllegalState, MachineError, SlotError, TransitionError};
pub use machine::{Machine, MachineStats, SlotOutcome};
pub use slot::{Slot, SlotStatus};
pub use slot_link::{SlotId, SlotLink, StepLink, StepMatch};
pub use transition::{
    Next, Resume, StateMachine, StateMachineBuilder, Step, StepOutcome, TransitionFn,
};
pub use worker::{CallWaiter, WorkerHandle};

use std::any::Any;

/// Slot payload, owned and interpreted by the state machine
pub type Payload = Box<dyn Any + Send>;

/// Input event a slot is created with
pub type Event = Box<dyn Any + Send>;

/// Panic value caught on the adapter side of a call
pub type Recovered = Box<dyn Any + Send>;
