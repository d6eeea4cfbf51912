//! Error types of the slot machine

use std::any::Any;

/// Error returned by a step transition; terminates only its own slot
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    /// The input event is not of the type the step expects
    #[error("wrong input event type, expected {expected}")]
    WrongInputEvent {
        /// Expected type name
        expected: &'static str,
    },

    /// The payload is missing or not of the type the step expects
    #[error("wrong payload type, expected {expected}")]
    WrongPayload {
        /// Expected type name
        expected: &'static str,
    },

    /// Step-defined failure
    #[error("{0}")]
    Failed(String),
}

/// Why a slot terminated unsuccessfully
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SlotError {
    /// A transition returned an error
    #[error("transition failed at step {step}: {source}")]
    Transition {
        /// Step index that failed
        step: usize,
        /// Underlying error
        #[source]
        source: TransitionError,
    },

    /// A step panicked
    #[error("step {step} panicked: {message}")]
    Panicked {
        /// Step index that panicked
        step: usize,
        /// Panic message, if it carried one
        message: String,
    },

    /// An adapter reported a recovered failure for an async call
    #[error("adapter failure: {0}")]
    AdapterFailure(String),

    /// The step index points past the end of the state machine
    #[error("step index {index} out of range ({count} steps)")]
    StepOutOfRange {
        /// Requested index
        index: usize,
        /// Number of steps defined
        count: usize,
    },

    /// The step exists but has no transition
    #[error("step {0} has no transition")]
    MissingTransition(usize),

    /// The machine stopped before the slot finished
    #[error("machine stopped")]
    Stopped,
}

/// Errors reported by the Machine API
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MachineError {
    /// `max_slots` live slots already exist
    #[error("slot limit reached ({0})")]
    SlotLimitReached(usize),

    /// The state machine has no steps
    #[error("state machine {0:?} has no steps")]
    EmptyStateMachine(String),

    /// The machine has been shut down
    #[error("machine is shut down")]
    ShutDown,

    /// A worker thread could not be spawned
    #[error("failed to spawn worker: {0}")]
    Spawn(String),
}

/// Panic payload for violated call-protocol invariants. Never recovered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal state: {0}")]
pub struct IllegalState(pub &'static str);

/// Panic payload raised by `Call` when the call was aborted. Never recovered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("call was cancelled")]
pub struct CallAborted;

/// True for panic payloads that must not be turned into a slot failure
pub(crate) fn is_fatal(payload: &(dyn Any + Send)) -> bool {
    payload.is::<IllegalState>() || payload.is::<CallAborted>()
}

/// Best-effort text of a panic or recovered payload
pub(crate) fn describe_payload(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    if let Some(e) = payload.downcast_ref::<IllegalState>() {
        return e.to_string();
    }
    if let Some(e) = payload.downcast_ref::<CallAborted>() {
        return e.to_string();
    }
    "non-string panic payload".to_string()
}
