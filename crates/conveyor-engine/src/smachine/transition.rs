//! State machine definitions and step outcomes
//!
//! A state machine is a fixed, ordered list of steps. The scheduler runs one
//! step per turn and applies the returned [`StepOutcome`] before the slot's
//! next turn.

use crate::smachine::adapter::ConditionalUpdate;
use crate::smachine::context::ExecutionContext;
use crate::smachine::error::TransitionError;
use crate::smachine::Payload;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Step transition function
pub type TransitionFn =
    Arc<dyn Fn(&mut ExecutionContext<'_>) -> Result<StepOutcome, TransitionError> + Send + Sync>;

/// What a parked slot does once it is woken
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Resume {
    /// Run the same step again
    Repeat,
    /// Move to another step
    Jump(usize),
}

/// Where the slot goes after a step
pub enum Next {
    /// Move to the given step (a new step generation) and run it
    Jump(usize),
    /// Yield, then run the same step again
    Repeat,
    /// Park until an applied result wakes the slot
    Sleep {
        /// Action once woken
        then: Resume,
    },
    /// Park and issue the deferred adapter call
    Wait {
        /// Deferred call built by `AdapterCallContext::wait`
        update: ConditionalUpdate,
        /// Action once woken
        then: Resume,
    },
    /// The task is finished
    Complete,
}

impl fmt::Debug for Next {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Next::Jump(step) => write!(f, "Jump({})", step),
            Next::Repeat => f.write_str("Repeat"),
            Next::Sleep { then } => write!(f, "Sleep({:?})", then),
            Next::Wait { then, .. } => write!(f, "Wait({:?})", then),
            Next::Complete => f.write_str("Complete"),
        }
    }
}

/// Result of one step: the next payload (if replaced) and where to go
#[derive(Debug)]
pub struct StepOutcome {
    pub(crate) payload: Option<Payload>,
    pub(crate) next: Next,
}

impl StepOutcome {
    fn new(next: Next) -> Self {
        Self {
            payload: None,
            next,
        }
    }

    /// Continue at `step`
    pub fn jump(step: usize) -> Self {
        Self::new(Next::Jump(step))
    }

    /// Run this step again on a later turn
    pub fn repeat() -> Self {
        Self::new(Next::Repeat)
    }

    /// Sleep, then repeat this step when woken
    pub fn sleep() -> Self {
        Self::new(Next::Sleep {
            then: Resume::Repeat,
        })
    }

    /// Sleep, then continue at `step` when woken
    pub fn sleep_then(step: usize) -> Self {
        Self::new(Next::Sleep {
            then: Resume::Jump(step),
        })
    }

    /// Issue the deferred call, then repeat this step when woken
    pub fn wait(update: ConditionalUpdate) -> Self {
        Self::new(Next::Wait {
            update,
            then: Resume::Repeat,
        })
    }

    /// Issue the deferred call, then continue at `step` when woken
    pub fn wait_then(update: ConditionalUpdate, step: usize) -> Self {
        Self::new(Next::Wait {
            update,
            then: Resume::Jump(step),
        })
    }

    /// Finish the task
    pub fn complete() -> Self {
        Self::new(Next::Complete)
    }

    /// Replace the slot payload with `payload`
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Replace the slot payload with `value`
    pub fn with_value<T: Any + Send>(self, value: T) -> Self {
        self.with_payload(Box::new(value))
    }

    /// Where the slot goes next
    pub fn next(&self) -> &Next {
        &self.next
    }
}

/// One step of a state machine
pub struct Step {
    name: String,
    transition: Option<TransitionFn>,
}

impl Step {
    /// Step name, for logs
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Transition, if the step defines one
    pub fn transition(&self) -> Option<&TransitionFn> {
        self.transition.as_ref()
    }
}

/// Fixed, ordered sequence of steps
pub struct StateMachine {
    id: u32,
    name: String,
    steps: Vec<Step>,
}

impl StateMachine {
    /// Start building a state machine
    pub fn builder(id: u32, name: impl Into<String>) -> StateMachineBuilder {
        StateMachineBuilder {
            id,
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// State machine id
    pub fn id(&self) -> u32 {
        self.id
    }

    /// State machine name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of steps
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Step at `index`
    pub fn step(&self, index: usize) -> Option<&Step> {
        self.steps.get(index)
    }
}

impl fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("steps", &self.steps.iter().map(Step::name).collect::<Vec<_>>())
            .finish()
    }
}

/// Builder for [`StateMachine`]
pub struct StateMachineBuilder {
    id: u32,
    name: String,
    steps: Vec<Step>,
}

impl StateMachineBuilder {
    /// Append a step
    pub fn step<F>(mut self, name: impl Into<String>, transition: F) -> Self
    where
        F: Fn(&mut ExecutionContext<'_>) -> Result<StepOutcome, TransitionError>
            + Send
            + Sync
            + 'static,
    {
        self.steps.push(Step {
            name: name.into(),
            transition: Some(Arc::new(transition)),
        });
        self
    }

    /// Append a step without a transition; reaching it fails the slot
    pub fn empty_step(mut self, name: impl Into<String>) -> Self {
        self.steps.push(Step {
            name: name.into(),
            transition: None,
        });
        self
    }

    /// Finish the definition
    pub fn build(self) -> Arc<StateMachine> {
        Arc::new(StateMachine {
            id: self.id,
            name: self.name,
            steps: self.steps,
        })
    }
}
