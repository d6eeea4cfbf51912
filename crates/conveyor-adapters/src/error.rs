//! Adapter errors

use conveyor_engine::AdapterId;

/// Errors reported by adapters in this crate
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    /// The task payload is not what the processor expects
    #[error("incorrect payload type for adapter {adapter}, expected {expected}")]
    IncorrectPayload {
        /// Adapter the task was addressed to
        adapter: AdapterId,
        /// Expected payload type
        expected: &'static str,
    },

    /// The adapter has been shut down
    #[error("adapter {0} is stopped")]
    Stopped(AdapterId),

    /// A processing thread could not be spawned
    #[error("failed to spawn adapter thread: {0}")]
    Spawn(String),
}
