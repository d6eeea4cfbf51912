//! Logging bootstrap
//!
//! The crate logs through the `log` facade. Binaries and tests that want to
//! see the output call [`initialize`] once; the level comes from `RUST_LOG`,
//! falling back to `warn`.

use flexi_logger::{Logger, LoggerHandle};
use once_cell::sync::OnceCell;
use std::sync::Once;

/// Default log spec when `RUST_LOG` is unset
pub const DEFAULT_LOG_SPEC: &str = "warn";

/// Guardian to the logging initialize function
static INIT_LOG: Once = Once::new();

/// Keeps the logger alive for the whole process
static HANDLE: OnceCell<LoggerHandle> = OnceCell::new();

/// Install the global logger. Safe to call more than once.
pub fn initialize() {
    INIT_LOG.call_once(|| {
        let started = Logger::try_with_env_or_str(DEFAULT_LOG_SPEC).and_then(|logger| logger.start());
        match started {
            Ok(handle) => {
                let _ = HANDLE.set(handle);
            }
            // Another logger was installed first
            Err(e) => eprintln!("conveyor: logging not initialized: {}", e),
        }
    });
}

/// True once [`initialize`] installed the logger
pub fn is_initialized() -> bool {
    HANDLE.get().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_twice() {
        initialize();
        initialize();
        log::debug!("logging initialized: {}", is_initialized());
    }
}
