//! Chained, idempotent cancellation
//!
//! A [`ChainedCancel`] fires at most once. Whatever was attached with
//! [`ChainedCancel::set_chain`] is invoked exactly once: either by the first
//! `cancel()`, or immediately by `set_chain` when the token is already
//! cancelled.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Callable that requests cancellation of something
pub type CancelFn = Arc<dyn Fn() + Send + Sync>;

struct Inner {
    cancelled: AtomicBool,
    chain: Mutex<Option<CancelFn>>,
}

/// Cancellation token with a downstream cancel function
#[derive(Clone)]
pub struct ChainedCancel {
    inner: Arc<Inner>,
}

impl ChainedCancel {
    /// Create an un-triggered token
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                chain: Mutex::new(None),
            }),
        }
    }

    /// Trigger cancellation. Repeated calls are no-ops.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let chained = self.inner.chain.lock().take();
        if let Some(chained) = chained {
            chained();
        }
    }

    /// True once `cancel` has been called
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Attach the function to call on cancellation, replacing any previous
    /// one. Fires right away if the token is already cancelled.
    pub fn set_chain(&self, chained: CancelFn) {
        {
            let mut slot = self.inner.chain.lock();
            if !self.is_cancelled() {
                *slot = Some(chained);
                return;
            }
        }
        chained();
    }

    /// Cancel `child` whenever this token is cancelled
    pub fn chain_to(&self, child: &ChainedCancel) {
        self.set_chain(child.cancel_fn());
    }

    /// A function that cancels this token
    pub fn cancel_fn(&self) -> CancelFn {
        let token = self.clone();
        Arc::new(move || token.cancel())
    }
}

impl Default for ChainedCancel {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ChainedCancel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainedCancel")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
