//! Cancellation token with a replaceable cancel hook.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

/// The hook run when cancellation is requested.
pub type CancelHook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct HookSlot {
    reason: Option<String>,
    hook: Option<CancelHook>,
}

/// A token for cooperative cancellation of one execution pipeline.
///
/// Each pipeline stage registers the hook that aborts its own in-flight work,
/// replacing the previous stage's hook. Cancellation runs the hook current at
/// that moment exactly once. Only the first cancellation reason is kept.
#[derive(Default)]
pub struct CancellationToken {
    cancelled: AtomicBool,
    slot: Mutex<HookSlot>,
}

impl CancellationToken {
    /// Creates a new cancellation token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    ///
    /// Returns `false` if cancellation had already been requested. A panic in
    /// the hook is logged and suppressed.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        let hook = {
            let mut slot = self.slot.lock();
            if self.cancelled.swap(true, Ordering::SeqCst) {
                return false;
            }
            slot.reason = Some(reason.into());
            slot.hook.take()
        };
        if let Some(hook) = hook {
            run_hook(hook);
        }
        true
    }

    /// Registers the hook for the current stage, replacing any previous one.
    ///
    /// If cancellation was already requested the hook runs immediately.
    pub fn set_cancel_hook<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut slot = self.slot.lock();
            if !self.cancelled.load(Ordering::SeqCst) {
                slot.hook = Some(Box::new(hook));
                return;
            }
        }
        run_hook(Box::new(hook));
    }

    /// Removes the current hook without running it.
    pub fn clear_cancel_hook(&self) {
        self.slot.lock().hook = None;
    }

    /// Returns whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns the cancellation reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.slot.lock().reason.clone()
    }
}

fn run_hook(hook: CancelHook) {
    if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(hook)) {
        warn!("Cancel hook panicked: {:?}", e);
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}
