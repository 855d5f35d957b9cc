//! Teardown at the end of the process (or any scope the caller chooses).

use std::sync::Arc;

use crate::cache::TeardownReport;
use crate::manager::ConnectionManager;

/// Clears its manager's cache when dropped, if armed.
///
/// Obtained from [`ConnectionManager::register_exit_hook`]. Keep it alive in
/// `main`; dropping it at the end of `main` (or while unwinding) closes every
/// cached handle. Close failures are logged, never raised.
#[derive(Debug)]
#[must_use = "the cache is cleared when the guard is dropped"]
pub struct LifecycleGuard {
    manager: Arc<ConnectionManager>,
    armed: bool,
}

impl LifecycleGuard {
    pub(crate) const fn new(manager: Arc<ConnectionManager>, armed: bool) -> Self {
        Self { manager, armed }
    }

    pub const fn is_armed(&self) -> bool {
        self.armed
    }

    /// Clear now. The guard stays armed; the cache may be repopulated and
    /// is cleared again on drop.
    pub fn clear(&self) -> TeardownReport {
        self.manager.clear()
    }

    /// Give up teardown on drop.
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for LifecycleGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::debug!("Running exit teardown");
        // The blocking driver must not be torn down on a runtime thread.
        if tokio::runtime::Handle::try_current().is_ok() {
            let manager = Arc::clone(&self.manager);
            if std::thread::spawn(move || manager.clear()).join().is_err() {
                tracing::warn!("Exit teardown panicked");
            }
        } else {
            self.manager.clear();
        }
    }
}
