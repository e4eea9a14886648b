//! Single-flight flag shared by the sync cycle, the scheduler and the
//! offline queue.

use std::sync::atomic::{AtomicBool, Ordering};

/// Holds a busy flag raised until dropped, including when the owning
/// future is cancelled mid-await.
#[must_use]
pub(crate) struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    /// Raises the flag, or returns `None` if it is already raised.
    pub(crate) fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        if flag.swap(true, Ordering::SeqCst) {
            None
        } else {
            Some(Self(flag))
        }
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
