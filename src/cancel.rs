//! Cooperative cancellation.
//!
//! A [`CancelToken`] is a clonable fire-once flag. It is used to abandon an
//! in-flight command call; the same shape (atomic flag plus `Notify`) backs
//! the per-cycle completion signal of a scan operation.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio::sync::Notify;

/// A clonable cancellation token.
///
/// Clones share the same cancellation state.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    /// Create a new, non-cancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel this token.
    pub fn cancel(&self) {
        // Only the first transition wakes waiters.
        if !self.inner.cancelled.swap(true, Ordering::Relaxed) {
            self.inner.notify.notify_waiters();
        }
    }

    /// Returns `true` if the token has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Relaxed)
    }

    /// A future that resolves once the token is cancelled.
    pub fn cancelled(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let token = self.clone();
        async move {
            let notified = token.inner.notify.notified();
            tokio::pin!(notified);
            // Register before the flag check so a cancel() racing this call
            // cannot slip between the check and the await.
            notified.as_mut().enable();
            if token.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}
