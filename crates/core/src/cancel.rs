//! Cooperative cancellation for a running turn.
//!
//! The flag is a [`tokio_util::sync::CancellationToken`]: the turn loop
//! checks it before every model invocation and awaits it during backoff
//! waits. The party that requested cancellation may register a completion
//! callback that runs exactly once after the loop has stopped.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

type Completion = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// A cloneable cancellation flag shared by the requester and the turn loop.
#[derive(Clone)]
pub struct CancellationToken {
    flag: tokio_util::sync::CancellationToken,
    completion: Arc<Mutex<Option<Completion>>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            flag: tokio_util::sync::CancellationToken::new(),
            completion: Arc::new(Mutex::new(None)),
        }
    }

    pub fn cancel(&self) {
        self.flag.cancel();
    }

    /// Cancel and register what to run once the loop has observed it.
    pub fn cancel_with<F, Fut>(&self, on_complete: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.set_completion(on_complete);
        self.cancel();
    }

    /// Register the completion callback, replacing any earlier one.
    pub fn set_completion<F, Fut>(&self, on_complete: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let boxed: Completion = Box::new(move || Box::pin(on_complete()));
        let mut slot = self
            .completion
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(boxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.is_cancelled()
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        self.flag.cancelled().await;
    }

    /// Run the completion callback if one is registered. Returns whether a
    /// callback ran; later calls are no-ops.
    pub async fn complete(&self) -> bool {
        let callback = self
            .completion
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match callback {
            Some(callback) => {
                callback().await;
                true
            }
            None => false,
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn clones_share_state() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[tokio::test]
    async fn completion_runs_once() {
        let token = CancellationToken::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        token.cancel_with(move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(token.is_cancelled());
        assert!(token.complete().await);
        assert!(!token.complete().await);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn complete_without_callback() {
        let token = CancellationToken::new();
        token.cancel();
        assert!(!token.complete().await);
    }

    #[tokio::test]
    async fn cancelled_wakes_waiters() {
        let token = CancellationToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .unwrap();
    }
}
