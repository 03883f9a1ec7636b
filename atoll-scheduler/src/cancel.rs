//! Cancelable contexts
//!
//! Every operation carries one; an agent incarnation carries one too.
//! Canceling the context makes every outstanding wait on its behalf return
//! `SchedulerError::Canceled`, which unwinds benignly.

use crate::error::{SchedulerError, SchedulerResult};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Inner {
    canceled: AtomicBool,
    notify: Notify,
}

/// A handle that cancels every future run under it
#[derive(Debug, Clone, Default)]
pub struct CancelableContext {
    inner: Arc<Inner>,
}

impl CancelableContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel; idempotent
    pub fn cancel(&self) {
        self.inner.canceled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::SeqCst)
    }

    /// Resolves once the context is canceled
    pub async fn canceled(&self) {
        loop {
            if self.is_canceled() {
                return;
            }
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before the re-check, so a cancel landing in between
            // still wakes us.
            notified.as_mut().enable();
            if self.is_canceled() {
                return;
            }
            notified.await;
        }
    }

    /// Run a future under this context; cancellation wins the race and
    /// surfaces as `Canceled`
    pub async fn run<F, T>(&self, future: F) -> SchedulerResult<T>
    where
        F: Future<Output = SchedulerResult<T>>,
    {
        if self.is_canceled() {
            return Err(SchedulerError::Canceled);
        }
        tokio::select! {
            result = future => result,
            _ = self.canceled() => Err(SchedulerError::Canceled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_unwinds_pending_wait() {
        let ctx = CancelableContext::new();
        let handle = {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                ctx.run(async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                })
                .await
            })
        };
        tokio::task::yield_now().await;
        ctx.cancel();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(SchedulerError::Canceled)));
    }

    #[tokio::test]
    async fn test_canceled_context_rejects_immediately() {
        let ctx = CancelableContext::new();
        ctx.cancel();
        let result = ctx.run(async { Ok(42) }).await;
        assert!(matches!(result, Err(SchedulerError::Canceled)));
    }

    #[tokio::test]
    async fn test_completed_future_wins() {
        let ctx = CancelableContext::new();
        let result = ctx.run(async { Ok(7) }).await.unwrap();
        assert_eq!(result, 7);
    }
}
