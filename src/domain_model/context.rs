use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::domain_port::RemoteError;

/// Cancellation and deadline carried by every operation that may block on the
/// remote store.
#[derive(Debug, Clone)]
pub struct OpContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl OpContext {
    /// Never cancelled, no deadline.
    pub fn background() -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
        }
    }

    /// Derives a context that also expires after `timeout`; the earlier
    /// deadline wins.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        };
        Self {
            cancel: self.cancel.child_token(),
            deadline: Some(deadline),
        }
    }

    /// Cancelled whenever `self` is.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_done(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Races `fut` against cancellation and the deadline.
    pub async fn run<T, F>(&self, fut: F) -> Result<T, RemoteError>
    where
        F: Future<Output = Result<T, RemoteError>>,
    {
        if self.cancel.is_cancelled() {
            return Err(RemoteError::Cancelled);
        }
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => Err(RemoteError::Cancelled),
                    _ = tokio::time::sleep_until(deadline) => Err(RemoteError::DeadlineExceeded),
                    result = fut => result,
                }
            }
            None => {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => Err(RemoteError::Cancelled),
                    result = fut => result,
                }
            }
        }
    }
}

impl Default for OpContext {
    fn default() -> Self {
        OpContext::background()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancelled_context_short_circuits() {
        let cx = OpContext::background();
        cx.cancel();
        let result = cx.run(async { Ok::<_, RemoteError>(1) }).await;
        assert!(matches!(result, Err(RemoteError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_interrupts_slow_call() {
        let cx = OpContext::background().with_timeout(Duration::from_millis(50));
        let result = cx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, RemoteError>(())
            })
            .await;
        assert!(matches!(result, Err(RemoteError::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn parent_cancellation_reaches_children() {
        let parent = OpContext::background();
        let child = parent.with_timeout(Duration::from_secs(60));
        assert!(!child.is_done());
        parent.cancel();
        assert!(child.is_done());
    }

    #[tokio::test]
    async fn earlier_deadline_is_kept() {
        let outer = OpContext::background().with_timeout(Duration::from_millis(10));
        let inner = outer.with_timeout(Duration::from_secs(10));
        assert_eq!(inner.deadline(), outer.deadline());
    }
}
