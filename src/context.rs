//! Cancellation and deadline context threaded through every blocking call.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Carries a cancellation token and an optional deadline.
///
/// Every runtime and git call races against both. Dropping the losing future
/// drops the child process handle, and the real collaborators spawn children
/// with `kill_on_drop`, so an aborted call does not keep running.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl OpContext {
    /// Creates a context with no deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a context that expires after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// Returns a child context sharing cancellation with this one.
    ///
    /// The child keeps the parent's deadline unless `timeout` is shorter.
    pub fn child(&self, timeout: Option<Duration>) -> Self {
        let deadline = match (self.deadline, timeout.map(|t| Instant::now() + t)) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Self {
            token: self.token.child_token(),
            deadline,
        }
    }

    /// Requests cancellation of every call using this context.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns true once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Fails fast if the context is already cancelled or expired.
    pub fn check(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(Error::DeadlineExceeded);
            }
        }
        Ok(())
    }

    /// Runs `fut` until it completes, the context is cancelled, or the
    /// deadline passes.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.token.cancelled() => Err(Error::Cancelled),
                _ = tokio::time::sleep_until(deadline) => Err(Error::DeadlineExceeded),
                res = fut => res,
            },
            None => tokio::select! {
                _ = self.token.cancelled() => Err(Error::Cancelled),
                res = fut => res,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_returns_future_output() {
        let ctx = OpContext::new();
        let value = ctx.run(async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn cancelled_context_aborts_pending_call() {
        let ctx = OpContext::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let res: Result<()> = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .await;
        assert!(matches!(res, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn deadline_aborts_pending_call() {
        let ctx = OpContext::with_timeout(Duration::from_millis(10));
        let res: Result<()> = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .await;
        assert!(matches!(res, Err(Error::DeadlineExceeded)));
    }

    #[test]
    fn child_inherits_cancellation() {
        let parent = OpContext::new();
        let child = parent.child(Some(Duration::from_secs(5)));
        parent.cancel();
        assert!(child.is_cancelled());
        assert!(matches!(child.check(), Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn child_keeps_the_shorter_deadline() {
        let parent = OpContext::with_timeout(Duration::from_secs(30));
        let child = parent.child(Some(Duration::from_millis(10)));
        let res: Result<()> = child
            .run(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .await;
        assert!(matches!(res, Err(Error::DeadlineExceeded)));
        assert!(parent.check().is_ok());

        let loose = OpContext::with_timeout(Duration::from_millis(10)).child(None);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(loose.check(), Err(Error::DeadlineExceeded)));
    }
}
