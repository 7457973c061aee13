//! Cancellation context threaded through every public, blocking operation
//! (spec §5). Wraps a [`CancellationToken`] (hierarchical - cancelling a
//! parent cancels every child derived from it via [`CallContext::child`])
//! plus an optional absolute deadline.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Error, Result};

#[derive(Clone)]
pub struct CallContext {
    cancel: CancellationToken,
    pub deadline: Option<Instant>,
    /// Stable across `child()`; carried into the `Transport` dispatch span
    /// so every request an outer call fans out into can be correlated back
    /// to it in logs (spec §4.A: structured logging with call context).
    correlation_id: Uuid,
}

impl Default for CallContext {
    fn default() -> Self {
        CallContext::new()
    }
}

impl CallContext {
    pub fn new() -> Self {
        CallContext {
            cancel: CancellationToken::new(),
            deadline: None,
            correlation_id: Uuid::new_v4(),
        }
    }

    pub fn with_deadline(duration: Duration) -> Self {
        let mut ctx = CallContext::new();
        ctx.deadline = Some(Instant::now() + duration);
        ctx
    }

    pub fn with_cancel(cancel: CancellationToken) -> Self {
        CallContext {
            cancel,
            deadline: None,
            correlation_id: Uuid::new_v4(),
        }
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// Derives a child context: cancelling `self` cancels the child too, but
    /// cancelling the child alone does not affect `self`. Used by the batch
    /// executor and resumable transfer engine to scope cancellation of one
    /// in-flight item without tearing down the whole call. The correlation
    /// id is inherited, not regenerated, so every fanned-out item still
    /// traces back to the call that spawned it.
    pub fn child(&self) -> Self {
        CallContext {
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
            correlation_id: self.correlation_id,
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Sleeps for `duration`, or less if the deadline is closer, racing
    /// against cancellation. Returns `Err(Cancelled)` if the context was
    /// cancelled or the deadline passed before the (possibly clamped) sleep
    /// completed.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::cancelled("context already cancelled"));
        }
        let capped = match self.deadline {
            Some(dl) => {
                let now = Instant::now();
                if now >= dl {
                    return Err(Error::cancelled("deadline exceeded"));
                }
                duration.min(dl - now)
            }
            None => duration,
        };

        tokio::select! {
            _ = tokio::time::sleep(capped) => {}
            _ = self.cancel.cancelled() => return Err(Error::cancelled("context cancelled")),
        }

        if self.deadline.is_some_and(|dl| Instant::now() >= dl) {
            return Err(Error::cancelled("deadline exceeded"));
        }
        Ok(())
    }

    /// Races an arbitrary future against cancellation, returning
    /// `Err(Cancelled)` if the context is cancelled (or its deadline passes)
    /// first.
    pub async fn race<F, T>(&self, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = T>,
    {
        if let Some(dl) = self.deadline {
            let now = Instant::now();
            if now >= dl {
                return Err(Error::cancelled("deadline exceeded"));
            }
            tokio::select! {
                out = fut => Ok(out),
                _ = self.cancel.cancelled() => Err(Error::cancelled("context cancelled")),
                _ = tokio::time::sleep(dl - now) => Err(Error::cancelled("deadline exceeded")),
            }
        } else {
            tokio::select! {
                out = fut => Ok(out),
                _ = self.cancel.cancelled() => Err(Error::cancelled("context cancelled")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sleep_returns_cancelled_once_cancelled() {
        let ctx = CallContext::new();
        let child = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            child.cancel();
        });
        let result = ctx.sleep(Duration::from_secs(5)).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().is_cancelled());
    }

    #[test]
    fn child_inherits_correlation_id() {
        let parent = CallContext::new();
        let child = parent.child();
        assert_eq!(parent.correlation_id(), child.correlation_id());

        let unrelated = CallContext::new();
        assert_ne!(parent.correlation_id(), unrelated.correlation_id());
    }

    #[tokio::test]
    async fn child_cancelled_by_parent() {
        let parent = CallContext::new();
        let child = parent.child();
        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn deadline_expires_sleep() {
        let ctx = CallContext::with_deadline(Duration::from_millis(20));
        let result = ctx.sleep(Duration::from_secs(5)).await;
        assert!(result.is_err());
    }
}
