use std::future::Future;
use std::time::Duration;

use crate::index::BackendError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockTiming {
    /// `lock_timeout` applied to the attempt.
    pub lock_timeout: Duration,
    /// Pause before the next attempt.
    pub sleep: Duration,
}

/// Bounded retry schedule for statements that need a brief exclusive lock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockRetries {
    timings: Vec<LockTiming>,
}

#[derive(Debug, thiserror::Error)]
pub enum LockRetryError {
    #[error("{operation}: lock not acquired after {attempts} attempts")]
    Exhausted { operation: String, attempts: usize },
    #[error(transparent)]
    Backend(BackendError),
}

impl LockRetries {
    pub fn new(timings: Vec<LockTiming>) -> Self {
        Self { timings }
    }

    pub fn uniform(attempts: u32, lock_timeout: Duration, sleep: Duration) -> Self {
        Self::new(
            (0..attempts)
                .map(|_| LockTiming {
                    lock_timeout,
                    sleep,
                })
                .collect(),
        )
    }

    pub fn attempts(&self) -> usize {
        self.timings.len()
    }

    /// Runs `attempt` with each lock timeout in turn until it succeeds, a non-lock error
    /// occurs, or the schedule runs out.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut attempt: F) -> Result<T, LockRetryError>
    where
        F: FnMut(Duration) -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        for (index, timing) in self.timings.iter().enumerate() {
            match attempt(timing.lock_timeout).await {
                Ok(value) => return Ok(value),
                Err(BackendError::LockTimeout(reason)) => {
                    tracing::warn!(
                        operation,
                        attempt = index + 1,
                        attempts = self.timings.len(),
                        %reason,
                        "lock not acquired"
                    );
                    if index + 1 < self.timings.len() && !timing.sleep.is_zero() {
                        tokio::time::sleep(timing.sleep).await;
                    }
                }
                Err(error) => return Err(LockRetryError::Backend(error)),
            }
        }
        Err(LockRetryError::Exhausted {
            operation: operation.to_string(),
            attempts: self.timings.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fast(attempts: u32) -> LockRetries {
        LockRetries::uniform(attempts, Duration::from_millis(10), Duration::ZERO)
    }

    #[tokio::test]
    async fn succeeds_after_transient_contention() -> anyhow::Result<()> {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let value = fast(3)
            .run("rename", move |_| {
                let seen = seen.clone();
                async move {
                    if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(BackendError::LockTimeout("busy".to_string()))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await?;
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        Ok(())
    }

    #[tokio::test]
    async fn exhausts_budget_under_persistent_contention() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let outcome: Result<(), _> = fast(3)
            .run("rename", move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                async { Err(BackendError::LockTimeout("busy".to_string())) }
            })
            .await;
        assert!(matches!(
            outcome,
            Err(LockRetryError::Exhausted { attempts: 3, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn other_errors_stop_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let outcome: Result<(), _> = fast(5)
            .run("drop", move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                async { Err(BackendError::Db("boom".to_string())) }
            })
            .await;
        assert!(matches!(outcome, Err(LockRetryError::Backend(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
