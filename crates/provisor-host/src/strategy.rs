//! Ordered fallback strategies with a bounded timeout per attempt.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use provisor_core::{AttemptOutcome, StrategyAttempt};
use tracing::{debug, warn};

/// Records strategy attempts for one action.
///
/// A failed or timed-out attempt never aborts the chain; callers move on to
/// the next strategy and decide what exhaustion means.
#[derive(Debug)]
pub struct StrategyChain {
    timeout: Duration,
    attempts: Vec<StrategyAttempt>,
}

impl StrategyChain {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            attempts: Vec::new(),
        }
    }

    /// Run one strategy under the timeout. `Some` on success.
    pub async fn attempt<T, E, F>(&mut self, strategy: impl Into<String>, fut: F) -> Option<T>
    where
        F: Future<Output = Result<T, E>>,
        E: Display,
    {
        let strategy = strategy.into();
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => {
                self.record(strategy, AttemptOutcome::Succeeded);
                Some(value)
            }
            Ok(Err(e)) => {
                self.record(
                    strategy,
                    AttemptOutcome::Failed {
                        reason: e.to_string(),
                    },
                );
                None
            }
            Err(_) => {
                let after_ms = self.timeout.as_millis() as u64;
                self.record(strategy, AttemptOutcome::TimedOut { after_ms });
                None
            }
        }
    }

    /// Record an attempt whose outcome was decided by the caller.
    pub fn record(&mut self, strategy: impl Into<String>, outcome: AttemptOutcome) {
        let strategy = strategy.into();
        match &outcome {
            AttemptOutcome::Succeeded => debug!("strategy {} succeeded", strategy),
            AttemptOutcome::Failed { reason } => {
                warn!("strategy {} failed: {}", strategy, reason)
            }
            AttemptOutcome::TimedOut { after_ms } => {
                warn!("strategy {} timed out after {}ms", strategy, after_ms)
            }
        }
        self.attempts.push(StrategyAttempt { strategy, outcome });
    }

    pub fn attempts(&self) -> &[StrategyAttempt] {
        &self.attempts
    }

    pub fn into_attempts(self) -> Vec<StrategyAttempt> {
        self.attempts
    }
}
