use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::{Advisor, AdvisorError, AdvisorResult};

/// Bounded retry schedule with linear backoff (`base_delay * attempt`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Wait before the attempt following `attempt` (1-based).
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

/// Retries transient failures of an inner advisor.
pub struct RetryingAdvisor<A> {
    inner: A,
    policy: RetryPolicy,
}

impl<A> RetryingAdvisor<A> {
    pub fn new(inner: A, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &A {
        &self.inner
    }
}

#[async_trait]
impl<A: Advisor> Advisor for RetryingAdvisor<A> {
    fn model(&self) -> &str {
        self.inner.model()
    }

    async fn advise(&self, system_prompt: &str, user_prompt: &str) -> AdvisorResult<String> {
        let attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.inner.advise(system_prompt, user_prompt).await {
                Ok(text) => {
                    if attempt > 1 {
                        info!(model = self.inner.model(), attempt, "advisor retry succeeded");
                    }
                    return Ok(text);
                }
                Err(err) if !err.is_transient() => return Err(err),
                Err(err) if attempt >= attempts => {
                    return Err(AdvisorError::Exhausted {
                        attempts,
                        last: Box::new(err),
                    });
                }
                Err(err) => {
                    let wait = self.policy.delay_after(attempt);
                    warn!(
                        model = self.inner.model(),
                        attempt,
                        max_attempts = attempts,
                        wait_ms = wait.as_millis() as u64,
                        error = %err,
                        "advisor call failed, retrying"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
            }
        }
    }
}
