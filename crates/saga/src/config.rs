//! Orchestrator settings.

use std::time::Duration;

use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Deadline for a whole saga run, counted from creation.
    pub overall_timeout: Duration,
    pub retry: RetryPolicy,
}

impl OrchestratorConfig {
    pub fn with_overall_timeout(mut self, overall_timeout: Duration) -> Self {
        self.overall_timeout = overall_timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            overall_timeout: Duration::from_secs(60 * 60),
            retry: RetryPolicy::default(),
        }
    }
}
