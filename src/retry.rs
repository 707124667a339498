//! Exponential backoff with full jitter, used by the stream adapters'
//! pre-stream HTTP retry (spec §4.1). Kept distinct from the MCP Client
//! Manager's reconnect backoff (`mcp::manager`), which has its own
//! attempt ceiling and base delay — the two are separate policy objects,
//! not a shared one-size-fits-all backoff (see SPEC_FULL.md §4.2).

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub factor: u32,
    pub max_jitter_fraction: f64,
    pub ceiling: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    /// base 500ms, factor 2, full jitter <=20%, ceiling 5s, 2 attempts.
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            factor: 2,
            max_jitter_fraction: 0.20,
            ceiling: Duration::from_secs(5),
            max_attempts: 2,
        }
    }
}

impl BackoffPolicy {
    /// MCP reconnect defaults: base 3s, ceiling from 10 attempts (no
    /// explicit delay ceiling is named by the spec beyond the attempt
    /// ceiling, so this reuses the stream policy's 5x factor headroom).
    pub fn mcp_reconnect() -> Self {
        Self {
            base: Duration::from_secs(3),
            factor: 2,
            max_jitter_fraction: 0.20,
            ceiling: Duration::from_secs(60),
            max_attempts: 10,
        }
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.base.as_millis() as f64 * (self.factor as f64).powi(attempt as i32);
        let capped = exp.min(self.ceiling.as_millis() as f64);
        let jitter_span = capped * self.max_jitter_fraction;
        let jitter = rand::thread_rng().gen_range(0.0..=jitter_span);
        Duration::from_millis((capped - jitter).max(0.0) as u64)
    }
}

/// Whether an HTTP status code should be retried under the pre-stream
/// retry policy. 401/403 are never retryable.
pub fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_never_exceeds_ceiling() {
        let policy = BackoffPolicy::default();
        for attempt in 0..10 {
            assert!(policy.delay_for_attempt(attempt) <= policy.ceiling);
        }
    }

    #[test]
    fn auth_statuses_are_not_retryable() {
        assert!(!is_retryable_status(401));
        assert!(!is_retryable_status(403));
    }

    #[test]
    fn rate_limit_and_server_errors_are_retryable() {
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(500));
        assert!(is_retryable_status(503));
    }
}
