//! Engine configuration.

use std::time::Duration;

/// Tuning knobs for the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of times a retryable node failure will be retried.
    pub max_retries: u32,
    /// Base delay for exponential back-off between node retries.
    pub retry_base_delay: Duration,
    /// Upper bound on a single executor invocation, unless the node
    /// definition overrides it.
    pub node_timeout: Duration,
    /// Page size used by `list_executions` when the caller sets none.
    pub default_page_limit: usize,
    /// Webhook delivery settings.
    pub webhook: WebhookConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay: Duration::from_millis(100),
            node_timeout: Duration::from_secs(30),
            default_page_limit: 50,
            webhook: WebhookConfig::default(),
        }
    }
}

/// Settings for outbound webhook delivery.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Per-request timeout.
    pub timeout: Duration,
    /// Total delivery attempts per event and subscription.
    pub max_attempts: u32,
    /// Base delay for exponential back-off between attempts.
    pub retry_base_delay: Duration,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_attempts: 3,
            retry_base_delay: Duration::from_millis(200),
        }
    }
}

/// Exponential back-off: `base * 2^(attempt - 1)`, saturating at `Duration::MAX`.
pub(crate) fn backoff(base: Duration, attempt: u32) -> Duration {
    base.checked_mul(2u32.pow(attempt.saturating_sub(1).min(16)))
        .unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff(base, 1), Duration::from_millis(100));
        assert_eq!(backoff(base, 2), Duration::from_millis(200));
        assert_eq!(backoff(base, 4), Duration::from_millis(800));
    }

    #[test]
    fn backoff_saturates_instead_of_overflowing() {
        let huge = Duration::from_secs(u64::MAX / 2);
        assert_eq!(backoff(huge, 1), huge);
        assert_eq!(backoff(huge, 3), Duration::MAX);
        assert_eq!(backoff(Duration::MAX, 40), Duration::MAX);
    }

    #[test]
    fn default_page_limit_is_fifty() {
        assert_eq!(EngineConfig::default().default_page_limit, 50);
    }
}
