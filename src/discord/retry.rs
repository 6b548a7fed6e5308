//! Retry with exponential backoff for Discord REST calls

use std::time::{Duration, SystemTime};

/// Retry policy for Discord REST calls
///
/// Controls how many times a failed request is retried and how
/// long to wait between attempts using exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Base delay between retries (doubles each attempt)
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Whether an HTTP status indicates a recoverable error.
///
/// Only rate limits (429) and server errors (5xx) are retried. Every other
/// status is surfaced to the caller immediately.
#[must_use]
pub fn is_recoverable(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

/// Whether a transport-level failure is worth retrying
#[must_use]
pub fn is_recoverable_transport(err: &reqwest::Error) -> bool {
    err.is_connect() || err.is_timeout()
}

/// Extract a `retry_after` duration from a Discord 429 response.
///
/// Discord sends seconds as a float in the JSON body and as the
/// `Retry-After` header; the body value is preferred.
#[must_use]
pub fn parse_retry_after(body: &str, header: Option<&str>) -> Option<Duration> {
    let from_body = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("retry_after")?.as_f64());

    from_body
        .or_else(|| header.and_then(|h| h.trim().parse::<f64>().ok()))
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

/// Compute the delay before the next retry attempt.
///
/// When `retry_after` is provided (from a 429 response), that value is
/// used directly but capped at `policy.max_delay`. Otherwise the delay follows
/// exponential backoff: `min(base_delay * 2^attempt + jitter, max_delay)`.
///
/// Jitter is 0-25% of the computed delay, derived from `SystemTime`.
#[must_use]
pub fn delay_for_attempt(
    policy: &RetryPolicy,
    attempt: u32,
    retry_after: Option<Duration>,
) -> Duration {
    if let Some(ra) = retry_after {
        return ra.min(policy.max_delay);
    }

    let base = policy
        .base_delay
        .saturating_mul(2u32.saturating_pow(attempt));
    let base = base.min(policy.max_delay);

    let jitter_nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();

    let jitter_fraction = f64::from(jitter_nanos % 250) / 1000.0;
    let jitter = base.mul_f64(jitter_fraction);

    (base + jitter).min(policy.max_delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    // -- is_recoverable -------------------------------------------------------

    #[test]
    fn recoverable_on_rate_limit() {
        assert!(is_recoverable(429));
    }

    #[test]
    fn recoverable_on_server_errors() {
        assert!(is_recoverable(500));
        assert!(is_recoverable(502));
        assert!(is_recoverable(503));
        assert!(is_recoverable(599));
    }

    #[test]
    fn not_recoverable_on_client_errors() {
        assert!(!is_recoverable(400));
        assert!(!is_recoverable(401));
        assert!(!is_recoverable(403));
        assert!(!is_recoverable(404));
    }

    // -- parse_retry_after ----------------------------------------------------

    #[test]
    fn parses_body_retry_after() {
        let body = r#"{"message":"You are being rate limited.","retry_after":0.75,"global":false}"#;
        assert_eq!(
            parse_retry_after(body, None),
            Some(Duration::from_millis(750))
        );
    }

    #[test]
    fn falls_back_to_header() {
        assert_eq!(
            parse_retry_after("", Some("2")),
            Some(Duration::from_secs(2))
        );
    }

    #[test]
    fn body_wins_over_header() {
        let body = r#"{"retry_after":1}"#;
        assert_eq!(
            parse_retry_after(body, Some("5")),
            Some(Duration::from_secs(1))
        );
    }

    #[test]
    fn returns_none_when_absent() {
        assert_eq!(parse_retry_after(r#"{"message":"x"}"#, None), None);
        assert_eq!(parse_retry_after("not json", None), None);
        assert_eq!(parse_retry_after("", Some("soon")), None);
    }

    // -- delay_for_attempt ----------------------------------------------------

    #[test]
    fn respects_retry_after() {
        let policy = RetryPolicy::default();
        let ra = Duration::from_secs(10);
        assert_eq!(delay_for_attempt(&policy, 0, Some(ra)), ra);
    }

    #[test]
    fn caps_retry_after_at_max_delay() {
        let policy = RetryPolicy::default();
        let ra = Duration::from_secs(120);
        assert_eq!(delay_for_attempt(&policy, 0, Some(ra)), policy.max_delay);
    }

    #[test]
    fn backoff_grows_with_attempts() {
        let policy = RetryPolicy::default();
        let first = delay_for_attempt(&policy, 0, None);
        let third = delay_for_attempt(&policy, 2, None);

        assert!(first >= policy.base_delay);
        assert!(first < policy.base_delay * 2);
        assert!(third >= policy.base_delay * 4);
    }

    #[test]
    fn backoff_never_exceeds_max() {
        let policy = RetryPolicy::default();
        assert!(delay_for_attempt(&policy, 20, None) <= policy.max_delay);
    }
}
