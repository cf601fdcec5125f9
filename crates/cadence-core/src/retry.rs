//! Retry policy for endpoint execution.
//!
//! Pure decision logic: given the classified outcome of an attempt, decide
//! whether to retry, fail, or escalate, and how long to back off.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Classification of an endpoint call failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Timeout,
    Network,
    #[serde(rename = "http_4xx")]
    Http4xx,
    #[serde(rename = "http_5xx")]
    Http5xx,
    Aborted,
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::Http4xx => "http_4xx",
            Self::Http5xx => "http_5xx",
            Self::Aborted => "aborted",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

impl ErrorCategory {
    /// Whether this failure is transient for the given status code.
    ///
    /// 408 and 429 are the only retryable 4xx statuses.
    pub fn is_transient(self, status_code: Option<u16>) -> bool {
        match self {
            Self::Timeout | Self::Network | Self::Http5xx => true,
            Self::Http4xx => matches!(status_code, Some(408) | Some(429)),
            Self::Aborted | Self::Unknown => false,
        }
    }
}

/// Everything the policy needs to judge one attempt.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// 1-based attempt number.
    pub attempt: u32,
    pub max_attempts: u32,
    pub category: ErrorCategory,
    pub status_code: Option<u16>,
    /// Attempt at which delays double.
    pub warn_threshold_attempt: Option<u32>,
    /// Attempt at which transient failures escalate instead of retrying.
    pub critical_threshold_attempt: Option<u32>,
}

/// The policy's verdict for an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    Fail,
    /// Halt retries and surface the failure to the pipeline.
    Escalate,
}

/// Decide what to do after a failed attempt. Rules apply in order:
/// aborted and non-retryable 4xx fail outright, the critical threshold
/// escalates transient failures, the attempt cap fails, and remaining
/// transient failures retry with backoff.
pub fn decide(ctx: &RetryContext) -> RetryDecision {
    if ctx.category == ErrorCategory::Aborted {
        return RetryDecision::Fail;
    }

    let transient = ctx.category.is_transient(ctx.status_code);

    if ctx.category == ErrorCategory::Http4xx && !transient {
        return RetryDecision::Fail;
    }

    let past_critical = ctx
        .critical_threshold_attempt
        .is_some_and(|critical| ctx.attempt >= critical);
    if transient && past_critical {
        return RetryDecision::Escalate;
    }

    if ctx.attempt >= ctx.max_attempts {
        return RetryDecision::Fail;
    }

    if transient {
        RetryDecision::Retry {
            delay: backoff(ctx),
        }
    } else {
        RetryDecision::Fail
    }
}

/// Backoff before the next attempt.
///
/// Linear 250 ms x attempt by default; rate-limited (429) responses use
/// capped exponential growth. The delay doubles once the warn threshold is
/// reached and doubles again at the critical threshold.
pub fn backoff(ctx: &RetryContext) -> Duration {
    let mut millis = if ctx.status_code == Some(429) {
        (500u64 * 2u64.saturating_pow(ctx.attempt.saturating_sub(1))).min(5_000)
    } else {
        250u64 * u64::from(ctx.attempt)
    };

    if ctx
        .warn_threshold_attempt
        .is_some_and(|warn| ctx.attempt >= warn)
    {
        millis *= 2;
    }
    if ctx
        .critical_threshold_attempt
        .is_some_and(|critical| ctx.attempt >= critical)
    {
        millis *= 2;
    }

    Duration::from_millis(millis)
}
