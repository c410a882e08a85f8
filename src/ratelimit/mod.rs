use reqwest::StatusCode;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{classify_failure_text, DownloadError, ErrorKind};
use crate::platform::Platform;

/// Outcome of classifying a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Throttling {
    /// Platform pushed back; worth retrying after a delay
    Throttled,
    Fatal,
}

/// Decides whether a failure is throttling and how long to back off
pub trait RateLimitPolicy: Send + Sync {
    fn classify(&self, error: &DownloadError) -> Throttling;

    /// Delay before retry number `attempt` (1-based)
    fn backoff(&self, attempt: u32) -> Duration;

    /// Total attempts allowed, including the first
    fn max_attempts(&self) -> u32;

    /// Structured check for APIs that report a status code
    fn classify_status(&self, status: u16) -> Throttling {
        if is_throttling_status(status) {
            Throttling::Throttled
        } else {
            Throttling::Fatal
        }
    }
}

/// Statuses platforms answer with when they throttle a client
pub fn is_throttling_status(status: u16) -> bool {
    matches!(status, 412 | 429)
}

/// Error for a non-success HTTP response, with throttling decided by `policy`
pub fn status_error(policy: &dyn RateLimitPolicy, platform: Platform, status: StatusCode, context: &str) -> DownloadError {
    let mut error = DownloadError::from_status(platform, status, context);
    match policy.classify_status(status.as_u16()) {
        Throttling::Throttled => error.kind = ErrorKind::RateLimited,
        Throttling::Fatal if error.kind == ErrorKind::RateLimited => error.kind = ErrorKind::DownloadFailed,
        Throttling::Fatal => {}
    }
    error
}

/// Linear backoff policy that recognises throttling by error text
#[derive(Debug, Clone)]
pub struct SignaturePolicy {
    base_delay: Duration,
    max_attempts: u32,
}

impl SignaturePolicy {
    pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_attempts: max_attempts.max(1),
        }
    }
}

impl Default for SignaturePolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), 3)
    }
}

impl RateLimitPolicy for SignaturePolicy {
    fn classify(&self, error: &DownloadError) -> Throttling {
        if error.kind == ErrorKind::RateLimited {
            return Throttling::Throttled;
        }
        if error.kind == ErrorKind::Cancelled {
            return Throttling::Fatal;
        }

        let text = format!("{} {}", error.message, error.detail.as_deref().unwrap_or_default());
        if classify_failure_text(&text) == ErrorKind::RateLimited {
            Throttling::Throttled
        } else {
            Throttling::Fatal
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay * attempt.max(1)
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// Run `operation` until it succeeds, fails fatally, or the throttling budget
/// is spent. The attempt number (1-based) is passed to each call.
///
/// Exhausting the budget yields a non-retryable `RateLimited` error carrying a
/// remediation hint; fatal errors are returned unchanged.
pub async fn retry_throttled<T, F, Fut>(
    policy: &dyn RateLimitPolicy,
    platform: Platform,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, DownloadError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, DownloadError>>,
{
    let max_attempts = policy.max_attempts();
    let mut attempt = 1;

    loop {
        if cancel.is_cancelled() {
            return Err(DownloadError::cancelled(platform));
        }

        let error = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if policy.classify(&error) == Throttling::Fatal {
            return Err(error);
        }

        if attempt >= max_attempts {
            let detail = error.detail.clone().unwrap_or_else(|| error.message.clone());
            return Err(DownloadError::new(
                ErrorKind::RateLimited,
                platform,
                format!(
                    "{} is temporarily throttling this IP (gave up after {} attempts). Wait 10-30 minutes, make sure you are logged in via the cookie file, or try another network. Last error: {}",
                    platform, max_attempts, error.message
                ),
            )
            .with_detail(detail));
        }

        let delay = policy.backoff(attempt);
        tracing::warn!(
            "{} throttled the request (attempt {}/{}), retrying in {}s",
            platform,
            attempt,
            max_attempts,
            delay.as_secs()
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(DownloadError::cancelled(platform)),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

/// Minimum spacing between calls to the same platform, shared by every
/// acquisition running in the process.
#[derive(Debug)]
pub struct PlatformPacer {
    min_interval: Duration,
    next_slot: Mutex<HashMap<Platform, Instant>>,
}

impl PlatformPacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_slot: Mutex::new(HashMap::new()),
        }
    }

    /// Wait until this platform's next call slot is free, then reserve it
    pub async fn pace(&self, platform: Platform) {
        if self.min_interval.is_zero() {
            return;
        }

        let wait_until = {
            let mut slots = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = slots.get(&platform).copied().filter(|s| *s > now).unwrap_or(now);
            slots.insert(platform, slot + self.min_interval);
            slot
        };

        if wait_until > Instant::now() {
            tracing::debug!("Pacing {} request", platform);
            tokio::time::sleep_until(wait_until).await;
        }
    }
}

impl Default for PlatformPacer {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}
