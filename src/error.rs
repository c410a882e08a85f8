use serde::Serialize;
use std::fmt;

use crate::platform::Platform;

/// Error kinds surfaced by the acquisition pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    /// No strategy claims the URL
    UnsupportedPlatform,
    /// Metadata came back but required fields are missing
    InfoError,
    /// Throttling signature detected
    RateLimited,
    /// Connection reset, timeout or 5xx
    NetworkError,
    /// Platform wants credentials or fresh cookies
    AuthRequired,
    /// A tool or strategy failed for any other reason
    DownloadFailed,
    /// Every applicable strategy was exhausted
    AllStrategiesFailed,
    /// Speech-to-text failed on every execution path
    TranscriptionFailed,
    /// Caller aborted the acquisition
    Cancelled,
    /// Local filesystem failure
    Io,
}

impl ErrorKind {
    /// Kinds a component may retry locally before giving up
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::RateLimited | ErrorKind::NetworkError)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::UnsupportedPlatform => "unsupported_platform",
            ErrorKind::InfoError => "info_error",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::NetworkError => "network_error",
            ErrorKind::AuthRequired => "auth_required",
            ErrorKind::DownloadFailed => "download_failed",
            ErrorKind::AllStrategiesFailed => "all_strategies_failed",
            ErrorKind::TranscriptionFailed => "transcription_failed",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Io => "io",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tagged error carried from any acquisition component up to the caller
#[derive(thiserror::Error, Debug, Clone)]
#[error("[{platform}] {message}")]
pub struct DownloadError {
    pub message: String,
    pub platform: Platform,
    pub kind: ErrorKind,
    /// Raw diagnostic output (tool stderr, HTTP status, ...)
    pub detail: Option<String>,
}

impl DownloadError {
    pub fn new(kind: ErrorKind, platform: Platform, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            platform,
            kind,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn cancelled(platform: Platform) -> Self {
        Self::new(ErrorKind::Cancelled, platform, "Acquisition cancelled")
    }

    pub fn io(platform: Platform, context: &str, err: std::io::Error) -> Self {
        Self::new(ErrorKind::Io, platform, format!("{}: {}", context, err)).with_detail(err.to_string())
    }

    /// Build an error from free-form tool output, picking the kind heuristically
    /// and attaching remediation hints.
    pub fn from_tool_output(platform: Platform, tool: &str, output: &str) -> Self {
        let kind = classify_failure_text(output);
        let summary = first_error_line(output);
        let message = match kind {
            ErrorKind::AuthRequired => format!(
                "{} needs authentication for this {} video: {}. Log in with a browser and refresh the cookie file (Netscape format), then retry",
                tool, platform, summary
            ),
            ErrorKind::RateLimited => format!(
                "{} was throttled by {}: {}. Wait 10-30 minutes or switch network before retrying",
                tool, platform, summary
            ),
            ErrorKind::NetworkError => format!("{} hit a network problem: {}. Check the connection or proxy settings", tool, summary),
            ErrorKind::UnsupportedPlatform => format!("{} does not recognise this URL: {}", tool, summary),
            _ => format!("{} failed: {}", tool, summary),
        };
        Self::new(kind, platform, message).with_detail(output.trim().to_string())
    }

    /// Map a non-success HTTP status onto the taxonomy
    pub fn from_status(platform: Platform, status: reqwest::StatusCode, context: &str) -> Self {
        let kind = match status.as_u16() {
            code if crate::ratelimit::is_throttling_status(code) => ErrorKind::RateLimited,
            401 | 403 => ErrorKind::AuthRequired,
            500..=599 => ErrorKind::NetworkError,
            _ => ErrorKind::DownloadFailed,
        };
        Self::new(kind, platform, format!("{}: HTTP {}", context, status)).with_detail(status.to_string())
    }

    /// Map a transport-level reqwest failure onto the taxonomy
    pub fn from_reqwest(platform: Platform, context: &str, err: &reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::from_status(platform, status, context);
        }
        let kind = if err.is_timeout() {
            ErrorKind::NetworkError
        } else if err.is_decode() {
            ErrorKind::InfoError
        } else if err.is_builder() {
            ErrorKind::DownloadFailed
        } else {
            ErrorKind::NetworkError
        };
        Self::new(kind, platform, format!("{}: {}", context, err)).with_detail(format!("{:?}", err))
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }
}

const THROTTLE_SIGNATURES: &[&str] = &[
    "http error 412",
    "http error 429",
    "412 precondition failed",
    "precondition failed",
    "429 too many requests",
    "too many requests",
    "rate limit",
    "rate-limit",
    "请求过于频繁",
];

const AUTH_SIGNATURES: &[&str] = &[
    "fresh cookies",
    "cookies",
    "sign in to confirm",
    "login required",
    "log in",
    "http error 401",
    "http error 403",
    "403 forbidden",
    "private video",
];

const NETWORK_SIGNATURES: &[&str] = &[
    "timed out",
    "timeout",
    "connection reset",
    "connection refused",
    "connection aborted",
    "network is unreachable",
    "temporary failure in name resolution",
    "http error 500",
    "http error 502",
    "http error 503",
    "http error 504",
    "ssl",
];

/// Best-effort mapping from error text to a kind
pub fn classify_failure_text(text: &str) -> ErrorKind {
    let lower = text.to_lowercase();
    let hit = |signatures: &[&str]| signatures.iter().any(|s| lower.contains(&s.to_lowercase()));

    if hit(THROTTLE_SIGNATURES) {
        ErrorKind::RateLimited
    } else if hit(AUTH_SIGNATURES) {
        ErrorKind::AuthRequired
    } else if hit(NETWORK_SIGNATURES) {
        ErrorKind::NetworkError
    } else if lower.contains("unsupported url") {
        ErrorKind::UnsupportedPlatform
    } else {
        ErrorKind::DownloadFailed
    }
}

/// Pick the most useful single line from tool output
fn first_error_line(output: &str) -> String {
    let lines: Vec<&str> = output.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    lines
        .iter()
        .find(|l| l.starts_with("ERROR") || l.contains("error:"))
        .or_else(|| lines.last())
        .map(|l| l.to_string())
        .unwrap_or_else(|| "no output".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_failure_text() {
        assert_eq!(
            classify_failure_text("ERROR: [BiliBili] HTTP Error 412: Precondition Failed"),
            ErrorKind::RateLimited
        );
        assert_eq!(classify_failure_text("请求过于频繁，请稍后再试"), ErrorKind::RateLimited);
        assert_eq!(
            classify_failure_text("ERROR: Sign in to confirm you're not a bot"),
            ErrorKind::AuthRequired
        );
        assert_eq!(classify_failure_text("Read timed out"), ErrorKind::NetworkError);
        assert_eq!(classify_failure_text("ERROR: Unsupported URL: https://x"), ErrorKind::UnsupportedPlatform);
        assert_eq!(classify_failure_text("something odd"), ErrorKind::DownloadFailed);
    }

    #[test]
    fn test_from_tool_output_attaches_hint() {
        let err = DownloadError::from_tool_output(
            Platform::Douyin,
            "yt-dlp",
            "WARNING: foo\nERROR: Fresh cookies (not necessarily logged in) are needed\n",
        );
        assert_eq!(err.kind, ErrorKind::AuthRequired);
        assert!(err.message.contains("refresh the cookie file"));
        assert!(err.message.contains("Fresh cookies"));
        assert!(err.detail.unwrap().contains("WARNING: foo"));
    }

    #[test]
    fn test_display_includes_platform() {
        let err = DownloadError::new(ErrorKind::InfoError, Platform::Bilibili, "missing title");
        assert_eq!(err.to_string(), "[bilibili] missing title");
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::RateLimited.is_retryable());
        assert!(ErrorKind::NetworkError.is_retryable());
        assert!(!ErrorKind::AuthRequired.is_retryable());
        assert!(!ErrorKind::AllStrategiesFailed.is_retryable());
    }
}
