//! External command execution with a timeout and cooperative cancellation

use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::{DownloadError, ErrorKind};
use crate::platform::Platform;

/// Limits applied to one external process invocation
#[derive(Debug, Clone)]
pub struct ProcessOptions {
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

impl ProcessOptions {
    pub fn new(timeout: Duration, cancel: CancellationToken) -> Self {
        Self { timeout, cancel }
    }
}

/// Run `cmd` to completion, capturing stdout/stderr.
///
/// A missing binary is `DownloadFailed`, a timeout is `NetworkError` and
/// cancellation kills the child and yields `Cancelled`. Exit status is left to
/// the caller.
pub async fn run_command(
    mut cmd: Command,
    tool: &str,
    platform: Platform,
    options: &ProcessOptions,
) -> Result<Output, DownloadError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    tracing::debug!("Executing command: {:?}", cmd);

    let child = cmd.spawn().map_err(|e| {
        let message = if e.kind() == std::io::ErrorKind::NotFound {
            format!("{} is not installed or not on PATH", tool)
        } else {
            format!("Failed to start {}: {}", tool, e)
        };
        DownloadError::new(ErrorKind::DownloadFailed, platform, message).with_detail(e.to_string())
    })?;

    // Dropping the wait future drops the child, and kill_on_drop reaps it
    tokio::select! {
        biased;
        _ = options.cancel.cancelled() => Err(DownloadError::cancelled(platform)),
        result = tokio::time::timeout(options.timeout, child.wait_with_output()) => match result {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(DownloadError::new(
                ErrorKind::DownloadFailed,
                platform,
                format!("{} did not run to completion: {}", tool, e),
            )),
            Err(_) => Err(DownloadError::new(
                ErrorKind::NetworkError,
                platform,
                format!("{} timed out after {}s", tool, options.timeout.as_secs()),
            )),
        },
    }
}

/// Run `cmd` and treat a non-zero exit as a classified tool failure
pub async fn run_checked(
    cmd: Command,
    tool: &str,
    platform: Platform,
    options: &ProcessOptions,
) -> Result<Output, DownloadError> {
    let output = run_command(cmd, tool, platform, options).await?;
    if output.status.success() {
        Ok(output)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(DownloadError::from_tool_output(platform, tool, &stderr))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn options(timeout: Duration) -> ProcessOptions {
        ProcessOptions::new(timeout, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_captures_stdout() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo hello"]);
        let output = run_command(cmd, "sh", Platform::Unknown, &options(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "hello");
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let cmd = Command::new("definitely-not-a-real-binary-xyz");
        let err = run_command(cmd, "xyz", Platform::Unknown, &options(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::DownloadFailed);
        assert!(err.message.contains("not installed"));
    }

    #[tokio::test]
    async fn test_timeout_is_network_error() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "sleep 5"]);
        let err = run_command(cmd, "sh", Platform::Unknown, &options(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NetworkError);
    }

    #[tokio::test]
    async fn test_cancellation_kills_child() {
        let opts = options(Duration::from_secs(30));
        let cancel = opts.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let mut cmd = Command::new("sh");
        cmd.args(["-c", "sleep 10"]);
        let err = run_command(cmd, "sh", Platform::Unknown, &opts).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_run_checked_classifies_stderr() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo 'ERROR: HTTP Error 429: Too Many Requests' >&2; exit 1"]);
        let err = run_checked(cmd, "yt-dlp", Platform::Youtube, &options(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::RateLimited);
    }
}
