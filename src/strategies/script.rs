use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{AcquiredMedia, DownloadStrategy, VideoInfo};
use crate::error::{DownloadError, ErrorKind};
use crate::platform;
use crate::utils::media::MEDIA_EXTENSIONS;
use crate::utils::{newest_file, run_command, ProcessOptions};

/// Escape hatch: `<script> <url> <output_dir>`, exit code 0 means success
pub struct CustomScriptStrategy {
    script: PathBuf,
    name: String,
    timeout: Duration,
}

impl CustomScriptStrategy {
    pub fn new(script: PathBuf, timeout: Duration) -> Self {
        let name = format!(
            "script:{}",
            script.file_name().and_then(|n| n.to_str()).unwrap_or("custom")
        );
        Self { script, name, timeout }
    }
}

#[async_trait]
impl DownloadStrategy for CustomScriptStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        5
    }

    fn supports(&self, url: &str) -> bool {
        platform::is_web_url(url)
    }

    async fn attempt(
        &self,
        url: &str,
        output_dir: &Path,
        _audio_only: bool,
        cancel: &CancellationToken,
    ) -> Result<AcquiredMedia, DownloadError> {
        let platform = platform::classify(url);
        let mut cmd = Command::new(&self.script);
        cmd.arg(url).arg(output_dir);

        let output = run_command(cmd, &self.name, platform, &ProcessOptions::new(self.timeout, cancel.clone())).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DownloadError::new(
                ErrorKind::DownloadFailed,
                platform,
                format!("{} exited with {}", self.name, output.status),
            )
            .with_detail(stderr.trim().to_string()));
        }

        let path = newest_file(output_dir, MEDIA_EXTENSIONS).ok_or_else(|| {
            DownloadError::new(
                ErrorKind::DownloadFailed,
                platform,
                format!("{} exited 0 but wrote no media file", self.name),
            )
        })?;
        let info = VideoInfo::from_file(&path, url);
        Ok(AcquiredMedia { path, info })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn write_script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("grab.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_script_success() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "echo audio > \"$2/clip.mp3\"");
        let out = dir.path().join("out");
        std::fs::create_dir(&out).unwrap();

        let strategy = CustomScriptStrategy::new(script, Duration::from_secs(5));
        assert_eq!(strategy.name(), "script:grab.sh");

        let media = strategy
            .attempt("https://example.com/v", &out, true, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(media.path, out.join("clip.mp3"));
        assert_eq!(media.info.title, "clip");
    }

    #[tokio::test]
    async fn test_script_nonzero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "echo nope >&2; exit 3");

        let err = CustomScriptStrategy::new(script, Duration::from_secs(5))
            .attempt("https://example.com/v", dir.path(), true, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::DownloadFailed);
        assert_eq!(err.detail.as_deref(), Some("nope"));
    }
}
