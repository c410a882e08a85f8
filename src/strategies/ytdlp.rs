use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{AcquiredMedia, DownloadStrategy, VideoInfo};
use crate::config::Config;
use crate::error::{DownloadError, ErrorKind};
use crate::platform::{self, Platform};
use crate::ratelimit::{retry_throttled, RateLimitPolicy};
use crate::utils::{newest_file, run_checked, ProcessOptions};
use crate::utils::media::MEDIA_EXTENSIONS;

/// Thin wrapper around the yt-dlp command line
#[derive(Debug, Clone)]
pub struct YtDlp {
    binary: String,
    proxy: Option<String>,
    cookie_file: Option<PathBuf>,
    timeout: Duration,
}

impl YtDlp {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            proxy: None,
            cookie_file: None,
            timeout: Duration::from_secs(600),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            binary: config.tools.yt_dlp.clone(),
            proxy: config.network.proxy().for_tools().map(str::to_string),
            cookie_file: config.network.cookie_file().map(Path::to_path_buf),
            timeout: config.tools.process_timeout(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["--no-warnings", "--no-progress"]);
        if let Some(proxy) = &self.proxy {
            cmd.arg("--proxy").arg(proxy);
        }
        if let Some(cookies) = &self.cookie_file {
            cmd.arg("--cookies").arg(cookies);
        }
        cmd
    }

    fn options(&self, cancel: &CancellationToken) -> ProcessOptions {
        ProcessOptions::new(self.timeout, cancel.clone())
    }

    /// Info dictionary for `url` without downloading anything. Playlists are
    /// returned whole; callers pick entries themselves.
    pub async fn dump_json(
        &self,
        url: &str,
        extra_args: &[String],
        cancel: &CancellationToken,
    ) -> Result<Value, DownloadError> {
        let platform = platform::classify(url);
        let mut cmd = self.command();
        cmd.args(["--dump-single-json", "--skip-download"]).args(extra_args).arg(url);

        let output = run_checked(cmd, "yt-dlp", platform, &self.options(cancel)).await?;
        parse_info(&output.stdout, platform)
    }

    /// Download `url` into `output_dir`, returning the produced file and the
    /// info dictionary yt-dlp printed while downloading.
    pub async fn download(
        &self,
        url: &str,
        output_dir: &Path,
        audio_only: bool,
        extra_args: &[String],
        cancel: &CancellationToken,
    ) -> Result<(PathBuf, Value), DownloadError> {
        let platform = platform::classify(url);
        let template = output_dir.join("%(id)s.%(ext)s");

        let mut cmd = self.command();
        cmd.arg("--no-playlist")
            .args(["--no-simulate", "--dump-json"])
            .arg("--output")
            .arg(&template);
        if audio_only {
            cmd.args(["--format", "bestaudio/best", "--extract-audio", "--audio-format", "mp3", "--audio-quality", "9"]);
        } else {
            cmd.args(["--format", "bestvideo[height<=720]+bestaudio/best"]);
        }
        cmd.args(extra_args).arg(url);

        let output = run_checked(cmd, "yt-dlp", platform, &self.options(cancel)).await?;
        let info = parse_info(&output.stdout, platform).unwrap_or(Value::Null);

        let wanted: &[&str] = if audio_only { &["mp3"] } else { MEDIA_EXTENSIONS };
        let path = newest_file(output_dir, wanted)
            .or_else(|| newest_file(output_dir, MEDIA_EXTENSIONS))
            .ok_or_else(|| {
                DownloadError::new(
                    ErrorKind::DownloadFailed,
                    platform,
                    "yt-dlp reported success but no media file was written",
                )
            })?;

        Ok((path, info))
    }
}

/// The last JSON object in yt-dlp's stdout
fn parse_info(stdout: &[u8], platform: Platform) -> Result<Value, DownloadError> {
    let text = String::from_utf8_lossy(stdout);
    text.lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .find_map(|line| serde_json::from_str::<Value>(line).ok())
        .ok_or_else(|| DownloadError::new(ErrorKind::InfoError, platform, "yt-dlp returned no video info"))
}

/// Hands any http(s) URL to yt-dlp; slowest and least specific, tried last
pub struct GenericExtractorStrategy {
    ytdlp: YtDlp,
    policy: Arc<dyn RateLimitPolicy>,
}

impl GenericExtractorStrategy {
    pub fn new(ytdlp: YtDlp, policy: Arc<dyn RateLimitPolicy>) -> Self {
        Self { ytdlp, policy }
    }
}

#[async_trait]
impl DownloadStrategy for GenericExtractorStrategy {
    fn name(&self) -> &str {
        "yt-dlp"
    }

    fn priority(&self) -> i32 {
        10
    }

    fn supports(&self, url: &str) -> bool {
        platform::is_web_url(url)
    }

    async fn attempt(
        &self,
        url: &str,
        output_dir: &Path,
        audio_only: bool,
        cancel: &CancellationToken,
    ) -> Result<AcquiredMedia, DownloadError> {
        let platform = platform::classify(url);
        let (path, info) = retry_throttled(self.policy.as_ref(), platform, cancel, |attempt| async move {
            tracing::debug!("yt-dlp download attempt {}", attempt);
            self.ytdlp.download(url, output_dir, audio_only, &[], cancel).await
        })
        .await?;

        let info = if info.is_null() {
            VideoInfo::from_file(&path, url)
        } else {
            VideoInfo::from_ytdlp(&info, url)
        };
        Ok(AcquiredMedia { path, info })
    }
}
