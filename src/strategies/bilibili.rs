use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::tools::YouGet;
use super::{AcquiredMedia, DownloadStrategy, StrategyDeps, YtDlp};
use crate::config::Config;
use crate::error::{DownloadError, ErrorKind};
use crate::platform::bilibili::{self as api, DESKTOP_USER_AGENT};
use crate::platform::{BilibiliApi, Platform};
use crate::ratelimit::{retry_throttled, RateLimitPolicy, Throttling};

/// Bilibili via its public API for metadata, then you-get with yt-dlp as the
/// second sub-method. Both run inside the throttling retry loop.
pub struct BilibiliStrategy {
    api: BilibiliApi,
    you_get: YouGet,
    ytdlp: YtDlp,
    policy: Arc<dyn RateLimitPolicy>,
}

impl BilibiliStrategy {
    pub fn new(api: BilibiliApi, you_get: YouGet, ytdlp: YtDlp, policy: Arc<dyn RateLimitPolicy>) -> Self {
        Self {
            api,
            you_get,
            ytdlp,
            policy,
        }
    }

    pub fn from_config(config: &Config, deps: &StrategyDeps, ytdlp: YtDlp) -> Self {
        Self::new(deps.bilibili.clone(), YouGet::from_config(config), ytdlp, deps.policy.clone())
    }

    fn ytdlp_headers(url: &str) -> Vec<String> {
        vec![
            "--add-header".to_string(),
            format!("Referer:{}", url),
            "--add-header".to_string(),
            format!("User-Agent:{}", DESKTOP_USER_AGENT),
        ]
    }

    /// One pass over both sub-methods
    async fn download_once(
        &self,
        url: &str,
        output_dir: &Path,
        audio_only: bool,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, DownloadError> {
        let you_get_error = match self.you_get.download(url, output_dir, cancel).await {
            Ok(path) => return Ok(path),
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => e,
        };
        tracing::warn!("you-get failed, trying yt-dlp: {}", you_get_error.message);

        let ytdlp_error = match self
            .ytdlp
            .download(url, output_dir, audio_only, &Self::ytdlp_headers(url), cancel)
            .await
        {
            Ok((path, _)) => return Ok(path),
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => e,
        };

        Err(self.combine_failures(you_get_error, ytdlp_error))
    }

    /// Throttling from either sub-method wins so the retry loop backs off;
    /// otherwise the pass is a plain failure.
    fn combine_failures(&self, you_get: DownloadError, ytdlp: DownloadError) -> DownloadError {
        let detail = format!("you-get: {}\nyt-dlp: {}", you_get.message, ytdlp.message);

        for error in [&ytdlp, &you_get] {
            if self.policy.classify(error) == Throttling::Throttled {
                return DownloadError::new(ErrorKind::RateLimited, Platform::Bilibili, error.message.clone())
                    .with_detail(detail);
            }
        }
        for error in [&ytdlp, &you_get] {
            if error.kind == ErrorKind::AuthRequired {
                return DownloadError::new(ErrorKind::AuthRequired, Platform::Bilibili, error.message.clone())
                    .with_detail(detail);
            }
        }

        DownloadError::new(
            ErrorKind::DownloadFailed,
            Platform::Bilibili,
            format!("you-get and yt-dlp both failed. Last error: {}", ytdlp.message),
        )
        .with_detail(detail)
    }
}

#[async_trait]
impl DownloadStrategy for BilibiliStrategy {
    fn name(&self) -> &str {
        "bilibili-api"
    }

    fn priority(&self) -> i32 {
        30
    }

    fn supports(&self, url: &str) -> bool {
        api::is_video_url(url)
    }

    async fn attempt(
        &self,
        url: &str,
        output_dir: &Path,
        audio_only: bool,
        cancel: &CancellationToken,
    ) -> Result<AcquiredMedia, DownloadError> {
        let policy = self.policy.as_ref();

        let info = retry_throttled(policy, Platform::Bilibili, cancel, |_| self.api.video_info(url)).await?;
        tracing::info!("Bilibili video: {} by {} ({}s)", info.title, info.uploader, info.duration);

        let path = retry_throttled(policy, Platform::Bilibili, cancel, |attempt| async move {
            tracing::info!("Bilibili download attempt {}/{}", attempt, policy.max_attempts());
            self.download_once(url, output_dir, audio_only, cancel).await
        })
        .await?;

        Ok(AcquiredMedia { path, info })
    }
}
