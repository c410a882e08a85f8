use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub mod bilibili;
pub mod direct;
pub mod script;
pub mod tools;
pub mod ytdlp;

pub use bilibili::BilibiliStrategy;
pub use direct::DirectLinkStrategy;
pub use script::CustomScriptStrategy;
pub use tools::{GalleryDlStrategy, YouGetStrategy};
pub use ytdlp::{GenericExtractorStrategy, YtDlp};

use crate::config::Config;
use crate::error::{DownloadError, ErrorKind};
use crate::platform::{self, BilibiliApi, Platform};
use crate::ratelimit::RateLimitPolicy;
use crate::utils::sanitize_filename;

/// Metadata describing acquired media. Built once by whichever step produced
/// it and never modified afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
    pub title: String,
    pub uploader: String,
    pub description: String,
    /// Seconds
    pub duration: u64,
    pub platform: Platform,
    pub url: String,
    pub thumbnail_url: Option<String>,
}

impl VideoInfo {
    /// Stand-in used when metadata cannot be fetched
    pub fn placeholder(url: &str) -> Self {
        Self {
            title: "Untitled".to_string(),
            uploader: "Unknown".to_string(),
            description: String::new(),
            duration: 0,
            platform: platform::classify(url),
            url: url.to_string(),
            thumbnail_url: None,
        }
    }

    /// Build from a yt-dlp info dictionary
    pub fn from_ytdlp(info: &serde_json::Value, url: &str) -> Self {
        let text = |key: &str| info[key].as_str().map(str::trim).filter(|s| !s.is_empty());

        Self {
            title: text("title").unwrap_or("Untitled").to_string(),
            uploader: text("uploader")
                .or_else(|| text("channel"))
                .or_else(|| text("uploader_id"))
                .unwrap_or("Unknown")
                .to_string(),
            description: text("description").unwrap_or_default().to_string(),
            duration: info["duration"].as_f64().filter(|d| *d >= 0.0).map(|d| d as u64).unwrap_or(0),
            platform: platform::classify(url),
            url: url.to_string(),
            thumbnail_url: text("thumbnail").map(str::to_string),
        }
    }

    /// Metadata for a file produced by a tool that reports nothing else
    pub fn from_file(path: &Path, url: &str) -> Self {
        let title = path
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("Untitled");

        Self {
            title: title.to_string(),
            ..Self::placeholder(url)
        }
    }
}

/// Result of a successful strategy attempt
#[derive(Debug, Clone)]
pub struct AcquiredMedia {
    pub path: PathBuf,
    pub info: VideoInfo,
}

/// One way of turning a URL into a local media file
#[async_trait]
pub trait DownloadStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Higher runs first
    fn priority(&self) -> i32;

    fn supports(&self, url: &str) -> bool;

    async fn attempt(
        &self,
        url: &str,
        output_dir: &Path,
        audio_only: bool,
        cancel: &CancellationToken,
    ) -> Result<AcquiredMedia, DownloadError>;
}

/// Shared collaborators handed to the built-in strategies
#[derive(Clone)]
pub struct StrategyDeps {
    pub client: Client,
    pub bilibili: BilibiliApi,
    pub policy: Arc<dyn RateLimitPolicy>,
}

/// Strategies ordered by descending priority, tried until one succeeds
#[derive(Default)]
pub struct StrategyChain {
    strategies: Vec<Arc<dyn DownloadStrategy>>,
}

impl StrategyChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Chain with every built-in strategy plus configured custom scripts
    pub fn from_config(config: &Config, deps: StrategyDeps) -> Self {
        let ytdlp = YtDlp::from_config(config);
        let mut chain = Self::new();

        chain.register(Arc::new(BilibiliStrategy::from_config(config, &deps, ytdlp.clone())));
        chain.register(Arc::new(DirectLinkStrategy::from_config(config, &deps, ytdlp.clone())));
        chain.register(Arc::new(YouGetStrategy::from_config(config)));
        chain.register(Arc::new(GalleryDlStrategy::from_config(config)));
        chain.register(Arc::new(GenericExtractorStrategy::new(ytdlp, deps.policy.clone())));

        for script in &config.tools.custom_scripts {
            chain.register(Arc::new(CustomScriptStrategy::new(script.clone(), config.tools.process_timeout())));
        }

        chain
    }

    /// Add a strategy; equal priorities keep registration order
    pub fn register(&mut self, strategy: Arc<dyn DownloadStrategy>) {
        self.strategies.push(strategy);
        self.strategies.sort_by_key(|s| std::cmp::Reverse(s.priority()));
    }

    /// (name, priority) in execution order
    pub fn describe(&self) -> Vec<(String, i32)> {
        self.strategies.iter().map(|s| (s.name().to_string(), s.priority())).collect()
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// Try every applicable strategy in priority order. Each attempt writes
    /// into its own numbered subdirectory of `output_dir`.
    ///
    /// Fails with `UnsupportedPlatform` when nothing claims the URL, with
    /// `Cancelled` as soon as a strategy reports cancellation, and otherwise
    /// with `AllStrategiesFailed` carrying the last underlying cause.
    pub async fn resolve(
        &self,
        url: &str,
        output_dir: &Path,
        audio_only: bool,
        cancel: &CancellationToken,
    ) -> Result<AcquiredMedia, DownloadError> {
        let platform = platform::classify(url);
        let candidates: Vec<&Arc<dyn DownloadStrategy>> = self.strategies.iter().filter(|s| s.supports(url)).collect();

        if candidates.is_empty() {
            return Err(DownloadError::new(
                ErrorKind::UnsupportedPlatform,
                platform,
                format!("No download strategy supports {}", url),
            ));
        }

        let mut failures = Vec::new();
        let mut last_error = None;

        for (index, strategy) in candidates.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(DownloadError::cancelled(platform));
            }

            // Leftovers of a failed attempt must not be picked up by the next one
            let attempt_dir = output_dir.join(format!(
                "{:02}-{}",
                index + 1,
                sanitize_filename(strategy.name(), "strategy")
            ));
            tokio::fs::create_dir_all(&attempt_dir)
                .await
                .map_err(|e| DownloadError::io(platform, "Cannot create strategy output directory", e))?;

            tracing::info!("Trying {} (priority {})", strategy.name(), strategy.priority());
            match strategy.attempt(url, &attempt_dir, audio_only, cancel).await {
                Ok(media) => {
                    tracing::info!("{} produced {}", strategy.name(), media.path.display());
                    return Ok(media);
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    tracing::warn!("{} failed [{}]: {}", strategy.name(), e.kind, e.message);
                    failures.push(format!("{}: [{}] {}", strategy.name(), e.kind, e.message));
                    last_error = Some(e);
                }
            }
        }

        let summary = failures.join("\n");
        let message = match last_error {
            Some(last) => format!(
                "All {} download strategies failed. Last error ({}): {}",
                failures.len(),
                last.kind,
                last.message
            ),
            None => "All download strategies failed".to_string(),
        };

        Err(DownloadError::new(ErrorKind::AllStrategiesFailed, platform, message).with_detail(summary))
    }
}
