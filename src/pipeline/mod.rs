//! Acquisition orchestrator.
//!
//! Captions are tried first because they cost one HTTP call. Only on a miss
//! does the strategy chain download media into a scoped temporary directory
//! that is removed whatever happens downstream.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{DownloadError, ErrorKind};
use crate::fetch::{build_client, client_builder};
use crate::platform::{self, bilibili as bili, BilibiliApi, Platform};
use crate::ratelimit::{PlatformPacer, RateLimitPolicy, SignaturePolicy};
use crate::strategies::{StrategyChain, StrategyDeps, VideoInfo, YtDlp};
use crate::subtitles::{SubtitleResolver, SubtitleSource};
use crate::transcribe::{TranscribeRequest, Transcriber, TranscriptionEngine};
use crate::utils::media::probe_duration;
use crate::utils::{cookie_header_for, ProcessOptions};

/// States an acquisition moves through, recorded in visiting order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionState {
    Start,
    SubtitleAttempted,
    TranscriptReady,
    MediaNeeded,
    Downloading,
    Transcribing,
    Done,
    Failed,
}

impl fmt::Display for AcquisitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AcquisitionState::Start => "start",
            AcquisitionState::SubtitleAttempted => "subtitle_attempted",
            AcquisitionState::TranscriptReady => "transcript_ready",
            AcquisitionState::MediaNeeded => "media_needed",
            AcquisitionState::Downloading => "downloading",
            AcquisitionState::Transcribing => "transcribing",
            AcquisitionState::Done => "done",
            AcquisitionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Where the transcript text came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptSource {
    Subtitles,
    Transcribed,
    LocalFile,
}

impl fmt::Display for TranscriptSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TranscriptSource::Subtitles => f.write_str("platform subtitles"),
            TranscriptSource::Transcribed => f.write_str("speech recognition"),
            TranscriptSource::LocalFile => f.write_str("local file"),
        }
    }
}

/// Outcome of one successful acquisition
#[derive(Debug, Clone, Serialize)]
pub struct Acquisition {
    pub info: VideoInfo,
    pub transcript: String,
    pub source: TranscriptSource,
    pub states: Vec<AcquisitionState>,
}

/// Cheap, download-free metadata lookup. Never fails: a placeholder stands in.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn video_info(&self, url: &str, cancel: &CancellationToken) -> VideoInfo;
}

/// Bilibili view API for Bilibili pages, `yt-dlp --dump-json` for the rest
pub struct PlatformMetadata {
    bilibili: BilibiliApi,
    ytdlp: YtDlp,
}

impl PlatformMetadata {
    pub fn new(bilibili: BilibiliApi, ytdlp: YtDlp) -> Self {
        Self { bilibili, ytdlp }
    }
}

#[async_trait]
impl MetadataSource for PlatformMetadata {
    async fn video_info(&self, url: &str, cancel: &CancellationToken) -> VideoInfo {
        let result = if bili::is_video_url(url) {
            self.bilibili.video_info(url).await
        } else {
            self.ytdlp
                .dump_json(url, &["--no-playlist".to_string()], cancel)
                .await
                .map(|info| VideoInfo::from_ytdlp(&info, url))
        };

        result.unwrap_or_else(|e| {
            tracing::warn!("Metadata lookup failed, using placeholder: {}", e);
            VideoInfo::placeholder(url)
        })
    }
}

/// Per-acquisition knobs taken from configuration or CLI flags
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub model: String,
    pub language: Option<String>,
    pub audio_only: bool,
    /// Parent of per-acquisition temporary directories
    pub work_dir: Option<PathBuf>,
    pub ffprobe: String,
    pub process_timeout: Duration,
    pub max_concurrent_jobs: usize,
}

impl PipelineOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            model: config.transcription.model.clone(),
            language: config.transcription.language.clone(),
            audio_only: config.download.audio_only,
            work_dir: config.app.work_dir.clone(),
            ffprobe: config.tools.ffprobe.clone(),
            process_timeout: config.tools.process_timeout(),
            max_concurrent_jobs: config.app.max_concurrent_jobs,
        }
    }

    fn work_root(&self) -> PathBuf {
        self.work_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// One entry of a batch run
#[derive(Debug)]
pub struct BatchOutcome {
    pub input: String,
    pub result: Result<Acquisition, DownloadError>,
}

pub struct AcquisitionPipeline {
    subtitles: Arc<dyn SubtitleSource>,
    metadata: Arc<dyn MetadataSource>,
    chain: Arc<StrategyChain>,
    transcriber: Arc<dyn Transcriber>,
    options: PipelineOptions,
}

impl AcquisitionPipeline {
    pub fn new(
        subtitles: Arc<dyn SubtitleSource>,
        metadata: Arc<dyn MetadataSource>,
        chain: Arc<StrategyChain>,
        transcriber: Arc<dyn Transcriber>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            subtitles,
            metadata,
            chain,
            transcriber,
            options,
        }
    }

    /// Wire every built-in collaborator from configuration
    pub fn from_config(config: &Config) -> Result<Self, DownloadError> {
        let deps = strategy_deps(config)?;
        let ytdlp = YtDlp::from_config(config);

        let subtitles = SubtitleResolver::new(ytdlp.clone(), deps.bilibili.clone(), deps.client.clone())
            .with_timeout(config.network.request_timeout());
        let metadata = PlatformMetadata::new(deps.bilibili.clone(), ytdlp);
        let chain = StrategyChain::from_config(config, deps);

        Ok(Self::new(
            Arc::new(subtitles),
            Arc::new(metadata),
            Arc::new(chain),
            Arc::new(TranscriptionEngine::from_config(config)),
            PipelineOptions::from_config(config),
        ))
    }

    pub fn chain(&self) -> &StrategyChain {
        &self.chain
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Turn one URL or local file into a transcript
    pub async fn acquire(&self, input: &str, cancel: &CancellationToken) -> Result<Acquisition, DownloadError> {
        let input = input.trim();

        if !platform::is_web_url(input) {
            let path = Path::new(input);
            if path.is_file() {
                return self.acquire_local(path, cancel).await;
            }
            return Err(DownloadError::new(
                ErrorKind::UnsupportedPlatform,
                Platform::Unknown,
                format!("{} is neither an http(s) URL nor an existing file", input),
            ));
        }

        let mut states = vec![AcquisitionState::Start];
        let result = self.acquire_url(input, &mut states, cancel).await;
        if let Err(e) = &result {
            states.push(AcquisitionState::Failed);
            tracing::warn!("Acquisition of {} failed [{}] after {:?}", input, e.kind, states);
        }
        result
    }

    async fn acquire_url(
        &self,
        url: &str,
        states: &mut Vec<AcquisitionState>,
        cancel: &CancellationToken,
    ) -> Result<Acquisition, DownloadError> {
        let captions = self.try_subtitles(url, cancel).await?;
        states.push(AcquisitionState::SubtitleAttempted);

        if let Some(transcript) = captions {
            states.push(AcquisitionState::TranscriptReady);
            tracing::info!("Using platform subtitles ({} chars)", transcript.chars().count());
            let info = self.metadata.video_info(url, cancel).await;
            states.push(AcquisitionState::Done);
            return Ok(Acquisition {
                info,
                transcript,
                source: TranscriptSource::Subtitles,
                states: states.clone(),
            });
        }

        states.push(AcquisitionState::MediaNeeded);
        let work_root = self.options.work_root();
        tokio::fs::create_dir_all(&work_root)
            .await
            .map_err(|e| DownloadError::io(platform::classify(url), "Failed to create work directory", e))?;
        let scratch = tempfile::Builder::new()
            .prefix("acquisition-")
            .tempdir_in(&work_root)
            .map_err(|e| DownloadError::io(platform::classify(url), "Failed to create temporary directory", e))?;

        let outcome = self.download_and_transcribe(url, scratch.path(), states, cancel).await;

        let scratch_path = scratch.path().to_path_buf();
        if let Err(e) = scratch.close() {
            tracing::warn!("Failed to remove {}: {}", scratch_path.display(), e);
        }
        outcome
    }

    /// Caption lookup where anything short of cancellation counts as a miss
    async fn try_subtitles(&self, url: &str, cancel: &CancellationToken) -> Result<Option<String>, DownloadError> {
        match self.subtitles.extract(url, cancel).await {
            Ok(text) => Ok(text.filter(|t| !t.trim().is_empty())),
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                tracing::warn!("Subtitle lookup failed, falling back to download: {}", e);
                Ok(None)
            }
        }
    }

    async fn download_and_transcribe(
        &self,
        url: &str,
        scratch: &Path,
        states: &mut Vec<AcquisitionState>,
        cancel: &CancellationToken,
    ) -> Result<Acquisition, DownloadError> {
        states.push(AcquisitionState::Downloading);
        let media = self.chain.resolve(url, scratch, self.options.audio_only, cancel).await?;

        states.push(AcquisitionState::Transcribing);
        let transcript = self.transcribe(&media.path, cancel).await?;

        states.push(AcquisitionState::Done);
        Ok(Acquisition {
            info: media.info,
            transcript,
            source: TranscriptSource::Transcribed,
            states: states.clone(),
        })
    }

    async fn transcribe(&self, path: &Path, cancel: &CancellationToken) -> Result<String, DownloadError> {
        let request = TranscribeRequest::new(path, self.options.model.clone(), self.options.language.clone());
        tracing::info!("Transcribing {} with model {}", path.display(), request.model);
        self.transcriber.transcribe(&request, cancel).await
    }

    async fn acquire_local(&self, path: &Path, cancel: &CancellationToken) -> Result<Acquisition, DownloadError> {
        let mut states = vec![AcquisitionState::Start, AcquisitionState::Transcribing];
        tracing::info!("Transcribing local file {}", path.display());

        let options = ProcessOptions::new(self.options.process_timeout, cancel.clone());
        let duration = probe_duration(&self.options.ffprobe, path, &options).await.unwrap_or(0);
        let info = VideoInfo {
            duration,
            platform: Platform::Local,
            ..VideoInfo::from_file(path, &path.to_string_lossy())
        };

        match self.transcribe(path, cancel).await {
            Ok(transcript) => {
                states.push(AcquisitionState::Done);
                Ok(Acquisition {
                    info,
                    transcript,
                    source: TranscriptSource::LocalFile,
                    states,
                })
            }
            Err(e) => {
                states.push(AcquisitionState::Failed);
                tracing::warn!("Local transcription failed [{}] after {:?}", e.kind, states);
                Err(e)
            }
        }
    }

    /// Process several inputs, in order. Sequential unless
    /// `max_concurrent_jobs > 1`; results keep input order either way.
    pub async fn acquire_many(&self, inputs: &[String], cancel: &CancellationToken) -> Vec<BatchOutcome> {
        let jobs = self.options.max_concurrent_jobs.max(1);
        tracing::info!("Batch of {} inputs, {} at a time", inputs.len(), jobs);

        futures_util::stream::iter(inputs)
            .map(|input| async move {
                let result = if cancel.is_cancelled() {
                    Err(DownloadError::cancelled(platform::classify(input)))
                } else {
                    self.acquire(input, cancel).await
                };
                BatchOutcome {
                    input: input.clone(),
                    result,
                }
            })
            .buffered(jobs)
            .collect()
            .await
    }
}

/// HTTP clients, Bilibili API and rate-limit policy shared by all strategies
pub fn strategy_deps(config: &Config) -> Result<StrategyDeps, DownloadError> {
    let proxy = config.network.proxy();
    let timeout = config.network.request_timeout();
    let client = build_client(&proxy, timeout, config.network.user_agent.as_deref())?;

    let cookie = config
        .network
        .cookie_file()
        .and_then(|path| cookie_header_for(path, "bilibili.com"));
    let bilibili_client = client_builder(&proxy, timeout)?
        .default_headers(BilibiliApi::default_headers(cookie.as_deref()))
        .timeout(timeout)
        .build()
        .map_err(|e| DownloadError::from_reqwest(Platform::Bilibili, "Failed to build Bilibili client", &e))?;

    let pacer = Arc::new(PlatformPacer::new(Duration::from_millis(
        config.rate_limit.platform_min_interval_ms,
    )));
    let policy: Arc<dyn RateLimitPolicy> = Arc::new(SignaturePolicy::new(
        Duration::from_secs(config.rate_limit.base_delay_secs),
        config.rate_limit.max_retries,
    ));

    Ok(StrategyDeps {
        client,
        bilibili: BilibiliApi::new(bilibili_client, pacer).with_policy(policy.clone()),
        policy,
    })
}
