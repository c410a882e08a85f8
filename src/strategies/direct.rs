use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, REFERER, USER_AGENT};
use reqwest::Client;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{AcquiredMedia, DownloadStrategy, StrategyDeps, VideoInfo, YtDlp};
use crate::config::Config;
use crate::error::{DownloadError, ErrorKind};
use crate::fetch::{FetchOptions, ProgressCallback, RangeFetcher};
use crate::platform::{self, Platform};
use crate::ratelimit::{retry_throttled, RateLimitPolicy};
use crate::utils::{media, sanitize_filename, ProcessOptions};

pub const MOBILE_USER_AGENT: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Mobile/15E148 Safari/604.1";

/// Platforms whose pages embed directly fetchable media
const DIRECT_PLATFORMS: &[Platform] = &[
    Platform::Douyin,
    Platform::Tiktok,
    Platform::Instagram,
    Platform::Facebook,
    Platform::Kuaishou,
    Platform::Weibo,
    Platform::Xiaohongshu,
];

/// Short-link hosts that need a redirect hop before extraction
const SHORT_LINK_HOSTS: &[&str] = &["v.douyin.com", "v.kuaishou.com", "xhslink.com"];

/// Alternative extractor settings, tried in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExtractorVariant {
    Default,
    NoCheckCertificates,
    MobileUserAgent,
}

impl ExtractorVariant {
    const ALL: [ExtractorVariant; 3] = [
        ExtractorVariant::Default,
        ExtractorVariant::NoCheckCertificates,
        ExtractorVariant::MobileUserAgent,
    ];

    fn args(&self) -> Vec<String> {
        match self {
            ExtractorVariant::Default => Vec::new(),
            ExtractorVariant::NoCheckCertificates => vec!["--no-check-certificates".to_string()],
            ExtractorVariant::MobileUserAgent => vec!["--user-agent".to_string(), MOBILE_USER_AGENT.to_string()],
        }
    }
}

/// A media URL plus the headers needed to fetch it
#[derive(Debug, Clone)]
pub struct DirectMedia {
    pub url: String,
    pub headers: HeaderMap,
    pub ext: String,
}

/// Pick a directly fetchable URL out of a yt-dlp info dictionary.
///
/// Playlists yield their first entry. For audio-only requests an audio-bearing
/// entry of `requested_formats` is preferred. HLS is rejected.
pub fn pick_direct_media(info: &Value, page_url: &str, audio_only: bool) -> Result<(DirectMedia, Value), DownloadError> {
    let platform = platform::classify(page_url);
    let entry = match info["entries"].as_array() {
        Some(entries) => entries.first().cloned().ok_or_else(|| {
            DownloadError::new(ErrorKind::InfoError, platform, "Playlist has no entries")
        })?,
        None => info.clone(),
    };

    let audio_stream = audio_only
        .then(|| entry["requested_formats"].as_array())
        .flatten()
        .and_then(|formats| {
            formats
                .iter()
                .find(|f| f["acodec"].as_str().map(|c| c != "none").unwrap_or(false) && f["url"].is_string())
        });

    let source = audio_stream.unwrap_or(&entry);
    let url = source["url"]
        .as_str()
        .or_else(|| entry["url"].as_str())
        .filter(|u| !u.is_empty())
        .map(str::to_string)
        .ok_or_else(|| DownloadError::new(ErrorKind::InfoError, platform, "No direct media URL in extractor output"))?;

    let protocol = source["protocol"].as_str().unwrap_or_default();
    if protocol.starts_with("m3u8") || url.contains(".m3u8") {
        return Err(DownloadError::new(
            ErrorKind::DownloadFailed,
            platform,
            "Media is only available as an HLS stream, which cannot be fetched directly",
        ));
    }

    let mut headers = HeaderMap::new();
    let header_source = if source["http_headers"].is_object() { source } else { &entry };
    if let Some(map) = header_source["http_headers"].as_object() {
        for (name, value) in map {
            if let (Ok(name), Some(Ok(value))) = (
                HeaderName::from_bytes(name.as_bytes()),
                value.as_str().map(HeaderValue::from_str),
            ) {
                headers.insert(name, value);
            }
        }
    }
    if !headers.contains_key(REFERER) {
        let referer = entry["webpage_url"].as_str().unwrap_or(page_url);
        if let Ok(value) = HeaderValue::from_str(referer) {
            headers.insert(REFERER, value);
        }
    }

    let ext = source["ext"]
        .as_str()
        .or_else(|| entry["ext"].as_str())
        .unwrap_or("mp4")
        .to_string();

    Ok((
        DirectMedia {
            url,
            headers,
            ext,
        },
        entry,
    ))
}

/// Resolves a playable URL with yt-dlp in metadata mode and downloads it with
/// the parallel range fetcher
pub struct DirectLinkStrategy {
    ytdlp: YtDlp,
    fetcher: RangeFetcher,
    client: Client,
    ffmpeg: String,
    process_timeout: Duration,
    fetch_options: FetchOptions,
    policy: Arc<dyn RateLimitPolicy>,
}

impl DirectLinkStrategy {
    pub fn new(
        ytdlp: YtDlp,
        fetcher: RangeFetcher,
        client: Client,
        ffmpeg: impl Into<String>,
        fetch_options: FetchOptions,
        policy: Arc<dyn RateLimitPolicy>,
    ) -> Self {
        Self {
            ytdlp,
            fetcher,
            client,
            ffmpeg: ffmpeg.into(),
            process_timeout: Duration::from_secs(600),
            fetch_options,
            policy,
        }
    }

    pub fn from_config(config: &Config, deps: &StrategyDeps, ytdlp: YtDlp) -> Self {
        let fetch_options = FetchOptions {
            max_parallel_segments: config.download.max_parallel_segments,
            segment_size: config.segment_size(),
            segment_retries: config.download.segment_retries,
            request_timeout: config.network.request_timeout(),
            ..Default::default()
        };

        Self {
            process_timeout: config.tools.process_timeout(),
            ..Self::new(
                ytdlp,
                RangeFetcher::new(deps.client.clone()).with_policy(deps.policy.clone()),
                deps.client.clone(),
                config.tools.ffmpeg.clone(),
                fetch_options,
                deps.policy.clone(),
            )
        }
    }

    /// Follow a short-link redirect with a mobile browser profile. Failure
    /// keeps the original URL.
    async fn preprocess_url(&self, url: &str) -> String {
        let is_short = platform::is_web_url(url)
            && crate::utils::extract_domain(url)
                .map(|domain| SHORT_LINK_HOSTS.contains(&domain.as_str()))
                .unwrap_or(false);
        if !is_short {
            return url.to_string();
        }

        let mut request = self
            .client
            .get(url)
            .header(USER_AGENT, MOBILE_USER_AGENT)
            .header(ACCEPT, "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8")
            .header(ACCEPT_LANGUAGE, "zh-CN,zh;q=0.8,en;q=0.2")
            .timeout(self.fetch_options.request_timeout);
        if platform::classify(url) == Platform::Douyin {
            request = request.header(REFERER, "https://www.douyin.com/");
        }

        match request.send().await {
            Ok(response) => {
                let resolved = response.url().to_string();
                if resolved != url {
                    tracing::info!("Short link redirected: {} -> {}", url, resolved);
                }
                resolved
            }
            Err(e) => {
                tracing::debug!("Short link resolution failed, using original URL: {}", e);
                url.to_string()
            }
        }
    }

    /// Run the extractor with each variant until one succeeds
    async fn extract(&self, url: &str, cancel: &CancellationToken) -> Result<Value, DownloadError> {
        let mut last_error = None;

        for (i, variant) in ExtractorVariant::ALL.iter().enumerate() {
            match self.ytdlp.dump_json(url, &variant.args(), cancel).await {
                Ok(info) => {
                    tracing::debug!("Extraction succeeded with variant {} ({:?})", i + 1, variant);
                    return Ok(info);
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    tracing::debug!("Extraction variant {:?} failed: {}", variant, e.message);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            DownloadError::new(ErrorKind::InfoError, platform::classify(url), "Every extraction variant failed")
        }))
    }
}

#[async_trait]
impl DownloadStrategy for DirectLinkStrategy {
    fn name(&self) -> &str {
        "direct-link"
    }

    fn priority(&self) -> i32 {
        25
    }

    fn supports(&self, url: &str) -> bool {
        DIRECT_PLATFORMS.contains(&platform::classify(url))
    }

    async fn attempt(
        &self,
        url: &str,
        output_dir: &Path,
        audio_only: bool,
        cancel: &CancellationToken,
    ) -> Result<AcquiredMedia, DownloadError> {
        let platform = platform::classify(url);
        let resolved = self.preprocess_url(url).await;
        let resolved = resolved.as_str();

        let info = retry_throttled(self.policy.as_ref(), platform, cancel, |_| self.extract(resolved, cancel)).await?;
        let (direct, entry) = pick_direct_media(&info, url, audio_only)?;
        let video_info = VideoInfo::from_ytdlp(&entry, url);

        let file_name = format!("{}.{}", sanitize_filename(&video_info.title, "video"), direct.ext);
        let destination = output_dir.join(file_name);

        let progress: ProgressCallback = Arc::new(|downloaded: u64, total: Option<u64>| {
            if let Some(total) = total.filter(|t| *t > 0) {
                tracing::debug!("Download progress {:.1}%", downloaded as f64 / total as f64 * 100.0);
            }
        });
        let options = FetchOptions {
            headers: direct.headers.clone(),
            platform,
            progress: Some(progress),
            ..self.fetch_options.clone()
        };

        tracing::info!("Fetching direct media for {}", video_info.title);
        let report = self.fetcher.fetch(&direct.url, &destination, &options, cancel).await?;
        tracing::info!(
            "Fetched {} bytes ({}, {} retries)",
            report.bytes,
            if report.segmented { "segmented" } else { "single stream" },
            report.total_retries()
        );
        let mut path = report.path;

        let is_mp3 = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("mp3"))
            .unwrap_or(false);
        if audio_only && !is_mp3 {
            let process = ProcessOptions::new(self.process_timeout, cancel.clone());
            path = media::extract_audio(&self.ffmpeg, &path, &process).await?;
        }

        Ok(AcquiredMedia { path, info: video_info })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const PAGE: &str = "https://www.douyin.com/video/1";

    #[test]
    fn test_pick_plain_url_with_referer_default() {
        let info = json!({"title": "clip", "url": "https://cdn/x.mp4", "ext": "mp4"});
        let (direct, entry) = pick_direct_media(&info, PAGE, false).unwrap();
        assert_eq!(direct.url, "https://cdn/x.mp4");
        assert_eq!(direct.headers.get(REFERER).unwrap(), PAGE);
        assert_eq!(direct.ext, "mp4");
        assert_eq!(entry["title"], "clip");
    }

    #[test]
    fn test_pick_first_playlist_entry_and_headers() {
        let info = json!({"entries": [
            {"title": "one", "url": "https://cdn/1.mp4", "http_headers": {"User-Agent": "UA", "Referer": "https://r/"}},
            {"title": "two", "url": "https://cdn/2.mp4"}
        ]});
        let (direct, entry) = pick_direct_media(&info, PAGE, false).unwrap();
        assert_eq!(direct.url, "https://cdn/1.mp4");
        assert_eq!(direct.headers.get(USER_AGENT).unwrap(), "UA");
        assert_eq!(direct.headers.get(REFERER).unwrap(), "https://r/");
        assert_eq!(entry["title"], "one");
    }

    #[test]
    fn test_pick_prefers_audio_format_when_audio_only() {
        let info = json!({
            "title": "clip",
            "url": "https://cdn/muxed.mp4",
            "requested_formats": [
                {"url": "https://cdn/video.mp4", "acodec": "none", "vcodec": "h264", "ext": "mp4"},
                {"url": "https://cdn/audio.m4a", "acodec": "mp4a", "vcodec": "none", "ext": "m4a"}
            ]
        });
        let (audio, _) = pick_direct_media(&info, PAGE, true).unwrap();
        assert_eq!(audio.url, "https://cdn/audio.m4a");
        assert_eq!(audio.ext, "m4a");

        let (video, _) = pick_direct_media(&info, PAGE, false).unwrap();
        assert_eq!(video.url, "https://cdn/muxed.mp4");
    }

    #[test]
    fn test_pick_rejects_hls() {
        let info = json!({"url": "https://cdn/index.m3u8", "protocol": "m3u8_native"});
        let err = pick_direct_media(&info, PAGE, false).unwrap_err();
        assert_eq!(err.kind, ErrorKind::DownloadFailed);

        let missing = pick_direct_media(&json!({"title": "x"}), PAGE, false).unwrap_err();
        assert_eq!(missing.kind, ErrorKind::InfoError);
    }

    #[test]
    fn test_variant_args() {
        assert!(ExtractorVariant::Default.args().is_empty());
        assert_eq!(ExtractorVariant::NoCheckCertificates.args(), vec!["--no-check-certificates"]);
        assert_eq!(ExtractorVariant::MobileUserAgent.args()[1], MOBILE_USER_AGENT);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_attempt_extracts_then_fetches_media() {
        use std::os::unix::fs::PermissionsExt;

        let mut server = mockito::Server::new_async().await;
        let body = vec![3u8; 2048];
        let _head = server.mock("HEAD", "/media.mp3").with_status(200).create_async().await;
        let _get = server
            .mock("GET", "/media.mp3")
            .with_status(200)
            .with_body(body.clone())
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("yt-dlp");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\necho '{{\"title\": \"clip\", \"uploader\": \"u\", \"url\": \"{}/media.mp3\", \"ext\": \"mp3\"}}'\n",
                server.url()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        let out = dir.path().join("out");
        std::fs::create_dir(&out).unwrap();

        let policy: Arc<dyn RateLimitPolicy> = Arc::new(crate::ratelimit::SignaturePolicy::default());
        let strategy = DirectLinkStrategy::new(
            YtDlp::new(script.to_str().unwrap()),
            RangeFetcher::new(Client::new()),
            Client::new(),
            "ffmpeg-not-needed",
            FetchOptions::default(),
            policy,
        );

        let media = strategy
            .attempt(PAGE, &out, true, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(media.path, out.join("clip.mp3"));
        assert_eq!(std::fs::read(&media.path).unwrap(), body);
        assert_eq!(media.info.title, "clip");
        assert_eq!(media.info.uploader, "u");
    }

    #[test]
    fn test_supports_short_form_platforms() {
        let policy: Arc<dyn RateLimitPolicy> = Arc::new(crate::ratelimit::SignaturePolicy::default());
        let strategy = DirectLinkStrategy::new(
            YtDlp::new("yt-dlp"),
            RangeFetcher::new(Client::new()),
            Client::new(),
            "ffmpeg",
            FetchOptions::default(),
            policy,
        );
        assert!(strategy.supports("https://v.douyin.com/abc/"));
        assert!(strategy.supports("https://www.tiktok.com/@u/video/1"));
        assert!(!strategy.supports("https://www.youtube.com/watch?v=1"));
        assert_eq!(strategy.priority(), 25);
    }
}
