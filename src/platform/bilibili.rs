//! Client for the public Bilibili web API
//!
//! Used both by the Bilibili download strategy (metadata) and by the subtitle
//! resolver (caption tracks). Every call goes through the shared per-platform
//! pacer so concurrent acquisitions do not amplify throttling.

use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, COOKIE, REFERER, USER_AGENT};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::{Arc, OnceLock};

use super::Platform;
use crate::error::{DownloadError, ErrorKind};
use crate::ratelimit::{status_error, PlatformPacer, RateLimitPolicy, SignaturePolicy};
use crate::strategies::VideoInfo;

pub const DEFAULT_API_BASE: &str = "https://api.bilibili.com";

pub const DESKTOP_USER_AGENT: &str =
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

const REFERER_URL: &str = "https://www.bilibili.com";

/// Response envelope shared by every Bilibili endpoint
#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    code: i64,
    #[serde(default)]
    message: Option<String>,
    data: Option<T>,
}

/// Subset of `/x/web-interface/view`
#[derive(Debug, Clone, Deserialize)]
pub struct ViewData {
    pub bvid: String,
    pub cid: u64,
    pub title: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub duration: u64,
    #[serde(default)]
    pub pic: Option<String>,
    pub owner: Owner,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Owner {
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct PlayerData {
    #[serde(default)]
    subtitle: Option<PlayerSubtitles>,
}

#[derive(Debug, Deserialize)]
struct PlayerSubtitles {
    #[serde(default)]
    subtitles: Vec<SubtitleTrack>,
}

/// One caption track listed by the player endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct SubtitleTrack {
    /// Language code, `ai-` prefixed for machine-generated tracks
    pub lan: String,
    #[serde(default)]
    pub lan_doc: String,
    pub subtitle_url: String,
}

impl SubtitleTrack {
    pub fn is_auto_generated(&self) -> bool {
        self.lan.starts_with("ai-")
    }
}

#[derive(Debug, Deserialize)]
struct SubtitleBody {
    #[serde(default)]
    body: Vec<SubtitleLine>,
}

#[derive(Debug, Deserialize)]
struct SubtitleLine {
    #[serde(default)]
    content: String,
}

fn video_url_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(bilibili\.com/video/[Bb][Vv]\w+)|(b23\.tv/\w+)").expect("static regex")
    })
}

fn bvid_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[Bb][Vv](\w+)").expect("static regex"))
}

/// Whether the URL is a Bilibili video page or short link
pub fn is_video_url(url: &str) -> bool {
    video_url_pattern().is_match(url)
}

pub fn is_short_link(url: &str) -> bool {
    url.contains("b23.tv/")
}

/// Extract the `BV...` identifier, normalising the prefix case
pub fn extract_bvid(url: &str) -> Option<String> {
    // Only look at the path so query strings like `?vd_source=` cannot match
    let path = url.split(['?', '#']).next().unwrap_or(url);
    bvid_pattern()
        .captures(path)
        .and_then(|caps| caps.get(1))
        .map(|m| format!("BV{}", m.as_str()))
}

/// Bilibili public API client
#[derive(Clone)]
pub struct BilibiliApi {
    client: Client,
    api_base: String,
    pacer: Arc<PlatformPacer>,
    policy: Arc<dyn RateLimitPolicy>,
}

impl BilibiliApi {
    pub fn new(client: Client, pacer: Arc<PlatformPacer>) -> Self {
        Self::with_base(client, pacer, DEFAULT_API_BASE)
    }

    /// Point the client at a different API host
    pub fn with_base(client: Client, pacer: Arc<PlatformPacer>, api_base: &str) -> Self {
        Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            pacer,
            policy: Arc::new(SignaturePolicy::default()),
        }
    }

    /// Decide which HTTP statuses count as throttling with `policy`
    pub fn with_policy(mut self, policy: Arc<dyn RateLimitPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Default request headers the API expects, plus cookies when configured
    pub fn default_headers(cookie_header: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(DESKTOP_USER_AGENT));
        headers.insert(REFERER, HeaderValue::from_static(REFERER_URL));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json, text/plain, */*"));
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("zh-CN,zh;q=0.9,en;q=0.8"));
        if let Some(cookie) = cookie_header.and_then(|c| HeaderValue::from_str(c).ok()) {
            headers.insert(COOKIE, cookie);
        }
        headers
    }

    /// Follow a `b23.tv` redirect chain to the canonical page URL
    pub async fn resolve_short_link(&self, url: &str) -> Result<String, DownloadError> {
        self.pacer.pace(Platform::Bilibili).await;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| DownloadError::from_reqwest(Platform::Bilibili, "Failed to resolve short link", &e))?;
        let resolved = response.url().to_string();
        tracing::debug!("Resolved short link {} -> {}", url, resolved);
        Ok(resolved)
    }

    /// Resolve the BV id for any supported Bilibili URL shape
    pub async fn bvid_for(&self, url: &str) -> Result<String, DownloadError> {
        let page_url = if is_short_link(url) {
            self.resolve_short_link(url).await?
        } else {
            url.to_string()
        };

        extract_bvid(&page_url).ok_or_else(|| {
            DownloadError::new(ErrorKind::InfoError, Platform::Bilibili, "Could not find a BV id in the URL")
                .with_detail(page_url)
        })
    }

    /// `/x/web-interface/view` for a BV id
    pub async fn view(&self, bvid: &str) -> Result<ViewData, DownloadError> {
        let endpoint = format!("{}/x/web-interface/view?bvid={}", self.api_base, bvid);
        self.get_api(&endpoint, "Failed to fetch video info").await
    }

    /// Metadata for a page URL, as a `VideoInfo`
    pub async fn video_info(&self, url: &str) -> Result<VideoInfo, DownloadError> {
        let bvid = self.bvid_for(url).await?;
        let view = self.view(&bvid).await?;
        if view.title.trim().is_empty() {
            return Err(DownloadError::new(
                ErrorKind::InfoError,
                Platform::Bilibili,
                "Video info is missing a title",
            ));
        }

        Ok(VideoInfo {
            title: view.title,
            uploader: view.owner.name,
            description: view.desc,
            duration: view.duration,
            platform: Platform::Bilibili,
            url: url.to_string(),
            thumbnail_url: view.pic,
        })
    }

    /// Caption tracks listed by the player endpoint
    pub async fn subtitle_tracks(&self, bvid: &str, cid: u64) -> Result<Vec<SubtitleTrack>, DownloadError> {
        let endpoint = format!("{}/x/player/wbi/v2?cid={}&bvid={}", self.api_base, cid, bvid);
        let data: PlayerData = self.get_api(&endpoint, "Failed to list subtitles").await?;
        Ok(data.subtitle.map(|s| s.subtitles).unwrap_or_default())
    }

    /// Download a caption track and return its lines
    pub async fn subtitle_lines(&self, subtitle_url: &str) -> Result<Vec<String>, DownloadError> {
        let url = if subtitle_url.starts_with("//") {
            format!("https:{}", subtitle_url)
        } else {
            subtitle_url.to_string()
        };

        self.pacer.pace(Platform::Bilibili).await;
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| DownloadError::from_reqwest(Platform::Bilibili, "Failed to download subtitle", &e))?;
        if !response.status().is_success() {
            return Err(status_error(
                self.policy.as_ref(),
                Platform::Bilibili,
                response.status(),
                "Failed to download subtitle",
            ));
        }
        let body: SubtitleBody = response
            .json()
            .await
            .map_err(|e| DownloadError::from_reqwest(Platform::Bilibili, "Invalid subtitle body", &e))?;

        Ok(body.body.into_iter().map(|line| line.content).collect())
    }

    async fn get_api<T: DeserializeOwned>(&self, endpoint: &str, context: &str) -> Result<T, DownloadError> {
        self.pacer.pace(Platform::Bilibili).await;
        tracing::debug!("GET {}", endpoint);

        let response = self
            .client
            .get(endpoint)
            .send()
            .await
            .map_err(|e| DownloadError::from_reqwest(Platform::Bilibili, context, &e))?;
        if !response.status().is_success() {
            return Err(status_error(self.policy.as_ref(), Platform::Bilibili, response.status(), context));
        }

        let envelope: ApiEnvelope<T> = response
            .json()
            .await
            .map_err(|e| DownloadError::from_reqwest(Platform::Bilibili, context, &e))?;

        if envelope.code != 0 {
            let message = envelope.message.unwrap_or_default();
            let kind = match envelope.code {
                -412 | -509 | -799 => ErrorKind::RateLimited,
                -101 | -403 => ErrorKind::AuthRequired,
                _ => ErrorKind::InfoError,
            };
            return Err(DownloadError::new(
                kind,
                Platform::Bilibili,
                format!("{}: API code {} {}", context, envelope.code, message),
            )
            .with_detail(format!("code={} message={}", envelope.code, message)));
        }

        envelope.data.ok_or_else(|| {
            DownloadError::new(ErrorKind::InfoError, Platform::Bilibili, format!("{}: response has no data", context))
        })
    }
}
