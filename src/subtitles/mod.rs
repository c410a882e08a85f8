//! Tier 1: reuse captions the platform already has
//!
//! A hit costs one or two metadata calls instead of a download plus model
//! inference. A video without captions is a normal `Ok(None)`.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub mod parse;

use crate::error::DownloadError;
use crate::platform::bilibili::{self as bili, SubtitleTrack};
use crate::platform::{self, BilibiliApi, Platform};
use crate::strategies::YtDlp;

/// Language preference, first match wins
pub const LANGUAGE_PREFERENCE: &[&str] = &["zh-Hans", "zh-Hant", "zh", "en"];

/// Anything that can look up existing captions for a URL
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SubtitleSource: Send + Sync {
    /// Transcript text, or `None` when the video has no usable captions
    async fn extract(&self, url: &str, cancel: &CancellationToken) -> Result<Option<String>, DownloadError>;
}

/// Caption format as advertised by yt-dlp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptionFormat {
    Json3,
    TimedText,
}

/// A caption file chosen for download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptionTrack {
    pub language: String,
    pub url: String,
    pub format: CaptionFormat,
    pub auto_generated: bool,
}

/// Pick a caption track from a yt-dlp info dictionary: human tracks before
/// automatic ones, then language preference, then json3 before other formats.
pub fn select_youtube_track(info: &Value) -> Option<CaptionTrack> {
    let usable = |key: &str| {
        info[key].as_object().map(|tracks| {
            tracks
                .iter()
                .filter(|(lang, formats)| *lang != "live_chat" && formats.as_array().map(|f| !f.is_empty()).unwrap_or(false))
                .collect::<Vec<_>>()
        })
    };

    let (tracks, auto_generated) = match usable("subtitles").filter(|t| !t.is_empty()) {
        Some(human) => (human, false),
        None => (usable("automatic_captions").filter(|t| !t.is_empty())?, true),
    };

    let (language, formats) = LANGUAGE_PREFERENCE
        .iter()
        .find_map(|wanted| tracks.iter().find(|(lang, _)| lang.as_str() == *wanted))
        .or_else(|| tracks.first())?;
    let formats = formats.as_array()?;

    let by_ext = |ext: &str| formats.iter().find(|f| f["ext"].as_str() == Some(ext));
    let (chosen, format) = match by_ext("json3") {
        Some(f) => (f, CaptionFormat::Json3),
        None => (
            by_ext("vtt").or_else(|| by_ext("srt")).or_else(|| formats.first())?,
            CaptionFormat::TimedText,
        ),
    };

    Some(CaptionTrack {
        language: language.to_string(),
        url: chosen["url"].as_str()?.to_string(),
        format,
        auto_generated,
    })
}

/// Rank a Bilibili language code, lower is better
fn bilibili_language_rank(lan: &str) -> usize {
    match lan.trim_start_matches("ai-") {
        "zh-CN" | "zh-Hans" => 0,
        "zh-Hant" | "zh-TW" | "zh-HK" => 1,
        "zh" => 2,
        "en" | "en-US" | "en-GB" => 3,
        _ => LANGUAGE_PREFERENCE.len(),
    }
}

/// Human tracks first, then language preference
pub fn select_bilibili_track(tracks: &[SubtitleTrack]) -> Option<&SubtitleTrack> {
    tracks
        .iter()
        .filter(|track| !track.subtitle_url.is_empty())
        .min_by_key(|track| (track.is_auto_generated(), bilibili_language_rank(&track.lan)))
}

/// Platform-dispatching subtitle resolver
#[derive(Clone)]
pub struct SubtitleResolver {
    ytdlp: YtDlp,
    bilibili: BilibiliApi,
    client: Client,
    request_timeout: Duration,
}

impl SubtitleResolver {
    pub fn new(ytdlp: YtDlp, bilibili: BilibiliApi, client: Client) -> Self {
        Self {
            ytdlp,
            bilibili,
            client,
            request_timeout: Duration::from_secs(30),
        }
    }

    /// Limit for each caption download
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    async fn youtube(&self, url: &str, cancel: &CancellationToken) -> Result<Option<String>, DownloadError> {
        let info = self.ytdlp.dump_json(url, &["--no-playlist".to_string()], cancel).await?;

        let Some(track) = select_youtube_track(&info) else {
            tracing::info!("No YouTube captions available");
            return Ok(None);
        };
        tracing::info!(
            "Using {} captions ({}, {:?})",
            track.language,
            if track.auto_generated { "automatic" } else { "uploaded" },
            track.format
        );

        self.fetch_caption(&track, Platform::Youtube).await
    }

    /// Download and flatten one caption file
    pub async fn fetch_caption(&self, track: &CaptionTrack, platform: Platform) -> Result<Option<String>, DownloadError> {
        let response = self
            .client
            .get(&track.url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| DownloadError::from_reqwest(platform, "Failed to download captions", &e))?;
        if !response.status().is_success() {
            return Err(DownloadError::from_status(platform, response.status(), "Failed to download captions"));
        }
        let body = response
            .text()
            .await
            .map_err(|e| DownloadError::from_reqwest(platform, "Failed to read captions", &e))?;

        let text = match track.format {
            CaptionFormat::Json3 => parse::parse_json3(&body).unwrap_or_else(|e| {
                tracing::warn!("Malformed json3 captions, falling back to plain text: {}", e);
                parse::strip_timed_text(&body)
            }),
            CaptionFormat::TimedText => parse::strip_timed_text(&body),
        };

        Ok(Some(text).filter(|t| !t.is_empty()))
    }

    async fn bilibili(&self, url: &str) -> Result<Option<String>, DownloadError> {
        if !bili::is_video_url(url) {
            return Ok(None);
        }

        let bvid = self.bilibili.bvid_for(url).await?;
        let view = self.bilibili.view(&bvid).await?;
        let tracks = self.bilibili.subtitle_tracks(&bvid, view.cid).await?;

        let Some(track) = select_bilibili_track(&tracks) else {
            tracing::info!("No Bilibili captions for {}", bvid);
            return Ok(None);
        };
        tracing::info!("Using Bilibili captions: {} ({})", track.lan_doc, track.lan);

        let lines = self.bilibili.subtitle_lines(&track.subtitle_url).await?;
        let text = parse::join_lines(lines);
        Ok(Some(text).filter(|t| !t.is_empty()))
    }
}

#[async_trait]
impl SubtitleSource for SubtitleResolver {
    async fn extract(&self, url: &str, cancel: &CancellationToken) -> Result<Option<String>, DownloadError> {
        if cancel.is_cancelled() {
            return Err(DownloadError::cancelled(platform::classify(url)));
        }

        match platform::classify(url) {
            Platform::Youtube => self.youtube(url, cancel).await,
            Platform::Bilibili => self.bilibili(url).await,
            other => {
                tracing::debug!("No caption source for {}", other);
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::ratelimit::PlatformPacer;
    use mockito::Matcher;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn track(lan: &str, url: &str) -> SubtitleTrack {
        SubtitleTrack {
            lan: lan.to_string(),
            lan_doc: lan.to_string(),
            subtitle_url: url.to_string(),
        }
    }

    fn resolver(api_base: &str) -> SubtitleResolver {
        let pacer = Arc::new(PlatformPacer::new(Duration::ZERO));
        SubtitleResolver::new(
            YtDlp::new("definitely-not-yt-dlp-xyz"),
            BilibiliApi::with_base(Client::new(), pacer, api_base),
            Client::new(),
        )
    }

    #[test]
    fn test_human_tracks_beat_automatic() {
        let info = json!({
            "subtitles": {"en": [{"ext": "vtt", "url": "https://s/en.vtt"}]},
            "automatic_captions": {"zh-Hans": [{"ext": "json3", "url": "https://s/zh.json3"}]}
        });
        let track = select_youtube_track(&info).unwrap();
        assert_eq!(track.language, "en");
        assert_eq!(track.format, CaptionFormat::TimedText);
        assert!(!track.auto_generated);
    }

    #[test]
    fn test_language_order_and_json3_preference() {
        let info = json!({
            "subtitles": {
                "fr": [{"ext": "json3", "url": "https://s/fr"}],
                "en": [{"ext": "json3", "url": "https://s/en"}],
                "zh-Hant": [{"ext": "srv1", "url": "https://s/hant.srv1"}, {"ext": "json3", "url": "https://s/hant"}]
            }
        });
        let track = select_youtube_track(&info).unwrap();
        assert_eq!(track.language, "zh-Hant");
        assert_eq!(track.url, "https://s/hant");
        assert_eq!(track.format, CaptionFormat::Json3);
    }

    #[test]
    fn test_automatic_fallback_and_live_chat_ignored() {
        let info = json!({
            "subtitles": {"live_chat": [{"ext": "json", "url": "https://s/chat"}]},
            "automatic_captions": {"de": [{"ext": "srt", "url": "https://s/de.srt"}]}
        });
        let track = select_youtube_track(&info).unwrap();
        assert_eq!(track.language, "de");
        assert!(track.auto_generated);

        assert_eq!(select_youtube_track(&json!({"subtitles": {}, "automatic_captions": {}})), None);
    }

    #[test]
    fn test_bilibili_track_preference() {
        let tracks = vec![
            track("ai-zh", "//s/ai-zh"),
            track("en-US", "//s/en"),
            track("zh-Hant", "//s/hant"),
        ];
        assert_eq!(select_bilibili_track(&tracks).unwrap().lan, "zh-Hant");

        let auto_only = vec![track("ai-en", "//s/ai-en"), track("ai-zh", "//s/ai-zh")];
        assert_eq!(select_bilibili_track(&auto_only).unwrap().lan, "ai-zh");
        assert!(select_bilibili_track(&[]).is_none());
    }

    #[tokio::test]
    async fn test_stalled_caption_download_times_out() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let _ = stream
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\nWEBVTT")
                    .await;
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
        });

        let track = CaptionTrack {
            language: "en".to_string(),
            url: format!("http://{}/captions.vtt", addr),
            format: CaptionFormat::TimedText,
            auto_generated: false,
        };
        let started = std::time::Instant::now();
        let err = resolver("http://127.0.0.1:9")
            .with_timeout(Duration::from_millis(500))
            .fetch_caption(&track, Platform::Youtube)
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::NetworkError);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_bilibili_captions_end_to_end() {
        let mut server = mockito::Server::new_async().await;
        let _view = server
            .mock("GET", "/x/web-interface/view")
            .match_query(Matcher::UrlEncoded("bvid".into(), "BV1xx411c7mD".into()))
            .with_body(r#"{"code":0,"data":{"bvid":"BV1xx411c7mD","cid":7,"title":"T","owner":{"name":"u"}}}"#)
            .create_async()
            .await;
        let player_body = format!(
            r#"{{"code":0,"data":{{"subtitle":{{"subtitles":[{{"lan":"ai-zh","lan_doc":"AI","subtitle_url":"{0}/ai.json"}},{{"lan":"zh-CN","lan_doc":"中文","subtitle_url":"{0}/human.json"}}]}}}}}}"#,
            server.url()
        );
        let _player = server
            .mock("GET", "/x/player/wbi/v2")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("cid".into(), "7".into()),
                Matcher::UrlEncoded("bvid".into(), "BV1xx411c7mD".into()),
            ]))
            .with_body(player_body)
            .create_async()
            .await;
        let _human = server
            .mock("GET", "/human.json")
            .with_body(r#"{"body":[{"content":"hello"},{"content":"world"}]}"#)
            .create_async()
            .await;

        let text = resolver(&server.url())
            .extract("https://www.bilibili.com/video/BV1xx411c7mD", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(text.as_deref(), Some("hello world"));
    }

    #[tokio::test]
    async fn test_bilibili_without_tracks_is_none() {
        let mut server = mockito::Server::new_async().await;
        let _view = server
            .mock("GET", "/x/web-interface/view")
            .match_query(Matcher::Any)
            .with_body(r#"{"code":0,"data":{"bvid":"BV1xx411c7mD","cid":7,"title":"T","owner":{"name":"u"}}}"#)
            .create_async()
            .await;
        let _player = server
            .mock("GET", "/x/player/wbi/v2")
            .match_query(Matcher::Any)
            .with_body(r#"{"code":0,"data":{"subtitle":{"subtitles":[]}}}"#)
            .create_async()
            .await;

        let text = resolver(&server.url())
            .extract("https://www.bilibili.com/video/BV1xx411c7mD", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(text, None);
    }

    #[tokio::test]
    async fn test_fetch_caption_parses_by_format() {
        let mut server = mockito::Server::new_async().await;
        let _json3 = server
            .mock("GET", "/c.json3")
            .with_body(r#"{"events":[{"segs":[{"utf8":"hi"}]}]}"#)
            .create_async()
            .await;
        let _empty = server.mock("GET", "/empty.vtt").with_body("WEBVTT\n\n").create_async().await;

        let resolver = resolver(&server.url());
        let json3 = CaptionTrack {
            language: "en".into(),
            url: format!("{}/c.json3", server.url()),
            format: CaptionFormat::Json3,
            auto_generated: false,
        };
        assert_eq!(resolver.fetch_caption(&json3, Platform::Youtube).await.unwrap().as_deref(), Some("hi"));

        let empty = CaptionTrack {
            url: format!("{}/empty.vtt", server.url()),
            format: CaptionFormat::TimedText,
            ..json3
        };
        assert_eq!(resolver.fetch_caption(&empty, Platform::Youtube).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_other_platforms_have_no_captions() {
        let text = resolver("http://127.0.0.1:9")
            .extract("https://www.tiktok.com/@u/video/1", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(text, None);
    }
}
