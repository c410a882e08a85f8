use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

pub mod bilibili;

pub use bilibili::BilibiliApi;

/// Source platform a URL belongs to
///
/// Classification only drives strategy ordering and diagnostics. Strategies
/// decide applicability on their own, so a wrong guess never blocks a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Youtube,
    Bilibili,
    Douyin,
    Tiktok,
    Twitter,
    Instagram,
    Facebook,
    Kuaishou,
    Xiaohongshu,
    Weibo,
    /// A file on the local filesystem
    Local,
    Unknown,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Youtube => "youtube",
            Platform::Bilibili => "bilibili",
            Platform::Douyin => "douyin",
            Platform::Tiktok => "tiktok",
            Platform::Twitter => "twitter",
            Platform::Instagram => "instagram",
            Platform::Facebook => "facebook",
            Platform::Kuaishou => "kuaishou",
            Platform::Xiaohongshu => "xiaohongshu",
            Platform::Weibo => "weibo",
            Platform::Local => "local",
            Platform::Unknown => "unknown",
        }
    }

    /// Human-readable platform list for `transcriptor platforms`
    pub fn describe_supported() -> &'static [(&'static str, &'static str)] {
        &[
            ("youtube", "youtube.com, youtu.be (subtitles + yt-dlp)"),
            ("bilibili", "bilibili.com/video/BV..., b23.tv (public API + you-get/yt-dlp)"),
            ("douyin", "douyin.com, iesdouyin.com (direct link)"),
            ("tiktok", "tiktok.com (direct link)"),
            ("twitter", "twitter.com, x.com (gallery-dl / yt-dlp)"),
            ("instagram", "instagram.com (direct link / gallery-dl)"),
            ("facebook", "facebook.com (direct link)"),
            ("kuaishou", "kuaishou.com (direct link)"),
            ("xiaohongshu", "xiaohongshu.com, xhslink.com (direct link)"),
            ("weibo", "weibo.com (direct link)"),
            ("local", "local audio/video files"),
            ("unknown", "anything else yt-dlp or a custom script can handle"),
        ]
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host suffixes per platform, checked in order
const HOST_TABLE: &[(&str, Platform)] = &[
    ("youtube.com", Platform::Youtube),
    ("youtu.be", Platform::Youtube),
    ("bilibili.com", Platform::Bilibili),
    ("b23.tv", Platform::Bilibili),
    ("iesdouyin.com", Platform::Douyin),
    ("douyin.com", Platform::Douyin),
    ("tiktok.com", Platform::Tiktok),
    ("twitter.com", Platform::Twitter),
    ("x.com", Platform::Twitter),
    ("instagram.com", Platform::Instagram),
    ("facebook.com", Platform::Facebook),
    ("fb.watch", Platform::Facebook),
    ("kuaishou.com", Platform::Kuaishou),
    ("xiaohongshu.com", Platform::Xiaohongshu),
    ("xhslink.com", Platform::Xiaohongshu),
    ("weibo.com", Platform::Weibo),
    ("weibo.cn", Platform::Weibo),
];

/// Map a URL to its platform. Total: malformed input yields `Unknown`.
pub fn classify(url: &str) -> Platform {
    let host = match Url::parse(url.trim()) {
        Ok(parsed) => match parsed.host_str() {
            Some(host) => host.to_lowercase(),
            None => return Platform::Unknown,
        },
        // Scheme-less input like "youtu.be/abc" still deserves a guess
        Err(_) => match url.trim().split('/').next() {
            Some(head) if head.contains('.') && !head.contains(' ') => head.to_lowercase(),
            _ => return Platform::Unknown,
        },
    };

    HOST_TABLE
        .iter()
        .find(|(suffix, _)| host == *suffix || host.ends_with(&format!(".{}", suffix)))
        .map(|(_, platform)| *platform)
        .unwrap_or(Platform::Unknown)
}

/// Whether the string is an http(s) URL rather than a filesystem path
pub fn is_web_url(input: &str) -> bool {
    let lower = input.trim().to_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_known_hosts() {
        assert_eq!(classify("https://www.youtube.com/watch?v=dQw4w9WgXcQ"), Platform::Youtube);
        assert_eq!(classify("https://youtu.be/dQw4w9WgXcQ"), Platform::Youtube);
        assert_eq!(classify("https://m.youtube.com/watch?v=1"), Platform::Youtube);
        assert_eq!(classify("https://www.bilibili.com/video/BV1xx411c7mD"), Platform::Bilibili);
        assert_eq!(classify("https://b23.tv/abc123"), Platform::Bilibili);
        assert_eq!(classify("https://v.douyin.com/iJ8abc/"), Platform::Douyin);
        assert_eq!(classify("https://www.iesdouyin.com/share/video/1/"), Platform::Douyin);
        assert_eq!(classify("https://www.tiktok.com/@user/video/1"), Platform::Tiktok);
        assert_eq!(classify("https://x.com/user/status/1"), Platform::Twitter);
        assert_eq!(classify("http://xhslink.com/a/b"), Platform::Xiaohongshu);
    }

    #[test]
    fn test_classify_does_not_match_lookalike_hosts() {
        assert_eq!(classify("https://notyoutube.com/watch"), Platform::Unknown);
        assert_eq!(classify("https://box.com/file"), Platform::Unknown);
    }

    #[test]
    fn test_classify_is_total() {
        for input in ["", "   ", "not a url", "://", "http://", "ftp://[::1", "\u{0}\u{1}", "youtu.be/abc"] {
            let first = classify(input);
            assert_eq!(first, classify(input));
        }
        assert_eq!(classify("not a url"), Platform::Unknown);
        assert_eq!(classify("youtu.be/abc"), Platform::Youtube);
    }

    #[test]
    fn test_is_web_url() {
        assert!(is_web_url("https://example.com/a.mp4"));
        assert!(is_web_url("HTTP://EXAMPLE.COM"));
        assert!(!is_web_url("./video.mp4"));
        assert!(!is_web_url("/tmp/audio.mp3"));
    }
}
