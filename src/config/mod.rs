use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::fetch::MIN_SEGMENT_SIZE;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Proxies, cookies and HTTP behaviour
    pub network: NetworkConfig,

    /// External tool locations
    pub tools: ToolsConfig,

    /// Direct-link download tuning
    pub download: DownloadConfig,

    /// Throttling backoff and pacing
    pub rate_limit: RateLimitConfig,

    /// Speech-to-text settings
    pub transcription: TranscriptionConfig,

    /// Application settings
    pub app: AppConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub http_proxy: Option<String>,
    pub https_proxy: Option<String>,

    /// Netscape-format cookie file handed to tools and API calls
    pub cookie_file: Option<PathBuf>,

    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,

    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub yt_dlp: String,
    pub you_get: String,
    pub gallery_dl: String,
    pub ffmpeg: String,
    pub ffprobe: String,
    pub whisper: String,

    /// Executables invoked as `<script> <url> <output_dir>` when every other
    /// strategy fails
    pub custom_scripts: Vec<PathBuf>,

    /// Timeout for any single external process, in seconds
    pub process_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub max_parallel_segments: usize,

    /// Bytes per range request, never below 1 MiB
    pub segment_size: u64,

    /// Attempts per segment on transient failures
    pub segment_retries: u32,

    /// Prefer audio-only downloads
    pub audio_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub base_delay_secs: u64,
    pub max_retries: u32,

    /// Minimum gap between API calls to the same platform
    pub platform_min_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptionConfig {
    /// Whisper model name
    pub model: String,

    pub language: Option<String>,

    /// Device for the accelerated execution path (e.g. "cuda", "mps")
    pub accelerator: Option<String>,

    pub initial_prompt: Option<String>,

    /// Transcript cache location, defaults to the user cache dir
    pub cache_dir: Option<PathBuf>,

    pub use_cache: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Root for per-acquisition temporary directories
    pub work_dir: Option<PathBuf>,

    /// Maximum concurrent acquisitions in batch mode
    pub max_concurrent_jobs: usize,
}

/// Proxy URLs for outbound HTTP
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyConfig {
    pub http: Option<String>,
    pub https: Option<String>,
}

impl ProxyConfig {
    pub fn is_empty(&self) -> bool {
        self.http.is_none() && self.https.is_none()
    }

    /// The proxy an external tool should use, https preferred
    pub fn for_tools(&self) -> Option<&str> {
        self.https.as_deref().or(self.http.as_deref())
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            http_proxy: None,
            https_proxy: None,
            cookie_file: None,
            request_timeout_secs: 30,
            user_agent: None,
        }
    }
}

impl NetworkConfig {
    pub fn proxy(&self) -> ProxyConfig {
        ProxyConfig {
            http: self.http_proxy.clone().filter(|p| !p.trim().is_empty()),
            https: self.https_proxy.clone().filter(|p| !p.trim().is_empty()),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    /// Cookie file, if configured and present on disk
    pub fn cookie_file(&self) -> Option<&Path> {
        self.cookie_file.as_deref().filter(|path| path.exists())
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            yt_dlp: "yt-dlp".to_string(),
            you_get: "you-get".to_string(),
            gallery_dl: "gallery-dl".to_string(),
            ffmpeg: "ffmpeg".to_string(),
            ffprobe: "ffprobe".to_string(),
            whisper: "whisper".to_string(),
            custom_scripts: Vec::new(),
            process_timeout_secs: 600,
        }
    }
}

impl ToolsConfig {
    pub fn process_timeout(&self) -> Duration {
        Duration::from_secs(self.process_timeout_secs.max(1))
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_parallel_segments: 4,
            segment_size: MIN_SEGMENT_SIZE,
            segment_retries: 3,
            audio_only: true,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: 5,
            max_retries: 3,
            platform_min_interval_ms: 500,
        }
    }
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            model: "medium".to_string(),
            language: Some("zh".to_string()),
            accelerator: Some("cuda".to_string()),
            initial_prompt: None,
            cache_dir: None,
            use_cache: true,
        }
    }
}

impl TranscriptionConfig {
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("video-transcriptor")
                .join("transcripts")
        })
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            work_dir: None,
            max_concurrent_jobs: 1,
        }
    }
}

impl Config {
    /// Load configuration from file or create default
    pub async fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Self::default();
            config.save().await?;
            Ok(config)
        }
    }

    /// Parse and validate a specific config file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs_err::read_to_string(path).context("Failed to read config file")?;

        let config: Config = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub async fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;

        if let Some(parent) = config_path.parent() {
            fs_err::create_dir_all(parent)?;
        }

        let content = serde_yaml::to_string(self).context("Failed to serialize config")?;

        fs_err::write(&config_path, content).context("Failed to write config file")?;

        Ok(())
    }

    /// Get configuration file path
    pub fn config_path() -> Result<PathBuf> {
        // First try current directory for easy testing
        let local_config = PathBuf::from("config.yaml");
        if local_config.exists() {
            return Ok(local_config);
        }

        let config_dir = dirs::config_dir().context("Could not determine config directory")?;

        Ok(config_dir.join("video-transcriptor").join("config.yaml"))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.download.max_parallel_segments == 0 {
            anyhow::bail!("download.max_parallel_segments must be at least 1");
        }
        if self.app.max_concurrent_jobs == 0 {
            anyhow::bail!("app.max_concurrent_jobs must be at least 1");
        }
        if self.rate_limit.max_retries == 0 {
            anyhow::bail!("rate_limit.max_retries must be at least 1");
        }
        if self.transcription.model.trim().is_empty() {
            anyhow::bail!("transcription.model must not be empty");
        }

        for (name, proxy) in [
            ("network.http_proxy", &self.network.http_proxy),
            ("network.https_proxy", &self.network.https_proxy),
        ] {
            if let Some(proxy) = proxy.as_deref().filter(|p| !p.trim().is_empty()) {
                Url::parse(proxy).with_context(|| format!("{} is not a valid URL: {}", name, proxy))?;
            }
        }

        Ok(())
    }

    /// Segment size after clamping to the minimum
    pub fn segment_size(&self) -> u64 {
        self.download.segment_size.max(MIN_SEGMENT_SIZE)
    }

    /// Display current configuration
    pub fn display(&self) {
        let proxy = self.network.proxy();
        println!("Current Configuration:");
        println!("  HTTP Proxy: {}", proxy.http.as_deref().unwrap_or("none"));
        println!("  HTTPS Proxy: {}", proxy.https.as_deref().unwrap_or("none"));
        match &self.network.cookie_file {
            Some(path) => println!("  Cookie File: {}", path.display()),
            None => println!("  Cookie File: none"),
        }
        println!("  yt-dlp: {}", self.tools.yt_dlp);
        println!("  ffmpeg: {}", self.tools.ffmpeg);
        println!("  whisper: {}", self.tools.whisper);
        if !self.tools.custom_scripts.is_empty() {
            println!("  Custom Scripts: {}", self.tools.custom_scripts.len());
        }
        println!(
            "  Parallel Segments: {} x {}",
            self.download.max_parallel_segments,
            crate::utils::format_file_size(self.segment_size())
        );
        println!(
            "  Rate Limit: {}s base delay, {} attempts",
            self.rate_limit.base_delay_secs, self.rate_limit.max_retries
        );
        println!("  Model: {}", self.transcription.model);
        println!(
            "  Language: {}",
            self.transcription.language.as_deref().unwrap_or("auto")
        );
        println!("  Cache: {}", if self.transcription.use_cache { "on" } else { "off" });
        println!("  Cache Dir: {}", self.transcription.cache_dir().display());
        println!("  Max Concurrent Jobs: {}", self.app.max_concurrent_jobs);
    }
}
