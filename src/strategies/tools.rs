//! Strategies backed by single-purpose download tools

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{AcquiredMedia, DownloadStrategy, VideoInfo};
use crate::config::Config;
use crate::error::{DownloadError, ErrorKind};
use crate::platform::{self, Platform};
use crate::utils::media::MEDIA_EXTENSIONS;
use crate::utils::{extract_domain, newest_file, run_checked, ProcessOptions};

fn host_matches(url: &str, hosts: &[&str]) -> bool {
    extract_domain(url)
        .map(|domain| hosts.iter().any(|h| domain == *h || domain.ends_with(&format!(".{}", h))))
        .unwrap_or(false)
}

/// The media file a tool left behind in `dir`
fn produced_media(dir: &Path, tool: &str, platform: Platform) -> Result<PathBuf, DownloadError> {
    newest_file(dir, MEDIA_EXTENSIONS).ok_or_else(|| {
        DownloadError::new(
            ErrorKind::DownloadFailed,
            platform,
            format!("{} finished without producing a media file", tool),
        )
    })
}

/// you-get wrapper, also used by the Bilibili strategy
#[derive(Debug, Clone)]
pub struct YouGet {
    binary: String,
    proxy: Option<String>,
    cookie_file: Option<PathBuf>,
    timeout: Duration,
}

impl YouGet {
    pub fn from_config(config: &Config) -> Self {
        Self {
            binary: config.tools.you_get.clone(),
            proxy: config.network.proxy().for_tools().map(str::to_string),
            cookie_file: config.network.cookie_file().map(Path::to_path_buf),
            timeout: config.tools.process_timeout(),
        }
    }

    pub async fn download(&self, url: &str, output_dir: &Path, cancel: &CancellationToken) -> Result<PathBuf, DownloadError> {
        let platform = platform::classify(url);
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-o").arg(output_dir);
        if let Some(cookies) = &self.cookie_file {
            cmd.arg("-c").arg(cookies);
        }
        if let Some(proxy) = &self.proxy {
            // you-get takes host:port
            let host_port = proxy.split("://").last().unwrap_or(proxy);
            cmd.arg("-x").arg(host_port);
        }
        cmd.arg(url);

        run_checked(cmd, "you-get", platform, &ProcessOptions::new(self.timeout, cancel.clone())).await?;
        produced_media(output_dir, "you-get", platform)
    }
}

/// you-get for the Chinese video sites it handles well
pub struct YouGetStrategy {
    you_get: YouGet,
}

impl YouGetStrategy {
    const HOSTS: &'static [&'static str] = &["bilibili.com", "b23.tv", "youku.com", "iqiyi.com"];

    pub fn new(you_get: YouGet) -> Self {
        Self { you_get }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(YouGet::from_config(config))
    }
}

#[async_trait]
impl DownloadStrategy for YouGetStrategy {
    fn name(&self) -> &str {
        "you-get"
    }

    fn priority(&self) -> i32 {
        20
    }

    fn supports(&self, url: &str) -> bool {
        host_matches(url, Self::HOSTS)
    }

    async fn attempt(
        &self,
        url: &str,
        output_dir: &Path,
        _audio_only: bool,
        cancel: &CancellationToken,
    ) -> Result<AcquiredMedia, DownloadError> {
        let path = self.you_get.download(url, output_dir, cancel).await?;
        // you-get names the file after the video title
        let info = VideoInfo::from_file(&path, url);
        Ok(AcquiredMedia { path, info })
    }
}

/// gallery-dl for social platforms where video sits inside a post
pub struct GalleryDlStrategy {
    binary: String,
    proxy: Option<String>,
    cookie_file: Option<PathBuf>,
    timeout: Duration,
}

impl GalleryDlStrategy {
    const HOSTS: &'static [&'static str] = &["twitter.com", "x.com", "instagram.com", "reddit.com"];

    pub fn from_config(config: &Config) -> Self {
        Self {
            binary: config.tools.gallery_dl.clone(),
            proxy: config.network.proxy().for_tools().map(str::to_string),
            cookie_file: config.network.cookie_file().map(Path::to_path_buf),
            timeout: config.tools.process_timeout(),
        }
    }
}

#[async_trait]
impl DownloadStrategy for GalleryDlStrategy {
    fn name(&self) -> &str {
        "gallery-dl"
    }

    fn priority(&self) -> i32 {
        15
    }

    fn supports(&self, url: &str) -> bool {
        host_matches(url, Self::HOSTS)
    }

    async fn attempt(
        &self,
        url: &str,
        output_dir: &Path,
        _audio_only: bool,
        cancel: &CancellationToken,
    ) -> Result<AcquiredMedia, DownloadError> {
        let platform = platform::classify(url);
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-d").arg(output_dir);
        if let Some(cookies) = &self.cookie_file {
            cmd.arg("--cookies").arg(cookies);
        }
        if let Some(proxy) = &self.proxy {
            cmd.arg("--proxy").arg(proxy);
        }
        cmd.arg(url);

        run_checked(cmd, "gallery-dl", platform, &ProcessOptions::new(self.timeout, cancel.clone())).await?;
        let path = produced_media(output_dir, "gallery-dl", platform)?;
        let info = VideoInfo::from_file(&path, url);
        Ok(AcquiredMedia { path, info })
    }
}
