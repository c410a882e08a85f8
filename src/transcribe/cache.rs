//! On-disk transcript cache keyed by audio content and model.
//!
//! One JSON file per entry. No locking: concurrent writers to the same key
//! race and the last write wins, which is fine since they carry the same text.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;

use crate::error::DownloadError;
use crate::platform::Platform;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedTranscript {
    pub model: String,
    pub fingerprint: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TranscriptCache {
    dir: PathBuf,
}

impl TranscriptCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// SHA-256 over the audio bytes followed by the model name
    pub async fn fingerprint(&self, audio_path: &Path, model: &str) -> Result<String, DownloadError> {
        let mut file = tokio::fs::File::open(audio_path)
            .await
            .map_err(|e| DownloadError::io(Platform::Local, "Failed to open audio for hashing", e))?;

        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file
                .read(&mut buf)
                .await
                .map_err(|e| DownloadError::io(Platform::Local, "Failed to read audio for hashing", e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        hasher.update(b"\0");
        hasher.update(model.as_bytes());

        Ok(hex::encode(hasher.finalize()))
    }

    fn entry_path(&self, fingerprint: &str) -> PathBuf {
        self.dir.join(format!("{}.json", fingerprint))
    }

    /// Cached text for a fingerprint. Unreadable or corrupt entries count as misses.
    pub async fn get(&self, fingerprint: &str) -> Option<String> {
        let path = self.entry_path(fingerprint);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("Transcript cache miss: {}", fingerprint);
                return None;
            }
            Err(e) => {
                tracing::warn!("Failed to read cache entry {}: {}", path.display(), e);
                return None;
            }
        };

        match serde_json::from_str::<CachedTranscript>(&content) {
            Ok(entry) => {
                tracing::info!("Transcript cache hit ({} chars, model {})", entry.text.len(), entry.model);
                Some(entry.text)
            }
            Err(e) => {
                tracing::warn!("Ignoring corrupt cache entry {}: {}", path.display(), e);
                None
            }
        }
    }

    pub async fn set(&self, fingerprint: &str, model: &str, text: &str) -> Result<(), DownloadError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| DownloadError::io(Platform::Local, "Failed to create cache directory", e))?;

        let entry = CachedTranscript {
            model: model.to_string(),
            fingerprint: fingerprint.to_string(),
            text: text.to_string(),
            created_at: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&entry).map_err(|e| {
            DownloadError::io(
                Platform::Local,
                "Failed to encode cache entry",
                std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            )
        })?;

        tokio::fs::write(self.entry_path(fingerprint), json)
            .await
            .map_err(|e| DownloadError::io(Platform::Local, "Failed to write cache entry", e))?;
        tracing::debug!("Cached transcript {}", fingerprint);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fingerprint_depends_on_content_and_model() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.mp3");
        let b = dir.path().join("b.mp3");
        std::fs::write(&a, b"same bytes").unwrap();
        std::fs::write(&b, b"same bytes").unwrap();

        let cache = TranscriptCache::new(dir.path().join("cache"));
        let fa = cache.fingerprint(&a, "medium").await.unwrap();
        assert_eq!(fa.len(), 64);
        // Renamed copies share an entry
        assert_eq!(fa, cache.fingerprint(&b, "medium").await.unwrap());
        assert_ne!(fa, cache.fingerprint(&a, "large-v3").await.unwrap());
    }

    #[tokio::test]
    async fn test_get_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TranscriptCache::new(dir.path());

        assert_eq!(cache.get("missing").await, None);
        assert_eq!(cache.get("missing").await, None);

        cache.set("key", "medium", "hello world").await.unwrap();
        let first = cache.get("key").await;
        let second = cache.get("key").await;
        assert_eq!(first.as_deref(), Some("hello world"));
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_set_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TranscriptCache::new(dir.path().join("nested"));

        cache.set("key", "medium", "old").await.unwrap();
        cache.set("key", "medium", "new").await.unwrap();
        assert_eq!(cache.get("key").await.as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.json"), "{not json").unwrap();
        assert_eq!(TranscriptCache::new(dir.path()).get("bad").await, None);
    }
}
