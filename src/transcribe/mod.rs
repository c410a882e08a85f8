//! Speech-to-text with a transcript cache in front and execution-path fallback
//! behind.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tokio_util::sync::CancellationToken;

pub mod cache;
pub mod whisper;

pub use cache::TranscriptCache;
pub use whisper::WhisperCliBackend;

use crate::config::Config;
use crate::error::{DownloadError, ErrorKind};
use crate::platform::Platform;

/// Where inference runs. Accelerated is preferred, Cpu is the fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionPath {
    Accelerated,
    Cpu,
}

impl fmt::Display for ExecutionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionPath::Accelerated => f.write_str("accelerated"),
            ExecutionPath::Cpu => f.write_str("cpu"),
        }
    }
}

/// One transcription job
#[derive(Debug, Clone, PartialEq)]
pub struct TranscribeRequest {
    pub audio_path: PathBuf,
    pub model: String,
    pub language: Option<String>,
}

impl TranscribeRequest {
    pub fn new(audio_path: impl Into<PathBuf>, model: impl Into<String>, language: Option<String>) -> Self {
        Self {
            audio_path: audio_path.into(),
            model: model.into(),
            language,
        }
    }
}

/// Audio file in, plain text out
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, request: &TranscribeRequest, cancel: &CancellationToken) -> Result<String, DownloadError>;
}

/// Something that can load a speech model on a given execution path
#[async_trait]
pub trait SpeechBackend: Send + Sync {
    /// Supported paths, preferred first
    fn execution_paths(&self) -> Vec<ExecutionPath>;

    async fn load(&self, model: &str, path: ExecutionPath) -> Result<Arc<dyn LoadedModel>, DownloadError>;
}

/// A model handle ready for inference
#[async_trait]
pub trait LoadedModel: Send + Sync {
    async fn infer(
        &self,
        audio_path: &Path,
        language: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<String, DownloadError>;
}

type ModelSlot = Arc<OnceCell<Arc<dyn LoadedModel>>>;

/// Owns loaded models for the life of the process.
///
/// Each (model, path) pair is loaded at most once; concurrent callers wait on
/// the same load. A failed load leaves the slot empty.
pub struct ModelHost {
    backend: Arc<dyn SpeechBackend>,
    slots: Mutex<HashMap<(String, ExecutionPath), ModelSlot>>,
}

impl ModelHost {
    pub fn new(backend: Arc<dyn SpeechBackend>) -> Self {
        Self {
            backend,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn execution_paths(&self) -> Vec<ExecutionPath> {
        self.backend.execution_paths()
    }

    pub async fn get(&self, model: &str, path: ExecutionPath) -> Result<Arc<dyn LoadedModel>, DownloadError> {
        let slot = {
            let mut slots = self.slots.lock().await;
            slots.entry((model.to_string(), path)).or_default().clone()
        };

        let loaded = slot
            .get_or_try_init(|| async {
                tracing::info!("Loading model {} on {} path", model, path);
                self.backend.load(model, path).await
            })
            .await?;
        Ok(loaded.clone())
    }

    pub async fn is_loaded(&self, model: &str, path: ExecutionPath) -> bool {
        self.slots
            .lock()
            .await
            .get(&(model.to_string(), path))
            .is_some_and(|slot| slot.initialized())
    }
}

/// Cache-first transcriber with accelerated-to-CPU fallback
pub struct TranscriptionEngine {
    host: ModelHost,
    cache: Option<TranscriptCache>,
}

impl TranscriptionEngine {
    pub fn new(backend: Arc<dyn SpeechBackend>, cache: Option<TranscriptCache>) -> Self {
        Self {
            host: ModelHost::new(backend),
            cache,
        }
    }

    /// Whisper CLI backend, cache per `transcription.use_cache`
    pub fn from_config(config: &Config) -> Self {
        let cache = config
            .transcription
            .use_cache
            .then(|| TranscriptCache::new(config.transcription.cache_dir()));
        Self::new(Arc::new(WhisperCliBackend::from_config(config)), cache)
    }

    async fn cache_key(&self, request: &TranscribeRequest) -> Option<String> {
        let cache = self.cache.as_ref()?;
        match cache.fingerprint(&request.audio_path, &request.model).await {
            Ok(key) => Some(key),
            Err(e) => {
                tracing::warn!("Transcript cache disabled for this file: {}", e);
                None
            }
        }
    }

    async fn run_paths(&self, request: &TranscribeRequest, cancel: &CancellationToken) -> Result<String, DownloadError> {
        let mut failures = Vec::new();

        for path in self.host.execution_paths() {
            if cancel.is_cancelled() {
                return Err(DownloadError::cancelled(Platform::Local));
            }

            let model = match self.host.get(&request.model, path).await {
                Ok(model) => model,
                Err(e) => {
                    tracing::warn!("Model {} failed to load on {} path: {}", request.model, path, e.message);
                    failures.push(format!("load on {}: {}", path, e.message));
                    continue;
                }
            };

            match model.infer(&request.audio_path, request.language.as_deref(), cancel).await {
                Ok(text) => {
                    tracing::info!("Transcribed {} chars on {} path", text.chars().count(), path);
                    return Ok(text);
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    tracing::warn!("Inference failed on {} path: {}", path, e.message);
                    failures.push(format!("inference on {}: {}", path, e.message));
                }
            }
        }

        Err(DownloadError::new(
            ErrorKind::TranscriptionFailed,
            Platform::Local,
            format!("Transcription failed on every execution path for {}", request.audio_path.display()),
        )
        .with_detail(failures.join("\n")))
    }
}

#[async_trait]
impl Transcriber for TranscriptionEngine {
    async fn transcribe(&self, request: &TranscribeRequest, cancel: &CancellationToken) -> Result<String, DownloadError> {
        let key = self.cache_key(request).await;
        if let (Some(cache), Some(key)) = (&self.cache, &key) {
            if let Some(text) = cache.get(key).await {
                return Ok(text);
            }
        }

        let text = self.run_paths(request, cancel).await?;
        if text.trim().is_empty() {
            return Err(DownloadError::new(
                ErrorKind::TranscriptionFailed,
                Platform::Local,
                format!("Transcription of {} produced no text", request.audio_path.display()),
            ));
        }

        if let (Some(cache), Some(key)) = (&self.cache, &key) {
            if let Err(e) = cache.set(key, &request.model, &text).await {
                tracing::warn!("Failed to cache transcript: {}", e);
            }
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Backend double with per-path failure switches and a load counter
    #[derive(Default)]
    struct FakeBackend {
        loads: Arc<AtomicUsize>,
        infers: Arc<AtomicUsize>,
        fail_load: HashSet<ExecutionPath>,
        fail_infer: HashSet<ExecutionPath>,
        text: String,
    }

    struct FakeModel {
        path: ExecutionPath,
        fail: bool,
        text: String,
        infers: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SpeechBackend for FakeBackend {
        fn execution_paths(&self) -> Vec<ExecutionPath> {
            vec![ExecutionPath::Accelerated, ExecutionPath::Cpu]
        }

        async fn load(&self, _model: &str, path: ExecutionPath) -> Result<Arc<dyn LoadedModel>, DownloadError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.fail_load.contains(&path) {
                return Err(DownloadError::new(ErrorKind::TranscriptionFailed, Platform::Local, "no cuda"));
            }
            Ok(Arc::new(FakeModel {
                path,
                fail: self.fail_infer.contains(&path),
                text: self.text.clone(),
                infers: self.infers.clone(),
            }))
        }
    }

    #[async_trait]
    impl LoadedModel for FakeModel {
        async fn infer(&self, _audio: &Path, _lang: Option<&str>, _cancel: &CancellationToken) -> Result<String, DownloadError> {
            self.infers.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(DownloadError::new(ErrorKind::TranscriptionFailed, Platform::Local, "oom"))
            } else {
                Ok(format!("{} ({})", self.text, self.path))
            }
        }
    }

    fn backend(text: &str) -> FakeBackend {
        FakeBackend {
            text: text.to_string(),
            ..Default::default()
        }
    }

    fn audio(dir: &Path) -> TranscribeRequest {
        let path = dir.join("a.mp3");
        std::fs::write(&path, b"audio bytes").unwrap();
        TranscribeRequest::new(path, "medium", Some("zh".to_string()))
    }

    #[tokio::test]
    async fn test_model_loaded_once_per_path() {
        let backend = backend("hi");
        let loads = backend.loads.clone();
        let host = ModelHost::new(Arc::new(backend));

        host.get("medium", ExecutionPath::Cpu).await.unwrap();
        host.get("medium", ExecutionPath::Cpu).await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(host.is_loaded("medium", ExecutionPath::Cpu).await);
        assert!(!host.is_loaded("medium", ExecutionPath::Accelerated).await);

        host.get("large-v3", ExecutionPath::Cpu).await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_load_failure_falls_back_to_cpu() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = backend("hello");
        backend.fail_load.insert(ExecutionPath::Accelerated);

        let engine = TranscriptionEngine::new(Arc::new(backend), None);
        let text = engine.transcribe(&audio(dir.path()), &CancellationToken::new()).await.unwrap();
        assert_eq!(text, "hello (cpu)");
    }

    #[tokio::test]
    async fn test_inference_failure_falls_back_to_cpu() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = backend("hello");
        backend.fail_infer.insert(ExecutionPath::Accelerated);

        let engine = TranscriptionEngine::new(Arc::new(backend), None);
        let text = engine.transcribe(&audio(dir.path()), &CancellationToken::new()).await.unwrap();
        assert_eq!(text, "hello (cpu)");
    }

    #[tokio::test]
    async fn test_every_path_failing_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = backend("hello");
        backend.fail_load.insert(ExecutionPath::Accelerated);
        backend.fail_infer.insert(ExecutionPath::Cpu);

        let engine = TranscriptionEngine::new(Arc::new(backend), None);
        let err = engine.transcribe(&audio(dir.path()), &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::TranscriptionFailed);
        let detail = err.detail.unwrap();
        assert!(detail.contains("load on accelerated: no cuda"));
        assert!(detail.contains("inference on cpu: oom"));
    }

    #[tokio::test]
    async fn test_cache_hit_skips_model() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend("fresh");
        let loads = backend.loads.clone();
        let infers = backend.infers.clone();
        let cache = TranscriptCache::new(dir.path().join("cache"));
        let engine = TranscriptionEngine::new(Arc::new(backend), Some(cache.clone()));
        let request = audio(dir.path());

        let first = engine.transcribe(&request, &CancellationToken::new()).await.unwrap();
        let second = engine.transcribe(&request, &CancellationToken::new()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(infers.load(Ordering::SeqCst), 1);

        let key = cache.fingerprint(&request.audio_path, "medium").await.unwrap();
        assert_eq!(cache.get(&key).await.as_deref(), Some("fresh (accelerated)"));
    }

    #[tokio::test]
    async fn test_blank_transcript_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();

        struct Blank;
        #[async_trait]
        impl LoadedModel for Blank {
            async fn infer(&self, _a: &Path, _l: Option<&str>, _c: &CancellationToken) -> Result<String, DownloadError> {
                Ok("  ".to_string())
            }
        }
        struct BlankBackend;
        #[async_trait]
        impl SpeechBackend for BlankBackend {
            fn execution_paths(&self) -> Vec<ExecutionPath> {
                vec![ExecutionPath::Cpu]
            }
            async fn load(&self, _m: &str, _p: ExecutionPath) -> Result<Arc<dyn LoadedModel>, DownloadError> {
                Ok(Arc::new(Blank))
            }
        }

        let cache_dir = dir.path().join("cache");
        let engine = TranscriptionEngine::new(Arc::new(BlankBackend), Some(TranscriptCache::new(&cache_dir)));
        let err = engine.transcribe(&audio(dir.path()), &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::TranscriptionFailed);
        assert!(!cache_dir.exists());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let engine = TranscriptionEngine::new(Arc::new(backend("x")), None);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = engine.transcribe(&audio(dir.path()), &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
