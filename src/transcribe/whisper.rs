use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{ExecutionPath, LoadedModel, SpeechBackend};
use crate::config::Config;
use crate::error::{DownloadError, ErrorKind};
use crate::platform::Platform;
use crate::subtitles::parse::join_lines;
use crate::utils::{run_command, ProcessOptions};

/// OpenAI Whisper command-line tool
#[derive(Debug, Clone)]
pub struct WhisperCliBackend {
    binary: String,
    accelerator: Option<String>,
    initial_prompt: Option<String>,
    timeout: Duration,
}

impl WhisperCliBackend {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            accelerator: None,
            initial_prompt: None,
            timeout: Duration::from_secs(600),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            binary: config.tools.whisper.clone(),
            accelerator: config.transcription.accelerator.clone().filter(|a| !a.trim().is_empty()),
            initial_prompt: config.transcription.initial_prompt.clone(),
            timeout: config.tools.process_timeout(),
        }
    }

    pub fn with_accelerator(mut self, device: impl Into<String>) -> Self {
        self.accelerator = Some(device.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl SpeechBackend for WhisperCliBackend {
    fn execution_paths(&self) -> Vec<ExecutionPath> {
        if self.accelerator.is_some() {
            vec![ExecutionPath::Accelerated, ExecutionPath::Cpu]
        } else {
            vec![ExecutionPath::Cpu]
        }
    }

    async fn load(&self, model: &str, path: ExecutionPath) -> Result<Arc<dyn LoadedModel>, DownloadError> {
        let device = match path {
            ExecutionPath::Accelerated => self.accelerator.clone().ok_or_else(|| {
                DownloadError::new(
                    ErrorKind::TranscriptionFailed,
                    Platform::Local,
                    "No accelerator device configured",
                )
            })?,
            ExecutionPath::Cpu => "cpu".to_string(),
        };

        // The CLI loads weights per run, so loading only proves the tool starts
        let mut probe = Command::new(&self.binary);
        probe.arg("--help");
        let options = ProcessOptions::new(Duration::from_secs(30), CancellationToken::new());
        let output = run_command(probe, &self.binary, Platform::Local, &options).await?;
        if !output.status.success() {
            return Err(DownloadError::new(
                ErrorKind::TranscriptionFailed,
                Platform::Local,
                format!("{} is not usable (exit {})", self.binary, output.status),
            ));
        }

        tracing::info!("Whisper model {} ready on {} ({})", model, path, device);
        Ok(Arc::new(WhisperCliModel {
            binary: self.binary.clone(),
            model: model.to_string(),
            path,
            device,
            initial_prompt: self.initial_prompt.clone(),
            timeout: self.timeout,
        }))
    }
}

/// Whisper invocation bound to one model and device
#[derive(Debug)]
struct WhisperCliModel {
    binary: String,
    model: String,
    path: ExecutionPath,
    device: String,
    initial_prompt: Option<String>,
    timeout: Duration,
}

impl WhisperCliModel {
    fn command(&self, audio_path: &Path, output_dir: &Path, language: Option<&str>) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg(audio_path)
            .arg("--model")
            .arg(&self.model)
            .arg("--output_format")
            .arg("txt")
            .arg("--output_dir")
            .arg(output_dir)
            .arg("--verbose")
            .arg("False")
            .arg("--device")
            .arg(&self.device);

        if self.path == ExecutionPath::Cpu {
            cmd.arg("--fp16").arg("False");
        }
        if let Some(language) = language {
            cmd.arg("--language").arg(language);
        }
        if let Some(prompt) = &self.initial_prompt {
            cmd.arg("--initial_prompt").arg(prompt);
        }
        cmd
    }
}

fn transcript_file(output_dir: &Path, audio_path: &Path) -> PathBuf {
    let stem = audio_path.file_stem().and_then(|s| s.to_str()).unwrap_or("audio");
    output_dir.join(format!("{}.txt", stem))
}

#[async_trait]
impl LoadedModel for WhisperCliModel {
    async fn infer(
        &self,
        audio_path: &Path,
        language: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<String, DownloadError> {
        let output_dir = tempfile::tempdir()
            .map_err(|e| DownloadError::io(Platform::Local, "Failed to create whisper output directory", e))?;

        let cmd = self.command(audio_path, output_dir.path(), language);
        tracing::debug!("Running whisper: {:?}", cmd.as_std());

        let options = ProcessOptions::new(self.timeout, cancel.clone());
        let output = run_command(cmd, &self.binary, Platform::Local, &options).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DownloadError::new(
                ErrorKind::TranscriptionFailed,
                Platform::Local,
                format!("whisper exited with {} on {}", output.status, self.path),
            )
            .with_detail(stderr.trim().to_string()));
        }

        let text_path = transcript_file(output_dir.path(), audio_path);
        let text = tokio::fs::read_to_string(&text_path).await.map_err(|e| {
            DownloadError::new(
                ErrorKind::TranscriptionFailed,
                Platform::Local,
                format!("whisper produced no transcript at {}", text_path.display()),
            )
            .with_detail(e.to_string())
        })?;

        Ok(join_lines(text.lines()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_paths_follow_accelerator() {
        let cpu_only = WhisperCliBackend::new("whisper");
        assert_eq!(cpu_only.execution_paths(), vec![ExecutionPath::Cpu]);

        let gpu = WhisperCliBackend::new("whisper").with_accelerator("cuda");
        assert_eq!(gpu.execution_paths(), vec![ExecutionPath::Accelerated, ExecutionPath::Cpu]);
    }

    #[test]
    fn test_cpu_command_disables_fp16() {
        let model = WhisperCliModel {
            binary: "whisper".to_string(),
            model: "medium".to_string(),
            path: ExecutionPath::Cpu,
            device: "cpu".to_string(),
            initial_prompt: Some("简体中文".to_string()),
            timeout: Duration::from_secs(5),
        };
        let cmd = model.command(Path::new("/tmp/a.mp3"), Path::new("/tmp/out"), Some("zh"));
        let args: Vec<String> = cmd.as_std().get_args().map(|a| a.to_string_lossy().into_owned()).collect();

        assert_eq!(args[0], "/tmp/a.mp3");
        assert!(args.windows(2).any(|w| w == ["--fp16", "False"]));
        assert!(args.windows(2).any(|w| w == ["--device", "cpu"]));
        assert!(args.windows(2).any(|w| w == ["--language", "zh"]));
        assert!(args.windows(2).any(|w| w == ["--initial_prompt", "简体中文"]));
    }

    #[test]
    fn test_transcript_file_uses_audio_stem() {
        assert_eq!(
            transcript_file(Path::new("/out"), Path::new("/tmp/clip.m4a")),
            PathBuf::from("/out/clip.txt")
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fake_whisper_end_to_end() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("whisper");
        // Writes "<stem>.txt" into the --output_dir argument
        std::fs::write(
            &script,
            "#!/bin/sh\n\
             [ \"$1\" = \"--help\" ] && exit 0\n\
             audio=$1; out=\n\
             while [ $# -gt 0 ]; do [ \"$1\" = \"--output_dir\" ] && out=$2; shift; done\n\
             name=$(basename \"$audio\"); printf 'hello\\n\\nworld\\n' > \"$out/${name%.*}.txt\"\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let audio = dir.path().join("clip.mp3");
        std::fs::write(&audio, b"fake").unwrap();

        let backend = WhisperCliBackend::new(script.to_string_lossy()).with_timeout(Duration::from_secs(10));
        let model = backend.load("tiny", ExecutionPath::Cpu).await.unwrap();
        let text = model.infer(&audio, None, &CancellationToken::new()).await.unwrap();
        assert_eq!(text, "hello world");
    }
}
