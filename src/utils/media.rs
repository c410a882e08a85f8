//! ffmpeg / ffprobe helpers for downloaded and local media

use std::path::{Path, PathBuf};
use tokio::process::Command;

use super::process::{run_checked, ProcessOptions};
use crate::error::DownloadError;
use crate::platform::Platform;

/// Extensions treated as audio or video output of a downloader
pub const MEDIA_EXTENSIONS: &[&str] = &[
    "mp3", "m4a", "aac", "wav", "flac", "ogg", "opus", "webm", "mp4", "m4v", "mkv", "mov", "flv", "ts", "avi",
];

/// Extract the audio track of `input` into an mp3 next to it.
///
/// Returns the mp3 path on success (removing the original), or `input`
/// unchanged when ffmpeg is missing or fails. Cancellation is the only error.
pub async fn extract_audio(ffmpeg: &str, input: &Path, options: &ProcessOptions) -> Result<PathBuf, DownloadError> {
    let target = input.with_extension("mp3");
    if target == input {
        return Ok(input.to_path_buf());
    }

    tracing::info!("Extracting audio track {} -> {}", input.display(), target.display());

    let mut cmd = Command::new(ffmpeg);
    cmd.arg("-y")
        .arg("-i")
        .arg(input)
        .args(["-vn", "-acodec", "mp3"])
        .arg(&target);

    match run_checked(cmd, "ffmpeg", Platform::Unknown, options).await {
        Ok(_) if target.exists() => {
            if let Err(e) = fs_err::remove_file(input) {
                tracing::debug!("Could not remove source after extraction: {}", e);
            }
            Ok(target)
        }
        Ok(_) => {
            tracing::warn!("ffmpeg reported success but produced no file, keeping original");
            Ok(input.to_path_buf())
        }
        Err(e) if e.is_cancelled() => Err(e),
        Err(e) => {
            tracing::warn!("Audio extraction failed, keeping original file: {}", e.message);
            Ok(input.to_path_buf())
        }
    }
}

/// Duration in whole seconds as reported by ffprobe, if it can tell
pub async fn probe_duration(ffprobe: &str, path: &Path, options: &ProcessOptions) -> Option<u64> {
    let mut cmd = Command::new(ffprobe);
    cmd.args(["-v", "quiet", "-print_format", "json", "-show_format"]).arg(path);

    let output = match run_checked(cmd, "ffprobe", Platform::Local, options).await {
        Ok(output) => output,
        Err(e) => {
            tracing::debug!("ffprobe unavailable for {}: {}", path.display(), e.message);
            return None;
        }
    };

    let info: serde_json::Value = serde_json::from_slice(&output.stdout).ok()?;
    parse_format_duration(&info)
}

fn parse_format_duration(info: &serde_json::Value) -> Option<u64> {
    info["format"]["duration"]
        .as_str()
        .and_then(|d| d.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d >= 0.0)
        .map(|d| d.round() as u64)
}
