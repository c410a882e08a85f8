use std::path::{Path, PathBuf};
use std::time::SystemTime;
use url::Url;
use walkdir::WalkDir;

pub mod cookies;
pub mod media;
pub mod process;

pub use cookies::cookie_header_for;
pub use process::{run_checked, run_command, ProcessOptions};

/// Format file size in human-readable format
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    const THRESHOLD: f64 = 1024.0;

    if bytes == 0 {
        return "0 B".to_string();
    }

    let bytes_f = bytes as f64;
    let unit_index = (bytes_f.log10() / THRESHOLD.log10()).floor() as usize;
    let unit_index = unit_index.min(UNITS.len() - 1);

    let size = bytes_f / THRESHOLD.powi(unit_index as i32);

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

/// Format duration in human-readable format
pub fn format_duration(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

/// Turn a video title into a safe file stem.
///
/// Drops path separators, shell-hostile and control characters, trims dots
/// and spaces, and falls back to `default` for empty or oversized names.
pub fn sanitize_filename(title: &str, default: &str) -> String {
    let cleaned: String = title
        .chars()
        .filter(|c| !matches!(c, '\\' | '/' | '*' | '?' | '"' | '<' | '>' | '|') && !c.is_control())
        .map(|c| if c == ':' { '_' } else { c })
        .collect();
    let cleaned = cleaned.trim_matches(|c: char| c == ' ' || c == '.');

    if cleaned.is_empty() || cleaned.chars().count() > 200 {
        default.to_string()
    } else {
        cleaned.to_string()
    }
}

/// Extract domain from URL for display purposes
pub fn extract_domain(url: &str) -> Option<String> {
    Url::parse(url).ok()?.host_str().map(|host| host.strip_prefix("www.").unwrap_or(host).to_string())
}

/// Most recently modified file under `dir` whose extension is in `extensions`
/// (any extension when the list is empty). Partial downloads are ignored.
pub fn newest_file(dir: &Path, extensions: &[&str]) -> Option<PathBuf> {
    WalkDir::new(dir)
        .max_depth(4)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            let ext = entry
                .path()
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_lowercase())
                .unwrap_or_default();
            if matches!(ext.as_str(), "part" | "ytdl" | "tmp" | "json") {
                return false;
            }
            extensions.is_empty() || extensions.iter().any(|wanted| ext == *wanted)
        })
        .filter_map(|entry| {
            let modified = entry.metadata().ok()?.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            Some((modified, entry.into_path()))
        })
        .max_by_key(|(modified, _)| *modified)
        .map(|(_, path)| path)
}

/// Check if the current environment has the external tools we drive
pub async fn check_dependencies(tools: &crate::config::ToolsConfig) -> Vec<String> {
    let mut missing = Vec::new();

    if !check_command_available(&tools.yt_dlp).await {
        missing.push(format!("{} - required for YouTube subtitles and most downloads", tools.yt_dlp));
    }
    if !check_command_available(&tools.ffmpeg).await {
        missing.push(format!("{} - required for audio extraction", tools.ffmpeg));
    }
    if !check_command_available(&tools.whisper).await {
        missing.push(format!("{} - required when no subtitles are available", tools.whisper));
    }
    if !check_command_available(&tools.you_get).await {
        missing.push(format!("{} - optional, improves Bilibili downloads", tools.you_get));
    }

    missing
}

/// Check if a command is available in PATH
pub async fn check_command_available(command: &str) -> bool {
    use tokio::process::Command;

    Command::new(command)
        .arg("--version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .output()
        .await
        .map(|output| output.status.success())
        .unwrap_or(false)
}
