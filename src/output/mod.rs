use anyhow::Result;
use console::style;
use std::path::{Path, PathBuf};

use crate::cli::OutputFormat;
use crate::pipeline::Acquisition;
use crate::utils::{format_duration, sanitize_filename};

/// Header block followed by the transcript
pub fn format_as_text(result: &Acquisition) -> String {
    let info = &result.info;
    let mut out = String::new();
    out.push_str(&format!("Title: {}\n", info.title));
    out.push_str(&format!("Uploader: {}\n", info.uploader));
    if info.duration > 0 {
        out.push_str(&format!("Duration: {}\n", format_duration(info.duration)));
    }
    out.push_str(&format!("Source: {} ({})\n", info.url, result.source));
    out.push('\n');
    out.push_str(&result.transcript);
    out.push('\n');
    out
}

pub fn format_as_json(result: &Acquisition) -> Result<String> {
    Ok(serde_json::to_string_pretty(result)?)
}

fn render(result: &Acquisition, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Text => Ok(format_as_text(result)),
        OutputFormat::Json => format_as_json(result),
    }
}

/// Save an acquisition to file
pub fn save_to_file(result: &Acquisition, path: &Path, format: OutputFormat) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs_err::create_dir_all(parent)?;
    }
    fs_err::write(path, render(result, format)?)?;
    Ok(())
}

/// Print an acquisition to the console
pub fn print_to_console(result: &Acquisition, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            println!("{}", style(&result.info.title).bold());
            println!(
                "{}",
                style(format!("{} · {} · {}", result.info.uploader, result.info.platform, result.source)).dim()
            );
            println!();
            println!("{}", result.transcript);
        }
        OutputFormat::Json => println!("{}", format_as_json(result)?),
    }
    Ok(())
}

/// `<dir>/<sanitized title>.<ext>`, suffixed with a counter if taken
pub fn batch_output_path(dir: &Path, result: &Acquisition, format: OutputFormat) -> PathBuf {
    let stem = sanitize_filename(&result.info.title, "transcript");
    let mut candidate = dir.join(format!("{}.{}", stem, format.extension()));
    let mut n = 2;
    while candidate.exists() {
        candidate = dir.join(format!("{}-{}.{}", stem, n, format.extension()));
        n += 1;
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{AcquisitionState, TranscriptSource};
    use crate::strategies::VideoInfo;

    fn acquisition() -> Acquisition {
        Acquisition {
            info: VideoInfo {
                title: "A/B talk".to_string(),
                duration: 75,
                ..VideoInfo::placeholder("https://www.bilibili.com/video/BV1xx411c7mD")
            },
            transcript: "hello world".to_string(),
            source: TranscriptSource::Subtitles,
            states: vec![AcquisitionState::Start, AcquisitionState::Done],
        }
    }

    #[test]
    fn test_text_format() {
        let text = format_as_text(&acquisition());
        assert!(text.starts_with("Title: A/B talk\n"));
        assert!(text.contains("Duration: "));
        assert!(text.contains("(platform subtitles)"));
        assert!(text.ends_with("hello world\n"));
    }

    #[test]
    fn test_json_format() {
        let json: serde_json::Value = serde_json::from_str(&format_as_json(&acquisition()).unwrap()).unwrap();
        assert_eq!(json["transcript"], "hello world");
        assert_eq!(json["source"], "subtitles");
        assert_eq!(json["info"]["platform"], "bilibili");
        assert_eq!(json["states"][1], "done");
    }

    #[test]
    fn test_batch_paths_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let result = acquisition();

        let first = batch_output_path(dir.path(), &result, OutputFormat::Text);
        save_to_file(&result, &first, OutputFormat::Text).unwrap();
        let second = batch_output_path(dir.path(), &result, OutputFormat::Text);

        assert_ne!(first, second);
        assert!(second.to_string_lossy().ends_with("-2.txt"));
    }
}
