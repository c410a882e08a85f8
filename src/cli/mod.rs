use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "transcriptor",
    about = "Video Transcriptor - Turn video URLs into plain-text transcripts",
    version,
    long_about = "Turns a video URL (YouTube, Bilibili, Douyin, TikTok, Twitter/X and more) or a local media file into a plain-text transcript. Platform subtitles are used when available; otherwise the media is downloaded through a chain of strategies and transcribed with Whisper."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Disable progress indicators
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Transcribe a URL or local file
    Transcribe {
        /// Video URL or path to a local audio/video file
        #[arg(value_name = "URL_OR_FILE")]
        url: String,

        /// Output file path (prints to console if not specified)
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,

        /// Whisper model (overrides the config file)
        #[arg(short, long, value_name = "MODEL")]
        model: Option<String>,

        /// Language code for transcription (overrides the config file)
        #[arg(short, long, value_name = "LANG")]
        language: Option<String>,

        /// Skip the transcript cache
        #[arg(long)]
        no_cache: bool,

        /// Download full video instead of audio only
        #[arg(long)]
        video: bool,
    },

    /// Transcribe several inputs, one output file each
    Batch {
        /// URLs or local files
        #[arg(value_name = "INPUTS")]
        inputs: Vec<String>,

        /// File with one input per line (blank lines and # comments ignored)
        #[arg(long, value_name = "FILE")]
        file: Option<PathBuf>,

        /// Directory for the transcripts
        #[arg(long, value_name = "DIR", default_value = "transcripts")]
        output_dir: PathBuf,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,

        /// Concurrent acquisitions (overrides the config file)
        #[arg(short, long, value_name = "N")]
        jobs: Option<usize>,
    },

    /// Show or create the configuration file
    Config {
        /// Show current configuration
        #[arg(short, long)]
        show: bool,
    },

    /// List supported platforms
    Platforms,

    /// List download strategies in the order they are tried
    Strategies,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    /// Plain text with a short header
    Text,
    /// JSON with metadata and visited states
    Json,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Text => "txt",
            OutputFormat::Json => "json",
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

/// Inputs from the command line followed by those listed in `--file`
pub fn collect_inputs(inputs: &[String], file: Option<&std::path::Path>) -> crate::Result<Vec<String>> {
    let mut all: Vec<String> = inputs.iter().map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();

    if let Some(path) = file {
        let content = fs_err::read_to_string(path)?;
        all.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string),
        );
    }

    if all.is_empty() {
        anyhow::bail!("No inputs given. Pass URLs/files or --file");
    }
    Ok(all)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_transcribe_flags() {
        let cli = Cli::parse_from([
            "transcriptor",
            "transcribe",
            "https://b23.tv/abc",
            "-f",
            "json",
            "--model",
            "small",
            "--no-cache",
        ]);
        match cli.command {
            Commands::Transcribe {
                url,
                format,
                model,
                no_cache,
                video,
                ..
            } => {
                assert_eq!(url, "https://b23.tv/abc");
                assert_eq!(format, OutputFormat::Json);
                assert_eq!(model.as_deref(), Some("small"));
                assert!(no_cache);
                assert!(!video);
            }
            _ => panic!("expected transcribe"),
        }
    }

    #[test]
    fn test_collect_inputs_merges_file() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("urls.txt");
        std::fs::write(&list, "# queue\nhttps://a\n\n  https://b  \n").unwrap();

        let inputs = collect_inputs(&["https://c".to_string()], Some(&list)).unwrap();
        assert_eq!(inputs, vec!["https://c", "https://a", "https://b"]);
        assert!(collect_inputs(&[], None).is_err());
    }
}
