//! Video Transcriptor - turns video URLs into plain-text transcripts
//!
//! Platform subtitles are preferred because they are cheap. When a video has
//! none, media is acquired through a prioritized chain of download strategies
//! (platform APIs, parallel range downloads, yt-dlp and friends) and
//! transcribed with Whisper, with results cached by audio content.

pub mod cli;
pub mod config;
pub mod error;
pub mod fetch;
pub mod output;
pub mod pipeline;
pub mod platform;
pub mod ratelimit;
pub mod strategies;
pub mod subtitles;
pub mod transcribe;
pub mod utils;

pub use cli::{Cli, Commands, OutputFormat};
pub use config::Config;
pub use error::{DownloadError, ErrorKind};
pub use fetch::{FetchOptions, RangeFetcher};
pub use pipeline::{Acquisition, AcquisitionPipeline, AcquisitionState, TranscriptSource};
pub use platform::Platform;
pub use strategies::{DownloadStrategy, StrategyChain, VideoInfo};
pub use subtitles::{SubtitleResolver, SubtitleSource};
pub use transcribe::{Transcriber, TranscriptionEngine};

/// Result type used by the configuration and front-end layers
pub type Result<T> = anyhow::Result<T>;
