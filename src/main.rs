use anyhow::Result;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use video_transcriptor::cli::{collect_inputs, Cli, Commands};
use video_transcriptor::{output, utils, AcquisitionPipeline, Config, DownloadError, Platform};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let default_filter = if cli.verbose {
        "video_transcriptor=debug"
    } else {
        "video_transcriptor=info"
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Cancelling...");
            ctrl_c.cancel();
        }
    });

    match cli.command {
        Commands::Transcribe {
            url,
            output,
            format,
            model,
            language,
            no_cache,
            video,
        } => {
            let mut config = Config::load().await?;
            if let Some(model) = model {
                config.transcription.model = model;
            }
            if let Some(language) = language {
                config.transcription.language = Some(language);
            }
            if no_cache {
                config.transcription.use_cache = false;
            }
            if video {
                config.download.audio_only = false;
            }
            warn_missing_tools(&config).await;

            let pipeline = AcquisitionPipeline::from_config(&config).map_err(user_error)?;
            tracing::info!("Starting acquisition for: {}", url);

            let progress = spinner(cli.quiet, format!("Acquiring {}", url));
            let result = pipeline.acquire(&url, &cancel).await;
            progress.finish_and_clear();
            let result = result.map_err(user_error)?;

            match output {
                Some(path) => {
                    output::save_to_file(&result, &path, format)?;
                    println!("Transcript saved to: {}", path.display());
                }
                None => output::print_to_console(&result, format)?,
            }
        }
        Commands::Batch {
            inputs,
            file,
            output_dir,
            format,
            jobs,
        } => {
            let inputs = collect_inputs(&inputs, file.as_deref())?;
            let mut config = Config::load().await?;
            if let Some(jobs) = jobs {
                config.app.max_concurrent_jobs = jobs.max(1);
            }
            warn_missing_tools(&config).await;

            let pipeline = AcquisitionPipeline::from_config(&config).map_err(user_error)?;
            let progress = spinner(cli.quiet, format!("Processing {} inputs", inputs.len()));
            let outcomes = pipeline.acquire_many(&inputs, &cancel).await;
            progress.finish_and_clear();

            fs_err::create_dir_all(&output_dir)?;
            let mut failed = 0;
            for outcome in &outcomes {
                match &outcome.result {
                    Ok(acquisition) => {
                        let path = output::batch_output_path(&output_dir, acquisition, format);
                        output::save_to_file(acquisition, &path, format)?;
                        println!("✓ {} -> {}", outcome.input, path.display());
                    }
                    Err(e) => {
                        failed += 1;
                        eprintln!("✗ {}: {} ({})", outcome.input, e, e.kind);
                    }
                }
            }

            println!("{} succeeded, {} failed", outcomes.len() - failed, failed);
            if failed == outcomes.len() {
                anyhow::bail!("Every input in the batch failed");
            }
        }
        Commands::Config { show } => {
            let config = Config::load().await?;
            if show {
                config.display();
            } else {
                println!("Configuration file: {}", Config::config_path()?.display());
                println!("Edit it to set proxies, cookies, tool paths and the Whisper model.");
            }
        }
        Commands::Platforms => {
            println!("Supported platforms:");
            for (name, description) in Platform::describe_supported() {
                println!("  • {:<12} {}", name, description);
            }
        }
        Commands::Strategies => {
            let config = Config::load().await?;
            let pipeline = AcquisitionPipeline::from_config(&config).map_err(user_error)?;
            println!("Download strategies (tried in this order):");
            for (name, priority) in pipeline.chain().describe() {
                println!("  {:>3}  {}", priority, name);
            }
        }
    }

    Ok(())
}

/// Last concrete message plus its kind
fn user_error(e: DownloadError) -> anyhow::Error {
    if let Some(detail) = &e.detail {
        tracing::debug!("Error detail:\n{}", detail);
    }
    anyhow::anyhow!("{} ({})", e, e.kind)
}

fn spinner(quiet: bool, message: String) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let progress = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}") {
        progress.set_style(style);
    }
    progress.set_message(message);
    progress.enable_steady_tick(Duration::from_millis(120));
    progress
}

async fn warn_missing_tools(config: &Config) {
    let missing_deps = utils::check_dependencies(&config.tools).await;
    if !missing_deps.is_empty() {
        eprintln!("⚠️  Dependency check warnings:");
        for dep in missing_deps {
            eprintln!("   • {}", dep);
        }
        eprintln!("   (Continuing anyway - some strategies may fail)");
    }
}
