//! Fragment remuxer
//!
//! Merges HLS/DASH media fragments, given as files, into a single seekable
//! MP4. Falls back to an ffmpeg re-encode when the fragments cannot be merged
//! structurally.

mod config;
mod config_file;
mod error;
mod fallback;

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use remux_lib::{
    CancellationToken, DataProvider, DiagnosticSink, FileProvider, Fmp4TransmuxerFactory,
    FragmentSource, ProgressSink, Remuxer, TaggedFragment, TrackKind,
};

use crate::config::{Args, CliConfig, LoggingConfig};
use crate::config_file::{generate_default_config, ConfigFile};
use crate::error::{CliError, Result};
use crate::fallback::FfmpegFallback;

/// Application version
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
const APP_NAME: &str = "fragment-remux";

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.init_config {
        generate_default_config(&args.config)?;
        println!("Wrote {}", args.config.display());
        return Ok(());
    }
    args.validate().map_err(CliError::Config)?;

    let config = load_config(&args)?;
    init_logging(&config.logging);
    tracing::info!("{} v{} starting", APP_NAME, VERSION);
    tracing::debug!("Configuration loaded: {:?}", config);

    let output = args
        .output
        .clone()
        .ok_or_else(|| CliError::Config("--output is required".to_string()))?;
    let source = build_source(&args).await?;
    if source.is_empty() {
        return Err(CliError::NoInput);
    }

    let mut remuxer = Remuxer::fmp4(Fmp4TransmuxerFactory::new())
        .with_options(config.remux.clone())
        .with_diagnostics(DiagnosticSink::new(|event| {
            tracing::debug!("Diagnostic: {:?}", event)
        }));
    if config.fallback.enabled {
        match FfmpegFallback::discover(&config.fallback).await {
            Some(fallback) => remuxer = remuxer.with_fallback(Arc::new(fallback)),
            None => tracing::warn!("ffmpeg not found, re-encode fallback disabled"),
        }
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, cancelling conversion");
                cancel.cancel();
            }
        });
    }
    let progress = ProgressSink::new(|percent| tracing::info!("Progress: {}%", percent));

    let artifact = remuxer.convert(source, progress, cancel).await?;
    tokio::fs::write(&output, &artifact.data).await?;
    tracing::info!(
        "Wrote {} bytes ({}) to {}",
        artifact.len(),
        artifact.mime_type,
        output.display()
    );
    Ok(())
}

/// Load the configuration file when present and apply command-line overrides
fn load_config(args: &Args) -> Result<CliConfig> {
    let base = if args.config.exists() {
        ConfigFile::from_file(&args.config)?.into_cli_config()
    } else {
        CliConfig::default()
    };
    Ok(base.apply_args(args))
}

/// Build the fragment list.
///
/// Init segments are passed as the first fragment of their track, so the
/// transmuxer and a re-encode fallback both see self-contained streams.
/// Tracks are interleaved fragment by fragment.
async fn build_source(args: &Args) -> Result<FragmentSource> {
    if !args.raw.is_empty() {
        let mut buffers = Vec::with_capacity(args.raw.len() + 1);
        for path in args.video_init.iter().chain(&args.raw) {
            buffers.push(bytes::Bytes::from(tokio::fs::read(path).await?));
        }
        return Ok(FragmentSource::Raw(buffers));
    }

    let video = track_files(args.video_init.as_ref(), &args.video);
    let audio = track_files(args.audio_init.as_ref(), &args.audio);
    let mut fragments = Vec::with_capacity(video.len() + audio.len());
    for i in 0..video.len().max(audio.len()) {
        for (kind, files) in [(TrackKind::Video, &video), (TrackKind::Audio, &audio)] {
            if let Some(path) = files.get(i) {
                let entry: Arc<dyn DataProvider> = Arc::new(FileProvider::new(path.clone()));
                fragments.push(TaggedFragment::new(kind.index() as u8, i as u64, 0, entry));
            }
        }
    }
    Ok(FragmentSource::Tagged(fragments))
}

fn track_files(init: Option<&PathBuf>, media: &[PathBuf]) -> Vec<PathBuf> {
    if media.is_empty() {
        return Vec::new();
    }
    init.into_iter().chain(media).cloned().collect()
}

/// Initialize logging with tracing
fn init_logging(config: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.default_filter().into());
    let registry = tracing_subscriber::registry().with(filter);
    if config.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
