//! Command-line and resolved configuration

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use remux_lib::{RemuxOptions, StoreKind};

/// Merge HLS/DASH media fragments into one MP4.
#[derive(Parser, Debug, Clone)]
#[command(name = "fragment-remux")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Output MP4 file
    #[arg(short, long, required_unless_present = "init_config")]
    pub output: Option<PathBuf>,

    /// Video init segment (`ftyp` + `moov`)
    #[arg(long)]
    pub video_init: Option<PathBuf>,

    /// Video media fragments, in playback order
    #[arg(long, num_args = 1..)]
    pub video: Vec<PathBuf>,

    /// Audio init segment (`ftyp` + `moov`)
    #[arg(long)]
    pub audio_init: Option<PathBuf>,

    /// Audio media fragments, in playback order
    #[arg(long, num_args = 1..)]
    pub audio: Vec<PathBuf>,

    /// Untagged fragments of a single video track, in order
    #[arg(long, num_args = 1.., conflicts_with_all = ["video", "audio"])]
    pub raw: Vec<PathBuf>,

    /// Configuration file
    #[arg(short, long, default_value = "fragment-remux.toml")]
    pub config: PathBuf,

    /// Duration hint in seconds, used for re-encode progress
    #[arg(long)]
    pub duration: Option<f64>,

    /// Keep chunk payloads in memory instead of spill files
    #[arg(long)]
    pub memory: bool,

    /// Parent directory for spill files
    #[arg(long)]
    pub spill_dir: Option<PathBuf>,

    /// Never fall back to an ffmpeg re-encode
    #[arg(long)]
    pub no_fallback: bool,

    /// Logging level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Write a default configuration file to the --config path and exit
    #[arg(long)]
    pub init_config: bool,
}

impl Args {
    /// Check the input selection.
    pub fn validate(&self) -> Result<(), String> {
        if self.raw.is_empty() && self.video.is_empty() && self.audio.is_empty() {
            return Err("Give --raw, --video or --audio fragments".to_string());
        }
        if !self.raw.is_empty() && self.audio_init.is_some() {
            return Err("--audio-init has no effect with --raw".to_string());
        }
        if let Some(d) = self.duration {
            if !(d.is_finite() && d > 0.0) {
                return Err(format!("Invalid duration: {}", d));
            }
        }
        Ok(())
    }
}

/// Re-encode fallback configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Engage the ffmpeg re-encode when the structural merge fails
    pub enabled: bool,

    /// ffmpeg binary; searched in `PATH` when unset
    pub ffmpeg_path: Option<PathBuf>,

    pub video_encoder: String,

    pub audio_encoder: String,

    /// x264 preset
    pub preset: String,

    pub crf: u32,

    pub audio_bitrate: String,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ffmpeg_path: None,
            video_encoder: "libx264".to_string(),
            audio_encoder: "aac".to_string(),
            preset: "veryfast".to_string(),
            crf: 20,
            audio_bitrate: "128k".to_string(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl LoggingConfig {
    /// Filter directive used when `RUST_LOG` is not set
    pub fn default_filter(&self) -> String {
        format!("fragment_remux={0},remux_lib={0}", self.level)
    }
}

/// Fully resolved tool configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CliConfig {
    pub remux: RemuxOptions,
    pub fallback: FallbackConfig,
    pub logging: LoggingConfig,
}

impl CliConfig {
    /// Apply command-line overrides on top of file or default settings.
    pub fn apply_args(mut self, args: &Args) -> Self {
        if let Some(duration) = args.duration {
            self.remux.duration = Some(duration);
        }
        if args.memory {
            self.remux.store.kind = StoreKind::Memory;
        }
        if let Some(dir) = &args.spill_dir {
            self.remux.store.spill_dir = Some(dir.clone());
        }
        if args.no_fallback {
            self.fallback.enabled = false;
        }
        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["fragment-remux", "-o", "out.mp4"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_default_config() {
        let config = CliConfig::default();
        assert!(config.fallback.enabled);
        assert_eq!(config.fallback.video_encoder, "libx264");
        assert_eq!(config.remux.store.kind, StoreKind::Spill);
        assert_eq!(
            config.logging.default_filter(),
            "fragment_remux=info,remux_lib=info"
        );
    }

    #[test]
    fn test_args_override_config() {
        let args = args(&[
            "--video",
            "a.m4s",
            "b.m4s",
            "--memory",
            "--no-fallback",
            "--duration",
            "12.5",
            "--log-level",
            "debug",
        ]);
        assert_eq!(args.video.len(), 2);
        let config = CliConfig::default().apply_args(&args);
        assert_eq!(config.remux.store.kind, StoreKind::Memory);
        assert!(!config.fallback.enabled);
        assert_eq!(config.remux.duration, Some(12.5));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_validate() {
        assert!(args(&[]).validate().is_err());
        assert!(args(&["--raw", "x.m4s"]).validate().is_ok());
        assert!(args(&["--raw", "x.m4s", "--audio-init", "a.mp4"])
            .validate()
            .is_err());
        assert!(args(&["--audio", "a.m4s", "--duration", "0"])
            .validate()
            .is_err());
    }

    #[test]
    fn test_raw_conflicts_with_tagged() {
        let parsed = Args::try_parse_from([
            "fragment-remux",
            "-o",
            "out.mp4",
            "--raw",
            "x.m4s",
            "--video",
            "y.m4s",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_init_config_needs_no_output() {
        let parsed = Args::try_parse_from(["fragment-remux", "--init-config"]).unwrap();
        assert!(parsed.init_config);
        assert!(parsed.output.is_none());
        assert!(Args::try_parse_from(["fragment-remux"]).is_err());
    }
}
