//! Configuration file support
//!
//! Loads tool configuration from TOML files. Every section and every field is
//! optional; missing values keep their defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use remux_lib::StoreKind;

use crate::config::CliConfig;
use crate::error::Result;

/// Configuration file format
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Conversion settings
    pub remux: Option<RemuxSettings>,
    /// Blob store settings
    pub store: Option<StoreSettings>,
    /// Re-encode fallback settings
    pub fallback: Option<FallbackSettings>,
    /// Logging settings
    pub logging: Option<LoggingSettings>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemuxSettings {
    /// Duration hint in seconds
    pub duration: Option<f64>,
    /// Codec label when the video codec string cannot be inferred
    pub video_codec: Option<String>,
    /// Codec label when the audio codec string cannot be inferred
    pub audio_codec: Option<String>,
    /// Explicit output mime type
    pub mime_type: Option<String>,
    /// Drop unneeded composition-offset tables
    pub flatten_composition_offsets: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSettings {
    /// "spill" or "memory"
    pub kind: Option<StoreKind>,
    /// Parent directory for spill files
    pub spill_dir: Option<PathBuf>,
    /// Grace period before the store is closed, in milliseconds
    pub release_grace_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FallbackSettings {
    pub enabled: Option<bool>,
    pub ffmpeg_path: Option<PathBuf>,
    pub video_encoder: Option<String>,
    pub audio_encoder: Option<String>,
    pub preset: Option<String>,
    pub crf: Option<u32>,
    pub audio_bitrate: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: Option<String>,
}

impl ConfigFile {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: ConfigFile = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }

    /// Generate default configuration file
    pub fn default_config() -> Self {
        let defaults = CliConfig::default();
        Self {
            remux: Some(RemuxSettings {
                flatten_composition_offsets: Some(false),
                ..Default::default()
            }),
            store: Some(StoreSettings {
                kind: Some(defaults.remux.store.kind),
                spill_dir: None,
                release_grace_ms: Some(defaults.remux.store.release_grace_ms),
            }),
            fallback: Some(FallbackSettings {
                enabled: Some(defaults.fallback.enabled),
                ffmpeg_path: None,
                video_encoder: Some(defaults.fallback.video_encoder),
                audio_encoder: Some(defaults.fallback.audio_encoder),
                preset: Some(defaults.fallback.preset),
                crf: Some(defaults.fallback.crf),
                audio_bitrate: Some(defaults.fallback.audio_bitrate),
            }),
            logging: Some(LoggingSettings {
                level: defaults.logging.level,
                format: Some("pretty".to_string()),
            }),
        }
    }

    /// Convert to CliConfig
    pub fn into_cli_config(self) -> CliConfig {
        let mut config = CliConfig::default();

        if let Some(remux) = self.remux {
            let options = &mut config.remux;
            options.duration = remux.duration;
            options.video_codec = remux.video_codec;
            options.audio_codec = remux.audio_codec;
            options.mime_type = remux.mime_type;
            options.flatten_composition_offsets = remux.flatten_composition_offsets.unwrap_or(false);
        }
        if let Some(store) = self.store {
            let target = &mut config.remux.store;
            if let Some(kind) = store.kind {
                target.kind = kind;
            }
            target.spill_dir = store.spill_dir;
            if let Some(grace) = store.release_grace_ms {
                target.release_grace_ms = grace;
            }
        }
        if let Some(fallback) = self.fallback {
            let target = &mut config.fallback;
            target.enabled = fallback.enabled.unwrap_or(target.enabled);
            target.ffmpeg_path = fallback.ffmpeg_path;
            if let Some(v) = fallback.video_encoder {
                target.video_encoder = v;
            }
            if let Some(a) = fallback.audio_encoder {
                target.audio_encoder = a;
            }
            if let Some(p) = fallback.preset {
                target.preset = p;
            }
            if let Some(crf) = fallback.crf {
                target.crf = crf;
            }
            if let Some(b) = fallback.audio_bitrate {
                target.audio_bitrate = b;
            }
        }
        if let Some(logging) = self.logging {
            config.logging.level = logging.level;
            config.logging.json = logging.format.as_deref() == Some("json");
        }
        config
    }
}

/// Generate default configuration file at the specified path
pub fn generate_default_config<P: AsRef<Path>>(path: P) -> Result<()> {
    ConfigFile::default_config().to_file(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = ConfigFile::default_config();
        assert_eq!(config.store.as_ref().unwrap().kind, Some(StoreKind::Spill));
        assert_eq!(
            config.fallback.as_ref().unwrap().video_encoder.as_deref(),
            Some("libx264")
        );
    }

    #[test]
    fn test_config_file_roundtrip() {
        let config = ConfigFile::default_config();

        let mut temp_file = NamedTempFile::new().unwrap();
        let content = toml::to_string_pretty(&config).unwrap();
        temp_file.write_all(content.as_bytes()).unwrap();

        let loaded = ConfigFile::from_file(temp_file.path()).unwrap();
        assert_eq!(
            loaded.fallback.unwrap().crf,
            config.fallback.unwrap().crf
        );
        assert_eq!(loaded.logging.unwrap().level, "info");
    }

    #[test]
    fn test_partial_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        write!(
            temp_file,
            r#"
[store]
kind = "memory"

[remux]
mime_type = "video/mp4"

[logging]
level = "debug"
format = "json"
"#
        )
        .unwrap();

        let config = ConfigFile::from_file(temp_file.path())
            .unwrap()
            .into_cli_config();
        assert_eq!(config.remux.store.kind, StoreKind::Memory);
        assert_eq!(config.remux.mime_type.as_deref(), Some("video/mp4"));
        assert!(config.logging.json);
        assert_eq!(config.logging.level, "debug");
        assert!(config.fallback.enabled);
    }

    #[test]
    fn test_invalid_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        write!(temp_file, "[store]\nkind = \"floppy\"\n").unwrap();
        assert!(ConfigFile::from_file(temp_file.path()).is_err());
    }

    #[test]
    fn test_generate_default_config() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_path_buf();

        generate_default_config(&path).unwrap();

        assert!(path.exists());
        let config = ConfigFile::from_file(&path).unwrap().into_cli_config();
        assert_eq!(config.fallback.preset, "veryfast");
    }
}
