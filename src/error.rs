use thiserror::Error;

use remux_lib::RemuxError;

/// Main error type for the command-line tool
#[derive(Error, Debug)]
pub enum CliError {
    #[error("{0}")]
    Remux(#[from] RemuxError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No input fragments given")]
    NoInput,
}

impl From<toml::de::Error> for CliError {
    fn from(e: toml::de::Error) -> Self {
        CliError::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for CliError {
    fn from(e: toml::ser::Error) -> Self {
        CliError::Config(e.to_string())
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, CliError>;
