use std::path::PathBuf;

use thiserror::Error;

/// Core error type for MedLuma.
#[derive(Debug, Error)]
pub enum MedLumaError {
    #[error("configuration error: {0}")]
    InvalidConfiguration(String),
    #[error("missing environment variable: {0}")]
    MissingSecret(String),
    #[error("I/O error while reading {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("biomcp executable not found (searched {0} locations); install with `pip install biomcp-python`")]
    BioMcpNotFound(usize),
    #[error("model call failed in stage {stage}: {message}")]
    Model { stage: String, message: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MedLumaError {
    pub fn config_io(path: PathBuf, source: std::io::Error) -> Self {
        Self::ConfigIo { path, source }
    }

    pub fn model(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Model {
            stage: stage.into(),
            message: message.into(),
        }
    }
}
