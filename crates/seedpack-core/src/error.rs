//! Core error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid Chart.yaml: {message}")]
    InvalidChart { message: String },

    #[error("Chart archive error: {message}")]
    Archive { message: String },

    #[error("Failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid version: {0}")]
    InvalidVersion(#[from] semver::Error),

    #[error("Values error: {message}")]
    Values { message: String },
}

pub type Result<T> = std::result::Result<T, CoreError>;
