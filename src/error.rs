use std::io;
use std::path::PathBuf;

/// Custom error type for webhook_deploy operations
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("Source update failed: {0}")]
    UpdateFailed(String),

    #[error("Deploy command not found: {}", .0.display())]
    DeployCommandMissing(PathBuf),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParseError(#[from] toml::de::Error),
}

/// Helper type for Results that use DeployError
pub type Result<T> = std::result::Result<T, DeployError>;
