pub mod api;
pub mod deploy;
pub mod error;
pub mod job;
pub mod logging;
pub mod utils;
pub mod webhook;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use deploy::Deployer;
use error::{DeployError, Result};

pub const SERVICE_NAME: &str = "webhook-deploy";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_DEPLOY_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct DeployConfig {
    pub port: u16,
    pub bind_host: String,
    pub webhook_path: String,
    pub webhook_secret: Option<String>,
    pub branch: String,
    pub repo_root: PathBuf,
    pub deploy_command: PathBuf,
    pub deploy_timeout_secs: u64,
    /// Source update argv run before deploying. `None` means
    /// `git pull origin <branch>`, an empty list skips the step.
    pub update_command: Option<Vec<String>>,
    /// Unbounded when unset
    pub update_timeout_secs: Option<u64>,
    pub log_dir: PathBuf,
    pub log_file: String,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind_host: "0.0.0.0".to_string(),
            webhook_path: "/webhook".to_string(),
            webhook_secret: None,
            branch: "main".to_string(),
            repo_root: PathBuf::from("."),
            deploy_command: PathBuf::from("./scripts/deploy.sh"),
            deploy_timeout_secs: DEFAULT_DEPLOY_TIMEOUT_SECS,
            update_command: None,
            update_timeout_secs: None,
            log_dir: PathBuf::from("."),
            log_file: "webhook-deploy.log".to_string(),
        }
    }
}

impl DeployConfig {
    /// Load and parse a TOML configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config_str = fs::read_to_string(path).map_err(|e| {
            DeployError::ConfigError(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;

        let config: DeployConfig = toml::from_str(&config_str)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.webhook_path.starts_with('/') {
            return Err(DeployError::ConfigError(format!(
                "webhook_path must start with '/', got '{}'",
                self.webhook_path
            )));
        }
        if matches!(self.webhook_path.as_str(), "/health" | "/status") {
            return Err(DeployError::ConfigError(format!(
                "webhook_path '{}' collides with a built-in endpoint",
                self.webhook_path
            )));
        }
        if self.branch.trim().is_empty() {
            return Err(DeployError::ConfigError("branch must not be empty".into()));
        }
        if self.deploy_timeout_secs == 0 {
            return Err(DeployError::ConfigError(
                "deploy_timeout_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Replace the configured secret, e.g. from `WEBHOOK_SECRET`.
    /// An empty value counts as unset.
    pub fn override_secret(&mut self, secret: Option<String>) {
        if let Some(secret) = secret {
            self.webhook_secret = Some(secret).filter(|s| !s.is_empty());
        }
    }

    /// The secret, if one is set and non-empty
    pub fn secret(&self) -> Option<&str> {
        self.webhook_secret.as_deref().filter(|s| !s.is_empty())
    }

    pub fn target_ref(&self) -> String {
        format!("refs/heads/{}", self.branch)
    }

    /// Argv of the source update step
    pub fn update_argv(&self) -> Vec<String> {
        match &self.update_command {
            Some(argv) => argv.clone(),
            None => vec![
                "git".to_string(),
                "pull".to_string(),
                "origin".to_string(),
                self.branch.clone(),
            ],
        }
    }

    pub fn log_file_path(&self) -> PathBuf {
        self.log_dir.join(&self.log_file)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_host, self.port)
    }
}

/// Process-wide context handed to every handler
pub struct AppState {
    pub config: DeployConfig,
    pub deployer: Deployer,
    pub start_time: Instant,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Builds the context, failing when the deploy command cannot be found
    pub fn new(config: DeployConfig) -> Result<Self> {
        let deployer = Deployer::from_config(&config)?;
        Ok(Self {
            config,
            deployer,
            start_time: Instant::now(),
            started_at: Utc::now(),
        })
    }
}

pub type SharedState = Arc<AppState>;
