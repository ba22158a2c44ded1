use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use webhook_deploy::error::DeployError;
use webhook_deploy::logging::{FileLogger, setup_logging};
use webhook_deploy::{AppState, DeployConfig, api};

const DEFAULT_CONFIG_PATH: &str = "webhook_deploy.toml";

/// Receives GitHub webhooks and deploys when a push lands on the deploy branch
#[derive(Debug, Parser)]
#[command(name = "webhook-deploy", version)]
struct Cli {
    /// Port to listen on, overrides the config file
    port: Option<u16>,

    /// TOML config file (default: $WEBHOOK_DEPLOY_CONFIG, then ./webhook_deploy.toml if present)
    #[arg(long)]
    config: Option<PathBuf>,
}

/// Defaults, then the config file, then `WEBHOOK_SECRET`, then the CLI port
fn load_config(cli: &Cli) -> Result<DeployConfig, DeployError> {
    let config_path = cli
        .config
        .clone()
        .or_else(|| std::env::var_os("WEBHOOK_DEPLOY_CONFIG").map(PathBuf::from))
        .or_else(|| {
            let default = Path::new(DEFAULT_CONFIG_PATH);
            default.is_file().then(|| default.to_path_buf())
        });

    let mut config = match config_path {
        Some(path) => DeployConfig::load(&path)?,
        None => DeployConfig::default(),
    };

    config.override_secret(std::env::var("WEBHOOK_SECRET").ok());
    if let Some(port) = cli.port {
        config.port = port;
    }
    config.validate()?;
    Ok(config)
}

async fn serve(config: DeployConfig) -> Result<(), DeployError> {
    let state = Arc::new(AppState::new(config)?);
    let config = &state.config;

    let bind_address = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;

    info!("Webhook deploy server starting on {}", bind_address);
    info!(
        "Webhook endpoint: http://localhost:{}{}",
        config.port, config.webhook_path
    );
    info!("Status page: http://localhost:{}/status", config.port);
    info!("Health check: http://localhost:{}/health", config.port);
    info!(
        "Deploying '{}' from '{}' on push to {} (timeout {}s)",
        state.deployer.deploy_command().display(),
        state.deployer.repo_root().display(),
        config.target_ref(),
        config.deploy_timeout_secs
    );
    if config.secret().is_none() {
        warn!("No webhook secret configured - set WEBHOOK_SECRET environment variable");
    }

    let app = api::router(state.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Webhook server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    info!("Shutting down webhook server...");
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // --help and --version are not failures
            let code = if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
            let _ = e.print();
            return code;
        }
    };

    let config = match load_config(&cli) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let file_logger = FileLogger::new(config.log_dir.clone()).with_file_name(config.log_file.clone());
    let _log_guard = match setup_logging(&file_logger) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!(
                "Failed to open log file '{}': {}",
                file_logger.log_path().display(),
                e
            );
            return ExitCode::FAILURE;
        }
    };

    match serve(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
