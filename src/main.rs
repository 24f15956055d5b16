use deploy_webhook::api::{HEALTH_PATH, WEBHOOK_PATH, router};
use deploy_webhook::config::{DEFAULT_CONFIG_PATH, load_config};
use deploy_webhook::error::DeployError;
use deploy_webhook::logging::{DiagnosticsFile, setup_logging};
use deploy_webhook::{AppState, DeployConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    let (config_path, explicit) = match std::env::var("DEPLOY_CONFIG") {
        Ok(path) => (PathBuf::from(path), true),
        Err(_) => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
    };

    let config = match load_config(&config_path, explicit) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    let _log_guard = setup_logging(config.diagnostics_dir.clone().map(DiagnosticsFile::new));
    info!("Using config at {:?}", config_path);

    if let Err(e) = serve(config).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn serve(config: DeployConfig) -> Result<(), DeployError> {
    let state = Arc::new(AppState::new(config));
    let log = state.log.clone();

    if !state.config.has_secret() {
        log.warn("WEBHOOK_SECRET not set. Set it for security: export WEBHOOK_SECRET=your_secret")
            .await;
    }

    let bind_address = state.config.bind_address.clone();
    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .map_err(|source| DeployError::BindFailed {
            address: bind_address.clone(),
            source,
        })?;

    log.log(format!("Webhook listener started on {}", bind_address)).await;
    log.log(format!("Endpoint: POST {}", WEBHOOK_PATH)).await;
    log.log(format!("Health:   GET  {}", HEALTH_PATH)).await;

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    log.log("Shutting down webhook listener").await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for CTRL+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received CTRL+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
