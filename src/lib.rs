pub mod api;
pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod pipeline;
pub mod runner;
pub mod signature;

use std::sync::Arc;

pub use config::DeployConfig;
use logging::DeployLog;
use pipeline::Deployer;

pub struct AppState {
    pub config: DeployConfig,
    pub deployer: Arc<Deployer>,
    pub log: DeployLog,
}

impl AppState {
    pub fn new(config: DeployConfig) -> Self {
        let log = DeployLog::new(&config.log_file);
        let deployer = Arc::new(Deployer::from_config(&config, log.clone()));
        Self::with_deployer(config, deployer, log)
    }

    /// Build state around an existing deployer, e.g. one with a custom plan.
    pub fn with_deployer(config: DeployConfig, deployer: Arc<Deployer>, log: DeployLog) -> Self {
        Self {
            config,
            deployer,
            log,
        }
    }
}

pub type SharedState = Arc<AppState>;
