//! Receiver configuration: TOML file first, then environment overrides.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::DeployError;
use crate::runner::quote;

pub const DEFAULT_CONFIG_PATH: &str = "deploy_config.toml";

/// What to do when the service manager refuses to restart the new code.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RestartFailurePolicy {
    /// Report failure and leave the service for the operator.
    #[default]
    Abort,
    /// Restore the backup and restart again.
    Rollback,
}

/// What a trigger does while another deployment is in flight.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConcurrencyPolicy {
    /// Answer immediately with a busy status.
    #[default]
    Reject,
    /// Wait for the running deployment, then deploy.
    Queue,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DeployConfig {
    pub bind_address: String,
    pub webhook_secret: String,
    pub repo_url: String,
    pub branch: String,
    /// Only pushes touching paths under this prefix trigger a deployment.
    pub watched_path_prefix: String,
    /// Directory inside the repository holding the deployable files.
    pub source_dir: String,
    pub app_dir: PathBuf,
    pub entry_point: String,
    pub manifest: String,
    pub staging_dir: PathBuf,
    pub log_file: PathBuf,
    pub install_command: Option<String>,
    pub restart_command: String,
    pub health_command: String,
    pub health_ok_status: String,
    pub health_attempts: u32,
    pub health_interval_secs: u64,
    pub command_timeout_secs: u64,
    pub restart_failure: RestartFailurePolicy,
    pub concurrency: ConcurrencyPolicy,
    /// Directory for the rolling tracing log; disabled when unset.
    pub diagnostics_dir: Option<PathBuf>,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:9000".to_string(),
            webhook_secret: String::new(),
            repo_url: "https://github.com/manpreetsingh78/portfolio-source-code.git".to_string(),
            branch: "main".to_string(),
            watched_path_prefix: "backend/api/".to_string(),
            source_dir: "backend/api".to_string(),
            app_dir: PathBuf::from("/opt/portfolio-api"),
            entry_point: "main.py".to_string(),
            manifest: "requirements.txt".to_string(),
            staging_dir: PathBuf::from("/tmp/portfolio-deploy"),
            log_file: PathBuf::from("/var/log/portfolio-deploy.log"),
            install_command: None,
            restart_command: "systemctl restart portfolio-api".to_string(),
            health_command:
                "curl -s -o /dev/null -w '%{http_code}' http://localhost:8000/api/v1/system/health"
                    .to_string(),
            health_ok_status: "200".to_string(),
            health_attempts: 5,
            health_interval_secs: 3,
            command_timeout_secs: 120,
            restart_failure: RestartFailurePolicy::default(),
            concurrency: ConcurrencyPolicy::default(),
            diagnostics_dir: None,
        }
    }
}

impl DeployConfig {
    /// Returns true if requests must carry a valid signature.
    pub fn has_secret(&self) -> bool {
        !self.webhook_secret.is_empty()
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    /// Returns the dependency install command, falling back to the
    /// virtualenv pip next to the deployed app.
    pub fn install_command(&self) -> String {
        match &self.install_command {
            Some(cmd) => cmd.clone(),
            None => format!(
                "{} install -q -r {}",
                quote(self.app_dir.join("venv/bin/pip").to_string_lossy()),
                quote(self.app_dir.join(&self.manifest).to_string_lossy())
            ),
        }
    }

    /// Apply overrides from a key lookup (normally the process environment).
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("BIND_ADDRESS") {
            self.bind_address = v;
        }
        if let Some(v) = lookup("WEBHOOK_SECRET") {
            self.webhook_secret = v;
        }
        if let Some(v) = lookup("DEPLOY_REPO_URL") {
            self.repo_url = v;
        }
        if let Some(v) = lookup("DEPLOY_BRANCH") {
            self.branch = v;
        }
        if let Some(v) = lookup("DEPLOY_APP_DIR") {
            self.app_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("DEPLOY_LOG_FILE") {
            self.log_file = PathBuf::from(v);
        }
    }

    pub fn validate(&self) -> Result<(), DeployError> {
        let required = [
            ("branch", self.branch.is_empty()),
            ("repo_url", self.repo_url.is_empty()),
            ("app_dir", self.app_dir.as_os_str().is_empty()),
            ("entry_point", self.entry_point.is_empty()),
        ];
        if let Some((name, _)) = required.iter().find(|(_, missing)| *missing) {
            return Err(DeployError::ConfigError(format!("'{}' must not be empty", name)));
        }
        if self.health_attempts == 0 {
            return Err(DeployError::ConfigError(
                "'health_attempts' must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse a configuration document.
pub fn parse_config(config_str: &str) -> Result<DeployConfig, DeployError> {
    let config: DeployConfig = toml::from_str(config_str)?;
    Ok(config)
}

/// Load the configuration file, apply environment overrides and validate.
///
/// When `explicit` is false a missing file is not an error and the
/// built-in defaults are used.
pub fn load_config(path: &Path, explicit: bool) -> Result<DeployConfig, DeployError> {
    let mut config = if path.exists() {
        let config_str = fs::read_to_string(path).map_err(|e| {
            DeployError::ConfigError(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        parse_config(&config_str).map_err(|e| {
            DeployError::ConfigError(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?
    } else if explicit {
        return Err(DeployError::ConfigError(format!(
            "Config file '{}' does not exist",
            path.display()
        )));
    } else {
        DeployConfig::default()
    };

    config.apply_overrides(|key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}
