//! Worker configuration
//!
//! Read once at startup from a TOML file with environment overrides, then
//! passed by value into the job constructor. Nothing reads configuration
//! from ambient global state after startup.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

fn default_server_address() -> String {
    "http://localhost:8000".into()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_make_command() -> Vec<String> {
    vec!["make".into()]
}

/// Configuration of one executor machine
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    /// Authentication token shared with the central server
    #[serde(default)]
    pub secret: String,
    /// Identity of this machine towards the central server
    #[serde(default)]
    pub uuid: String,
    /// Central server endpoint
    #[serde(default = "default_server_address")]
    pub server_address: String,
    /// Default execution timeout in seconds, must be positive
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Make tool command line
    #[serde(default = "default_make_command")]
    pub make_command: Vec<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            uuid: String::new(),
            server_address: default_server_address(),
            default_timeout_secs: default_timeout_secs(),
            make_command: default_make_command(),
        }
    }
}

impl ExecutorConfig {
    /// Load from a TOML file, then apply `EXECUTOR_*` environment overrides
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Could not read config file {:?}", path))?;
        let mut config: ExecutorConfig =
            toml::from_str(&content).context("Invalid executor config")?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Configuration from environment variables alone
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(secret) = std::env::var("EXECUTOR_SECRET") {
            self.secret = secret;
        }
        if let Ok(uuid) = std::env::var("EXECUTOR_UUID") {
            self.uuid = uuid;
        }
        if let Ok(address) = std::env::var("EXECUTOR_SERVER") {
            self.server_address = address;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.default_timeout_secs == 0 {
            anyhow::bail!("default_timeout_secs must be positive");
        }
        if self.make_command.is_empty() {
            anyhow::bail!("make_command must not be empty");
        }
        Ok(())
    }

    /// Endpoint receiving result reports
    pub fn jobs_url(&self) -> String {
        format!("{}/jobs/", self.server_address.trim_end_matches('/'))
    }
}
