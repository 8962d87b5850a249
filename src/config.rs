//! Layered configuration.
//!
//! Built-in defaults, then the TOML file, then `FACADE_BRIDGE_*` environment
//! variables, then command line flags. Later layers win.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::logging::LogConfig;
use crate::rpc::{BindMode, ServerSettings, events};

pub const DEFAULT_CONFIG_FILE: &str = "facade-bridge.toml";
pub const ENV_PREFIX: &str = "FACADE_BRIDGE_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub bind: BindMode,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    pub handshake_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
    pub event_queue_capacity: usize,
    pub verbose: bool,
    pub json_logs: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind: BindMode::Loopback,
            port: 0,
            secret: None,
            handshake_timeout_ms: 10_000,
            shutdown_grace_ms: 5_000,
            event_queue_capacity: events::DEFAULT_CAPACITY,
            verbose: false,
            json_logs: false,
        }
    }
}

impl AppConfig {
    /// Load the effective configuration. `config_file` overrides the default
    /// file name and must exist; `overrides` holds CLI flags, with unset
    /// flags skipped during serialization.
    pub fn new<T: Serialize>(
        config_file: Option<&Path>,
        overrides: Option<&T>,
    ) -> anyhow::Result<Self> {
        if let Some(path) = config_file {
            if !path.is_file() {
                bail!("Config file {} does not exist", path.display());
            }
        }

        let config: Self = Self::figment(config_file, overrides)
            .extract()
            .context("Invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn figment<T: Serialize>(config_file: Option<&Path>, overrides: Option<&T>) -> Figment {
        let file = config_file
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        let figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX));

        match overrides {
            Some(overrides) => figment.merge(Serialized::defaults(overrides)),
            None => figment,
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.event_queue_capacity == 0 {
            bail!("event_queue_capacity must be at least 1");
        }
        if self.handshake_timeout_ms == 0 {
            bail!("handshake_timeout_ms must be at least 1");
        }
        if self.secret.as_deref().is_some_and(str::is_empty) {
            bail!("secret must not be empty");
        }
        Ok(())
    }

    pub fn server_settings(&self) -> ServerSettings {
        ServerSettings {
            port: self.port,
            secret: self.secret.clone(),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
            event_queue_capacity: self.event_queue_capacity,
        }
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            json: self.json_logs,
            verbose: self.verbose,
        }
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        toml::to_string_pretty(self).context("Failed to render configuration")
    }
}
