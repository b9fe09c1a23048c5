//! Engine binary configuration

use anyhow::{Context, Result};
use engine_lib::config::EngineConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable naming an optional configuration file
pub const CONFIG_PATH_ENV: &str = "RECON_CONFIG";

/// Binary configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Instance name attached to structured events
    #[serde(default = "default_instance")]
    pub instance: String,

    /// API server port for health/status/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Interval between engine report log lines
    #[serde(default = "default_report_interval")]
    pub report_interval_secs: u64,

    /// Hostnames to resolve and probe
    #[serde(default)]
    pub targets: Vec<String>,

    /// Ports probed on every target
    #[serde(default = "default_ports")]
    pub ports: Vec<u16>,

    /// Append results here as JSON lines; kept in memory when unset
    #[serde(default)]
    pub results_path: Option<PathBuf>,

    #[serde(default)]
    pub engine: EngineConfig,
}

fn default_instance() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "recon-engine".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_report_interval() -> u64 {
    60
}

fn default_ports() -> Vec<u16> {
    vec![22, 80, 443]
}

impl AppConfig {
    /// Load from the file named by `RECON_CONFIG` (if any) and `RECON__*` variables
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from);
        Self::load_from(path.as_deref())
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix("RECON")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("targets")
                    .with_list_parse_key("ports"),
            )
            .build()
            .context("Failed to read configuration")?;

        let app: AppConfig = config
            .try_deserialize()
            .context("Failed to parse configuration")?;
        app.engine.validate().context("Invalid engine configuration")?;
        Ok(app)
    }
}
