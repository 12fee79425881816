//! Command line and environment configuration

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use warden_common::reconcile::{Settings, DEFAULT_REGISTRY};
use warden_common::render::proxy_from_env;
use warden_common::retry::RetryConfig;
use warden_common::telemetry::{LogFormat, TelemetryConfig};
use warden_tracker::TrackerConfig;

/// Warden - installs and keeps Warden security sensors up to date
#[derive(Parser, Debug)]
#[command(name = "warden-operator", version, about, long_about = None)]
pub struct Cli {
    /// Base URL of the sensor release catalog
    #[arg(long, env = "WARDEN_CATALOG_URL")]
    pub catalog_url: Option<String>,

    /// File holding the bearer token for the catalog
    #[arg(long, env = "WARDEN_CATALOG_TOKEN_FILE")]
    pub catalog_token_file: Option<PathBuf>,

    /// Registry sensor images are pulled from
    #[arg(long, env = "WARDEN_REGISTRY", default_value = DEFAULT_REGISTRY)]
    pub registry: String,

    /// Seconds between catalog polls of the version tracker
    #[arg(long, default_value_t = 900)]
    pub tracker_interval_secs: u64,

    /// Seconds before a failed version tracker restarts
    #[arg(long, default_value_t = 60)]
    pub tracker_restart_secs: u64,

    /// Seconds between node cleanup completion checks
    #[arg(long, default_value_t = 5)]
    pub cleanup_poll_secs: u64,

    /// Seconds before an installed sensor is reconciled again
    #[arg(long, default_value_t = 600)]
    pub resync_interval_secs: u64,

    /// Attempts for status and finalizer writes that hit conflicts
    #[arg(long, default_value_t = 5)]
    pub status_retries: u32,

    /// Reconciliations running at once, per controller
    #[arg(long, default_value_t = 4)]
    pub concurrency: u16,

    /// Log output: json or text
    #[arg(long, default_value = "json")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Print the CRDs as YAML and exit
    Crd,
    /// Run the controllers (default)
    Run,
}

impl Cli {
    /// Settings shared by both controllers
    pub fn settings(&self) -> Settings {
        Settings {
            registry: self.registry.trim_end_matches('/').to_string(),
            status_retry: RetryConfig::conflicts(self.status_retries),
            resync_interval: Duration::from_secs(self.resync_interval_secs),
            cleanup_poll_interval: Duration::from_secs(self.cleanup_poll_secs),
            proxy_env: proxy_from_env(),
        }
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            interval: Duration::from_secs(self.tracker_interval_secs),
            restart_delay: Duration::from_secs(self.tracker_restart_secs),
        }
    }

    pub fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            service_name: "warden-operator".to_string(),
            format: self.log_format,
            filter: None,
        }
    }
}
