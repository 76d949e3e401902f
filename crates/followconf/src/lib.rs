//! Configuration loading for the scorefollow device service.
//!
//! Configuration is split into two categories:
//!
//! - **Infrastructure** (`InfraConfig`): bind address, paths, telemetry,
//!   the cloud file service and CORS. Fixed for the life of the process.
//!
//! - **Tuning** (`TuningConfig`): timing and signal-processing constants
//!   handed to each live session when it starts.
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/scorefollow/config.toml` (system)
//! 2. `~/.config/scorefollow/config.toml` (user)
//! 3. `./scorefollow.toml` (local override, replaced by `--config`)
//! 4. Environment variables (`SCOREFOLLOW_*`)
//!
//! # Example Config
//!
//! ```toml
//! [bind]
//! http_port = 8201
//!
//! [cloud]
//! base_url = "http://cloud.internal:8101"
//!
//! [session]
//! broadcast_interval_ms = 100
//! position_epsilon = 0.001
//!
//! [tuner]
//! frame_size = 1024
//! silence_threshold = 0.01
//! ```

pub mod infra;
pub mod loader;
pub mod tuning;

pub use infra::{BindConfig, CloudConfig, CorsConfig, InfraConfig, PathsConfig, TelemetryConfig};
pub use loader::{discover_config_files_with_override, ConfigSources};
pub use tuning::{SessionConfig, TunerConfig, TuningConfig};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Complete service configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FollowConfig {
    /// Infrastructure - cannot change at runtime.
    #[serde(flatten)]
    pub infra: InfraConfig,

    /// Per-session tuning.
    #[serde(flatten)]
    pub tuning: TuningConfig,
}

impl FollowConfig {
    /// Load configuration from all sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration with an explicit file replacing `./scorefollow.toml`.
    pub fn load_from(config_path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration from optional path and return information about sources.
    pub fn load_with_sources_from(
        config_path: Option<&std::path::Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut merged = toml::Table::new();

        for path in loader::discover_config_files_with_override(config_path) {
            let table = loader::load_table(&path)?;
            loader::merge_tables(&mut merged, table);
            sources.files.push(path);
        }

        let mut config = loader::from_table(merged, sources.files.last())?;
        loader::apply_env_overrides(&mut config, &mut sources);

        Ok((config, sources))
    }

    /// Serialize config to a TOML string.
    pub fn to_toml(&self) -> String {
        let mut output = String::from("# scorefollow configuration\n\n");
        match toml::to_string_pretty(self) {
            Ok(body) => output.push_str(&body),
            Err(e) => output.push_str(&format!("# failed to render config: {}\n", e)),
        }
        output
    }
}
