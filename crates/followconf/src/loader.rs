//! Config file discovery, loading, and environment variable overlay.

use crate::{ConfigError, FollowConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
/// Returns paths in load order (system, user, local/cli). Only existing files
/// are returned.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/scorefollow/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("scorefollow/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("scorefollow.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Read a TOML file as a raw table.
pub fn load_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    contents
        .parse()
        .map_err(|e: toml::de::Error| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Merge `overlay` into `base`, recursing into nested tables. Scalars and
/// arrays in `overlay` replace those in `base`.
pub fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Deserialize a merged table. Missing keys take compiled defaults.
pub fn from_table(table: toml::Table, origin: Option<&PathBuf>) -> Result<FollowConfig, ConfigError> {
    let mut config: FollowConfig =
        toml::Value::Table(table)
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Parse {
                path: origin.cloned().unwrap_or_default(),
                message: e.to_string(),
            })?;

    config.infra.paths.work_dir = expand_path(&config.infra.paths.work_dir.to_string_lossy());
    Ok(config)
}

/// Apply environment variable overrides from the process environment.
pub fn apply_env_overrides(config: &mut FollowConfig, sources: &mut ConfigSources) {
    apply_env_overrides_from(config, sources, env::vars());
}

/// Apply overrides from an explicit variable list.
///
/// Values that fail to parse are skipped and not recorded in `sources`.
pub fn apply_env_overrides_from<I>(config: &mut FollowConfig, sources: &mut ConfigSources, vars: I)
where
    I: IntoIterator<Item = (String, String)>,
{
    for (key, value) in vars {
        let applied = match key.as_str() {
            "SCOREFOLLOW_HTTP_PORT" => match value.parse() {
                Ok(port) => {
                    config.infra.bind.http_port = port;
                    true
                }
                Err(_) => false,
            },
            "SCOREFOLLOW_HOST" => {
                config.infra.bind.host = value;
                true
            }
            "SCOREFOLLOW_WORK_DIR" => {
                config.infra.paths.work_dir = expand_path(&value);
                true
            }
            "SCOREFOLLOW_LOG_LEVEL" | "RUST_LOG" => {
                config.infra.telemetry.log_level = value;
                true
            }
            "SCOREFOLLOW_OTLP_ENDPOINT" | "OTEL_EXPORTER_OTLP_ENDPOINT" => {
                config.infra.telemetry.otlp_endpoint = Some(value);
                true
            }
            // NEXT_CLOUD_BACKEND_URL is shared with the web frontend's build
            "SCOREFOLLOW_CLOUD_URL" | "NEXT_CLOUD_BACKEND_URL" => {
                config.infra.cloud.base_url = value;
                true
            }
            _ => false,
        };

        if applied {
            sources.env_overrides.push(key);
        }
    }
}

/// Expand ~ and environment variables in a path.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            return home.join(stripped);
        }
        return PathBuf::from(path);
    }

    if let Some(stripped) = path.strip_prefix('$') {
        return match stripped.split_once('/') {
            Some((var_name, rest)) => env::var(var_name)
                .map(|v| PathBuf::from(v).join(rest))
                .unwrap_or_else(|_| PathBuf::from(path)),
            None => env::var(stripped)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(path)),
        };
    }

    PathBuf::from(path)
}
