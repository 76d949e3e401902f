//! Infrastructure configuration - things that cannot change at runtime.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Filesystem paths used by the device service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Parent directory for per-session working directories.
    /// Default: <system temp>/score_following
    pub work_dir: PathBuf,
}

impl PathsConfig {
    fn default_work_dir() -> PathBuf {
        std::env::temp_dir().join("score_following")
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            work_dir: Self::default_work_dir(),
        }
    }
}

/// Network bind address for the HTTP/WebSocket listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BindConfig {
    /// Interface to bind.
    /// Default: 0.0.0.0
    pub host: String,

    /// HTTP port for device listing and session sockets.
    /// Default: 8201
    pub http_port: u16,
}

impl BindConfig {
    fn default_host() -> String {
        "0.0.0.0".to_string()
    }

    fn default_http_port() -> u16 {
        8201
    }

    /// `host:port` string suitable for a socket address.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.http_port)
    }
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            http_port: Self::default_http_port(),
        }
    }
}

/// Telemetry and observability configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// OTLP gRPC endpoint for OpenTelemetry. Unset means console logging only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub otlp_endpoint: Option<String>,

    /// Log filter directive (trace, debug, info, warn, error, or an EnvFilter string).
    /// Default: info
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            otlp_endpoint: None,
            log_level: Self::default_log_level(),
        }
    }
}

/// The cloud service that stores scores and performance recordings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    /// Base URL of the cloud file service.
    /// Default: http://localhost:8101
    pub base_url: String,

    /// Per-request timeout in milliseconds.
    /// Default: 30000
    pub timeout_ms: u64,
}

impl CloudConfig {
    fn default_base_url() -> String {
        "http://localhost:8101".to_string()
    }

    fn default_timeout_ms() -> u64 {
        30_000
    }
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            base_url: Self::default_base_url(),
            timeout_ms: Self::default_timeout_ms(),
        }
    }
}

/// Cross-origin settings for the browser frontend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    /// Allowed origins. `"*"` allows any origin.
    pub allowed_origins: Vec<String>,
}

impl CorsConfig {
    /// True when any origin is allowed.
    pub fn allows_any(&self) -> bool {
        self.allowed_origins.iter().any(|o| o == "*")
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_string()],
        }
    }
}

/// Infrastructure configuration - cannot change at runtime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InfraConfig {
    pub paths: PathsConfig,
    pub bind: BindConfig,
    pub telemetry: TelemetryConfig,
    pub cloud: CloudConfig,
    pub cors: CorsConfig,
}
