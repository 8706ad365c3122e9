use std::net::SocketAddr;
use std::path::PathBuf;

use serde::Deserialize;

use crate::proxy::https_validation::HttpsValidationLevel;

/// Top-level proxy configuration, read from a TOML file
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Address of the NTLM proxy listener.
    /// Port 0 picks any free port.
    /// Default: "127.0.0.1:0"
    #[serde(default = "default_listen")]
    pub proxy_listen: SocketAddr,
    /// Address of the control API listener.
    /// Default: "127.0.0.1:0"
    #[serde(default = "default_listen")]
    pub config_api_listen: SocketAddr,
    /// Leave an already running instance alone instead of asking it to quit.
    /// Default: false
    #[serde(default)]
    pub allow_multiple_instances: bool,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub ports_file: PortsFileConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proxy_listen: default_listen(),
            config_api_listen: default_listen(),
            allow_multiple_instances: false,
            upstream: UpstreamConfig::default(),
            tls: TlsConfig::default(),
            logging: LoggingConfig::default(),
            ports_file: PortsFileConfig::default(),
        }
    }
}

/// Corporate proxy that outbound traffic is relayed through
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    /// Complete URL with port, e.g. "http://proxy.acme.com:8080"
    #[serde(default)]
    pub http_proxy: Option<String>,
    /// Used for HTTPS targets; falls back to `http_proxy` when absent
    #[serde(default)]
    pub https_proxy: Option<String>,
    /// Comma separated hosts that bypass the upstream proxy.
    /// Wildcards, ports and IPv6 literals are accepted.
    #[serde(default)]
    pub no_proxy: Option<String>,
}

/// Certificate checks on HTTPS targets
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    /// Side-channel validation of target certificates: "strict", "warn" or "unsafe"
    /// Default: "warn"
    #[serde(default)]
    pub https_validation: HttpsValidationLevel,
    /// Verify target certificates on outbound connections. Loopback targets
    /// are never verified. `false` also turns validation to "unsafe".
    /// Default: true
    #[serde(default = "default_true")]
    pub reject_unauthorized: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self { https_validation: HttpsValidationLevel::default(), reject_unauthorized: true }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error"
    /// Can be overridden at runtime via RUST_LOG environment variable
    /// Default: "info"
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Show module path (target) in log messages
    /// Default: false
    #[serde(default)]
    pub show_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level(), show_target: false }
    }
}

/// Where the running proxy advertises its URLs
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct PortsFileConfig {
    /// Default: true
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Default: the per-user data directory
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Default for PortsFileConfig {
    fn default() -> Self {
        Self { enabled: true, path: None }
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}
