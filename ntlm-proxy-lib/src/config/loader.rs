use std::fs;
use std::path::Path;

use crate::config::Config;
use crate::error::{ProxyError, Result};
use crate::upstream::parse_proxy_url;

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error", "off"];

pub fn load_from_path<P: AsRef<Path>>(p: P) -> Result<Config> {
    let txt = fs::read_to_string(p).map_err(|e| ProxyError::Config(format!("Failed to read config file: {e}")))?;
    let cfg: Config =
        toml::from_str(&txt).map_err(|e| ProxyError::Config(format!("Failed to parse config: {e}")))?;

    validate_config(&cfg)?;

    Ok(cfg)
}

pub fn validate_config(cfg: &Config) -> Result<()> {
    if !LOG_LEVELS.contains(&cfg.logging.level.to_ascii_lowercase().as_str()) {
        return Err(ProxyError::Config(format!("Unknown log level: {}", cfg.logging.level)));
    }

    if let Some(http_proxy) = cfg.upstream.http_proxy.as_deref().filter(|v| !v.trim().is_empty()) {
        parse_proxy_url(http_proxy.trim(), "HTTP_PROXY")?;
    }
    if let Some(https_proxy) = cfg.upstream.https_proxy.as_deref().filter(|v| !v.trim().is_empty()) {
        parse_proxy_url(https_proxy.trim(), "HTTPS_PROXY")?;
    }

    if cfg.ports_file.path.as_ref().is_some_and(|p| p.as_os_str().is_empty()) {
        return Err(ProxyError::Config("ports_file.path cannot be empty".into()));
    }

    if cfg.proxy_listen.port() != 0 && cfg.proxy_listen == cfg.config_api_listen {
        return Err(ProxyError::Config(format!(
            "proxy_listen and config_api_listen cannot both be {}",
            cfg.proxy_listen
        )));
    }

    Ok(())
}
