//! Discovery file that lets another process find a running proxy, and the
//! in-memory record of the proxy's own listener URLs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::error::{ProxyError, Result};
use crate::upstream::has_explicit_port;

const APP_DIR: &str = "cypress-ntlm-auth";
const FILE_NAME: &str = "cypress-ntlm-auth.port";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortsFile {
    pub config_api_url: String,
    pub ntlm_proxy_url: String,
}

/// Listener URLs of the running proxy.
#[derive(Debug, Default)]
pub struct PortsConfigStore {
    config_api_url: ArcSwapOption<Url>,
    ntlm_proxy_url: ArcSwapOption<Url>,
}

impl PortsConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config_api_url(&self) -> Option<Arc<Url>> {
        self.config_api_url.load_full()
    }

    pub fn set_config_api_url(&self, url: Option<Url>) {
        self.config_api_url.store(url.map(Arc::new));
    }

    pub fn ntlm_proxy_url(&self) -> Option<Arc<Url>> {
        self.ntlm_proxy_url.load_full()
    }

    pub fn set_ntlm_proxy_url(&self, url: Option<Url>) {
        self.ntlm_proxy_url.store(url.map(Arc::new));
    }

    pub fn to_ports_file(&self) -> Option<PortsFile> {
        Some(PortsFile {
            config_api_url: url_origin(&*self.config_api_url()?),
            ntlm_proxy_url: url_origin(&*self.ntlm_proxy_url()?),
        })
    }
}

/// `scheme://host:port` without the trailing slash `Url` adds.
pub fn url_origin(url: &Url) -> String {
    url.as_str().trim_end_matches('/').to_string()
}

/// Per-user data directory: `$XDG_DATA_HOME`, `~/.local/share`, or
/// `%LOCALAPPDATA%` on Windows.
pub fn default_ports_file_path() -> PathBuf {
    let base = if cfg!(windows) {
        std::env::var_os("LOCALAPPDATA").map(PathBuf::from)
    } else {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".local").join("share")))
    };
    base.unwrap_or_else(std::env::temp_dir).join(APP_DIR).join(FILE_NAME)
}

#[derive(Debug, Clone)]
pub struct PortsFileService {
    path: PathBuf,
}

impl Default for PortsFileService {
    fn default() -> Self {
        Self::new(default_ports_file_path())
    }
}

impl PortsFileService {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn full_path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub async fn save(&self, ports: &PortsFile) -> Result<()> {
        validate_ports_file(ports, &self.path)?;
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| ProxyError::PortsFile(format!("Cannot create {}: {e}", dir.display())))?;
        }
        let json = serde_json::to_vec(ports).map_err(|e| ProxyError::PortsFile(e.to_string()))?;
        tokio::fs::write(&self.path, json)
            .await
            .map_err(|e| ProxyError::PortsFile(format!("Cannot write {}: {e}", self.path.display())))?;
        debug!(path = %self.path.display(), "ports file saved");
        Ok(())
    }

    pub async fn delete(&self) -> Result<()> {
        tokio::fs::remove_file(&self.path)
            .await
            .map_err(|e| ProxyError::PortsFile(format!("Cannot delete {}: {e}", self.path.display())))?;
        debug!(path = %self.path.display(), "ports file deleted");
        Ok(())
    }

    pub fn parse(&self) -> Result<PortsFile> {
        if !self.exists() {
            return Err(ProxyError::PortsFile(format!(
                "cypress-ntlm-auth proxy does not seem to be running. It must be started before cypress. \
                 Please see the docs.{}",
                self.path.display()
            )));
        }
        let data = std::fs::read_to_string(&self.path)
            .map_err(|e| ProxyError::PortsFile(format!("Cannot read {}: {e}", self.path.display())))?;
        let ports: PortsFile = serde_json::from_str(&data)
            .map_err(|_| ProxyError::PortsFile(format!("Cannot parse ports file {}", self.path.display())))?;
        validate_ports_file(&ports, &self.path)?;
        Ok(ports)
    }
}

fn is_complete_url(value: &str) -> bool {
    Url::parse(value).is_ok_and(|url| url.has_host() && !url.cannot_be_a_base()) && has_explicit_port(value)
}

fn validate_ports_file(ports: &PortsFile, path: &Path) -> Result<()> {
    if !is_complete_url(&ports.config_api_url) {
        return Err(ProxyError::PortsFile(format!("Invalid configApiUrl in ports file {}", path.display())));
    }
    if !is_complete_url(&ports.ntlm_proxy_url) {
        return Err(ProxyError::PortsFile(format!("Invalid ntlmProxyUrl in ports file {}", path.display())));
    }
    Ok(())
}
