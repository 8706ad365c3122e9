#![forbid(unsafe_code)]

pub mod auth;
pub mod config;
pub mod control;
pub mod core;
pub mod error;
pub mod ntlm;
pub mod proxy;
pub mod store;
pub mod target;
pub mod telemetry;
pub mod upstream;

pub use config::{load_from_path, Config};
pub use control::{ControlEvent, PortsFile, PortsFileService};
pub use self::core::{CoreOptions, CoreServer};
pub use error::{ProxyError, Result};
pub use proxy::https_validation::HttpsValidationLevel;
pub use store::{ConfigStore, HostCredential};
pub use target::TargetDescriptor;
pub use upstream::UpstreamProxyManager;
