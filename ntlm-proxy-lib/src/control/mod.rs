//! The control API a test runner uses to configure the proxy, plus the ports
//! file that advertises where it listens.

pub mod ports;
pub mod server;
pub mod validator;

pub use ports::{PortsConfigStore, PortsFile, PortsFileService};
pub use server::{ControlApi, ControlServer};
pub use validator::ValidationError;

/// Published by the control API after a request has been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// Credentials were stored for this host pattern.
    ConfigUpdated(String),
    Reset,
    Quit { keep_ports_file: bool },
}
