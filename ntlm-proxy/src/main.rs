#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::builder::BoolishValueParser;
use clap::Parser;
use ntlm_proxy_lib::config::{load_from_path, validate_config};
use ntlm_proxy_lib::telemetry::init_tracing;
use ntlm_proxy_lib::{Config, CoreOptions, CoreServer, HttpsValidationLevel};
use tokio::signal;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Transparent NTLM/Negotiate authentication proxy for end-to-end test runners")]
struct Cli {
    /// Path to configuration TOML file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Upstream proxy for HTTP targets
    #[arg(long, env = "HTTP_PROXY", value_name = "URL")]
    http_proxy: Option<String>,

    /// Upstream proxy for HTTPS targets
    #[arg(long, env = "HTTPS_PROXY", value_name = "URL")]
    https_proxy: Option<String>,

    /// Hosts that bypass the upstream proxy
    #[arg(long, env = "NO_PROXY", value_name = "LIST")]
    no_proxy: Option<String>,

    /// Side-channel validation of target certificates: strict, warn or unsafe
    #[arg(long, env = "HTTPS_VALIDATION", value_name = "LEVEL")]
    https_validation: Option<String>,

    /// Set to false to accept any target certificate
    #[arg(long, env = "TLS_REJECT_UNAUTHORIZED", value_name = "BOOL", value_parser = BoolishValueParser::new())]
    tls_reject_unauthorized: Option<bool>,

    /// Port of the NTLM proxy listener
    #[arg(long, value_name = "PORT")]
    proxy_port: Option<u16>,

    /// Port of the control API listener
    #[arg(long, value_name = "PORT")]
    config_api_port: Option<u16>,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(v) = &self.http_proxy {
            config.upstream.http_proxy = Some(v.clone());
        }
        if let Some(v) = &self.https_proxy {
            config.upstream.https_proxy = Some(v.clone());
        }
        if let Some(v) = &self.no_proxy {
            config.upstream.no_proxy = Some(v.clone());
        }
        if let Some(level) = &self.https_validation {
            config.tls.https_validation = level.parse().unwrap_or_else(|err| {
                eprintln!("{err}. Applying default value \"warn\"");
                HttpsValidationLevel::Warn
            });
        }
        if let Some(reject) = self.tls_reject_unauthorized {
            config.tls.reject_unauthorized = reject;
        }
        if let Some(port) = self.proxy_port {
            config.proxy_listen = SocketAddr::new(config.proxy_listen.ip(), port);
        }
        if let Some(port) = self.config_api_port {
            config.config_api_listen = SocketAddr::new(config.config_api_listen.ip(), port);
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => match load_from_path(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                eprintln!("failed to load configuration: {err}");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };
    cli.apply(&mut config);

    if let Err(err) = init_tracing(&config.logging.level, config.logging.show_target) {
        eprintln!("failed to initialise logging: {err}");
        std::process::exit(1);
    }
    if let Err(err) = validate_config(&config) {
        error!(%err, "invalid configuration");
        std::process::exit(1);
    }

    let mut core = match CoreServer::start(CoreOptions::from_config(&config)).await {
        Ok(core) => core,
        Err(err) => {
            error!(%err, "failed to start NTLM auth proxy");
            std::process::exit(1);
        }
    };

    let keep_ports_file = tokio::select! {
        keep = core.wait_for_quit() => keep,
        _ = signal::ctrl_c() => {
            info!("Received interrupt, initiating shutdown");
            false
        }
    };

    if let Err(err) = core.stop(keep_ports_file).await {
        error!(%err, "error during shutdown");
        std::process::exit(1);
    }
}
