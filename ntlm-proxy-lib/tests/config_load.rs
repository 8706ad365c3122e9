#![forbid(unsafe_code)]

use std::io::Write;

use ntlm_proxy_lib::config::load_from_path;
use ntlm_proxy_lib::{CoreOptions, HttpsValidationLevel};
use tempfile::NamedTempFile;

type TestResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

fn write_config(content: &str) -> TestResult<NamedTempFile> {
    let mut file = NamedTempFile::new()?;
    file.write_all(content.as_bytes())?;
    Ok(file)
}

#[test]
fn loads_full_config() -> TestResult<()> {
    let file = write_config(
        r#"
proxy_listen = "127.0.0.1:5000"
config_api_listen = "127.0.0.1:5001"
allow_multiple_instances = true

[upstream]
http_proxy = "http://proxy.acme.com:8080"
no_proxy = "*.acme.com, localhost"

[logging]
level = "debug"
show_target = true

[ports_file]
path = "/tmp/ntlm-proxy.port"

[tls]
https_validation = "strict"
reject_unauthorized = false
"#,
    )?;

    let cfg = load_from_path(file.path())?;
    assert_eq!(cfg.proxy_listen.port(), 5000);
    assert_eq!(cfg.config_api_listen.port(), 5001);
    assert!(cfg.allow_multiple_instances);
    assert_eq!(cfg.upstream.http_proxy.as_deref(), Some("http://proxy.acme.com:8080"));
    assert!(cfg.upstream.https_proxy.is_none());
    assert_eq!(cfg.logging.level, "debug");
    assert!(cfg.ports_file.enabled);

    let options = CoreOptions::from_config(&cfg);
    assert_eq!(options.no_proxy.as_deref(), Some("*.acme.com, localhost"));
    assert_eq!(options.https_validation, HttpsValidationLevel::Strict);
    assert!(!options.tls_reject_unauthorized);
    let ports_file = options.ports_file.ok_or("ports file should be enabled")?;
    assert_eq!(ports_file.full_path(), std::path::Path::new("/tmp/ntlm-proxy.port"));
    Ok(())
}

#[test]
fn disabled_ports_file_has_no_service() -> TestResult<()> {
    let file = write_config("[ports_file]\nenabled = false\n")?;
    let cfg = load_from_path(file.path())?;
    assert!(CoreOptions::from_config(&cfg).ports_file.is_none());
    Ok(())
}

#[test]
fn rejects_unknown_log_level() -> TestResult<()> {
    let file = write_config("[logging]\nlevel = \"loud\"\n")?;
    let err = load_from_path(file.path()).err().ok_or("expected an error")?;
    assert!(err.to_string().contains("Unknown log level"));
    Ok(())
}

#[test]
fn rejects_malformed_upstream_proxy() -> TestResult<()> {
    let file = write_config("[upstream]\nhttps_proxy = \"not a url\"\n")?;
    assert!(load_from_path(file.path()).is_err());
    Ok(())
}

#[test]
fn missing_file_is_a_config_error() {
    let err = load_from_path("/nonexistent/ntlm-proxy.toml").err();
    assert!(err.is_some_and(|e| e.to_string().contains("Failed to read config file")));
}
