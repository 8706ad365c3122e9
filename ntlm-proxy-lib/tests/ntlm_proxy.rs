#![forbid(unsafe_code)]

#[allow(dead_code)]
mod helpers;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use std::time::Duration;

use helpers::{
    configure_ntlm_host, direct_client, proxied_client, spawn_negotiate_server, spawn_ntlm_server, spawn_open_server,
    spawn_refusing_server, spawn_tls_ntlm_server, spawn_upstream_proxy, start_core, start_core_with_options, tmp_path,
    ScriptedSso, TestResult,
};
use ntlm_proxy_lib::auth::{SecurityPackage, SsoFacadeFactory};
use reqwest::StatusCode;
use tokio::net::TcpListener;

async fn enable_sso(core: &ntlm_proxy_lib::CoreServer, host: &str) -> TestResult<()> {
    let res = direct_client()?
        .post(format!("{}/ntlm-sso", core.config_api_url()))
        .json(&serde_json::json!({ "ntlmHosts": [host] }))
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn unconfigured_host_gets_the_challenge_passed_through() -> TestResult<()> {
    let (target, handshakes) = spawn_ntlm_server().await?;
    let core = start_core(None).await?;
    let client = proxied_client(&core)?;

    let res = client.get(format!("http://{target}/secure")).send().await?;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(res.headers().get("www-authenticate").and_then(|v| v.to_str().ok()), Some("NTLM"));
    assert_eq!(handshakes.load(Ordering::SeqCst), 0);

    core.stop(false).await?;
    Ok(())
}

#[tokio::test]
async fn configured_host_is_authenticated_and_body_replayed() -> TestResult<()> {
    let (target, handshakes) = spawn_ntlm_server().await?;
    let core = start_core(None).await?;
    let res = configure_ntlm_host(&core, &target.to_string()).await?;
    assert_eq!(res.status(), StatusCode::OK);

    let client = proxied_client(&core)?;
    let res = client.post(format!("http://{target}/secure")).body("hello").send().await?;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await?, "POST /secure hello");
    assert_eq!(handshakes.load(Ordering::SeqCst), 1);

    // the authenticated upstream connection is reused
    let res = client.get(format!("http://{target}/again")).send().await?;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await?, "GET /again ");
    assert_eq!(handshakes.load(Ordering::SeqCst), 1);

    core.stop(false).await?;
    Ok(())
}

#[tokio::test]
async fn reset_forgets_credentials() -> TestResult<()> {
    let (target, handshakes) = spawn_ntlm_server().await?;
    let core = start_core(None).await?;
    configure_ntlm_host(&core, &target.to_string()).await?;

    let res = proxied_client(&core)?.get(format!("http://{target}/")).send().await?;
    assert_eq!(res.status(), StatusCode::OK);

    let res = direct_client()?.post(format!("{}/reset", core.config_api_url())).send().await?;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(core.contexts().context_count(), 0);

    let res = proxied_client(&core)?.get(format!("http://{target}/")).send().await?;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    configure_ntlm_host(&core, &target.to_string()).await?;
    let res = proxied_client(&core)?.get(format!("http://{target}/")).send().await?;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(handshakes.load(Ordering::SeqCst), 2);

    core.stop(false).await?;
    Ok(())
}

#[tokio::test]
async fn host_header_pointing_at_the_proxy_is_rejected() -> TestResult<()> {
    let core = start_core(None).await?;

    let res = direct_client()?.get(format!("{}/loop", core.ntlm_proxy_url())).send().await?;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert!(res.text().await?.contains("refers to this proxy"));

    core.stop(false).await?;
    Ok(())
}

#[tokio::test]
async fn config_api_is_reachable_through_the_proxy() -> TestResult<()> {
    let core = start_core(None).await?;

    let res = proxied_client(&core)?.get(format!("{}/alive", core.config_api_url())).send().await?;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await?, "OK");

    core.stop(false).await?;
    Ok(())
}

#[tokio::test]
async fn sso_host_is_authenticated_with_negotiate() -> TestResult<()> {
    let target = spawn_negotiate_server().await?;
    let sso = Arc::new(ScriptedSso::default());
    let factory: Arc<dyn SsoFacadeFactory> = sso.clone();
    let core = start_core(Some(factory)).await?;
    enable_sso(&core, "127.0.0.1").await?;

    let client = proxied_client(&core)?;
    let res = client.post(format!("http://127.0.0.1:{}/sso", target.port())).body("payload").send().await?;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await?, "POST /sso payload");
    assert_eq!(sso.created.load(Ordering::SeqCst), 1);

    let res = client.get(format!("http://127.0.0.1:{}/next", target.port())).send().await?;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(sso.created.load(Ordering::SeqCst), 1);

    core.stop(false).await?;
    Ok(())
}

#[tokio::test]
async fn sso_falls_back_to_ntlm_package_when_negotiate_is_not_offered() -> TestResult<()> {
    let (target, handshakes) = spawn_ntlm_server().await?;
    let sso = Arc::new(ScriptedSso::default());
    let factory: Arc<dyn SsoFacadeFactory> = sso.clone();
    let core = start_core(Some(factory)).await?;
    enable_sso(&core, "127.0.0.1").await?;

    let client = proxied_client(&core)?;
    let res = client.post(format!("http://127.0.0.1:{}/sso", target.port())).body("payload").send().await?;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await?, "POST /sso payload");
    assert_eq!(handshakes.load(Ordering::SeqCst), 1);
    assert_eq!(sso.packages(), vec![(SecurityPackage::Negotiate, false), (SecurityPackage::Ntlm, false)]);

    let res = client.get(format!("http://127.0.0.1:{}/next", target.port())).send().await?;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(sso.created.load(Ordering::SeqCst), 2);

    core.stop(false).await?;
    Ok(())
}

#[tokio::test]
async fn credential_update_forces_a_new_handshake() -> TestResult<()> {
    let (target, handshakes) = spawn_ntlm_server().await?;
    let core = start_core(None).await?;
    configure_ntlm_host(&core, "127.0.0.1").await?;

    let client = proxied_client(&core)?;
    let res = client.get(format!("http://{target}/one")).send().await?;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(handshakes.load(Ordering::SeqCst), 1);

    let res = configure_ntlm_host(&core, "127.0.0.1").await?;
    assert_eq!(res.status(), StatusCode::OK);

    let res = client.get(format!("http://{target}/two")).send().await?;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await?, "GET /two ");
    assert_eq!(handshakes.load(Ordering::SeqCst), 2);

    core.stop(false).await?;
    Ok(())
}

#[tokio::test]
async fn server_challenge_on_authenticated_connection_renews_the_handshake() -> TestResult<()> {
    let (target, handshakes) = spawn_ntlm_server().await?;
    let core = start_core(None).await?;
    configure_ntlm_host(&core, &target.to_string()).await?;

    let client = proxied_client(&core)?;
    let res = client.get(format!("http://{target}/first")).send().await?;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(handshakes.load(Ordering::SeqCst), 1);

    // the target drops the authentication and challenges again
    let res = client.get(format!("http://{target}/logout")).send().await?;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await?, "GET /logout ");
    assert_eq!(handshakes.load(Ordering::SeqCst), 2);

    core.stop(false).await?;
    Ok(())
}

#[tokio::test]
async fn configured_host_without_ntlm_is_passed_through() -> TestResult<()> {
    let target = spawn_open_server().await?;
    let core = start_core(None).await?;
    configure_ntlm_host(&core, &target.to_string()).await?;

    let res = proxied_client(&core)?.post(format!("http://{target}/open")).body("data").send().await?;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await?, "POST /open data");

    core.stop(false).await?;
    Ok(())
}

#[tokio::test]
async fn https_host_is_intercepted_and_authenticated() -> TestResult<()> {
    let (target, handshakes) = spawn_tls_ntlm_server().await?;
    let core = start_core(None).await?;
    configure_ntlm_host(&core, &format!("localhost:{}", target.port())).await?;

    let client = reqwest::Client::builder()
        .proxy(reqwest::Proxy::all(core.ntlm_proxy_url())?)
        .add_root_certificate(reqwest::Certificate::from_der(core.ca_certificate().as_ref())?)
        .timeout(Duration::from_secs(10))
        .build()?;
    let res = client.post(format!("https://localhost:{}/secure", target.port())).body("hello").send().await?;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await?, "POST /secure hello");
    assert_eq!(handshakes.load(Ordering::SeqCst), 1);

    core.stop(false).await?;
    Ok(())
}

#[tokio::test]
async fn requests_are_relayed_through_the_upstream_proxy() -> TestResult<()> {
    let (upstream, relayed) = spawn_upstream_proxy().await?;
    let core = start_core_with_options(tmp_path("ports.json"), |options| {
        options.http_proxy = Some(format!("http://{upstream}"));
        options.no_proxy = Some("<-loopback>".into());
    })
    .await?;

    let res = proxied_client(&core)?.get("http://127.0.0.1:9/relayed").send().await?;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await?, "via upstream http://127.0.0.1:9/relayed");
    assert_eq!(relayed.load(Ordering::SeqCst), 1);

    core.stop(false).await?;
    Ok(())
}

#[tokio::test]
async fn unreachable_upstream_proxy_is_a_gateway_timeout() -> TestResult<()> {
    let closed = TcpListener::bind("127.0.0.1:0").await?.local_addr()?;
    let core = start_core_with_options(tmp_path("ports.json"), |options| {
        options.http_proxy = Some(format!("http://{closed}"));
        options.no_proxy = Some("<-loopback>".into());
    })
    .await?;

    let res = proxied_client(&core)?.get("http://127.0.0.1:9/relayed").send().await?;
    assert_eq!(res.status(), StatusCode::GATEWAY_TIMEOUT);

    core.stop(false).await?;
    Ok(())
}

#[tokio::test]
async fn refused_websocket_upgrade_keeps_the_whole_body() -> TestResult<()> {
    let len = 256 * 1024;
    let target = spawn_refusing_server(len).await?;
    let core = start_core(None).await?;

    let res = proxied_client(&core)?
        .get(format!("http://{target}/socket"))
        .header("connection", "Upgrade")
        .header("upgrade", "websocket")
        .header("sec-websocket-version", "13")
        .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
    assert_eq!(res.bytes().await?.len(), len);

    core.stop(false).await?;
    Ok(())
}
