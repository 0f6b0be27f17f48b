// Shared scaffolding for the integration suites under tests/integration/.
// Included via `#[path = "support.rs"] mod support;` in each test binary
// (Cargo treats every [[test]] target as its own crate, so there is no
// single shared test-lib to put this in).

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde_json::Value;
use sessiond::app_state::AppState;
use test_support::MockWsClient;

/// A running `sessiond` instance bound to a random local port, for the
/// lifetime of the owning test.
pub struct TestServer {
    pub state: AppState,
    pub addr: SocketAddr,
    _task: tokio::task::JoinHandle<()>,
}

impl TestServer {
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub async fn connect(&self) -> MockWsClient {
        MockWsClient::connect(&self.ws_url()).await.expect("client connects")
    }
}

/// Writes a minimal `setup.json` under `dir` pointing the encoder/bonder
/// at `/bin/true` (a real, instantly-exiting executable, so the process
/// runner's supervise loop has something harmless to spawn) and a
/// `generic/` pipeline directory containing one file.
///
/// Returns the setup path plus the discoverable pipeline id for the file
/// it created.
pub fn write_setup(dir: &Path) -> (std::path::PathBuf, String) {
    let pipeline_root = dir.join("pipelines");
    std::fs::create_dir_all(pipeline_root.join("generic")).unwrap();
    std::fs::write(pipeline_root.join("generic/low_latency.conf"), b"").unwrap();
    let pipeline_id = sessiond::pipelines::pipeline_id("generic", "low_latency.conf");

    let setup_path = dir.join("setup.json");
    std::fs::write(
        &setup_path,
        format!(
            r#"{{
                "platform": "generic",
                "encoder_path": "/bin/true",
                "bonder_path": "/bin/true",
                "pipeline_root": "{}",
                "bitrate_file": "{}",
                "uplinks_file": "{}",
                "upgrades_enabled": false
            }}"#,
            pipeline_root.display(),
            dir.join("bitrate").display(),
            dir.join("uplinks").display(),
        ),
    )
    .unwrap();

    (setup_path, pipeline_id)
}

/// Boots an `AppState` from a fresh temp directory (no password
/// configured) and serves it over a random local port. The pollers in
/// `main` are intentionally not started — tests that need interface or
/// Wi-Fi state seed it directly through the `AppState` handle.
pub async fn start_server(dir: &Path) -> TestServer {
    let (setup_path, _pipeline_id) = write_setup(dir);
    start_server_with_setup(dir, &setup_path).await
}

pub async fn start_server_with_setup(dir: &Path, setup_path: &Path) -> TestServer {
    let state = AppState::load(
        setup_path,
        dir.join("config.json"),
        dir.join("tokens.json"),
    )
    .expect("app state loads");

    let router = sessiond::ui_server::build_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    TestServer {
        state,
        addr,
        _task: task,
    }
}

/// Pre-populates `config.json` in `dir` with a password hash for
/// `password`, so a test can skip the first-run `config:{password}` step
/// and authenticate directly.
pub fn seed_password(dir: &Path, password: &str) {
    let path = dir.join("config.json");
    let mut config = sessiond::config::Config::load_or_default(&path).unwrap();
    config.password_hash = Some(sessiond::auth::hash_password(password).unwrap());
    config.save(&path).unwrap();
}

/// Authenticates `client` with `password` (non-persistent token) and
/// drains the initial-state frames that follow a successful auth
/// (status, config, pipelines, netif, wifi, revisions), returning the
/// auth reply itself.
pub async fn auth_and_drain_initial(client: &mut MockWsClient, password: &str) -> Value {
    client
        .send_json(&serde_json::json!({"auth": {"password": password}}))
        .await
        .unwrap();
    let auth_reply = client.recv_json().await.unwrap();
    for _ in 0..6 {
        client.recv_json().await.unwrap();
    }
    auth_reply
}

/// Receives frames until `pred` matches one, or `timeout` elapses.
/// Panics on timeout so a failing assertion points at the right test.
pub async fn recv_matching<F>(client: &mut MockWsClient, timeout: Duration, pred: F) -> Value
where
    F: Fn(&Value) -> bool,
{
    tokio::time::timeout(timeout, async {
        loop {
            let value = client.recv_json().await.expect("connection stays open");
            if pred(&value) {
                return value;
            }
        }
    })
    .await
    .expect("expected frame did not arrive in time")
}

/// Seeds a single enabled interface directly into `state`, bypassing the
/// sysfs poller (which integration tests don't run).
pub async fn seed_interface(state: &AppState, name: &str, ip: &str, tx_bytes: u64) {
    state.interfaces.write().await.apply_poll(vec![sessiond::netif::RawIfaceRead {
        name: name.to_owned(),
        ipv4: Some(ip.parse().unwrap()),
        tx_bytes,
    }]);
}
