//! End-to-end remote-tunnel key rejection (spec §8, scenario 6): a relay
//! that rejects the configured key produces exactly one
//! `{"status":{"remote":{"error":"key"}}}` broadcast, and the client does
//! not keep retrying against the same rejected key every second.

#[path = "support.rs"]
mod support;

use std::time::Duration;

use serde_json::json;
use test_support::MockRelayServer;

#[tokio::test]
async fn rejected_key_broadcasts_once_and_does_not_spin() {
    let dir = tempfile::tempdir().unwrap();
    support::seed_password(dir.path(), "hunter2x");
    let server = support::start_server(dir.path()).await;
    support::seed_interface(&server.state, "eth0", "10.0.0.5", 1000).await;
    server.state.config.write().await.remote_key = Some("bad-key".to_owned());

    let relay = MockRelayServer::start(false).await.unwrap();
    let relay_url = format!("ws://{}", relay.local_addr());

    let tunnel_task = tokio::spawn(sessiond::tunnel::run(server.state.clone(), relay_url));

    let mut client = server.connect().await;
    support::auth_and_drain_initial(&mut client, "hunter2x").await;

    let key_error = support::recv_matching(&mut client, Duration::from_secs(2), |v| {
        v["status"]["remote"]["error"] == json!("key")
    })
    .await;
    assert_eq!(key_error["status"]["remote"]["error"], json!("key"));

    // The loop remembers the rejected key and stops retrying against it;
    // no further remote-status frame (key or network) should follow.
    let further_frame = tokio::time::timeout(Duration::from_millis(1500), client.recv_json()).await;
    assert!(further_frame.is_err(), "a remembered-rejected key must not keep re-broadcasting");

    tunnel_task.abort();
}
