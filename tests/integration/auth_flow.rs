//! End-to-end auth scenarios (spec §8, scenarios 1-2): first-run password
//! set followed by successful token auth, and the minimum-length rejection
//! on a too-short password.

#[path = "support.rs"]
mod support;

use serde_json::json;

#[tokio::test]
async fn first_run_password_set_then_password_auth_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let server = support::start_server(dir.path()).await;
    let mut client = server.connect().await;

    // No password configured yet: the hub greets a fresh connection with
    // `{"status":{"set_password":true}}` before anything else.
    let greeting = client.recv_json().await.unwrap();
    assert_eq!(greeting["status"]["set_password"], json!(true));

    client
        .send_json(&json!({"config": {"password": "hunter2x"}}))
        .await
        .unwrap();

    client
        .send_json(&json!({"auth": {"password": "hunter2x"}}))
        .await
        .unwrap();
    let auth_reply = client.recv_json().await.unwrap();
    assert_eq!(auth_reply["auth"]["success"], json!(true));
    let token = auth_reply["auth"]["auth_token"]
        .as_str()
        .expect("a token is issued on successful password auth");
    let raw = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, token).unwrap();
    assert_eq!(raw.len(), 32, "auth_token is a 256-bit value, base64-encoded");

    // Initial state frames follow the auth reply.
    let status = client.recv_json().await.unwrap();
    assert!(status.get("status").is_some());
    let config = client.recv_json().await.unwrap();
    assert!(config.get("config").is_some());
}

#[tokio::test]
async fn bad_password_length_is_rejected_with_no_config_change() {
    let dir = tempfile::tempdir().unwrap();
    let server = support::start_server(dir.path()).await;
    let mut client = server.connect().await;

    let _greeting = client.recv_json().await.unwrap();

    client
        .send_json(&json!({"config": {"password": "short"}}))
        .await
        .unwrap();

    let notification = client.recv_json().await.unwrap();
    let shown = &notification["notification"]["show"][0];
    assert_eq!(shown["type"], json!("error"));
    assert_eq!(shown["msg"], json!("Minimum password length: 8 characters"));

    assert!(
        !server.state.password_configured().await,
        "a rejected password set must not touch config"
    );
}

#[tokio::test]
async fn persistent_token_survives_a_fresh_load_non_persistent_does_not() {
    let dir = tempfile::tempdir().unwrap();
    support::seed_password(dir.path(), "hunter2x");
    let server = support::start_server(dir.path()).await;
    let mut client = server.connect().await;

    client
        .send_json(&json!({"auth": {"password": "hunter2x", "persistent_token": true}}))
        .await
        .unwrap();
    let persistent_reply = client.recv_json().await.unwrap();
    let persistent_token = persistent_reply["auth"]["auth_token"].as_str().unwrap().to_owned();

    for _ in 0..6 {
        client.recv_json().await.unwrap();
    }

    let mut client2 = server.connect().await;
    client2
        .send_json(&json!({"auth": {"password": "hunter2x", "persistent_token": false}}))
        .await
        .unwrap();
    let transient_reply = client2.recv_json().await.unwrap();
    let transient_token = transient_reply["auth"]["auth_token"].as_str().unwrap().to_owned();

    // Simulate a daemon restart: reload AppState from the same directory.
    let (setup_path, _id) = support::write_setup(dir.path());
    let restarted = support::start_server_with_setup(dir.path(), &setup_path).await;

    assert!(restarted.state.token_authenticates(&persistent_token).await);
    assert!(!restarted.state.token_authenticates(&transient_token).await);
}
