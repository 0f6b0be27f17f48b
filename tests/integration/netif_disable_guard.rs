//! End-to-end interface-disable guard (spec §8, scenario 4): disabling the
//! sole enabled interface is rejected with a persistent `netif_disable_all`
//! notification and no table change, while disabling it once a second
//! interface is enabled succeeds and broadcasts the updated table.

#[path = "support.rs"]
mod support;

use std::time::Duration;

use serde_json::json;

#[tokio::test]
async fn disabling_the_last_interface_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    support::seed_password(dir.path(), "hunter2x");
    let server = support::start_server(dir.path()).await;
    support::seed_interface(&server.state, "eth0", "10.0.0.5", 1000).await;

    let mut client = server.connect().await;
    support::auth_and_drain_initial(&mut client, "hunter2x").await;

    client
        .send_json(&json!({"netif": {"name": "eth0", "ip": "10.0.0.5", "enabled": false}}))
        .await
        .unwrap();

    let notification = support::recv_matching(&mut client, Duration::from_secs(2), |v| {
        v.get("notification").is_some()
    })
    .await;
    let shown = &notification["notification"]["show"][0];
    assert_eq!(shown["type"], json!("error"));
    assert_eq!(shown["msg"], json!("Cannot disable every network interface"));
    assert_eq!(shown["name"], json!("netif_disable_all"));
    assert_eq!(shown["duration"], json!(10));
    assert_eq!(shown["dismissable"], json!(true));

    let enabled_count = server
        .state
        .interfaces
        .read()
        .await
        .enabled_count();
    assert_eq!(enabled_count, 1, "the rejected request must not change the table");
}

#[tokio::test]
async fn disabling_succeeds_once_another_interface_is_enabled() {
    let dir = tempfile::tempdir().unwrap();
    support::seed_password(dir.path(), "hunter2x");
    let server = support::start_server(dir.path()).await;
    support::seed_interface(&server.state, "eth0", "10.0.0.5", 1000).await;
    support::seed_interface(&server.state, "eth1", "10.0.0.6", 500).await;

    let mut client = server.connect().await;
    support::auth_and_drain_initial(&mut client, "hunter2x").await;

    client
        .send_json(&json!({"netif": {"name": "eth0", "ip": "10.0.0.5", "enabled": false}}))
        .await
        .unwrap();

    let netif_update = support::recv_matching(&mut client, Duration::from_secs(2), |v| {
        v.get("netif").is_some()
    })
    .await;
    assert_eq!(netif_update["netif"]["eth0"]["enabled"], json!(false));
    assert_eq!(netif_update["netif"]["eth1"]["enabled"], json!(true));

    assert_eq!(server.state.interfaces.read().await.enabled_count(), 1);
}
