//! End-to-end persistent-notification rate limiting (universal invariant
//! from spec §8): two `netif` requests that would each disable the last
//! interface, issued within the same second, produce only one
//! `netif_disable_all` notification; a third attempt issued after the
//! window has elapsed produces another.

#[path = "support.rs"]
mod support;

use std::time::Duration;

use serde_json::json;

#[tokio::test]
async fn rapid_repeats_are_suppressed_but_a_later_one_is_not() {
    let dir = tempfile::tempdir().unwrap();
    support::seed_password(dir.path(), "hunter2x");
    let server = support::start_server(dir.path()).await;
    support::seed_interface(&server.state, "eth0", "10.0.0.5", 1000).await;

    let mut client = server.connect().await;
    support::auth_and_drain_initial(&mut client, "hunter2x").await;

    let disable = json!({"netif": {"name": "eth0", "ip": "10.0.0.5", "enabled": false}});

    client.send_json(&disable).await.unwrap();
    let first = support::recv_matching(&mut client, Duration::from_secs(2), |v| v.get("notification").is_some()).await;
    assert_eq!(first["notification"]["show"][0]["msg"], json!("Cannot disable every network interface"));

    client.send_json(&disable).await.unwrap();
    let no_second = tokio::time::timeout(Duration::from_millis(400), client.recv_json()).await;
    assert!(no_second.is_err(), "a repeat within the rate-limit window must not emit a second frame");

    tokio::time::sleep(Duration::from_millis(700)).await;

    client.send_json(&disable).await.unwrap();
    let third = support::recv_matching(&mut client, Duration::from_secs(2), |v| v.get("notification").is_some()).await;
    assert_eq!(third["notification"]["show"][0]["msg"], json!("Cannot disable every network interface"));
}
