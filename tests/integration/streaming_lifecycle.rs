//! End-to-end streaming scenarios (spec §8, scenarios 3 and 5): an
//! out-of-range bitrate is rejected before anything is persisted or
//! started, and a bitrate change accepted while streaming rewrites the
//! bitrate file and reaches every other authenticated client but not the
//! requester.

#[path = "support.rs"]
mod support;

use std::time::Duration;

use serde_json::json;

fn valid_start_payload(pipeline_id: &str) -> serde_json::Value {
    json!({
        "start": {
            "delay": 0,
            "pipeline": pipeline_id,
            "max_br": 4000,
            "srt_latency": 500,
            "srt_streamid": "",
            "srtla_addr": "localhost",
            "srtla_port": 5000,
        }
    })
}

#[tokio::test]
async fn start_rejects_out_of_range_bitrate_without_touching_state() {
    let dir = tempfile::tempdir().unwrap();
    support::seed_password(dir.path(), "hunter2x");
    let server = support::start_server(dir.path()).await;
    let (_setup_path, pipeline_id) = support::write_setup(dir.path());

    let mut client = server.connect().await;
    support::auth_and_drain_initial(&mut client, "hunter2x").await;

    let mut payload = valid_start_payload(&pipeline_id);
    payload["start"]["max_br"] = json!(50);
    client.send_json(&payload).await.unwrap();

    let notification = client.recv_json().await.unwrap();
    let shown = &notification["notification"]["show"][0];
    assert_eq!(shown["type"], json!("error"));
    assert_eq!(shown["msg"], json!("invalid bitrate range: "));

    let status = client.recv_json().await.unwrap();
    assert_eq!(status["status"]["is_streaming"], json!(false));

    assert!(!server.state.is_streaming().await);
}

#[tokio::test]
async fn bitrate_change_while_streaming_rewrites_file_and_excludes_the_sender() {
    let dir = tempfile::tempdir().unwrap();
    support::seed_password(dir.path(), "hunter2x");
    let server = support::start_server(dir.path()).await;
    let (_setup_path, pipeline_id) = support::write_setup(dir.path());
    support::seed_interface(&server.state, "eth0", "10.0.0.5", 1000).await;

    let mut sender = server.connect().await;
    support::auth_and_drain_initial(&mut sender, "hunter2x").await;
    let mut observer = server.connect().await;
    support::auth_and_drain_initial(&mut observer, "hunter2x").await;

    sender.send_json(&valid_start_payload(&pipeline_id)).await.unwrap();

    // The sender sees the streaming flag flip; the observer gets both the
    // config rewrite (`broadcast_except`) and the streaming-flag flip.
    let is_streaming_true = |v: &serde_json::Value| v["status"]["is_streaming"] == json!(true);
    support::recv_matching(&mut sender, Duration::from_secs(2), is_streaming_true).await;
    support::recv_matching(&mut observer, Duration::from_secs(2), is_streaming_true).await;
    assert!(server.state.is_streaming().await);

    sender
        .send_json(&json!({"bitrate": {"max_br": 6000}}))
        .await
        .unwrap();

    let bitrate_frame = support::recv_matching(&mut observer, Duration::from_secs(2), |v| {
        v.get("bitrate").is_some()
    })
    .await;
    assert_eq!(bitrate_frame["bitrate"]["max_br"], json!(6000));

    // The sender must not receive its own bitrate echo. Race the next
    // frame it does receive (if any) against a short timeout; either the
    // timeout wins, or a frame arrives that is not the bitrate echo.
    let sender_saw_bitrate = tokio::time::timeout(Duration::from_millis(300), async {
        loop {
            let frame = sender.recv_json().await.unwrap();
            if frame.get("bitrate").is_some() {
                return true;
            }
        }
    })
    .await
    .unwrap_or(false);
    assert!(!sender_saw_bitrate, "broadcast_except must exclude the requester");

    let bitrate_path = dir.path().join("bitrate");
    let contents = tokio::fs::read_to_string(&bitrate_path).await.unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines[1], "6000000", "bitrate file's second line is max_br * 1000");
}
