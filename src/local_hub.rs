//! Local WS hub (C8): accepts local WebSocket clients, parses inbound
//! frames, dispatches them to the router (C12), and exposes the
//! broadcast helpers every mutating component uses to fan state out to
//! connected dashboards.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use tracing::{debug, info, warn};
use wire_protocol::{ServerFrame, ServerMessage, parse_client_frame};

use crate::app_state::AppState;
use crate::clock::now_ms;
use crate::session::Connection;

/// Clients active within this many milliseconds of "now" are eligible
/// recipients of bandwidth-sensitive broadcasts (§4.7, §5).
pub const ACTIVE_TIMEOUT_MS: i64 = 15_000;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = futures_util::StreamExt::split(socket);
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<ServerFrame>();
    let conn = Arc::new(Connection::new(false, tx, now_ms()));
    state.connections.insert(conn.clone());
    info!(conn_id = conn.id, "local client connected");

    if !state.password_configured().await {
        conn.send(ServerFrame::new(ServerMessage::Status(wire_protocol::StatusUpdate {
            set_password: Some(true),
            ..Default::default()
        })));
    }

    let writer_conn = conn.clone();
    let mut writer = tokio::spawn(async move {
        use futures_util::SinkExt;
        while let Some(frame) = rx.recv().await {
            if sink.send(Message::Text(frame.to_json().into())).await.is_err() {
                break;
            }
        }
        let _ = writer_conn;
    });

    loop {
        tokio::select! {
            msg = stream.next_message() => {
                match msg {
                    Some(text) => {
                        conn.touch(now_ms());
                        match parse_client_frame(&text) {
                            Ok(Some(frame)) => {
                                crate::router::dispatch(&state, &conn, frame).await;
                            }
                            Ok(None) => debug!(conn_id = conn.id, "dropped frame of unrecognized type"),
                            Err(err) => warn!(conn_id = conn.id, %err, "dropped unparseable frame"),
                        }
                    }
                    None => break,
                }
            }
            _ = &mut writer => break,
        }
    }

    writer.abort();
    state.connections.remove(conn.id);
    info!(conn_id = conn.id, "local client disconnected");
}

/// Thin adapter so the select loop above can await "next text frame,
/// ignoring pings/pongs/binary, ending the loop on close or error" in
/// one line.
trait NextTextMessage {
    fn next_message(&mut self) -> impl std::future::Future<Output = Option<String>> + Send;
}

impl NextTextMessage for futures_util::stream::SplitStream<WebSocket> {
    async fn next_message(&mut self) -> Option<String> {
        loop {
            match futures_util::StreamExt::next(self).await {
                Some(Ok(Message::Text(text))) => return Some(text.to_string()),
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Ok(_)) => continue,
                Some(Err(_)) => return None,
            }
        }
    }
}

/// `broadcastLocal(type, data, activeMin, except)`: deliver to every
/// local client that's authenticated and active within the window.
pub fn broadcast_local(state: &AppState, message: ServerMessage, active_min: i64, except: Option<u64>) {
    let frame = ServerFrame::new(message);
    for conn in state.connections.local_recipients(active_min, except) {
        conn.send(frame.clone());
    }
}

/// `broadcast(type, data, activeMin)`: `broadcastLocal` plus a mirror to
/// the remote tunnel, if authenticated.
pub fn broadcast(state: &AppState, message: ServerMessage, active_min: i64) {
    broadcast_local(state, message.clone(), active_min, None);
    if state.remote_authenticated.load(std::sync::atomic::Ordering::Acquire) {
        if let Some(remote) = state.connections.remote() {
            remote.send(ServerFrame::new(message));
        }
    }
}

/// `broadcastExcept(conn, type, data)`: broadcast to all local clients
/// except `conn`, and mirror to the tunnel tagged with `conn`'s
/// `senderId` — per §9's preserved (if surprising) behavior, every
/// `broadcastExcept` mirrors, not just plain `broadcast`.
pub fn broadcast_except(state: &AppState, except: &Connection, message: ServerMessage) {
    broadcast_local(state, message.clone(), 0, Some(except.id));
    if state.remote_authenticated.load(std::sync::atomic::Ordering::Acquire) {
        if let Some(remote) = state.connections.remote() {
            match except.sender_id() {
                Some(id) => remote.send(ServerFrame::tagged(id, message)),
                None => remote.send(ServerFrame::new(message)),
            }
        }
    }
}

/// The `ACTIVE_TO`-filtered cutoff for "now".
pub fn active_min_now() -> i64 {
    now_ms() - ACTIVE_TIMEOUT_MS
}

#[cfg(test)]
mod tests {
    use super::*;
    use wire_protocol::StatusUpdate;

    fn make_conn(is_remote: bool) -> (Arc<Connection>, tokio::sync::mpsc::UnboundedReceiver<ServerFrame>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Arc::new(Connection::new(is_remote, tx, now_ms())), rx)
    }

    #[tokio::test]
    async fn broadcast_local_skips_unauthenticated_and_excepted() {
        let setup_dir = tempfile::tempdir().unwrap();
        std::fs::write(
            setup_dir.path().join("setup.json"),
            r#"{"platform":"generic","encoder_path":"/bin/true","bonder_path":"/bin/true",
                "pipeline_root":"/opt/pipelines","bitrate_file":"/run/br","uplinks_file":"/run/ips"}"#,
        )
        .unwrap();
        let state = AppState::load(
            &setup_dir.path().join("setup.json"),
            setup_dir.path().join("config.json"),
            setup_dir.path().join("tokens.json"),
        )
        .unwrap();

        let (authed, mut authed_rx) = make_conn(false);
        authed.set_authenticated(None);
        authed.touch(now_ms());
        let (unauthed, mut unauthed_rx) = make_conn(false);
        unauthed.touch(now_ms());
        let (excepted, mut excepted_rx) = make_conn(false);
        excepted.set_authenticated(None);
        excepted.touch(now_ms());

        state.connections.insert(authed.clone());
        state.connections.insert(unauthed);
        state.connections.insert(excepted.clone());

        broadcast_local(
            &state,
            ServerMessage::Status(StatusUpdate {
                is_streaming: Some(true),
                ..Default::default()
            }),
            0,
            Some(excepted.id),
        );

        assert!(authed_rx.try_recv().is_ok());
        assert!(unauthed_rx.try_recv().is_err());
        assert!(excepted_rx.try_recv().is_err());
    }

    #[test]
    fn active_min_now_is_active_timeout_before_now() {
        let before = now_ms();
        let min = active_min_now();
        assert!(min <= before - ACTIVE_TIMEOUT_MS + 50);
    }
}
