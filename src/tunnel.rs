//! Remote tunnel client (C9): a single reconnecting outbound WebSocket to
//! the cloud relay, source-address rotation across uplinks, and
//! bidirectional message bridging with sender tagging (§4.8).
//!
//! Modelled on the forwarder's `uplink.rs` hello/heartbeat session: a
//! `connect` that performs the handshake and hands back a live session,
//! a `run` loop around it that owns reconnect/backoff policy, with the
//! wire parsing kept in small pure functions so the handshake and
//! keepalive math can be unit-tested without a real socket.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpSocket, TcpStream};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_tungstenite::tungstenite::http::Uri;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};
use wire_protocol::{RemoteAuthError, ServerFrame, ServerMessage, StatusUpdate, TUNNEL_PROTOCOL_VERSION};

use crate::app_state::AppState;
use crate::clock::now_ms;
use crate::session::Connection;

/// Well-known relay endpoint; overridable at startup via `RELAY_URL` (see
/// `main`), analogous to the forwarder's configurable `server_url`.
pub const DEFAULT_RELAY_URL: &str = "wss://relay.example.com/tunnel";

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);
const REMOTE_TIMEOUT_MS: i64 = 5_000;
const REMOTE_CONNECT_GRACE_MS: i64 = 5_000;
const RETRY_DELAY: Duration = Duration::from_secs(1);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Run the tunnel forever. Never returns; `main` spawns this as a
/// background task alongside the pollers.
///
/// A key rejected by the relay is fatal for that key (§7 kind 4): we
/// remember it in `rejected_key` and don't retry until `remote_key`
/// changes (rekey notifies immediately; otherwise we still poll, but
/// slowly, since the key can also change via a plain config write).
pub async fn run(state: AppState, relay_url: String) {
    let mut rejected_key: Option<String> = None;
    loop {
        let remote_key = state.config.read().await.remote_key.clone();
        let Some(remote_key) = remote_key else {
            rejected_key = None;
            tokio::time::sleep(RETRY_DELAY).await;
            continue;
        };
        if rejected_key.as_deref() == Some(remote_key.as_str()) {
            tokio::time::sleep(RETRY_DELAY).await;
            continue;
        }

        let Some(local_addr) = next_uplink_addr(&state).await else {
            tokio::time::sleep(RETRY_DELAY).await;
            continue;
        };

        match connect(&relay_url, local_addr, &remote_key).await {
            Ok(ws) => {
                rejected_key = None;
                serve(&state, ws).await;
            }
            Err(err) => {
                debug!(%err, "tunnel connect failed");
                if err.downcast_ref::<TunnelAuthRejected>().is_some() {
                    // The reject happens inside `connect`, before `serve` is
                    // ever entered, so there is no pending close event for
                    // this attempt to suppress — setting the flag here would
                    // leak forward and swallow a later, unrelated session's
                    // genuine network error.
                    rejected_key = Some(remote_key);
                    broadcast_key_error(&state);
                } else {
                    broadcast_network_error(&state);
                }
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
    }
}

/// Round-robins over the currently-enabled interface table (§4.8).
async fn next_uplink_addr(state: &AppState) -> Option<Ipv4Addr> {
    let ips = state.interfaces.read().await.enabled_ips();
    if ips.is_empty() {
        return None;
    }
    let i = state.uplink_rr.fetch_add(1, Ordering::Relaxed) % ips.len();
    Some(ips[i])
}

/// Open a TCP connection bound to `local_addr`, then perform the WS
/// upgrade against `relay_url`.
async fn connect(relay_url: &str, local_addr: Ipv4Addr, key: &str) -> anyhow::Result<AuthedSession> {
    let uri: Uri = relay_url.parse()?;
    let host = uri.host().ok_or_else(|| anyhow::anyhow!("relay URL has no host"))?;
    let port = uri.port_u16().unwrap_or(if uri.scheme_str() == Some("wss") { 443 } else { 80 });

    let remote_addr = tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| anyhow::anyhow!("relay host did not resolve"))?;

    let socket = TcpSocket::new_v4()?;
    socket.bind(SocketAddr::new(IpAddr::V4(local_addr), 0))?;
    let stream = socket.connect(remote_addr).await?;

    let (mut ws, _response) = tokio_tungstenite::client_async_tls(relay_url, stream).await?;

    ws.send(Message::Text(handshake_frame(key).to_string().into())).await?;
    let reply = ws.next().await.ok_or_else(|| anyhow::anyhow!("relay closed before handshake reply"))??;
    let Message::Text(text) = reply else {
        anyhow::bail!("relay sent a non-text handshake reply");
    };
    match parse_handshake_reply(&text) {
        Some(true) => Ok(AuthedSession { ws }),
        Some(false) => anyhow::bail!(TunnelAuthRejected),
        None => anyhow::bail!("relay sent an unrecognized handshake reply"),
    }
}

#[derive(Debug, thiserror::Error)]
#[error("relay rejected the tunnel key")]
struct TunnelAuthRejected;

struct AuthedSession {
    ws: WsStream,
}

/// `{"remote":{"auth/encoder":{"key":..., "version":6}}}`. The slash is
/// a literal character in the key, not a nested path (§4.8).
fn handshake_frame(key: &str) -> Value {
    json!({"remote": {"auth/encoder": {"key": key, "version": TUNNEL_PROTOCOL_VERSION}}})
}

/// `Some(true/false)` for `{"remote":{"auth/encoder": bool}}`, `None`
/// if the reply doesn't carry that shape.
fn parse_handshake_reply(text: &str) -> Option<bool> {
    let value: Value = serde_json::from_str(text).ok()?;
    value.get("remote")?.get("auth/encoder")?.as_bool()
}

/// Drive an authenticated tunnel session until it closes or goes stale,
/// updating shared state and broadcasting along the way.
async fn serve(state: &AppState, session: AuthedSession) {
    let AuthedSession { ws } = session;
    let (mut sink, mut stream) = ws.split();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<ServerFrame>();
    let conn = Arc::new(Connection::new(true, tx, now_ms()));
    state.connections.insert(conn.clone());
    state.remote_authenticated.store(true, Ordering::Release);
    info!("remote tunnel authenticated");

    crate::local_hub::broadcast(
        state,
        ServerMessage::Status(StatusUpdate {
            remote: Some(crate::status::remote_connected()),
            ..Default::default()
        }),
        0,
    );
    let initial = crate::status::build(state, !state.password_configured().await).await;
    conn.send(ServerFrame::new(ServerMessage::Status(initial)));

    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    let connect_deadline = now_ms() + REMOTE_CONNECT_GRACE_MS;

    let close_reason = loop {
        tokio::select! {
            frame = rx.recv() => {
                match frame {
                    Some(frame) => {
                        if sink.send(Message::Text(frame.to_json().into())).await.is_err() {
                            break CloseReason::Network;
                        }
                    }
                    None => break CloseReason::Network,
                }
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        conn.touch(now_ms());
                        handle_inbound(state, &conn, &text).await;
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => conn.touch(now_ms()),
                    Some(Ok(Message::Close(_))) | None => break CloseReason::Network,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break CloseReason::Network,
                }
            }
            _ = keepalive.tick() => {
                let grace = if now_ms() < connect_deadline { REMOTE_CONNECT_GRACE_MS } else { 0 };
                if now_ms() - conn.last_active_ms() > REMOTE_TIMEOUT_MS + grace {
                    break CloseReason::Stale;
                }
            }
            () = state.rekey_notify.notified() => {
                state.suppress_next_network_error.store(true, Ordering::Release);
                break CloseReason::Rekeyed;
            }
        }
    };

    state.remote_authenticated.store(false, Ordering::Release);
    state.connections.remove(conn.id);

    if matches!(close_reason, CloseReason::Stale) {
        state.suppress_next_network_error.store(true, Ordering::Release);
    }
    if !state.suppress_next_network_error.swap(false, Ordering::AcqRel) {
        broadcast_network_error(state);
    }
    info!(?close_reason, "remote tunnel session ended");
}

#[derive(Debug)]
enum CloseReason {
    Network,
    Stale,
    Rekeyed,
}

/// Inbound frames: `remote` sub-object is handled locally (none of our
/// own messages flow back from the relay today beyond the handshake), the
/// rest is dispatched through the router with the sender id copied from
/// `id` onto the tunnel connection (§4.8).
async fn handle_inbound(state: &AppState, conn: &Arc<Connection>, text: &str) {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(err) => {
            warn!(%err, "dropped unparseable remote frame");
            return;
        }
    };
    if value.get("remote").is_some() {
        return;
    }
    let sender_id = value.get("id").and_then(Value::as_str).map(str::to_owned);
    conn.set_sender_id(sender_id);

    match wire_protocol::parse_client_frame(text) {
        Ok(Some(frame)) => crate::router::dispatch(state, conn, frame).await,
        Ok(None) => debug!("dropped remote frame of unrecognized type"),
        Err(err) => warn!(%err, "dropped unparseable remote frame"),
    }
}

fn broadcast_network_error(state: &AppState) {
    state.ui_log.log("remote tunnel: network error");
    crate::local_hub::broadcast_local(
        state,
        ServerMessage::Status(StatusUpdate {
            remote: Some(crate::status::remote_error(RemoteAuthError::Network)),
            ..Default::default()
        }),
        0,
        None,
    );
}

fn broadcast_key_error(state: &AppState) {
    state.ui_log.log("remote tunnel: relay rejected key");
    crate::local_hub::broadcast_local(
        state,
        ServerMessage::Status(StatusUpdate {
            remote: Some(crate::status::remote_error(RemoteAuthError::Key)),
            ..Default::default()
        }),
        0,
        None,
    );
}

/// `setRemoteKey`: persist the new key, then force-terminate any current
/// tunnel session with the suppression flag set so the forced close
/// doesn't also emit a spurious network-error broadcast (§4.8).
pub async fn set_remote_key(state: &AppState, key: Option<String>) -> Result<(), crate::config::ConfigError> {
    {
        let mut config = state.config.write().await;
        config.remote_key = key;
    }
    state.save_config().await?;
    state.suppress_next_network_error.store(true, Ordering::Release);
    state.rekey_notify.notify_one();
    Ok(())
}
