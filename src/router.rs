//! Top-level message router (C12): the single `dispatch` entrypoint both
//! the local WS hub (C8) and the remote tunnel (C9) call with a parsed
//! frame plus the connection it arrived on. Everything here is
//! orchestration — it owns no state of its own beyond the small
//! ssh-status-change cache, and defers to C1–C11 for the actual work.

use std::net::Ipv4Addr;
use std::sync::Arc;

use serde_json::json;
use tracing::warn;
use wire_protocol::{
    AuthReply, AuthRequest, BitrateRequest, ClientFrame, ClientMessage, CommandKind, ConfigRequest,
    NetifRequest, NotificationUpdate, RemoteAuthError, ServerFrame, ServerMessage, StatusUpdate,
    WifiRequest,
};

use crate::app_state::AppState;
use crate::auth;
use crate::clock::now_ms;
use crate::notifications::{NotificationKind, SendOutcome};
use crate::session::Connection;
use crate::ssh::SshStatus;
use crate::streaming::{StartError, ValidationError};
use crate::wifi::{NewConnectionFailure, WifiCommandError};

/// Platform-specific sensor root; sampled by the periodic poller and on
/// initial attach. Sensor reporting is incidental to this controller
/// (§1) — the path isn't part of the persisted setup document.
pub const SENSORS_ROOT: &str = "/run/appliance/sensors";

pub async fn dispatch(state: &AppState, conn: &Arc<Connection>, frame: ClientFrame) {
    match frame.message {
        ClientMessage::Auth(req) => handle_auth(state, conn, req).await,
        ClientMessage::Config(req) => handle_config(state, conn, req).await,
        ClientMessage::Keepalive => conn.touch(now_ms()),
        ClientMessage::Start(params) => handle_start(state, conn, params).await,
        ClientMessage::Stop => handle_stop(state, conn).await,
        ClientMessage::Bitrate(req) => handle_bitrate(state, conn, req).await,
        ClientMessage::Command(cmd) => handle_command(state, conn, cmd).await,
        ClientMessage::Netif(req) => handle_netif(state, conn, req).await,
        ClientMessage::Wifi(req) => handle_wifi(state, conn, req).await,
        ClientMessage::Logout => handle_logout(state, conn).await,
    }
}

fn notify_error(conn: &Arc<Connection>, msg: impl Into<String>) {
    let view = wire_protocol::NotificationView {
        name: None,
        kind: "error",
        msg: msg.into(),
        duration: 10,
        dismissable: true,
    };
    conn.send(ServerFrame::new(ServerMessage::Notification(NotificationUpdate::Show(vec![view]))));
}

// ---------------------------------------------------------------------------
// C7 auth/config
// ---------------------------------------------------------------------------

async fn handle_auth(state: &AppState, conn: &Arc<Connection>, req: AuthRequest) {
    let ok = match req {
        AuthRequest::Password { password, persistent_token } => {
            let hash = state.config.read().await.password_hash.clone();
            if hash.is_some_and(|hash| auth::verify_password(&password, &hash)) {
                let token = auth::generate_token();
                if persistent_token {
                    state.persistent_tokens.write().await.insert(token.clone());
                    let _ = state.save_persistent_tokens().await;
                } else {
                    state.transient_tokens.write().await.insert(token.clone());
                }
                conn.set_authenticated(Some(token.clone()));
                conn.send(ServerFrame::new(ServerMessage::Auth(AuthReply {
                    success: true,
                    auth_token: Some(token),
                })));
                true
            } else {
                false
            }
        }
        AuthRequest::Token { token } => {
            if state.token_authenticates(&token).await {
                conn.set_authenticated(Some(token));
                conn.send(ServerFrame::new(ServerMessage::Auth(AuthReply {
                    success: true,
                    auth_token: None,
                })));
                true
            } else {
                false
            }
        }
    };

    if ok {
        send_initial_state(state, conn).await;
    } else {
        conn.send(ServerFrame::new(ServerMessage::Auth(AuthReply {
            success: false,
            auth_token: None,
        })));
    }
}

/// Every frame a freshly-authenticated connection (local or remote)
/// needs to reconstruct full UI state, mirroring what a new local client
/// gets on connect plus what the tunnel's handshake success sends.
pub async fn send_initial_state(state: &AppState, conn: &Arc<Connection>) {
    let status = {
        let mut status = crate::status::build(state, false).await;
        status.ssh = state.setup.ssh_username.as_ref().map(|_| to_wire_ssh(&current_ssh_status(state).await));
        status
    };
    conn.send(ServerFrame::new(ServerMessage::Status(status)));
    conn.send(ServerFrame::new(ServerMessage::Config(state.config.read().await.to_public())));
    conn.send(ServerFrame::new(ServerMessage::Pipelines(crate::pipelines::to_wire(&state.pipelines))));
    conn.send(ServerFrame::new(ServerMessage::Netif(state.interfaces.read().await.to_wire())));
    conn.send(ServerFrame::new(ServerMessage::Wifi(state.wifi.read().await.to_wire())));
    conn.send(ServerFrame::new(ServerMessage::Revisions(std::collections::BTreeMap::from([(
        "sessiond".to_owned(),
        env!("CARGO_PKG_VERSION").to_owned(),
    )]))));

    let views = state.notifications.lock().await.replay_for_new_client(chrono::Utc::now());
    if !views.is_empty() {
        conn.send(ServerFrame::new(ServerMessage::Notification(NotificationUpdate::Show(views))));
    }
}

async fn handle_config(state: &AppState, conn: &Arc<Connection>, req: ConfigRequest) {
    if let Some(password) = req.password {
        let password_configured = state.password_configured().await;
        if !auth::can_set_password(conn.is_authenticated(), password_configured, conn.is_remote) {
            notify_error(conn, "Not authorized to set password");
        } else if password.len() < auth::MIN_PASSWORD_LEN {
            notify_error(conn, format!("Minimum password length: {} characters", auth::MIN_PASSWORD_LEN));
        } else {
            match auth::hash_password(&password) {
                Ok(hash) => {
                    state.config.write().await.password_hash = Some(hash);
                    if let Err(err) = state.save_config().await {
                        warn!(%err, "failed to persist config after password change");
                    }
                    let public = state.config.read().await.to_public();
                    crate::local_hub::broadcast_except(state, conn, ServerMessage::Config(public));
                }
                Err(err) => warn!(%err, "failed to hash new password"),
            }
        }
    }

    if let Some(remote_key) = req.remote_key {
        if !conn.is_authenticated() {
            notify_error(conn, "Not authorized to set remote key");
        } else {
            let key = (!remote_key.is_empty()).then_some(remote_key);
            if let Err(err) = crate::tunnel::set_remote_key(state, key).await {
                warn!(%err, "failed to persist remote key");
            }
            let public = state.config.read().await.to_public();
            crate::local_hub::broadcast_except(state, conn, ServerMessage::Config(public));
        }
    }
}

async fn handle_logout(state: &AppState, conn: &Arc<Connection>) {
    if let Some(token) = conn.token() {
        state.revoke_token(&token).await;
    }
    conn.clear_authenticated();
}

// ---------------------------------------------------------------------------
// C6 streaming
// ---------------------------------------------------------------------------

async fn handle_start(state: &AppState, conn: &Arc<Connection>, params: wire_protocol::StartParams) {
    if !conn.is_authenticated() {
        return;
    }
    if state.is_streaming().await {
        reject_start(conn, &StartError::AlreadyStreaming.to_string());
        return;
    }
    if state.update.is_updating() {
        reject_start(conn, &StartError::UpdateInProgress.to_string());
        return;
    }

    let validated = crate::streaming::validate_start(&params, &state.pipelines, crate::streaming::resolve_via_system_dns).await;
    let validated = match validated {
        Ok(v) => v,
        Err(err) => {
            reject_start(conn, &ValidationError::from(err).to_string());
            return;
        }
    };

    {
        let mut config = state.config.write().await;
        config.delay = Some(validated.delay);
        config.pipeline = Some(validated.pipeline_id.clone());
        config.max_br = Some(validated.max_br);
        config.srt_latency = Some(validated.srt_latency);
        config.srt_streamid = Some(validated.srt_streamid.clone());
        config.srtla_addr = Some(validated.srtla_addr.clone());
        config.srtla_port = Some(validated.srtla_port);
    }
    if let Err(err) = state.save_config().await {
        warn!(%err, "failed to persist config on start");
    }
    let public = state.config.read().await.to_public();
    crate::local_hub::broadcast_except(state, conn, ServerMessage::Config(public));

    let enabled_ips = state.interfaces.read().await.enabled_ips();
    let result = {
        let mut streaming = state.streaming.lock().await;
        streaming.begin(&state.setup, &validated, &enabled_ips)
    };
    match result {
        Ok(()) => crate::local_hub::broadcast(
            state,
            ServerMessage::Status(StatusUpdate {
                is_streaming: Some(true),
                ..Default::default()
            }),
            0,
        ),
        Err(err) => reject_start(conn, &err.to_string()),
    }
}

fn reject_start(conn: &Arc<Connection>, detail: &str) {
    notify_error(conn, detail.to_owned());
    conn.send(ServerFrame::new(ServerMessage::Status(StatusUpdate {
        is_streaming: Some(false),
        ..Default::default()
    })));
}

async fn handle_stop(state: &AppState, conn: &Arc<Connection>) {
    if !conn.is_authenticated() {
        return;
    }
    state.streaming.lock().await.stop();
    crate::local_hub::broadcast(
        state,
        ServerMessage::Status(StatusUpdate {
            is_streaming: Some(false),
            ..Default::default()
        }),
        0,
    );
}

async fn handle_bitrate(state: &AppState, conn: &Arc<Connection>, req: BitrateRequest) {
    if !conn.is_authenticated() || !state.is_streaming().await {
        return;
    }
    if !crate::streaming::validate_bitrate(req.max_br) {
        notify_error(conn, "invalid bitrate range");
        return;
    }
    state.config.write().await.max_br = Some(req.max_br);
    if let Err(err) = state.save_config().await {
        warn!(%err, "failed to persist config on bitrate change");
    }
    if let Err(err) = crate::streaming::apply_bitrate_change(&state.setup, req.max_br).await {
        warn!(%err, "failed to apply bitrate change");
        return;
    }
    crate::local_hub::broadcast_except(state, conn, ServerMessage::Bitrate(req));
}

// ---------------------------------------------------------------------------
// C3 interfaces
// ---------------------------------------------------------------------------

async fn handle_netif(state: &AppState, conn: &Arc<Connection>, req: NetifRequest) {
    if !conn.is_authenticated() {
        return;
    }
    let Ok(ip) = req.ip.parse::<Ipv4Addr>() else {
        warn!(ip = %req.ip, "dropped netif request with unparseable address");
        return;
    };

    let result = state.interfaces.write().await.set_enabled(&req.name, ip, req.enabled);
    match result {
        Ok(()) => {
            crate::local_hub::broadcast(
                state,
                ServerMessage::Netif(state.interfaces.read().await.to_wire()),
                0,
            );
            if state.is_streaming().await {
                let enabled_ips = state.interfaces.read().await.enabled_ips();
                if let Err(err) = crate::streaming::update_uplinks(&state.setup, &enabled_ips).await {
                    warn!(%err, "failed to update uplinks after netif change");
                    state.ui_log.log(format_args!("netif: failed to update uplinks: {err}"));
                }
            }
        }
        Err(crate::netif::SetEnabledError::NoMatch) => {}
        Err(crate::netif::SetEnabledError::WouldDisableAll) => {
            let outcome = state.notifications.lock().await.send(
                chrono::Utc::now(),
                false,
                "netif_disable_all",
                NotificationKind::Error,
                "Cannot disable every network interface",
                10,
                true,
                true,
            );
            if let Ok(SendOutcome::Broadcast(view)) = outcome {
                crate::local_hub::broadcast_local(
                    state,
                    ServerMessage::Notification(NotificationUpdate::Show(vec![view])),
                    0,
                    None,
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// C4 wifi
// ---------------------------------------------------------------------------

async fn handle_wifi(state: &AppState, conn: &Arc<Connection>, req: WifiRequest) {
    if !conn.is_authenticated() {
        return;
    }
    match req {
        WifiRequest::Scan => {
            let _ = state.nmcli.rescan().await;
        }
        WifiRequest::Connect { uuid } => {
            let _ = state.nmcli.connect(&uuid).await;
        }
        WifiRequest::Disconnect { uuid } => {
            let _ = state.nmcli.disconnect(&uuid).await;
        }
        WifiRequest::Forget { uuid } => {
            let _ = state.nmcli.forget(&uuid).await;
        }
        WifiRequest::New { device_id, ssid, password } => {
            let ifname = state.wifi.read().await.device_by_id(device_id).map(|(_, d)| d.ifname.clone());
            let Some(ifname) = ifname else {
                conn.send(ServerFrame::new(ServerMessage::Wifi(
                    json!({"new": {"success": false, "error": "generic"}}),
                )));
                return;
            };
            let reply = match state.nmcli.new_connection(&ifname, &ssid, password.as_deref()).await {
                Ok(()) => json!({"new": {"success": true}}),
                Err(WifiCommandError::Connect(NewConnectionFailure::Auth)) => {
                    json!({"new": {"success": false, "error": "auth"}})
                }
                Err(_) => json!({"new": {"success": false, "error": "generic"}}),
            };
            conn.send(ServerFrame::new(ServerMessage::Wifi(reply)));
        }
    }
}

// ---------------------------------------------------------------------------
// Commands: power, OS update (C10), SSH (C11)
// ---------------------------------------------------------------------------

async fn handle_command(state: &AppState, conn: &Arc<Connection>, cmd: CommandKind) {
    if !conn.is_authenticated() {
        return;
    }
    match cmd {
        CommandKind::Poweroff => {
            let _ = tokio::process::Command::new("systemctl").arg("poweroff").status().await;
        }
        CommandKind::Reboot => {
            let _ = tokio::process::Command::new("systemctl").arg("reboot").status().await;
        }
        CommandKind::Update => run_update(state.clone()),
        CommandKind::StartSsh => start_ssh(state).await,
        CommandKind::StopSsh => stop_ssh(state).await,
        CommandKind::ResetSshPass => reset_ssh_pass(state, conn).await,
    }
}

/// Spawned rather than awaited inline: `doUpdate` can run for minutes and
/// the caller (a WS read loop) must keep servicing other frames.
fn run_update(state: AppState) {
    tokio::spawn(async move {
        let is_streaming = state.is_streaming().await;
        let total = state
            .update
            .last_plan
            .lock()
            .expect("lock not poisoned")
            .map_or(0, |plan| plan.package_count);

        let last_progress = std::sync::Arc::new(std::sync::Mutex::new(pkg_update::UpdateProgress::default()));
        let state_for_progress = state.clone();
        let last_progress_for_closure = last_progress.clone();
        let on_progress = move |progress: pkg_update::UpdateProgress| {
            *last_progress_for_closure.lock().expect("lock not poisoned") = progress;
            crate::local_hub::broadcast(
                &state_for_progress,
                ServerMessage::Status(StatusUpdate {
                    updating: Some(to_wire_update_progress(progress, None)),
                    ..Default::default()
                }),
                0,
            );
        };

        match crate::update::do_update(&state.package_manager, &state.update, is_streaming, total, on_progress).await {
            Ok(outcome) => {
                let progress = *last_progress.lock().expect("lock not poisoned");
                let (result, detail) = match &outcome {
                    pkg_update::UpdateOutcome::Success => (json!(0), None),
                    pkg_update::UpdateOutcome::Failed(detail) => (json!(detail), Some(detail.clone())),
                };
                crate::local_hub::broadcast(
                    &state,
                    ServerMessage::Status(StatusUpdate {
                        updating: Some(to_wire_update_progress(progress, Some(result))),
                        ..Default::default()
                    }),
                    0,
                );
                if let Some(detail) = detail {
                    warn!(%detail, "OS update failed");
                    state.ui_log.log(format_args!("update: {detail}"));
                } else if state.setup.restart_on_update {
                    std::process::exit(0);
                }
            }
            Err(err) => warn!(%err, "OS update rejected"),
        }
    });
}

fn to_wire_update_progress(
    progress: pkg_update::UpdateProgress,
    result: Option<serde_json::Value>,
) -> wire_protocol::UpdateProgress {
    wire_protocol::UpdateProgress {
        downloading: progress.downloading,
        unpacking: progress.unpacking,
        setting_up: progress.setting_up,
        total: progress.total,
        result,
    }
}

async fn start_ssh(state: &AppState) {
    if state.config.read().await.ssh_pass.is_none() {
        reset_password_unannounced(state).await;
    }
    if let Err(err) = state.ssh.enable().await {
        warn!(%err, "failed to enable ssh");
        state.ui_log.log(format_args!("ssh: failed to enable: {err}"));
    }
    refresh_ssh_status(state).await;
}

async fn stop_ssh(state: &AppState) {
    if let Err(err) = state.ssh.disable().await {
        warn!(%err, "failed to disable ssh");
        state.ui_log.log(format_args!("ssh: failed to disable: {err}"));
    }
    refresh_ssh_status(state).await;
}

async fn reset_ssh_pass(state: &AppState, conn: &Arc<Connection>) {
    let Some(password) = reset_password_unannounced(state).await else {
        return;
    };
    refresh_ssh_status(state).await;
    conn.send(ServerFrame::new(ServerMessage::Notification(NotificationUpdate::Show(vec![
        wire_protocol::NotificationView {
            name: None,
            kind: "success",
            msg: format!("SSH password reset to: {password}"),
            duration: 0,
            dismissable: true,
        },
    ]))));
}

/// Generate and apply a new SSH password, recording it (plaintext and
/// shadow hash) in config. Returns the plaintext on success.
async fn reset_password_unannounced(state: &AppState) -> Option<String> {
    let Some(username) = state.setup.ssh_username.clone() else {
        return None;
    };
    let password = crate::ssh::generate_password();
    let hash = match state.ssh.set_password(&username, &password).await {
        Ok(hash) => hash,
        Err(err) => {
            warn!(%err, "failed to set ssh password");
            return None;
        }
    };
    {
        let mut config = state.config.write().await;
        config.ssh_pass = Some(password.clone());
        config.ssh_pass_hash = Some(hash);
    }
    if let Err(err) = state.save_config().await {
        warn!(%err, "failed to persist config after ssh password reset");
    }
    Some(password)
}

/// Compute the current SSH status: active/inactive plus whether the
/// account's shadow hash differs from the one this daemon last recorded.
async fn current_ssh_status(state: &AppState) -> SshStatus {
    let Some(username) = state.setup.ssh_username.clone() else {
        return SshStatus::default();
    };
    let active = state.ssh.is_active().await.unwrap_or(false);
    let recorded_hash = state.config.read().await.ssh_pass_hash.clone();
    let shadow = tokio::fs::read_to_string("/etc/shadow").await.unwrap_or_default();
    let current_hash = crate::ssh::parse_shadow_hash(&shadow, &username);
    let user_pass_changed = match (recorded_hash, current_hash) {
        (Some(recorded), Some(current)) => recorded != current,
        _ => false,
    };
    SshStatus {
        username: Some(username),
        active,
        user_pass_changed,
    }
}

fn to_wire_ssh(status: &SshStatus) -> wire_protocol::SshStatus {
    crate::status::ssh_status(status)
}

/// Broadcast `{status:{ssh:...}}` only when it differs from the cached
/// value (§4.10 "broadcast only on change").
pub async fn refresh_ssh_status(state: &AppState) {
    let current = current_ssh_status(state).await;
    let mut cache = state.ssh_status_cache.lock().await;
    if cache.as_ref() == Some(&current) {
        return;
    }
    *cache = Some(current.clone());
    drop(cache);
    crate::local_hub::broadcast(
        state,
        ServerMessage::Status(StatusUpdate {
            ssh: Some(to_wire_ssh(&current)),
            ..Default::default()
        }),
        0,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_error_builds_a_ten_second_dismissable_notification() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let conn = Arc::new(Connection::new(false, tx, 0));
        notify_error(&conn, "boom");
        let frame = rx.try_recv().expect("a frame was sent");
        match frame.message {
            ServerMessage::Notification(NotificationUpdate::Show(views)) => {
                assert_eq!(views.len(), 1);
                assert_eq!(views[0].msg, "boom");
                assert_eq!(views[0].duration, 10);
            }
            other => panic!("expected a notification, got {other:?}"),
        }
    }
}
