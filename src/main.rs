//! `sessiond` entry point: loads the three persisted documents, reaps
//! orphaned encoder/bonder processes from a prior run, wires the axum
//! router, and spawns every background poller and the remote tunnel
//! client before serving forever. Structured after the existing server
//! binary's `main` (tracing init, `LOG_LEVEL`, `axum::serve` with
//! graceful shutdown).

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, warn};
use wire_protocol::{AvailableUpdates, ServerMessage, StatusUpdate};

use sessiond::app_state::AppState;
use sessiond::process_runner::{self, Signal};
use sessiond::router::SENSORS_ROOT;
use sessiond::{local_hub, netif, sensors, streaming, tunnel, ui_server, update, wifi};

const NETIF_POLL_INTERVAL: Duration = Duration::from_secs(1);
const WIFI_POLL_INTERVAL: Duration = Duration::from_secs(1);
const SENSORS_POLL_INTERVAL: Duration = Duration::from_secs(1);
const SSH_POLL_INTERVAL: Duration = Duration::from_secs(5);
const SYS_CLASS_NET: &str = "/sys/class/net";

#[tokio::main]
async fn main() {
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(log_level))
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "sessiond starting");

    let setup_path = env_path("SETUP_PATH", "/etc/sessiond/setup.json");
    let config_path = env_path("CONFIG_PATH", "/etc/sessiond/config.json");
    let tokens_path = env_path("TOKENS_PATH", "/etc/sessiond/auth_tokens.json");

    let state = AppState::load(&setup_path, config_path, tokens_path).unwrap_or_else(|err| {
        eprintln!("FATAL: failed to load persisted documents: {err}");
        std::process::exit(1);
    });

    if let Err(err) = state.setup.check_executables() {
        eprintln!("FATAL: {err}");
        std::process::exit(1);
    }

    reap_orphans(&state).await;

    let port: u16 = std::env::var("PORT").ok().and_then(|p| p.parse().ok()).unwrap_or(80);
    let bind_addr = format!("0.0.0.0:{port}");

    let router = ui_server::build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .unwrap_or_else(|err| {
            eprintln!("FATAL: failed to bind {bind_addr}: {err}");
            std::process::exit(1);
        });
    info!(addr = %bind_addr, "listening");

    spawn_netif_poller(state.clone());
    spawn_wifi_poller(state.clone());
    spawn_sensors_poller(state.clone());
    spawn_ssh_poller(state.clone());
    spawn_update_poller(state.clone());

    let relay_url = std::env::var("RELAY_URL").unwrap_or_else(|_| tunnel::DEFAULT_RELAY_URL.to_owned());
    tokio::spawn(tunnel::run(state.clone(), relay_url));

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap_or_else(|err| {
            warn!(%err, "server error");
        });
    info!("sessiond shut down gracefully");
}

fn env_path(var: &str, default: &str) -> PathBuf {
    std::env::var(var).map(PathBuf::from).unwrap_or_else(|_| PathBuf::from(default))
}

/// Reap any encoder/bonder left running by a prior, uncleanly-terminated
/// process (§4.6 "invoked on daemon startup to reap any orphans").
async fn reap_orphans(state: &AppState) {
    let encoder = exe_name(&state.setup.encoder_path);
    let bonder = exe_name(&state.setup.bonder_path);
    process_runner::signal_by_name(&encoder, Signal::Kill).await;
    process_runner::signal_by_name(&bonder, Signal::Kill).await;
}

fn exe_name(path: &Path) -> String {
    path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| path.display().to_string())
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

// ---------------------------------------------------------------------------
// Pollers (§4.2-§4.3, §4.9, §4.10, §1 sensors)
// ---------------------------------------------------------------------------

fn spawn_netif_poller(state: AppState) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(NETIF_POLL_INTERVAL);
        loop {
            ticker.tick().await;
            let reads = tokio::task::spawn_blocking(|| netif::read_sysfs_interfaces(Path::new(SYS_CLASS_NET)))
                .await
                .unwrap_or_default();
            let outcome = {
                let mut interfaces = state.interfaces.write().await;
                interfaces.apply_poll(reads)
            };
            local_hub::broadcast(&state, ServerMessage::Netif(state.interfaces.read().await.to_wire()), local_hub::active_min_now());

            if outcome.ip_changed && state.is_streaming().await {
                let ips = state.interfaces.read().await.enabled_ips();
                if let Err(err) = streaming::update_uplinks(&state.setup, &ips).await {
                    warn!(%err, "failed to update uplinks after interface change");
                    state.ui_log.log(format_args!("netif: failed to update uplinks: {err}"));
                }
            }
        }
    });
}

fn spawn_wifi_poller(state: AppState) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(WIFI_POLL_INTERVAL);
        loop {
            ticker.tick().await;
            wifi_poll_tick(&state).await;
        }
    });
}

async fn wifi_poll_tick(state: &AppState) {
    let Ok(devices) = state.nmcli.list_devices().await else {
        return;
    };
    let membership_changed = {
        let mut wifi = state.wifi.write().await;
        wifi.apply_devices(devices)
    };

    if membership_changed {
        if let Ok(saved) = state.nmcli.list_saved_connections().await {
            state.wifi.write().await.apply_saved_connections(saved);
        }
        let _ = state.nmcli.rescan().await;
        schedule_scan_followups(state.clone());
    }

    refresh_scan_results(state).await;
    local_hub::broadcast(state, ServerMessage::Wifi(state.wifi.read().await.to_wire()), 0);
}

async fn refresh_scan_results(state: &AppState) {
    let targets: Vec<(String, String)> =
        state.wifi.read().await.devices().iter().map(|(mac, d)| (mac.clone(), d.ifname.clone())).collect();
    for (mac, ifname) in targets {
        if let Ok(results) = state.nmcli.list_scan_results(&ifname).await {
            state.wifi.write().await.apply_scan_results(&mac, results);
        }
    }
}

/// Schedules the 1/3/5/10 s scan-result follow-ups a device-membership
/// change triggers (§4.3) — `nmcli` populates fresh results asynchronously.
fn schedule_scan_followups(state: AppState) {
    for delay in wifi::SCAN_FOLLOWUP_DELAYS {
        let state = state.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            refresh_scan_results(&state).await;
            local_hub::broadcast(&state, ServerMessage::Wifi(state.wifi.read().await.to_wire()), 0);
        });
    }
}

fn spawn_sensors_poller(state: AppState) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SENSORS_POLL_INTERVAL);
        loop {
            ticker.tick().await;
            let readings = tokio::task::spawn_blocking(|| sensors::sample(Path::new(SENSORS_ROOT))).await.unwrap_or_default();
            local_hub::broadcast(&state, ServerMessage::Sensors(readings), 0);
        }
    });
}

/// Not in §5's explicit timer list; `user_pass_changed` can only be
/// observed by polling `/etc/shadow`, so this mirrors the poller idiom
/// at a slower cadence than the 1 s network/sensor timers.
fn spawn_ssh_poller(state: AppState) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SSH_POLL_INTERVAL);
        loop {
            ticker.tick().await;
            if state.setup.ssh_username.is_some() {
                sessiond::router::refresh_ssh_status(&state).await;
            }
        }
    });
}

fn spawn_update_poller(state: AppState) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(update::CATALOG_REFRESH_INTERVAL);
        loop {
            ticker.tick().await;
            if !state.update.enabled {
                continue;
            }
            let now = chrono::Utc::now();
            let is_streaming = state.is_streaming().await;
            if !state.update.catalog_refresh_due(now, is_streaming) {
                continue;
            }
            match update::refresh_catalog(&state.package_manager, &state.update, now).await {
                Ok(plan) => {
                    local_hub::broadcast(
                        &state,
                        ServerMessage::Status(StatusUpdate {
                            available_updates: Some(AvailableUpdates {
                                package_count: plan.package_count,
                                download_size: plan.download_size,
                            }),
                            ..Default::default()
                        }),
                        0,
                    );
                }
                Err(err) => warn!(%err, "failed to refresh update catalog"),
            }
        }
    });
}

