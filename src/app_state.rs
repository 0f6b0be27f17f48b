//! The process-wide shared state (§9 "Global mutable state"): one
//! [`AppState`] is constructed in `main` and cloned into every connection
//! task, poll loop, and HTTP handler. Each field owns its own lock at the
//! granularity the spec's suspension-point rule allows — no lock here is
//! ever held across an `.await`; callers re-acquire after any suspension
//! (subprocess spawn/wait, DNS resolve, bcrypt hash, WS send) per §5.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use pkg_update::PackageManager;
use tokio::sync::{Mutex, RwLock, broadcast};
use ui_log::UiLogger;

use crate::config::{Config, ConfigError, PersistentTokens, Setup};
use crate::netif::InterfaceTable;
use crate::notifications::NotificationBus;
use crate::pipelines::Pipeline;
use crate::session::ConnectionRegistry;
use crate::ssh::SshControl;
use crate::streaming::StreamingRuntime;
use crate::update::UpdateState;
use crate::wifi::{NmcliRunner, WifiIndex};

#[derive(Clone)]
pub struct AppState {
    pub setup: Arc<Setup>,
    pub config_path: Arc<PathBuf>,
    pub tokens_path: Arc<PathBuf>,

    pub config: Arc<RwLock<Config>>,
    pub persistent_tokens: Arc<RwLock<PersistentTokens>>,
    pub transient_tokens: Arc<RwLock<HashSet<String>>>,

    pub notifications: Arc<Mutex<NotificationBus>>,
    pub interfaces: Arc<RwLock<InterfaceTable>>,
    pub wifi: Arc<RwLock<WifiIndex>>,
    pub streaming: Arc<Mutex<StreamingRuntime>>,
    pub pipelines: Arc<Vec<Pipeline>>,

    pub connections: Arc<ConnectionRegistry>,
    /// Set while the tunnel is authenticated with the relay; cleared on
    /// disconnect. Read by `status` broadcasts and the remote-rekey path.
    pub remote_authenticated: Arc<AtomicBool>,
    /// Round-robins over the enabled-interface table when the tunnel
    /// picks a source address to bind its outbound socket to (§4.8).
    pub uplink_rr: Arc<std::sync::atomic::AtomicUsize>,
    /// Set just before a force-terminate the caller knows is benign
    /// (rekey, stale keepalive) so the close handler doesn't also
    /// broadcast a spurious `{status:{remote:{error:"network"}}}`.
    pub suppress_next_network_error: Arc<AtomicBool>,
    /// Notified to force the tunnel's current connection closed and
    /// immediately re-evaluate `config.remote_key` (rekey).
    pub rekey_notify: Arc<tokio::sync::Notify>,

    pub update: Arc<UpdateState>,
    pub package_manager: Arc<PackageManager>,
    pub ssh: Arc<SshControl>,
    pub nmcli: Arc<NmcliRunner>,
    /// Last broadcast `{status:{ssh:...}}` payload, so the SSH poller only
    /// broadcasts on change (§4.10).
    pub ssh_status_cache: Arc<Mutex<Option<crate::ssh::SshStatus>>>,

    /// Secondary in-memory log surface: mirrors OS-call failures into a
    /// bounded ring buffer alongside `tracing`. Not exposed over the wire
    /// protocol today.
    pub ui_log: Arc<UiLogger<String>>,
}

impl AppState {
    /// Load the three on-disk documents and discover pipelines, but do
    /// not yet start any background task. `main` calls this, then
    /// `Setup::check_executables`, before spawning pollers.
    pub fn load(setup_path: &PathBuf, config_path: PathBuf, tokens_path: PathBuf) -> Result<Self, ConfigError> {
        let setup = Setup::load(setup_path)?;
        let config = Config::load_or_default(&config_path)?;
        let persistent_tokens = PersistentTokens::load_or_default(&tokens_path)?;
        let pipelines = crate::pipelines::discover_pipelines(&setup.pipeline_root, &setup.platform);
        let upgrades_enabled = setup.upgrades_enabled;

        Ok(Self {
            setup: Arc::new(setup),
            config_path: Arc::new(config_path),
            tokens_path: Arc::new(tokens_path),
            config: Arc::new(RwLock::new(config)),
            persistent_tokens: Arc::new(RwLock::new(persistent_tokens)),
            transient_tokens: Arc::new(RwLock::new(HashSet::new())),
            notifications: Arc::new(Mutex::new(NotificationBus::default())),
            interfaces: Arc::new(RwLock::new(InterfaceTable::default())),
            wifi: Arc::new(RwLock::new(WifiIndex::default())),
            streaming: Arc::new(Mutex::new(StreamingRuntime::new())),
            pipelines: Arc::new(pipelines),
            connections: Arc::new(ConnectionRegistry::default()),
            remote_authenticated: Arc::new(AtomicBool::new(false)),
            uplink_rr: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
            suppress_next_network_error: Arc::new(AtomicBool::new(false)),
            rekey_notify: Arc::new(tokio::sync::Notify::new()),
            update: Arc::new(UpdateState::new(upgrades_enabled)),
            package_manager: Arc::new(PackageManager::default()),
            ssh: Arc::new(SshControl),
            nmcli: Arc::new(NmcliRunner),
            ssh_status_cache: Arc::new(Mutex::new(None)),
            ui_log: Arc::new(UiLogger::with_buffer(broadcast::channel(64).0, |entry| entry, 200)),
        })
    }

    pub async fn save_config(&self) -> Result<(), ConfigError> {
        self.config.read().await.save(&self.config_path)
    }

    pub async fn save_persistent_tokens(&self) -> Result<(), ConfigError> {
        self.persistent_tokens.read().await.save(&self.tokens_path)
    }

    pub async fn token_authenticates(&self, token: &str) -> bool {
        if self.transient_tokens.read().await.contains(token) {
            return true;
        }
        self.persistent_tokens.read().await.contains(token)
    }

    /// `logout`: remove `token` from both the persistent and transient
    /// sets, persisting the token file if it had been in the persistent
    /// set (§4.5).
    pub async fn revoke_token(&self, token: &str) {
        self.transient_tokens.write().await.remove(token);
        let was_persistent = {
            let mut tokens = self.persistent_tokens.write().await;
            let contained = tokens.contains(token);
            tokens.remove(token);
            contained
        };
        if was_persistent {
            let _ = self.save_persistent_tokens().await;
        }
    }

    pub async fn is_streaming(&self) -> bool {
        self.streaming.lock().await.is_streaming()
    }

    pub async fn password_configured(&self) -> bool {
        self.config.read().await.password_hash.is_some()
    }
}
