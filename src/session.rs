//! Per-connection state (§3 "Connection") and the registry of live
//! connections the local WS hub (C8) and remote tunnel (C9) broadcast
//! through. One [`Connection`] exists per live local WebSocket plus one
//! for the tunnel; both are registered here so broadcast helpers don't
//! need to know which transport a connection rides on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use wire_protocol::ServerFrame;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// One live connection: a local WS client, or the single remote tunnel.
/// Mutable fields use plain atomics/`Mutex` rather than async locks —
/// nothing here is ever held across an `.await`.
pub struct Connection {
    pub id: u64,
    pub is_remote: bool,
    authenticated: AtomicBool,
    token: Mutex<Option<String>>,
    last_active_ms: AtomicI64,
    /// Set while a message that originated from the remote tunnel is
    /// being handled, so the reply can be tagged for the relay to route
    /// back to the right remote client (§3, §4.8).
    sender_id: Mutex<Option<String>>,
    outbound: tokio::sync::mpsc::UnboundedSender<ServerFrame>,
}

impl Connection {
    pub fn new(is_remote: bool, outbound: tokio::sync::mpsc::UnboundedSender<ServerFrame>, now_ms: i64) -> Self {
        Self {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            is_remote,
            authenticated: AtomicBool::new(false),
            token: Mutex::new(None),
            last_active_ms: AtomicI64::new(now_ms),
            sender_id: Mutex::new(None),
            outbound,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    pub fn set_authenticated(&self, token: Option<String>) {
        self.authenticated.store(true, Ordering::Release);
        *self.token.lock().expect("lock not poisoned") = token;
    }

    pub fn clear_authenticated(&self) {
        self.authenticated.store(false, Ordering::Release);
        *self.token.lock().expect("lock not poisoned") = None;
    }

    pub fn token(&self) -> Option<String> {
        self.token.lock().expect("lock not poisoned").clone()
    }

    pub fn touch(&self, now_ms: i64) {
        self.last_active_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn last_active_ms(&self) -> i64 {
        self.last_active_ms.load(Ordering::Relaxed)
    }

    pub fn sender_id(&self) -> Option<String> {
        self.sender_id.lock().expect("lock not poisoned").clone()
    }

    pub fn set_sender_id(&self, id: Option<String>) {
        *self.sender_id.lock().expect("lock not poisoned") = id;
    }

    /// Deliver one frame. Silently drops it if the connection's task has
    /// already exited (§5 "any pending reply addressed to a dead
    /// connection is silently dropped").
    pub fn send(&self, frame: ServerFrame) {
        let _ = self.outbound.send(frame);
    }
}

/// The set of live connections, keyed by id. Local clients and the one
/// tunnel connection (when attached) share this registry so broadcast
/// helpers can treat them uniformly except where the wire protocol
/// distinguishes them (mirroring to the tunnel, sender-id tagging).
#[derive(Default)]
pub struct ConnectionRegistry {
    conns: RwLock<HashMap<u64, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn insert(&self, conn: Arc<Connection>) {
        self.conns.write().expect("lock not poisoned").insert(conn.id, conn);
    }

    pub fn remove(&self, id: u64) {
        self.conns.write().expect("lock not poisoned").remove(&id);
    }

    pub fn get(&self, id: u64) -> Option<Arc<Connection>> {
        self.conns.read().expect("lock not poisoned").get(&id).cloned()
    }

    /// Snapshot of every live connection, for broadcast fan-out. Cloning
    /// the `Arc`s and releasing the lock before sending keeps the lock
    /// uncontended across any per-recipient work.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.conns.read().expect("lock not poisoned").values().cloned().collect()
    }

    /// All connections that are local (not the tunnel), authenticated,
    /// and active within the window ending at `active_min`.
    pub fn local_recipients(&self, active_min: i64, except: Option<u64>) -> Vec<Arc<Connection>> {
        self.snapshot()
            .into_iter()
            .filter(|c| !c.is_remote)
            .filter(|c| c.is_authenticated())
            .filter(|c| c.last_active_ms() >= active_min)
            .filter(|c| Some(c.id) != except)
            .collect()
    }

    pub fn remote(&self) -> Option<Arc<Connection>> {
        self.snapshot().into_iter().find(|c| c.is_remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(is_remote: bool) -> (Arc<Connection>, tokio::sync::mpsc::UnboundedReceiver<ServerFrame>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Arc::new(Connection::new(is_remote, tx, 0)), rx)
    }

    #[test]
    fn authentication_state_round_trips() {
        let (conn, _rx) = conn(false);
        assert!(!conn.is_authenticated());
        conn.set_authenticated(Some("tok".to_owned()));
        assert!(conn.is_authenticated());
        assert_eq!(conn.token().as_deref(), Some("tok"));
        conn.clear_authenticated();
        assert!(!conn.is_authenticated());
        assert_eq!(conn.token(), None);
    }

    #[test]
    fn registry_filters_local_recipients_by_auth_activity_and_except() {
        let registry = ConnectionRegistry::default();
        let (a, _rx_a) = conn(false);
        a.set_authenticated(None);
        a.touch(100);
        let (b, _rx_b) = conn(false);
        b.touch(100);
        let (c, _rx_c) = conn(true);
        c.set_authenticated(None);
        c.touch(100);
        registry.insert(a.clone());
        registry.insert(b.clone());
        registry.insert(c.clone());

        let recipients = registry.local_recipients(50, None);
        assert_eq!(recipients.len(), 1, "only `a` is local, authed, and active");
        assert_eq!(recipients[0].id, a.id);

        let recipients = registry.local_recipients(50, Some(a.id));
        assert!(recipients.is_empty());
    }

    #[test]
    fn remote_finds_the_single_tunnel_connection() {
        let registry = ConnectionRegistry::default();
        let (local, _rx) = conn(false);
        let (remote, _rx2) = conn(true);
        registry.insert(local);
        registry.insert(remote.clone());
        assert_eq!(registry.remote().unwrap().id, remote.id);
    }

    #[test]
    fn send_to_a_dropped_receiver_is_a_silent_no_op() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let conn = Connection::new(false, tx, 0);
        drop(rx);
        conn.send(ServerFrame::new(wire_protocol::ServerMessage::Status(Default::default())));
    }
}
