//! Notification bus (C5): in-memory pub/sub of transient and persistent
//! user notifications, with rate limiting on repeated persistent sends
//! and TTL-based expiry.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use wire_protocol::NotificationView;

const RATE_LIMIT: chrono::Duration = chrono::Duration::seconds(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Success,
    Warning,
    Error,
}

impl NotificationKind {
    fn as_wire(self) -> &'static str {
        match self {
            NotificationKind::Success => "success",
            NotificationKind::Warning => "warning",
            NotificationKind::Error => "error",
        }
    }
}

/// A persistent notification's stored state, keyed by name in the bus.
#[derive(Debug, Clone)]
struct StoredNotification {
    kind: NotificationKind,
    msg: String,
    duration_secs: u64,
    dismissable: bool,
    updated: DateTime<Utc>,
    last_sent: Option<DateTime<Utc>>,
}

impl StoredNotification {
    /// Seconds remaining until expiry, or `None` if the notification is
    /// permanent (`duration_secs == 0`).
    fn remaining_secs(&self, now: DateTime<Utc>) -> Option<i64> {
        if self.duration_secs == 0 {
            return None;
        }
        let elapsed = (now - self.updated).num_seconds();
        Some(self.duration_secs as i64 - elapsed)
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.remaining_secs(now), Some(remaining) if remaining <= 0)
    }

    fn to_view(&self, name: &str, now: DateTime<Utc>) -> NotificationView {
        let duration = match self.remaining_secs(now) {
            Some(remaining) => remaining.max(0) as u64,
            None => 0,
        };
        NotificationView {
            name: Some(name.to_owned()),
            kind: self.kind.as_wire(),
            msg: self.msg.clone(),
            duration,
            dismissable: self.dismissable,
        }
    }
}

/// Outcome of [`NotificationBus::send`], telling the caller who to
/// deliver the resulting frame to (if anyone).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Deliver `view` to the single connection that asked for it.
    Unicast(NotificationView),
    /// Deliver `view` to all authenticated connections.
    Broadcast(NotificationView),
    /// Rate-limited: `updated` was refreshed but no frame should go out.
    Suppressed,
}

#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("persistent notifications must be broadcast, not unicast")]
    PersistentRequiresBroadcast,
}

#[derive(Debug, Default)]
pub struct NotificationBus {
    persistent: BTreeMap<String, StoredNotification>,
}

impl NotificationBus {
    /// `send(conn?, name, kind, msg, duration, persistent, dismissable)`.
    /// `unicast` is `true` when this send targets one connection (`conn`
    /// is `Some` in the spec's terms); persistent notifications must not
    /// be unicast.
    #[allow(clippy::too_many_arguments)]
    pub fn send(
        &mut self,
        now: DateTime<Utc>,
        unicast: bool,
        name: &str,
        kind: NotificationKind,
        msg: &str,
        duration_secs: u64,
        persistent: bool,
        dismissable: bool,
    ) -> Result<SendOutcome, NotificationError> {
        if persistent && unicast {
            return Err(NotificationError::PersistentRequiresBroadcast);
        }

        if !persistent {
            let view = NotificationView {
                name: None,
                kind: kind.as_wire(),
                msg: msg.to_owned(),
                duration: duration_secs,
                dismissable,
            };
            return Ok(if unicast {
                SendOutcome::Unicast(view)
            } else {
                SendOutcome::Broadcast(view)
            });
        }

        let rate_limited = self
            .persistent
            .get(name)
            .and_then(|prev| prev.last_sent)
            .is_some_and(|last_sent| now - last_sent < RATE_LIMIT);

        let entry = self
            .persistent
            .entry(name.to_owned())
            .or_insert_with(|| StoredNotification {
                kind,
                msg: msg.to_owned(),
                duration_secs,
                dismissable,
                updated: now,
                last_sent: None,
            });
        entry.kind = kind;
        entry.msg = msg.to_owned();
        entry.duration_secs = duration_secs;
        entry.dismissable = dismissable;
        entry.updated = now;

        if rate_limited {
            return Ok(SendOutcome::Suppressed);
        }
        entry.last_sent = Some(now);
        Ok(SendOutcome::Broadcast(entry.to_view(name, now)))
    }

    /// `remove(name)`: deletes the persistent entry, returning a removal
    /// view for the caller to broadcast, or `None` if no such entry
    /// existed.
    pub fn remove(&mut self, name: &str) -> bool {
        self.persistent.remove(name).is_some()
    }

    /// Persistent entries to replay to a newly-attached client: every
    /// entry whose remaining time is still positive (or permanent), with
    /// `duration` rewritten to what's left.
    pub fn replay_for_new_client(&mut self, now: DateTime<Utc>) -> Vec<NotificationView> {
        self.persistent.retain(|_, n| !n.is_expired(now));
        self.persistent
            .iter()
            .map(|(name, n)| n.to_view(name, now))
            .collect()
    }
}
