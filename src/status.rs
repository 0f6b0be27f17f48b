//! Builds the `{"status": ...}` snapshot (§6) from the current
//! [`AppState`]. Used on initial attach (local and remote) and after any
//! mutation that affects one of its fields.

use wire_protocol::{AvailableUpdates, RemoteAuthError, RemoteStatus, SshStatus, StatusUpdate, UpdateProgress};

use crate::app_state::AppState;

pub async fn build(state: &AppState, set_password: bool) -> StatusUpdate {
    let is_streaming = state.is_streaming().await;
    let available_updates = state
        .update
        .last_plan
        .lock()
        .expect("lock not poisoned")
        .map(|plan| AvailableUpdates {
            package_count: plan.package_count,
            download_size: plan.download_size,
        });

    StatusUpdate {
        is_streaming: Some(is_streaming),
        available_updates,
        updating: state.update.is_updating().then(UpdateProgress::default),
        ssh: None,
        remote: None,
        set_password: set_password.then_some(true),
    }
}

pub fn remote_connected() -> RemoteStatus {
    RemoteStatus::Connected(true)
}

pub fn remote_error(kind: RemoteAuthError) -> RemoteStatus {
    RemoteStatus::Error { error: kind }
}

pub fn ssh_status(status: &crate::ssh::SshStatus) -> SshStatus {
    SshStatus {
        username: status.username.clone(),
        active: status.active,
        user_pass: status.user_pass_changed,
    }
}
