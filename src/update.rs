//! Update orchestrator (C10): drives [`pkg_update`] to refresh the
//! package catalog on a schedule, report available updates, and run a
//! single-flight upgrade with progress broadcasts. Exits the process on
//! a successful upgrade so a restarting supervisor can bring the daemon
//! back up on the new packages (§4.9, §9 open question — gated by
//! [`crate::config::Setup::restart_on_update`]).

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use pkg_update::{PackageManager, UpdateOutcome, UpdateProgress, UpgradePlan};

pub const CATALOG_REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);
pub const CATALOG_MAX_AGE: chrono::Duration = chrono::Duration::days(1);
pub const CATALOG_RETRY_DELAY: Duration = Duration::from_secs(60 * 60);

/// The update orchestrator's state. `updating` is a simple single-flight
/// guard: `doUpdate` is rejected while it's already true.
pub struct UpdateState {
    pub enabled: bool,
    updating: AtomicBool,
    last_catalog_refresh: std::sync::Mutex<Option<DateTime<Utc>>>,
    pub last_plan: std::sync::Mutex<Option<UpgradePlan>>,
}

impl UpdateState {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            updating: AtomicBool::new(false),
            last_catalog_refresh: std::sync::Mutex::new(None),
            last_plan: std::sync::Mutex::new(None),
        }
    }

    pub fn is_updating(&self) -> bool {
        self.updating.load(Ordering::Acquire)
    }

    /// Returns `false` (and leaves state untouched) if an update is
    /// already in flight — the single-flight guard.
    fn try_begin(&self) -> bool {
        self.updating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn finish(&self) {
        self.updating.store(false, Ordering::Release);
    }

    /// Whether a catalog refresh is due: not streaming, not updating, and
    /// the last successful refresh (if any) is at least a day old.
    pub fn catalog_refresh_due(&self, now: DateTime<Utc>, is_streaming: bool) -> bool {
        if !self.enabled || is_streaming || self.is_updating() {
            return false;
        }
        match *self.last_catalog_refresh.lock().expect("lock not poisoned") {
            None => true,
            Some(last) => now - last >= CATALOG_MAX_AGE,
        }
    }

    fn mark_catalog_refreshed(&self, now: DateTime<Utc>) {
        *self.last_catalog_refresh.lock().expect("lock not poisoned") = Some(now);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DoUpdateError {
    #[error("streaming is active")]
    Streaming,
    #[error("an update is already in progress")]
    AlreadyUpdating,
}

/// Refresh the catalog and re-derive the available-update counts. On
/// failure the caller should retry in [`CATALOG_RETRY_DELAY`] without
/// marking the refresh as done.
pub async fn refresh_catalog(
    pm: &PackageManager,
    state: &UpdateState,
    now: DateTime<Utc>,
) -> Result<UpgradePlan, pkg_update::UpdateError> {
    pm.refresh_catalog().await?;
    let plan = pm.simulate_upgrade().await?;
    state.mark_catalog_refreshed(now);
    *state.last_plan.lock().expect("lock not poisoned") = Some(plan);
    Ok(plan)
}

/// Run `doUpdate()`: rejected while streaming or already updating.
/// `on_progress` is called on every monotone counter bump; the final
/// callback with the terminal [`UpdateOutcome`] always fires exactly
/// once, even on failure.
pub async fn do_update<F>(
    pm: &PackageManager,
    state: &UpdateState,
    is_streaming: bool,
    total: u32,
    on_progress: F,
) -> Result<UpdateOutcome, DoUpdateError>
where
    F: FnMut(UpdateProgress),
{
    if is_streaming {
        return Err(DoUpdateError::Streaming);
    }
    if !state.try_begin() {
        return Err(DoUpdateError::AlreadyUpdating);
    }
    let outcome = pm
        .run_upgrade(total, on_progress)
        .await
        .unwrap_or_else(|err| UpdateOutcome::Failed(err.to_string()));
    state.finish();
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(day_offset: i64) -> DateTime<Utc> {
        DateTime::UNIX_EPOCH + chrono::Duration::days(day_offset)
    }

    #[test]
    fn catalog_refresh_is_due_on_first_check_and_after_a_day() {
        let state = UpdateState::new(true);
        assert!(state.catalog_refresh_due(t(0), false));
        state.mark_catalog_refreshed(t(0));
        assert!(!state.catalog_refresh_due(t(0), false));
        assert!(state.catalog_refresh_due(t(1), false));
    }

    #[test]
    fn catalog_refresh_never_due_while_streaming_or_disabled() {
        let state = UpdateState::new(true);
        assert!(!state.catalog_refresh_due(t(0), true));
        let disabled = UpdateState::new(false);
        assert!(!disabled.catalog_refresh_due(t(0), false));
    }

    #[test]
    fn single_flight_guard_rejects_concurrent_begin() {
        let state = UpdateState::new(true);
        assert!(state.try_begin());
        assert!(!state.try_begin(), "second begin must be rejected");
        state.finish();
        assert!(state.try_begin());
    }
}
