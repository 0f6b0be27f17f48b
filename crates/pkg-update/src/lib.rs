// pkg-update: drives the system package manager to check for, and apply,
// OS package upgrades for the appliance.
//
// Everything here is a thin wrapper around `apt-get`/`dpkg` invocations plus
// a pure parser from their stdout to progress counters. The parser is kept
// separate from the process-spawning code so it can be unit-tested against
// recorded transcripts instead of a real package manager.

use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

/// Outcome of a catalog refresh + simulated upgrade (`apt-get update` then
/// `apt-get -s dist-upgrade`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpgradePlan {
    pub package_count: u32,
    pub download_size: u64,
}

/// Progress counters for an in-flight upgrade. Monotone and clamped to
/// `total` by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpdateProgress {
    pub downloading: u32,
    pub unpacking: u32,
    pub setting_up: u32,
    pub total: u32,
}

/// Terminal result of a `run_upgrade` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Success,
    Failed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with status {status}")]
    NonZeroExit {
        program: &'static str,
        status: std::process::ExitStatus,
    },
    #[error("failed to read {program} output: {0}")]
    Io(std::io::Error),
}

/// Names of the package-manager binaries invoked. Exposed so tests can point
/// at a fake script instead of the real `apt-get`.
#[derive(Debug, Clone)]
pub struct PackageManager {
    pub apt_get: String,
}

impl Default for PackageManager {
    fn default() -> Self {
        Self {
            apt_get: "apt-get".to_owned(),
        }
    }
}

impl PackageManager {
    /// `apt-get update -qq`. Refreshes the local package index; does not
    /// change any installed package.
    pub async fn refresh_catalog(&self) -> Result<(), UpdateError> {
        let status = Command::new(&self.apt_get)
            .args(["update", "-qq"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|source| UpdateError::Spawn {
                program: "apt-get update",
                source,
            })?;
        if !status.success() {
            return Err(UpdateError::NonZeroExit {
                program: "apt-get update",
                status,
            });
        }
        Ok(())
    }

    /// `apt-get -s dist-upgrade`: a dry run that reports what an upgrade
    /// would do without installing anything. Parsed for the package count
    /// and total download size.
    pub async fn simulate_upgrade(&self) -> Result<UpgradePlan, UpdateError> {
        let output = Command::new(&self.apt_get)
            .args(["-s", "dist-upgrade"])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| UpdateError::Spawn {
                program: "apt-get -s dist-upgrade",
                source,
            })?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_simulated_upgrade(&stdout))
    }

    /// Spawn `apt-get dist-upgrade -y` with non-interactive flags and feed
    /// a progress counter to `on_progress` as dpkg status lines arrive.
    /// Returns the terminal outcome once the process exits.
    pub async fn run_upgrade<F>(&self, total: u32, mut on_progress: F) -> Result<UpdateOutcome, UpdateError>
    where
        F: FnMut(UpdateProgress),
    {
        let mut child = Command::new(&self.apt_get)
            .args([
                "dist-upgrade",
                "-y",
                "-o",
                "Dpkg::Options::=--force-confold",
            ])
            .env("DEBIAN_FRONTEND", "noninteractive")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| UpdateError::Spawn {
                program: "apt-get dist-upgrade",
                source,
            })?;

        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");

        let mut progress = UpdateProgress {
            total,
            ..UpdateProgress::default()
        };

        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_buf = String::new();
        let mut stderr_lines = BufReader::new(stderr).lines();

        loop {
            tokio::select! {
                line = stdout_lines.next_line() => {
                    match line.map_err(UpdateError::Io)? {
                        Some(line) => {
                            if apply_progress_line(&line, &mut progress) {
                                debug!(?progress, "upgrade progress");
                                on_progress(progress);
                            }
                        }
                        None => break,
                    }
                }
                line = stderr_lines.next_line() => {
                    if let Some(line) = line.map_err(UpdateError::Io)? {
                        warn!(%line, "apt-get stderr");
                        stderr_buf.push_str(&line);
                        stderr_buf.push('\n');
                    }
                }
            }
        }

        let status = child.wait().await.map_err(UpdateError::Io)?;
        if status.success() {
            Ok(UpdateOutcome::Success)
        } else {
            Ok(UpdateOutcome::Failed(stderr_buf))
        }
    }
}

/// Parse a single line of `apt-get dist-upgrade -y` stdout, mutating
/// `progress` in place. Returns whether the line advanced a counter (so the
/// caller only emits a broadcast on real progress).
///
/// Counters are clamped to `total`: a noisy or unexpected transcript can
/// never push them past the originally reported package count.
fn apply_progress_line(line: &str, progress: &mut UpdateProgress) -> bool {
    let bump = |counter: &mut u32, total: u32| {
        if *counter < total {
            *counter += 1;
            true
        } else {
            false
        }
    };

    if line.starts_with("Get:") {
        bump(&mut progress.downloading, progress.total)
    } else if line.starts_with("Unpacking ") || line.starts_with("Preparing to unpack ") {
        bump(&mut progress.unpacking, progress.total)
    } else if line.starts_with("Setting up ") {
        bump(&mut progress.setting_up, progress.total)
    } else {
        false
    }
}

/// Parse `apt-get -s dist-upgrade` output for:
/// `N upgraded, M newly installed, ...`
/// `Need to get X MB/kB/B of archives.`
fn parse_simulated_upgrade(stdout: &str) -> UpgradePlan {
    let mut plan = UpgradePlan::default();

    for line in stdout.lines() {
        if let Some(rest) = line.strip_suffix(" upgraded, not a real run") {
            // Some apt versions append this note to the same summary line;
            // fall through to the generic " upgraded" parse below.
            let _ = rest;
        }
        if line.contains(" upgraded, ") {
            if let Some(count) = line.split_whitespace().next().and_then(|s| s.parse().ok()) {
                plan.package_count = count;
            }
        }
        if let Some(rest) = line.strip_prefix("Need to get ") {
            if let Some(size) = parse_archive_size(rest) {
                plan.download_size = size;
            }
        }
    }

    plan
}

/// Parse the leading `<number> <unit>` of a string like
/// `"1,234 kB of archives. After this operation, ..."` into bytes.
fn parse_archive_size(text: &str) -> Option<u64> {
    let mut parts = text.split_whitespace();
    let number: String = parts.next()?.chars().filter(|c| *c != ',').collect();
    let value: f64 = number.parse().ok()?;
    let unit = parts.next()?;
    let multiplier = match unit {
        "B" => 1.0,
        "kB" => 1_000.0,
        "MB" => 1_000_000.0,
        "GB" => 1_000_000_000.0,
        _ => return None,
    };
    Some((value * multiplier) as u64)
}
