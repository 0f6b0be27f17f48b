//! Process runner (C2): supervises a single long-running child program —
//! the encoder or the bonder — restarting it with a cooldown while a
//! shared supervision flag stays set, and signalling it by executable
//! name to prompt a re-read of its runtime files.
//!
//! Modeled as one supervisor task per logical child with its own
//! cancellation token, per §9's design note.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Hangup,
    Kill,
}

/// A supervised child process: spawns `argv` repeatedly while `running`
/// stays true, waiting `cooldown` between a child's exit and the next
/// spawn attempt.
pub struct Supervisor {
    name: &'static str,
    argv: Arc<Vec<String>>,
    cooldown: Duration,
    token: CancellationToken,
    current_pid: Arc<Mutex<Option<u32>>>,
}

impl Supervisor {
    pub fn new(name: &'static str, argv: Vec<String>, cooldown: Duration) -> Self {
        Self {
            name,
            argv: Arc::new(argv),
            cooldown,
            token: CancellationToken::new(),
            current_pid: Arc::new(Mutex::new(None)),
        }
    }

    /// Run the supervise loop until `running` goes false or this
    /// supervisor's token is cancelled, then kill any in-flight child.
    pub async fn run(self: Arc<Self>, mut running: watch::Receiver<bool>) {
        loop {
            if !*running.borrow() || self.token.is_cancelled() {
                break;
            }
            let Some(argv) = self.argv.split_first() else {
                warn!(name = self.name, "supervisor has no argv, exiting");
                break;
            };
            let (program, args) = argv;
            let spawned = Command::new(program)
                .args(args)
                .stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .spawn();

            let mut child = match spawned {
                Ok(child) => child,
                Err(err) => {
                    warn!(name = self.name, %err, "failed to spawn child");
                    if !self.sleep_or_stop(&mut running).await {
                        break;
                    }
                    continue;
                }
            };
            *self.current_pid.lock().await = child.id();
            info!(name = self.name, pid = ?child.id(), "child spawned");

            tokio::select! {
                status = child.wait() => {
                    match status {
                        Ok(status) => info!(name = self.name, %status, "child exited"),
                        Err(err) => warn!(name = self.name, %err, "error waiting on child"),
                    }
                }
                () = self.token.cancelled() => {
                    kill_child(&mut child).await;
                    *self.current_pid.lock().await = None;
                    break;
                }
                _ = running.changed() => {
                    if !*running.borrow() {
                        kill_child(&mut child).await;
                        *self.current_pid.lock().await = None;
                        break;
                    }
                }
            }
            *self.current_pid.lock().await = None;

            if !self.sleep_or_stop(&mut running).await {
                break;
            }
        }
    }

    /// Sleeps `cooldown`, returning `false` if streaming stopped or this
    /// supervisor was cancelled while waiting (so the caller should exit
    /// the loop without spawning again).
    async fn sleep_or_stop(&self, running: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            () = tokio::time::sleep(self.cooldown) => *running.borrow() && !self.token.is_cancelled(),
            () = self.token.cancelled() => false,
            _ = running.changed() => *running.borrow(),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }
}

async fn kill_child(child: &mut Child) {
    let _ = child.start_kill();
    let _ = child.wait().await;
}

/// Send a signal to every live process whose executable basename matches
/// `name`, via `pkill -SIGHUP <name>` / `pkill -SIGKILL <name>`. This is
/// the sole coordination primitive the encoder/bonder use to learn their
/// runtime files changed (hangup) or that they should die (kill).
pub async fn signal_by_name(name: &str, signal: Signal) {
    let flag = match signal {
        Signal::Hangup => "-HUP",
        Signal::Kill => "-KILL",
    };
    let basename = PathBuf::from(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_owned());
    let result = Command::new("pkill")
        .args([flag, &basename])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match result {
        // pkill exits 1 when no process matched, which is not an error here.
        Ok(status) if status.success() || status.code() == Some(1) => {
            info!(process = %basename, ?signal, "signalled");
        }
        Ok(status) => warn!(process = %basename, ?signal, %status, "pkill exited unexpectedly"),
        Err(err) => warn!(process = %basename, ?signal, %err, "failed to invoke pkill"),
    }
}
