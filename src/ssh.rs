//! SSH control (C11): start/stop the SSH service, randomize the account
//! password, and detect an out-of-band password change by comparing the
//! `/etc/shadow` hash this daemon last set against the account's current
//! one.
//!
//! `systemctl`/`passwd` output is scraped the same way the Wi-Fi manager
//! scrapes `nmcli`: a thin process-spawning wrapper around pure parsers,
//! so the parsers get the transcript-driven unit tests from §10.4 without
//! a real `systemd`/`shadow` file on the test box.

use std::process::Stdio;

use rand::Rng;
use rand::distributions::Alphanumeric;
use tokio::process::Command;

const GENERATED_PASSWORD_LEN: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SshStatus {
    pub username: Option<String>,
    pub active: bool,
    /// True when the account's current shadow hash differs from the
    /// last one this daemon itself set — i.e. the password was changed
    /// out-of-band.
    pub user_pass_changed: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum SshError {
    #[error("no SSH username configured in setup")]
    NoUsername,
    #[error("failed to run {program}: {source}")]
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
}

/// `systemctl is-active ssh` — parses the single-line stdout, trimmed.
pub fn parse_is_active(stdout: &str) -> bool {
    stdout.trim() == "active"
}

/// The relevant line of `/etc/shadow` is `username:hash:...`; extract the
/// hash field, or `None` if the user has no entry.
pub fn parse_shadow_hash(shadow_contents: &str, username: &str) -> Option<String> {
    shadow_contents.lines().find_map(|line| {
        let mut fields = line.split(':');
        let name = fields.next()?;
        let hash = fields.next()?;
        (name == username).then(|| hash.to_owned())
    })
}

/// Generate a fresh 20-character URL-safe password for `reset_ssh_pass`.
pub fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_PASSWORD_LEN)
        .map(char::from)
        .collect()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SshControl;

impl SshControl {
    pub async fn is_active(&self) -> Result<bool, SshError> {
        let output = Command::new("systemctl")
            .args(["is-active", "ssh"])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| SshError::Spawn {
                program: "systemctl is-active",
                source,
            })?;
        Ok(parse_is_active(&String::from_utf8_lossy(&output.stdout)))
    }

    pub async fn enable(&self) -> Result<(), SshError> {
        self.run_systemctl("enable").await?;
        self.run_systemctl("start").await
    }

    pub async fn disable(&self) -> Result<(), SshError> {
        self.run_systemctl("stop").await?;
        self.run_systemctl("disable").await
    }

    async fn run_systemctl(&self, verb: &'static str) -> Result<(), SshError> {
        let status = Command::new("systemctl")
            .args([verb, "ssh"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|source| SshError::Spawn {
                program: "systemctl",
                source,
            })?;
        if !status.success() {
            return Err(SshError::NonZeroExit {
                program: "systemctl",
                status,
            });
        }
        Ok(())
    }

    /// Set `username`'s password via `chpasswd`, returning the plaintext
    /// (for display to the authenticated operator) and the shadow hash
    /// the system produced, so the caller can record both in config.
    pub async fn set_password(&self, username: &str, password: &str) -> Result<String, SshError> {
        use tokio::io::AsyncWriteExt;
        let mut child = Command::new("chpasswd")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| SshError::Spawn {
                program: "chpasswd",
                source,
            })?;
        let mut stdin = child.stdin.take().expect("stdin piped");
        let payload = format!("{username}:{password}\n");
        let _ = stdin.write_all(payload.as_bytes()).await;
        drop(stdin);
        let status = child.wait().await.map_err(|source| SshError::Spawn {
            program: "chpasswd",
            source,
        })?;
        if !status.success() {
            return Err(SshError::NonZeroExit {
                program: "chpasswd",
                status,
            });
        }
        let shadow = tokio::fs::read_to_string("/etc/shadow").await.unwrap_or_default();
        Ok(parse_shadow_hash(&shadow, username).unwrap_or_default())
    }
}
