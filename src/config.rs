//! Persistent store (C1): the three on-disk documents this daemon owns —
//! the read-only setup document, the mutable config document, and the
//! auth-token set. Follows the same raw/defaulted two-stage load used by
//! the forwarder's TOML config loader, but over JSON (per §6 of the spec
//! this daemon implements) rather than TOML.
//!
//! All writes are whole-file replacements: write to a temp path in the
//! same directory, then rename, so a concurrently-starting encoder or
//! bonder never observes a half-written file.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use wire_protocol::PublicConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid value for {field}: {detail}")]
    InvalidValue { field: &'static str, detail: String },
}

// ---------------------------------------------------------------------------
// Setup document (read-only, process-wide)
// ---------------------------------------------------------------------------

/// The read-only setup document. Loaded once at startup; never rewritten
/// by this process.
#[derive(Debug, Clone)]
pub struct Setup {
    pub platform: String,
    pub encoder_path: PathBuf,
    pub bonder_path: PathBuf,
    pub pipeline_root: PathBuf,
    pub bitrate_file: PathBuf,
    pub uplinks_file: PathBuf,
    pub ssh_username: Option<String>,
    pub upgrades_enabled: bool,
    /// Decided open question (§9): whether a successful OS upgrade calls
    /// `process::exit`. Defaults to `true` to match the literal spec
    /// behavior; a deployment without a restarting supervisor can set
    /// this to `false` in `setup.json`.
    pub restart_on_update: bool,
}

#[derive(Debug, Deserialize)]
struct RawSetup {
    platform: Option<String>,
    encoder_path: Option<String>,
    bonder_path: Option<String>,
    pipeline_root: Option<String>,
    bitrate_file: Option<String>,
    uplinks_file: Option<String>,
    ssh_username: Option<String>,
    upgrades_enabled: Option<bool>,
    restart_on_update: Option<bool>,
}

impl Setup {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        let raw: RawSetup = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })?;
        Ok(Self {
            platform: raw.platform.ok_or(ConfigError::MissingField("platform"))?,
            encoder_path: raw
                .encoder_path
                .ok_or(ConfigError::MissingField("encoder_path"))?
                .into(),
            bonder_path: raw
                .bonder_path
                .ok_or(ConfigError::MissingField("bonder_path"))?
                .into(),
            pipeline_root: raw
                .pipeline_root
                .ok_or(ConfigError::MissingField("pipeline_root"))?
                .into(),
            bitrate_file: raw
                .bitrate_file
                .ok_or(ConfigError::MissingField("bitrate_file"))?
                .into(),
            uplinks_file: raw
                .uplinks_file
                .ok_or(ConfigError::MissingField("uplinks_file"))?
                .into(),
            ssh_username: raw.ssh_username,
            upgrades_enabled: raw.upgrades_enabled.unwrap_or(false),
            restart_on_update: raw.restart_on_update.unwrap_or(true),
        })
    }

    /// Both the encoder and bonder executables must exist at startup, or
    /// the daemon exits fatally (§6/§7 kind 3).
    pub fn check_executables(&self) -> Result<(), ConfigError> {
        for (field, path) in [
            ("encoder_path", &self.encoder_path),
            ("bonder_path", &self.bonder_path),
        ] {
            if !path.is_file() {
                return Err(ConfigError::InvalidValue {
                    field,
                    detail: format!("{} does not exist", path.display()),
                });
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Config document (persisted, mutable)
// ---------------------------------------------------------------------------

/// The mutable config document (§3). `ssh_pass_hash` never leaves this
/// process except written to `config.json`: it is stripped from every
/// broadcast and from [`PublicConfig`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub password_hash: Option<String>,
    pub remote_key: Option<String>,
    pub delay: Option<i32>,
    pub pipeline: Option<String>,
    pub max_br: Option<i64>,
    pub srt_latency: Option<i64>,
    pub srt_streamid: Option<String>,
    pub srtla_addr: Option<String>,
    pub srtla_port: Option<u32>,
    pub ssh_pass: Option<String>,
    pub ssh_pass_hash: Option<String>,
}

impl Config {
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })?;
        atomic_write(path, json.as_bytes()).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })
    }

    /// The secret-stripped projection broadcast to clients as `{"config": ...}`.
    pub fn to_public(&self) -> PublicConfig {
        PublicConfig {
            remote_key: self.remote_key.clone(),
            delay: self.delay,
            pipeline: self.pipeline.clone(),
            max_br: self.max_br,
            srt_latency: self.srt_latency,
            srt_streamid: self.srt_streamid.clone(),
            srtla_addr: self.srtla_addr.clone(),
            srtla_port: self.srtla_port,
        }
    }
}

// ---------------------------------------------------------------------------
// Auth tokens (persistent set on disk, transient set kept by the caller)
// ---------------------------------------------------------------------------

/// The on-disk persistent token set: `auth_tokens.json` is an object whose
/// keys are tokens and whose values are always `true`.
#[derive(Debug, Clone, Default)]
pub struct PersistentTokens {
    tokens: HashSet<String>,
}

impl PersistentTokens {
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        let map: std::collections::BTreeMap<String, bool> =
            serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_owned(),
                source,
            })?;
        Ok(Self {
            tokens: map.into_keys().collect(),
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let map: std::collections::BTreeMap<&str, bool> =
            self.tokens.iter().map(|t| (t.as_str(), true)).collect();
        let json = serde_json::to_string_pretty(&map).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })?;
        atomic_write(path, json.as_bytes()).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })
    }

    pub fn contains(&self, token: &str) -> bool {
        self.tokens.contains(token)
    }

    pub fn insert(&mut self, token: String) {
        self.tokens.insert(token);
    }

    pub fn remove(&mut self, token: &str) {
        self.tokens.remove(token);
    }
}

/// Write `contents` to `path` via a same-directory temp file + rename, so
/// a reader never observes a partially-written file.
pub fn atomic_write(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp_path = dir.to_path_buf();
    let file_name = path
        .file_name()
        .map(|n| format!(".{}.tmp", n.to_string_lossy()))
        .unwrap_or_else(|| ".sessiond.tmp".to_owned());
    tmp_path.push(file_name);
    std::fs::write(&tmp_path, contents)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}
