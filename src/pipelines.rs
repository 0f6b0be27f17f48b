//! Pipeline discovery (§6): scans the encoder's pipeline tree for
//! available pipeline files and assigns each a stable id — the
//! hex-encoded 160-bit (SHA-1) hash of `"<dir-basename>/<filename>"`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};

const GENERIC_DIR: &str = "generic";

/// A discovered pipeline file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    pub id: String,
    pub name: String,
    pub path: PathBuf,
}

/// `<dir-basename>/<filename>"` hashed with SHA-1, hex-encoded.
pub fn pipeline_id(dir_basename: &str, filename: &str) -> String {
    let key = format!("{dir_basename}/{filename}");
    let digest = Sha1::digest(key.as_bytes());
    hex::encode(digest)
}

/// Scan the generic pipeline directory (always) and the platform-specific
/// directory (only when it exists, i.e. when `platform` names a directory
/// under `pipeline_root`) for pipeline files.
pub fn discover_pipelines(pipeline_root: &Path, platform: &str) -> Vec<Pipeline> {
    let mut pipelines = Vec::new();
    scan_dir(&pipeline_root.join(GENERIC_DIR), GENERIC_DIR, &mut pipelines);
    if platform != GENERIC_DIR {
        scan_dir(&pipeline_root.join(platform), platform, &mut pipelines);
    }
    pipelines
}

fn scan_dir(dir: &Path, dir_basename: &str, out: &mut Vec<Pipeline>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if !file_type.is_file() {
            continue;
        }
        let filename = entry.file_name().to_string_lossy().into_owned();
        out.push(Pipeline {
            id: pipeline_id(dir_basename, &filename),
            name: filename,
            path: entry.path(),
        });
    }
}

/// Build the `{id: name}` map broadcast as `{"pipelines": ...}`.
pub fn to_wire(pipelines: &[Pipeline]) -> BTreeMap<String, String> {
    pipelines
        .iter()
        .map(|p| (p.id.clone(), p.name.clone()))
        .collect()
}

/// Resolve a client-supplied pipeline id to a file path, for `start`
/// validation.
pub fn resolve(pipelines: &[Pipeline], id: &str) -> Option<PathBuf> {
    pipelines.iter().find(|p| p.id == id).map(|p| p.path.clone())
}
