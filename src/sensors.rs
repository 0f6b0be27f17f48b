//! Hardware sensor polling (§1 "out of scope" — the only rule specified
//! is "periodically sample files under a platform-specific path and
//! broadcast"). Kept deliberately thin: one label per readable file under
//! `sensors_root`, whose contents are truncated/trimmed as the
//! formatted value. The concrete parsing of e.g. `/sys/class/thermal`
//! is incidental per §1 and not specified further.

use std::collections::BTreeMap;
use std::path::Path;

/// Read every regular file directly under `sensors_root` and return a
/// `label -> formatted_value` map, skipping files that can't be read as
/// UTF-8. `label` is the file's name.
pub fn sample(sensors_root: &Path) -> BTreeMap<String, String> {
    let Ok(entries) = std::fs::read_dir(sensors_root) else {
        return BTreeMap::new();
    };
    let mut readings = BTreeMap::new();
    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if !file_type.is_file() {
            continue;
        }
        let Ok(contents) = std::fs::read_to_string(entry.path()) else {
            continue;
        };
        let label = entry.file_name().to_string_lossy().into_owned();
        readings.insert(label, contents.trim().to_owned());
    }
    readings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_readable_files_trimmed_and_skips_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("temp_cpu"), "42.5\n").unwrap();
        std::fs::write(dir.path().join("voltage"), "5.1\n").unwrap();
        std::fs::create_dir(dir.path().join("subdir")).unwrap();

        let readings = sample(dir.path());
        assert_eq!(readings.len(), 2);
        assert_eq!(readings["temp_cpu"], "42.5");
        assert_eq!(readings["voltage"], "5.1");
    }

    #[test]
    fn missing_root_yields_empty_map() {
        let readings = sample(Path::new("/nonexistent/sensors/path"));
        assert!(readings.is_empty());
    }
}
