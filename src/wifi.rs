//! Wi-Fi manager (C4): drives `nmcli` to maintain a wireless device index
//! keyed by MAC address, and exposes scan/connect/disconnect/forget/new
//! operations.
//!
//! `nmcli -t` output is colon-separated with `\:`, `\\`, and literal
//! newlines within a field backslash-escaped; [`split_nmcli_fields`] is
//! the one parser every other function in this module funnels through,
//! kept pure so it can be exercised without a real `nmcli` on the box.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::process::Command;

/// Scan-result refresh delays scheduled after a device-membership change,
/// because `nmcli` populates fresh scan results asynchronously.
pub const SCAN_FOLLOWUP_DELAYS: [Duration; 4] = [
    Duration::from_secs(1),
    Duration::from_secs(3),
    Duration::from_secs(5),
    Duration::from_secs(10),
];

const NEW_CONNECTION_TIMEOUT: Duration = Duration::from_secs(15);

/// Split one line of `nmcli -t` output into unescaped fields.
pub fn split_nmcli_fields(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(&next) = chars.peek() {
                    current.push(next);
                    chars.next();
                }
            }
            ':' => {
                fields.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedConnection {
    pub uuid: String,
    pub ssid: String,
    pub mac: Option<String>,
}

/// Parses `nmcli -t -f uuid,type,802-11-wireless.ssid,802-11-wireless.mac-address connection show`.
pub fn parse_saved_connections(output: &str) -> Vec<SavedConnection> {
    output
        .lines()
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let fields = split_nmcli_fields(line);
            if fields.len() < 4 || fields[1] != "802-11-wireless" {
                return None;
            }
            Some(SavedConnection {
                uuid: fields[0].clone(),
                ssid: fields[2].clone(),
                mac: (!fields[3].is_empty()).then(|| fields[3].to_uppercase()),
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanResult {
    pub ssid: String,
    pub active: bool,
    pub signal: u8,
    pub security: String,
    pub freq: u32,
}

/// Parses `nmcli -t -f active,ssid,signal,security,freq dev wifi list ifname <name>`.
pub fn parse_scan_results(output: &str) -> Vec<ScanResult> {
    output
        .lines()
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let fields = split_nmcli_fields(line);
            if fields.len() < 5 || fields[1].is_empty() {
                return None;
            }
            let signal = fields[2].parse::<u8>().unwrap_or(0);
            let freq = fields[4].trim_end_matches(" MHz").parse::<u32>().unwrap_or(0);
            Some(ScanResult {
                ssid: fields[1].clone(),
                active: fields[0] == "yes",
                signal,
                security: fields[3].clone(),
                freq,
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRow {
    pub ifname: String,
    pub mac: String,
    pub connection_uuid: Option<String>,
}

/// Parses `nmcli -t -f device,type,general.hwaddr,general.connection-uuid dev show`-style
/// rows: one device per line, already flattened by the caller's invocation.
pub fn parse_devices(output: &str) -> Vec<DeviceRow> {
    output
        .lines()
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let fields = split_nmcli_fields(line);
            if fields.len() < 4 || fields[1] != "wifi" || fields[2].is_empty() {
                return None;
            }
            Some(DeviceRow {
                ifname: fields[0].clone(),
                mac: fields[2].to_uppercase(),
                connection_uuid: (!fields[3].is_empty()).then(|| fields[3].clone()),
            })
        })
        .collect()
}

/// Parses `nmcli -t -f uuid,timestamp connection show` to find profiles
/// that have never successfully connected (timestamp 0) and should be
/// garbage-collected after a failed `new`.
pub fn parse_zero_timestamp_profiles(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let fields = split_nmcli_fields(line);
            if fields.len() < 2 || fields[1] != "0" {
                return None;
            }
            Some(fields[0].clone())
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewConnectionFailure {
    /// stderr mentioned a secrets/auth failure — wrong password.
    Auth,
    /// any other failure.
    Generic,
}

/// `nmcli`'s secrets-required marker varies by version; match loosely.
pub fn classify_new_connection_error(stderr: &str) -> NewConnectionFailure {
    let lowered = stderr.to_lowercase();
    if lowered.contains("secrets were required") || lowered.contains("no key available") {
        NewConnectionFailure::Auth
    } else {
        NewConnectionFailure::Generic
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Network {
    pub active: bool,
    pub signal: u8,
    pub security: String,
    pub freq: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WifiDevice {
    pub id: u64,
    pub ifname: String,
    pub active_connection: Option<String>,
    pub networks: BTreeMap<String, Network>,
    pub saved: BTreeMap<String, String>,
}

/// The wireless device index, keyed by MAC. Rebuilt in three phases each
/// refresh: saved connections, scan results, then devices (which creates
/// or retires entries and assigns stable-for-the-process ids).
#[derive(Debug, Default)]
pub struct WifiIndex {
    devices: BTreeMap<String, WifiDevice>,
    next_id: u64,
}

impl WifiIndex {
    pub fn devices(&self) -> &BTreeMap<String, WifiDevice> {
        &self.devices
    }

    pub fn device_by_id(&self, id: u64) -> Option<(&str, &WifiDevice)> {
        self.devices
            .iter()
            .find(|(_, d)| d.id == id)
            .map(|(mac, d)| (mac.as_str(), d))
    }

    /// Phase 1: populate each known device's saved SSID→UUID map.
    pub fn apply_saved_connections(&mut self, saved: Vec<SavedConnection>) {
        for device in self.devices.values_mut() {
            device.saved.clear();
        }
        for conn in saved {
            let Some(mac) = conn.mac else { continue };
            if let Some(device) = self.devices.get_mut(&mac) {
                device.saved.insert(conn.ssid, conn.uuid);
            }
        }
    }

    /// Phase 2: replace one device's visible-network map, deduping by
    /// SSID and preferring the entry marked active.
    pub fn apply_scan_results(&mut self, mac: &str, results: Vec<ScanResult>) {
        let Some(device) = self.devices.get_mut(mac) else {
            return;
        };
        let mut networks: BTreeMap<String, Network> = BTreeMap::new();
        for r in results {
            let better = networks.get(&r.ssid).is_none_or(|existing| r.active && !existing.active);
            if better {
                networks.insert(
                    r.ssid,
                    Network {
                        active: r.active,
                        signal: r.signal,
                        security: r.security,
                        freq: r.freq,
                    },
                );
            }
        }
        device.networks = networks;
    }

    /// Phase 3: reconcile the device list. Returns `true` if membership
    /// (the set of known MACs) changed, which triggers a saved-connection
    /// refresh plus a rescan in the caller.
    pub fn apply_devices(&mut self, rows: Vec<DeviceRow>) -> bool {
        let seen: std::collections::BTreeSet<String> = rows.iter().map(|r| r.mac.clone()).collect();
        let mut membership_changed = false;

        self.devices.retain(|mac, _| {
            let keep = seen.contains(mac);
            membership_changed |= !keep;
            keep
        });

        for row in rows {
            match self.devices.get_mut(&row.mac) {
                Some(device) => {
                    device.ifname = row.ifname;
                    device.active_connection = row.connection_uuid;
                }
                None => {
                    let id = self.next_id;
                    self.next_id += 1;
                    self.devices.insert(
                        row.mac,
                        WifiDevice {
                            id,
                            ifname: row.ifname,
                            active_connection: row.connection_uuid,
                            networks: BTreeMap::new(),
                            saved: BTreeMap::new(),
                        },
                    );
                    membership_changed = true;
                }
            }
        }

        membership_changed
    }

    /// Build the `{"wifi": ...}` payload broadcast to clients.
    pub fn to_wire(&self) -> Value {
        let devices: BTreeMap<String, Value> = self
            .devices
            .iter()
            .map(|(mac, d)| {
                let networks: BTreeMap<&str, Value> = d
                    .networks
                    .iter()
                    .map(|(ssid, n)| {
                        (
                            ssid.as_str(),
                            json!({
                                "active": n.active,
                                "signal": n.signal,
                                "security": n.security,
                                "freq": n.freq,
                            }),
                        )
                    })
                    .collect();
                (
                    mac.clone(),
                    json!({
                        "id": d.id,
                        "ifname": d.ifname,
                        "connection": d.active_connection,
                        "networks": networks,
                        "saved": d.saved,
                    }),
                )
            })
            .collect();
        json!({ "devices": devices })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WifiCommandError {
    #[error("no such device id {0}")]
    NoSuchDevice(u64),
    #[error("failed to run nmcli: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("connection failed: {0:?}")]
    Connect(NewConnectionFailure),
}

/// Runs `nmcli` for the stateful operations (scan/connect/disconnect/
/// forget/new). Pure parsing lives above; this struct owns only process
/// spawning so tests can exercise the parsers without it.
#[derive(Debug, Clone, Copy, Default)]
pub struct NmcliRunner;

impl NmcliRunner {
    /// `nmcli -t -f device,type,general.hwaddr,general.connection-uuid dev show`,
    /// filtered to wireless devices by [`parse_devices`].
    pub async fn list_devices(&self) -> Result<Vec<DeviceRow>, WifiCommandError> {
        let output = Command::new("nmcli")
            .args(["-t", "-f", "device,type,general.hwaddr,general.connection-uuid", "dev", "show"])
            .output()
            .await?;
        Ok(parse_devices(&String::from_utf8_lossy(&output.stdout)))
    }

    /// `nmcli -t -f uuid,type,802-11-wireless.ssid,802-11-wireless.mac-address connection show`.
    pub async fn list_saved_connections(&self) -> Result<Vec<SavedConnection>, WifiCommandError> {
        let output = Command::new("nmcli")
            .args([
                "-t",
                "-f",
                "uuid,type,802-11-wireless.ssid,802-11-wireless.mac-address",
                "connection",
                "show",
            ])
            .output()
            .await?;
        Ok(parse_saved_connections(&String::from_utf8_lossy(&output.stdout)))
    }

    /// `nmcli -t -f active,ssid,signal,security,freq dev wifi list ifname <name>`.
    pub async fn list_scan_results(&self, ifname: &str) -> Result<Vec<ScanResult>, WifiCommandError> {
        let output = Command::new("nmcli")
            .args(["-t", "-f", "active,ssid,signal,security,freq", "dev", "wifi", "list", "ifname", ifname])
            .output()
            .await?;
        Ok(parse_scan_results(&String::from_utf8_lossy(&output.stdout)))
    }

    pub async fn rescan(&self) -> Result<(), WifiCommandError> {
        Command::new("nmcli")
            .args(["dev", "wifi", "rescan"])
            .output()
            .await?;
        Ok(())
    }

    pub async fn connect(&self, uuid: &str) -> Result<(), WifiCommandError> {
        Command::new("nmcli")
            .args(["con", "up", "uuid", uuid])
            .output()
            .await?;
        Ok(())
    }

    pub async fn disconnect(&self, uuid: &str) -> Result<(), WifiCommandError> {
        Command::new("nmcli")
            .args(["con", "down", "uuid", uuid])
            .output()
            .await?;
        Ok(())
    }

    pub async fn forget(&self, uuid: &str) -> Result<(), WifiCommandError> {
        Command::new("nmcli")
            .args(["con", "delete", "uuid", uuid])
            .output()
            .await?;
        Ok(())
    }

    /// `new(ifname, ssid, password?)`, with a 15-second timeout; on
    /// failure classifies the stderr and garbage-collects any
    /// never-successful profile nmcli left behind.
    pub async fn new_connection(
        &self,
        ifname: &str,
        ssid: &str,
        password: Option<&str>,
    ) -> Result<(), WifiCommandError> {
        let mut args = vec![
            "dev".to_owned(),
            "wifi".to_owned(),
            "connect".to_owned(),
            ssid.to_owned(),
            "ifname".to_owned(),
            ifname.to_owned(),
        ];
        if let Some(password) = password {
            args.push("password".to_owned());
            args.push(password.to_owned());
        }

        let output = tokio::time::timeout(
            NEW_CONNECTION_TIMEOUT,
            Command::new("nmcli").args(&args).output(),
        )
        .await
        .map_err(|_| WifiCommandError::Connect(NewConnectionFailure::Generic))??;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let failure = classify_new_connection_error(&stderr);
        self.gc_zero_timestamp_profiles().await;
        Err(WifiCommandError::Connect(failure))
    }

    async fn gc_zero_timestamp_profiles(&self) {
        let Ok(output) = Command::new("nmcli")
            .args(["-t", "-f", "uuid,timestamp", "connection", "show"])
            .output()
            .await
        else {
            return;
        };
        let stdout = String::from_utf8_lossy(&output.stdout);
        for uuid in parse_zero_timestamp_profiles(&stdout) {
            let _ = Command::new("nmcli")
                .args(["con", "delete", "uuid", &uuid])
                .output()
                .await;
        }
    }
}

/// Wireless interface naming prefixes recognised by the MAC+IP feed from
/// the interface monitor (§4.2).
pub fn is_wireless_ifname(name: &str) -> bool {
    name.starts_with("wl") || name.starts_with("wlan")
}

/// True if `path` (a device's sysfs directory) is backed by a wireless
/// PHY, used when the interface monitor needs to confirm a name match.
pub fn has_wireless_phy(sysfs_iface_dir: &Path) -> bool {
    sysfs_iface_dir.join("phy80211").exists() || sysfs_iface_dir.join("wireless").exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_nmcli_fields_unescapes_backslash_colon() {
        let fields = split_nmcli_fields(r"uuid1:802-11-wireless:My\:SSID:AA\:BB\:CC\:DD\:EE\:FF");
        assert_eq!(fields, vec!["uuid1", "802-11-wireless", "My:SSID", "AA:BB:CC:DD:EE:FF"]);
    }

    #[test]
    fn parse_saved_connections_skips_non_wireless_and_empty_mac() {
        let output = "u1:802-11-wireless:home:AA\\:BB\\:CC\\:DD\\:EE\\:FF\nu2:vpn:office:\nu3:802-11-wireless:noMac:\n";
        let saved = parse_saved_connections(output);
        assert_eq!(saved.len(), 2);
        assert_eq!(saved[0].mac.as_deref(), Some("AA:BB:CC:DD:EE:FF"));
        assert_eq!(saved[1].mac, None);
    }

    #[test]
    fn parse_scan_results_prefers_active_entry_for_duplicate_ssid() {
        let output = "no:office:40:WPA2:2412\nyes:office:70:WPA2:2412\n";
        let results = parse_scan_results(output);
        assert_eq!(results.len(), 2);
        let mut index = WifiIndex::default();
        index.apply_devices(vec![DeviceRow {
            ifname: "wlan0".to_owned(),
            mac: "AA:BB:CC:DD:EE:FF".to_owned(),
            connection_uuid: None,
        }]);
        index.apply_scan_results("AA:BB:CC:DD:EE:FF", results);
        let net = &index.devices()["AA:BB:CC:DD:EE:FF"].networks["office"];
        assert!(net.active);
        assert_eq!(net.signal, 70);
    }

    #[test]
    fn apply_devices_assigns_stable_ids_and_retires_missing() {
        let mut index = WifiIndex::default();
        let changed = index.apply_devices(vec![DeviceRow {
            ifname: "wlan0".to_owned(),
            mac: "AA:BB:CC:DD:EE:FF".to_owned(),
            connection_uuid: None,
        }]);
        assert!(changed);
        let first_id = index.devices()["AA:BB:CC:DD:EE:FF"].id;

        let changed = index.apply_devices(vec![DeviceRow {
            ifname: "wlan0".to_owned(),
            mac: "AA:BB:CC:DD:EE:FF".to_owned(),
            connection_uuid: Some("uuid-1".to_owned()),
        }]);
        assert!(!changed, "no membership change, only a field update");
        assert_eq!(index.devices()["AA:BB:CC:DD:EE:FF"].id, first_id);

        let changed = index.apply_devices(vec![]);
        assert!(changed);
        assert!(index.devices().is_empty());
    }

    #[test]
    fn apply_saved_connections_populates_matching_device_only() {
        let mut index = WifiIndex::default();
        index.apply_devices(vec![DeviceRow {
            ifname: "wlan0".to_owned(),
            mac: "AA:BB:CC:DD:EE:FF".to_owned(),
            connection_uuid: None,
        }]);
        index.apply_saved_connections(vec![
            SavedConnection {
                uuid: "u1".to_owned(),
                ssid: "home".to_owned(),
                mac: Some("AA:BB:CC:DD:EE:FF".to_owned()),
            },
            SavedConnection {
                uuid: "u2".to_owned(),
                ssid: "unrelated".to_owned(),
                mac: Some("00:00:00:00:00:00".to_owned()),
            },
        ]);
        let device = &index.devices()["AA:BB:CC:DD:EE:FF"];
        assert_eq!(device.saved.get("home"), Some(&"u1".to_owned()));
        assert_eq!(device.saved.len(), 1);
    }

    #[test]
    fn classify_new_connection_error_detects_secrets_marker() {
        assert_eq!(
            classify_new_connection_error("Error: Secrets were required, but not provided."),
            NewConnectionFailure::Auth
        );
        assert_eq!(
            classify_new_connection_error("Error: No network with SSID 'x' found."),
            NewConnectionFailure::Generic
        );
    }

    #[test]
    fn parse_zero_timestamp_profiles_finds_never_connected_uuids() {
        let output = "u1:0\nu2:1700000000\nu3:0\n";
        assert_eq!(parse_zero_timestamp_profiles(output), vec!["u1", "u3"]);
    }

    #[test]
    fn is_wireless_ifname_matches_common_prefixes() {
        assert!(is_wireless_ifname("wlan0"));
        assert!(is_wireless_ifname("wlp3s0"));
        assert!(!is_wireless_ifname("eth0"));
    }
}
