//! Network-interface monitor (C3): polls local IPv4 interfaces every
//! second, computes transmit deltas, and maintains per-interface enable
//! flags that gate which uplinks the bonder uses.
//!
//! Enumeration reads the platform's per-interface sysfs tree
//! (`/sys/class/net/<name>/`), mirroring the teacher's parse-as-a-pure-
//! function seam: [`parse_interface_samples`] takes a `Vec<RawIfaceRead>`
//! (one read per interface directory) and returns the table, so tests can
//! feed a recorded transcript instead of a real sysfs tree.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::Path;

use wire_protocol::NetifEntry;

const LOOPBACK_PREFIX: &str = "lo";
const DOCKER_BRIDGE_PREFIX: &str = "docker";
const PLATFORM_BRIDGE_PREFIX: &str = "br-";
const WIRELESS_PREFIX: &str = "wlan";

/// One interface's raw observation for a single poll tick, as read from
/// sysfs (or fabricated by a test).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawIfaceRead {
    pub name: String,
    pub ipv4: Option<Ipv4Addr>,
    pub tx_bytes: u64,
}

/// Whether `name` is excluded from the uplink table by convention
/// (loopback, the docker bridge prefix, or the platform-internal bridge
/// prefix). Kept as a plain function rather than a fixed list per the
/// design note in §9 suggesting a configurable allow/deny list.
pub fn is_excluded_interface(name: &str) -> bool {
    name == LOOPBACK_PREFIX
        || name.starts_with(DOCKER_BRIDGE_PREFIX)
        || name.starts_with(PLATFORM_BRIDGE_PREFIX)
}

pub fn is_wireless_interface(name: &str) -> bool {
    name.starts_with(WIRELESS_PREFIX)
}

/// One entry in the live interface table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceState {
    pub ip: Ipv4Addr,
    pub tx_bytes: u64,
    pub throughput: u64,
    pub enabled: bool,
}

/// The live interface table, keyed by interface name.
#[derive(Debug, Clone, Default)]
pub struct InterfaceTable {
    entries: BTreeMap<String, InterfaceState>,
}

/// Outcome of applying one poll tick to an existing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOutcome {
    /// Whether any surviving or new entry gained or changed its IPv4
    /// address relative to the previous table — triggers `updateUplinks`
    /// while streaming.
    pub ip_changed: bool,
}

impl InterfaceTable {
    pub fn entries(&self) -> &BTreeMap<String, InterfaceState> {
        &self.entries
    }

    pub fn enabled_ips(&self) -> Vec<Ipv4Addr> {
        self.entries
            .values()
            .filter(|e| e.enabled)
            .map(|e| e.ip)
            .collect()
    }

    pub fn enabled_count(&self) -> usize {
        self.entries.values().filter(|e| e.enabled).count()
    }

    /// Apply one poll's raw reads: excluded names are dropped, entries
    /// that disappeared are removed, `enabled` persists for interfaces
    /// still present, and throughput is `max(0, tx_now - tx_prev)`.
    pub fn apply_poll(&mut self, reads: Vec<RawIfaceRead>) -> PollOutcome {
        let mut next = BTreeMap::new();
        let mut ip_changed = false;

        for read in reads {
            if is_excluded_interface(&read.name) {
                continue;
            }
            let Some(ip) = read.ipv4 else { continue };

            let prev = self.entries.get(&read.name);
            let throughput = match prev {
                Some(prev) => read.tx_bytes.saturating_sub(prev.tx_bytes),
                None => 0,
            };
            let enabled = prev.map(|p| p.enabled).unwrap_or(true);
            if prev.map(|p| p.ip) != Some(ip) {
                ip_changed = true;
            }

            next.insert(
                read.name,
                InterfaceState {
                    ip,
                    tx_bytes: read.tx_bytes,
                    throughput,
                    enabled,
                },
            );
        }

        self.entries = next;
        PollOutcome { ip_changed }
    }

    /// `setEnabled`: succeeds only if `name`/`ip` match the current entry
    /// and the change would not disable every interface. Returns `Err`
    /// with the `netif_disable_all` case distinguished so the caller can
    /// emit the right notification.
    pub fn set_enabled(
        &mut self,
        name: &str,
        ip: Ipv4Addr,
        enabled: bool,
    ) -> Result<(), SetEnabledError> {
        let Some(entry) = self.entries.get_mut(name) else {
            return Err(SetEnabledError::NoMatch);
        };
        if entry.ip != ip {
            return Err(SetEnabledError::NoMatch);
        }
        if entry.enabled == enabled {
            return Ok(());
        }
        if !enabled {
            let other_enabled = self
                .entries
                .iter()
                .filter(|(n, _)| n.as_str() != name)
                .filter(|(_, e)| e.enabled)
                .count();
            if other_enabled == 0 {
                return Err(SetEnabledError::WouldDisableAll);
            }
        }
        self.entries.get_mut(name).unwrap().enabled = enabled;
        Ok(())
    }

    pub fn to_wire(&self) -> BTreeMap<String, NetifEntry> {
        self.entries
            .iter()
            .map(|(name, e)| {
                (
                    name.clone(),
                    NetifEntry {
                        ip: e.ip,
                        txb: e.tx_bytes,
                        tp: e.throughput,
                        enabled: e.enabled,
                    },
                )
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetEnabledError {
    NoMatch,
    WouldDisableAll,
}

/// Read `/sys/class/net/<name>/` for every interface present, returning
/// one [`RawIfaceRead`] per interface. Errors reading an individual
/// interface's files are treated as "no usable data" for that interface
/// rather than failing the whole poll, since interfaces can disappear
/// mid-enumeration.
pub fn read_sysfs_interfaces(sys_class_net: &Path) -> Vec<RawIfaceRead> {
    let Ok(dirs) = std::fs::read_dir(sys_class_net) else {
        return Vec::new();
    };
    let mut reads = Vec::new();
    for entry in dirs.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        let iface_dir = entry.path();
        let Ok(tx_bytes) = std::fs::read_to_string(iface_dir.join("statistics/tx_bytes")) else {
            continue;
        };
        let Ok(tx_bytes) = tx_bytes.trim().parse::<u64>() else {
            continue;
        };
        let ipv4 = read_ipv4_via_ip_command(&name);
        reads.push(RawIfaceRead {
            name,
            ipv4,
            tx_bytes,
        });
    }
    reads
}

/// Resolve an interface's IPv4 address by shelling out to `ip -4 -o addr
/// show dev <name>`, parsing the `inet a.b.c.d/nn` token from the single
/// line of terse output. Returns `None` if the interface has no IPv4
/// address, matching the "interface with no IPv4 address is excluded"
/// rule.
fn read_ipv4_via_ip_command(name: &str) -> Option<Ipv4Addr> {
    let output = std::process::Command::new("ip")
        .args(["-4", "-o", "addr", "show", "dev", name])
        .output()
        .ok()?;
    parse_ip_addr_show(&String::from_utf8_lossy(&output.stdout))
}

fn parse_ip_addr_show(stdout: &str) -> Option<Ipv4Addr> {
    let line = stdout.lines().next()?;
    let inet_pos = line.find("inet ")?;
    let rest = &line[inet_pos + "inet ".len()..];
    let cidr = rest.split_whitespace().next()?;
    let addr = cidr.split('/').next()?;
    addr.parse().ok()
}
