//! Typed view over `showvminfo --machinereadable` output.
//!
//! Every hypervisor field name the provider depends on lives in this module,
//! so a VirtualBox release that renames fields is fixed here only.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::OnceLock;

use vmfleet_core::{LifecycleState, PortMapping};

use crate::parser::{parse_flat, Record};

/// Storage controller holding the system disk and data volumes.
pub const SATA_CONTROLLER: &str = "SATA";
/// Storage controller holding removable media.
pub const IDE_CONTROLLER: &str = "IDE";
/// SATA port reserved for the system disk.
pub const SYSTEM_DISK_PORT: u32 = 0;
/// IDE device slot carrying the cloud-init seed media.
pub const SEED_DEVICE: u32 = 0;
/// IDE device slot carrying the guest tooling installer.
pub const GUEST_TOOLS_DEVICE: u32 = 1;
/// Name of the NAT rule forwarding the SSH port.
pub const SSH_RULE: &str = "ssh";

const VM_STATE: &str = "VMState";
const FORWARDING_PREFIX: &str = "Forwarding(";
const SATA_PREFIX: &str = "SATA-";
const SATA_UUID_PREFIX: &str = "SATA-ImageUUID-";
const SHARED_NAME_PREFIX: &str = "SharedFolderNameMachineMapping";
const SHARED_PATH_PREFIX: &str = "SharedFolderPathMachineMapping";
const NAT_KEY_PREFIX: &str = "port-";
const EMPTY_MEDIUM: &str = "none";

/// Parsed machine-readable inspection of one VM.
///
/// Immutable once built. Derived views are computed on first use. Fetch a
/// new one after any command that changes the VM configuration.
#[derive(Debug, Default)]
pub struct MachineInfo {
    fields: Record,
    exists: bool,
    nat_rules: OnceLock<BTreeMap<String, u16>>,
    attached_volumes: OnceLock<BTreeMap<String, u32>>,
}

impl MachineInfo {
    /// Build from raw `showvminfo --machinereadable` output.
    #[must_use]
    pub fn from_output(output: &str) -> Self {
        Self {
            fields: parse_flat(output),
            exists: true,
            ..Self::default()
        }
    }

    /// Info for a VM the hypervisor does not know.
    #[must_use]
    pub fn not_existing() -> Self {
        Self::default()
    }

    /// Raw field lookup.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// The raw `VMState` value, if any.
    #[must_use]
    pub fn raw_state(&self) -> Option<&str> {
        self.get(VM_STATE)
    }

    /// Lifecycle state derived from `VMState`.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        if !self.exists {
            return LifecycleState::NotExisting;
        }
        match self.raw_state() {
            None => LifecycleState::NotExisting,
            Some("running") => LifecycleState::Up,
            Some("poweroff" | "aborted") => LifecycleState::Down,
            Some(_) => LifecycleState::Other,
        }
    }

    /// Data volumes on the SATA controller: disk path to port.
    ///
    /// The system disk port and empty slots are excluded.
    pub fn attached_volumes(&self) -> &BTreeMap<String, u32> {
        self.attached_volumes.get_or_init(|| {
            let mut volumes = BTreeMap::new();
            for (key, value) in &self.fields {
                if key.starts_with(SATA_UUID_PREFIX) || value == EMPTY_MEDIUM {
                    continue;
                }
                let Some(slot) = key.strip_prefix(SATA_PREFIX) else {
                    continue;
                };
                let Some(port) = parse_slot(slot) else {
                    continue;
                };
                if port != SYSTEM_DISK_PORT {
                    volumes.insert(value.clone(), port);
                }
            }
            volumes
        })
    }

    /// First SATA port above every attached volume.
    #[must_use]
    pub fn next_free_volume_port(&self) -> u32 {
        self.attached_volumes()
            .values()
            .copied()
            .max()
            .unwrap_or(SYSTEM_DISK_PORT)
            .saturating_add(1)
    }

    /// NAT port-forwarding rules on the first adapter: rule name to host port.
    pub fn nat_rules(&self) -> &BTreeMap<String, u16> {
        self.nat_rules.get_or_init(|| {
            self.forwarding_rules()
                .map(|rule| (rule.name.to_owned(), rule.host_port))
                .collect()
        })
    }

    /// Host port forwarded to `guest_port`, if any rule targets it.
    #[must_use]
    pub fn host_port(&self, guest_port: u16) -> Option<u16> {
        self.forwarding_rules()
            .find(|rule| rule.guest_port == guest_port)
            .map(|rule| rule.host_port)
    }

    /// Shared folders: share name to host path.
    ///
    /// Name and path entries are paired through their common index suffix.
    #[must_use]
    pub fn shared_folders(&self) -> BTreeMap<String, PathBuf> {
        let mut names = BTreeMap::new();
        let mut paths = BTreeMap::new();
        for (key, value) in &self.fields {
            if let Some(index) = key.strip_prefix(SHARED_NAME_PREFIX) {
                names.insert(index, value.clone());
            } else if let Some(index) = key.strip_prefix(SHARED_PATH_PREFIX) {
                paths.insert(index, PathBuf::from(value));
            }
        }
        names
            .into_iter()
            .filter_map(|(index, name)| paths.remove(index).map(|path| (name, path)))
            .collect()
    }

    /// Whether seed media occupies its IDE slot.
    #[must_use]
    pub fn is_seed_attached(&self) -> bool {
        self.ide_slot_occupied(SEED_DEVICE)
    }

    /// Whether the guest tooling installer occupies its IDE slot.
    #[must_use]
    pub fn is_guest_tools_attached(&self) -> bool {
        self.ide_slot_occupied(GUEST_TOOLS_DEVICE)
    }

    /// MAC address of adapter `n`, formatted `aa:bb:cc:dd:ee:ff`.
    #[must_use]
    pub fn mac_address(&self, n: u32) -> Option<String> {
        let raw = self.get(&format!("macaddress{n}"))?;
        if raw.len() != 12 || !raw.is_ascii() {
            return None;
        }
        let octets: Vec<&str> = (0..6).map(|i| &raw[i * 2..i * 2 + 2]).collect();
        Some(octets.join(":"))
    }

    fn ide_slot_occupied(&self, device: u32) -> bool {
        self.get(&format!("{IDE_CONTROLLER}-0-{device}"))
            .is_some_and(|medium| medium != EMPTY_MEDIUM)
    }

    fn forwarding_rules(&self) -> impl Iterator<Item = ForwardingRule<'_>> {
        self.fields
            .iter()
            .filter(|(key, _)| key.starts_with(FORWARDING_PREFIX))
            .filter_map(|(key, value)| {
                let rule = ForwardingRule::parse(value);
                if rule.is_none() {
                    tracing::warn!(%key, %value, "ignoring malformed forwarding rule");
                }
                rule
            })
    }
}

/// Deterministic NAT rule name for an exposed port.
///
/// Depends on the guest port only, so exposing the same port again finds
/// the existing rule.
#[must_use]
pub fn nat_key_for(mapping: &PortMapping) -> String {
    format!("{NAT_KEY_PREFIX}{}", mapping.guest)
}

/// `name,proto,host_ip,host_port,guest_ip,guest_port`
struct ForwardingRule<'a> {
    name: &'a str,
    host_port: u16,
    guest_port: u16,
}

impl<'a> ForwardingRule<'a> {
    fn parse(value: &'a str) -> Option<Self> {
        let parts: Vec<&str> = value.split(',').collect();
        if parts.len() != 6 {
            return None;
        }
        Some(Self {
            name: parts[0],
            host_port: parts[3].trim().parse().ok()?,
            guest_port: parts[5].trim().parse().ok()?,
        })
    }
}

/// `{port}-{device}` after the controller prefix.
fn parse_slot(slot: &str) -> Option<u32> {
    let (port, device) = slot.split_once('-')?;
    device.parse::<u32>().ok()?;
    port.parse().ok()
}
