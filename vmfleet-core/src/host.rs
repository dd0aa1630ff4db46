use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Declarative description of one VM, supplied by the orchestrator once per
/// reconciliation cycle. Never mutated by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSpec {
    /// Declared host name, unique within an environment.
    pub name: String,
    /// Login user for the remote shell.
    pub user: String,
    /// Guest ports to expose on the host loopback interface.
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    /// Names of declared volumes to attach. Absolute paths are host folders.
    #[serde(default)]
    pub volumes: Vec<String>,
    /// Number of virtual CPUs.
    #[serde(default = "default_cpus")]
    pub cpus: u32,
    /// Memory size in mebibytes.
    #[serde(default = "default_memory")]
    pub memory_mib: u32,
    /// URL of the origin disk image.
    pub disk: String,
    /// Hypervisor OS type tag (e.g. `"Ubuntu_64"`).
    #[serde(default = "default_os_type")]
    pub os_type: String,
    /// Bootstrap script run on first boot; authorizes the orchestrator's keys.
    #[serde(default)]
    pub bootstrap: String,
}

fn default_cpus() -> u32 {
    1
}

fn default_memory() -> u32 {
    1024
}

fn default_os_type() -> String {
    "Ubuntu_64".to_owned()
}

impl HostSpec {
    /// Create a host spec with default sizing and no ports or volumes.
    pub fn new(name: impl Into<String>, user: impl Into<String>, disk: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            user: user.into(),
            ports: Vec::new(),
            volumes: Vec::new(),
            cpus: default_cpus(),
            memory_mib: default_memory(),
            disk: disk.into(),
            os_type: default_os_type(),
            bootstrap: String::new(),
        }
    }

    /// Replace the exposed port list.
    #[must_use]
    pub fn with_ports(mut self, ports: Vec<PortMapping>) -> Self {
        self.ports = ports;
        self
    }

    /// Replace the attached volume list.
    #[must_use]
    pub fn with_volumes(mut self, volumes: Vec<String>) -> Self {
        self.volumes = volumes;
        self
    }

    /// Set CPU count and memory.
    #[must_use]
    pub fn with_resources(mut self, cpus: u32, memory_mib: u32) -> Self {
        self.cpus = cpus;
        self.memory_mib = memory_mib;
        self
    }

    /// Set the first-boot bootstrap script.
    #[must_use]
    pub fn with_bootstrap(mut self, bootstrap: impl Into<String>) -> Self {
        self.bootstrap = bootstrap.into();
        self
    }

    /// Check the fields the provider relies on.
    ///
    /// # Errors
    /// Returns [`CoreError::HostValidation`] naming the first offending field.
    pub fn validate(&self) -> Result<(), CoreError> {
        let fail = |field: &str, reason: &str| CoreError::HostValidation {
            host: self.name.clone(),
            field: field.to_owned(),
            reason: reason.to_owned(),
        };
        if self.name.is_empty() {
            return Err(fail("name", "must not be empty"));
        }
        // '_' separates host name from environment in VM names.
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.'))
        {
            return Err(fail("name", "only ASCII alphanumerics, '-' and '.' are allowed"));
        }
        if self.user.is_empty() {
            return Err(fail("user", "must not be empty"));
        }
        if self.disk.is_empty() {
            return Err(fail("disk", "must not be empty"));
        }
        if self.cpus == 0 {
            return Err(fail("cpus", "must be at least 1"));
        }
        if self.memory_mib < 4 {
            return Err(fail("memory_mib", "must be at least 4"));
        }
        Ok(())
    }
}

/// A guest port exposed on the host, written `guest` or `host:guest`.
///
/// Without an explicit host port the provider allocates a free one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PortMapping {
    /// Host port, if pinned by the declaration.
    pub host: Option<u16>,
    /// Port inside the guest.
    pub guest: u16,
}

impl PortMapping {
    /// Expose `guest` on an allocated host port.
    #[must_use]
    pub const fn guest(guest: u16) -> Self {
        Self { host: None, guest }
    }

    /// Expose `guest` on the fixed `host` port.
    #[must_use]
    pub const fn pinned(host: u16, guest: u16) -> Self {
        Self {
            host: Some(host),
            guest,
        }
    }
}

impl FromStr for PortMapping {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |part: &str| {
            part.trim()
                .parse::<u16>()
                .map_err(|e| CoreError::InvalidPortMapping {
                    spec: s.to_owned(),
                    reason: format!("'{}': {e}", part.trim()),
                })
        };
        match s.split_once(':') {
            Some((host, guest)) => Ok(Self::pinned(parse(host)?, parse(guest)?)),
            None => Ok(Self::guest(parse(s)?)),
        }
    }
}

impl TryFrom<String> for PortMapping {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PortMapping> for String {
    fn from(mapping: PortMapping) -> Self {
        mapping.to_string()
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.host {
            Some(host) => write!(f, "{host}:{}", self.guest),
            None => write!(f, "{}", self.guest),
        }
    }
}

/// A named data volume declared for the environment.
///
/// The orchestrator owns volume identity; the provider only materializes,
/// attaches, detaches and deletes the backing file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    /// Logical name, or an absolute host path for folder shares.
    pub name: String,
    /// Size in gibibytes.
    #[serde(default)]
    pub size_gib: u32,
    /// Directory holding the backing file; provider default when absent.
    #[serde(default)]
    pub location: Option<PathBuf>,
    /// Disk format (`VDI`, `VMDK`, ...); `VDI` when absent.
    #[serde(default)]
    pub format: Option<String>,
}

impl VolumeSpec {
    /// Create a volume declaration with default location and format.
    pub fn new(name: impl Into<String>, size_gib: u32) -> Self {
        Self {
            name: name.into(),
            size_gib,
            location: None,
            format: None,
        }
    }

    /// Whether this volume is a host folder share rather than a virtual disk.
    #[must_use]
    pub fn is_host_folder(&self) -> bool {
        is_host_folder(&self.name)
    }
}

/// Volume names that are absolute paths designate host folders.
#[must_use]
pub fn is_host_folder(name: &str) -> bool {
    Path::new(name).is_absolute()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_mapping_parses_guest_only() {
        let m: PortMapping = match "8080".parse() {
            Ok(m) => m,
            Err(e) => panic!("unexpected error: {e}"),
        };
        assert_eq!(m, PortMapping::guest(8080));
    }

    #[test]
    fn port_mapping_parses_host_and_guest_with_spaces() {
        let m: PortMapping = match " 2222 : 22 ".parse() {
            Ok(m) => m,
            Err(e) => panic!("unexpected error: {e}"),
        };
        assert_eq!(m, PortMapping::pinned(2222, 22));
        assert_eq!(m.to_string(), "2222:22");
    }

    #[test]
    fn port_mapping_rejects_garbage() {
        assert!("ssh".parse::<PortMapping>().is_err());
        assert!("1:2:3".parse::<PortMapping>().is_err());
        assert!("70000".parse::<PortMapping>().is_err());
    }

    #[test]
    fn host_spec_deserializes_with_defaults() {
        let json = r#"{"name":"web","user":"ubuntu","disk":"https://x/y.vmdk","ports":["2222:22","80"]}"#;
        let spec: HostSpec = match serde_json::from_str(json) {
            Ok(s) => s,
            Err(e) => panic!("deserialize failed: {e}"),
        };
        assert_eq!(spec.cpus, 1);
        assert_eq!(spec.memory_mib, 1024);
        assert_eq!(spec.os_type, "Ubuntu_64");
        assert_eq!(spec.ports, vec![PortMapping::pinned(2222, 22), PortMapping::guest(80)]);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn host_spec_rejects_underscore_in_name() {
        let spec = HostSpec::new("web_1", "ubuntu", "file:///disk.vmdk");
        match spec.validate() {
            Err(CoreError::HostValidation { field, .. }) => assert_eq!(field, "name"),
            other => panic!("expected name validation failure, got {other:?}"),
        }
    }

    #[test]
    fn absolute_volume_names_are_host_folders() {
        assert!(VolumeSpec::new("/srv/data", 0).is_host_folder());
        assert!(!VolumeSpec::new("data", 10).is_host_folder());
    }
}
