//! Provider configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::VboxError;

/// Configuration for driving a local VirtualBox installation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct VboxConfig {
    /// Path or bare name of the `VBoxManage` binary.
    pub vboxmanage: PathBuf,

    /// Parent directory of per-VM folders. Queried from the hypervisor when unset.
    pub machine_folder: Option<PathBuf>,

    /// Root for provider-owned files (`volumes/`, `exports/`, `cache/`).
    pub state_dir: PathBuf,

    /// Default floor for host port allocation.
    pub port_floor: u16,

    /// Floor for SSH forwarding ports.
    pub ssh_port_floor: u16,

    /// Interval between polls in every bounded wait.
    pub poll_interval_secs: u64,

    /// Deadline for the guest boot-completion marker.
    pub boot_timeout_secs: u64,

    /// Deadline for the guest remote shell to accept connections.
    pub shell_timeout_secs: u64,

    /// Deadline for the guest to report its internal IP.
    pub ip_timeout_secs: u64,

    /// Prefix of environment network names.
    pub network_prefix: String,
}

impl Default for VboxConfig {
    fn default() -> Self {
        let home = std::env::var_os("HOME").map_or_else(|| PathBuf::from("/tmp"), PathBuf::from);
        Self {
            vboxmanage: default_vboxmanage(),
            machine_folder: None,
            state_dir: home.join(".vmfleet"),
            port_floor: 1025,
            ssh_port_floor: 2200,
            poll_interval_secs: 1,
            boot_timeout_secs: 300,
            shell_timeout_secs: 600,
            ip_timeout_secs: 60,
            network_prefix: "fleetnet".to_owned(),
        }
    }
}

fn default_vboxmanage() -> PathBuf {
    // Windows installers do not put VBoxManage on PATH.
    match std::env::var_os("VBOX_MSI_INSTALL_PATH") {
        Some(root) => Path::new(&root).join("VBoxManage.exe"),
        None => PathBuf::from("VBoxManage"),
    }
}

impl VboxConfig {
    /// Create a config rooted at `state_dir`, everything else default.
    #[must_use]
    pub fn new(state_dir: PathBuf) -> Self {
        Self {
            state_dir,
            ..Self::default()
        }
    }

    /// Load from a JSON file, filling unspecified fields with defaults.
    ///
    /// # Errors
    /// Returns [`VboxError::Io`] if the file cannot be read and
    /// [`VboxError::Config`] if it does not parse.
    pub fn from_file(path: &Path) -> Result<Self, VboxError> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|source| VboxError::Config {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `VMFLEET_*` environment overrides on top of `self`.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = std::env::var_os("VMFLEET_VBOXMANAGE") {
            self.vboxmanage = PathBuf::from(v);
        }
        if let Some(v) = std::env::var_os("VMFLEET_MACHINE_FOLDER") {
            self.machine_folder = Some(PathBuf::from(v));
        }
        if let Some(v) = std::env::var_os("VMFLEET_STATE_DIR") {
            self.state_dir = PathBuf::from(v);
        }
        if let Some(v) = env_number("VMFLEET_BOOT_TIMEOUT_SECS") {
            self.boot_timeout_secs = v;
        }
        if let Some(v) = env_number("VMFLEET_SHELL_TIMEOUT_SECS") {
            self.shell_timeout_secs = v;
        }
        self
    }

    /// Directory holding declared volume backing files.
    #[must_use]
    pub fn volumes_dir(&self) -> PathBuf {
        self.state_dir.join("volumes")
    }

    /// Directory holding exported system disks.
    #[must_use]
    pub fn exports_dir(&self) -> PathBuf {
        self.state_dir.join("exports")
    }

    /// Host folder shared into every guest as the artifact cache.
    #[must_use]
    pub fn cache_dir(&self) -> PathBuf {
        self.state_dir.join("cache")
    }

    /// Interval between polls.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Boot-completion deadline.
    #[must_use]
    pub fn boot_timeout(&self) -> Duration {
        Duration::from_secs(self.boot_timeout_secs)
    }

    /// Shell-reachability deadline.
    #[must_use]
    pub fn shell_timeout(&self) -> Duration {
        Duration::from_secs(self.shell_timeout_secs)
    }

    /// Internal-IP resolution deadline.
    #[must_use]
    pub fn ip_timeout(&self) -> Duration {
        Duration::from_secs(self.ip_timeout_secs)
    }
}

fn env_number(key: &str) -> Option<u64> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(%key, value = %raw, error = %e, "ignoring non-numeric override");
            None
        }
    }
}
