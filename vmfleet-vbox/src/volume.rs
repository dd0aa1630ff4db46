//! Declared volumes: virtual disks outside the system disk, and host
//! folders shared into the guest.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use vmfleet_core::VolumeSpec;

use crate::cli::Vbox;
use crate::vminfo::MachineInfo;
use crate::VboxError;

/// Format used when a volume does not name one.
pub const DEFAULT_FORMAT: &str = "VDI";

/// A declared volume materialized as a disk image.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct VolumeRecord {
    pub name: String,
    /// Size in MiB, the unit `createmedium` expects.
    pub size_mib: u64,
    /// Directory holding the backing file.
    pub location: PathBuf,
    pub format: String,
    /// Guest device the volume should appear as, once attached.
    pub device: Option<String>,
}

impl VolumeRecord {
    /// Materialize `spec`. Without a location the file lives in
    /// `default_dir`; a relative location is resolved against it.
    #[must_use]
    pub fn from_spec(spec: &VolumeSpec, default_dir: &Path) -> Self {
        let location = match &spec.location {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => default_dir.join(dir),
            None => default_dir.to_path_buf(),
        };
        Self {
            name: spec.name.clone(),
            size_mib: u64::from(spec.size_gib) * 1024,
            location,
            format: spec.format.clone().unwrap_or_else(|| DEFAULT_FORMAT.to_owned()),
            device: None,
        }
    }

    /// Backing file, `{location}/{name}.{format}`.
    #[must_use]
    pub fn file(&self) -> PathBuf {
        self.location
            .join(format!("{}.{}", self.name, self.format.to_lowercase()))
    }

    /// Create the backing file unless it already exists. Returns whether a
    /// file was created.
    ///
    /// # Errors
    /// Returns [`VboxError::Io`] or the failing tool invocation.
    pub async fn create(&self, host: &Vbox) -> Result<bool, VboxError> {
        let file = self.file();
        if tokio::fs::try_exists(&file).await? {
            return Ok(false);
        }
        tokio::fs::create_dir_all(&self.location).await?;
        tracing::info!(volume = %self.name, file = %file.display(), "creating volume");
        host.create_medium(&file, self.size_mib, &self.format).await?;
        Ok(true)
    }

    /// Close and delete the backing file.
    ///
    /// # Errors
    /// Returns the failing tool invocation.
    pub async fn delete(&self, host: &Vbox) -> Result<(), VboxError> {
        tracing::info!(volume = %self.name, file = %self.file().display(), "deleting volume");
        host.remove_medium(&self.file()).await
    }

    /// Attach to the VM unless `info` already shows it attached; record the
    /// guest device. Returns the controller port.
    ///
    /// # Errors
    /// Returns the failing tool invocation.
    pub async fn ensure_attached(&mut self, vm: &Vbox, info: &MachineInfo) -> Result<u32, VboxError> {
        let file = self.file();
        let port = match info.attached_volumes().get(&file.display().to_string()) {
            Some(port) => *port,
            None => {
                let port = info.next_free_volume_port();
                tracing::info!(vm = %vm.name(), volume = %self.name, port, "attaching volume");
                vm.attach_disk(port, &file).await?;
                port
            }
        };
        self.device = device_for_port(port);
        Ok(port)
    }

    /// Detach from the VM if `info` shows it attached. Returns whether a
    /// detach was issued.
    ///
    /// # Errors
    /// Returns the failing tool invocation.
    pub async fn ensure_detached(&self, vm: &Vbox, info: &MachineInfo) -> Result<bool, VboxError> {
        let Some(port) = info.attached_volumes().get(&self.file().display().to_string()) else {
            return Ok(false);
        };
        tracing::info!(vm = %vm.name(), volume = %self.name, port, "detaching volume");
        vm.detach_disk(*port).await?;
        Ok(true)
    }
}

/// First partition of the disk on SATA `port`: port 1 is `/dev/sdb1`.
///
/// Informational only; the guest kernel is free to name disks differently.
#[must_use]
pub fn device_for_port(port: u32) -> Option<String> {
    let offset = u8::try_from(port).ok().filter(|p| *p < 26)?;
    Some(format!("/dev/sd{}1", char::from(b'a' + offset)))
}

/// Share name for a host-folder volume: a stable digest prefix of the path.
#[must_use]
pub fn share_name_for(host_path: &Path) -> String {
    let digest = Sha256::digest(host_path.as_os_str().as_encoded_bytes());
    digest.iter().take(8).map(|b| format!("{b:02x}")).collect()
}
