//! `VBoxManage` invocation layer.
//!
//! [`CommandRunner`] is the single seam to the hypervisor: every other
//! component issues commands through it and parses the returned text.
//! [`Vbox`] wraps it with the subcommand vocabulary the provider uses.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;

use crate::parser::{parse_blocks, Record};
use crate::vminfo::{IDE_CONTROLLER, SATA_CONTROLLER};
use crate::VboxError;

/// Executes hypervisor tool invocations.
///
/// Implementations must be `Send + Sync` to allow use across async tasks.
///
/// # Cancel Safety
/// Dropping the returned future aborts the invocation. Hypervisor state
/// already changed by the tool is not rolled back.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run the tool with `args` and return combined stdout and stderr.
    ///
    /// # Errors
    /// Returns [`VboxError::ExternalTool`] with the full command line and
    /// output if the tool exits non-zero or cannot be spawned.
    async fn execute(&self, args: &[&str]) -> Result<String, VboxError>;
}

/// Runs the real `VBoxManage` binary.
#[derive(Debug, Clone)]
pub struct VBoxManage {
    binary: PathBuf,
}

impl VBoxManage {
    /// Use the binary at `binary` (a bare name is looked up in `PATH`).
    #[must_use]
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }

    fn command_line(&self, args: &[&str]) -> String {
        let mut line = self.binary.display().to_string();
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

#[async_trait]
impl CommandRunner for VBoxManage {
    async fn execute(&self, args: &[&str]) -> Result<String, VboxError> {
        let command = self.command_line(args);
        tracing::debug!(%command, "invoking hypervisor tool");

        let output = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| VboxError::ExternalTool {
                command: command.clone(),
                output: format!("cannot spawn: {e}"),
            })?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            return Err(VboxError::ExternalTool {
                command,
                output: text,
            });
        }
        Ok(text)
    }
}

/// Subcommands addressed to one VM (or to the host when the name is empty).
#[derive(Clone)]
pub struct Vbox {
    runner: Arc<dyn CommandRunner>,
    name: String,
}

impl std::fmt::Debug for Vbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vbox").field("name", &self.name).finish_non_exhaustive()
    }
}

impl Vbox {
    /// Commands for the VM registered as `name`.
    pub fn new(runner: Arc<dyn CommandRunner>, name: impl Into<String>) -> Self {
        Self {
            runner,
            name: name.into(),
        }
    }

    /// Host-level commands that do not address a VM.
    pub fn host(runner: Arc<dyn CommandRunner>) -> Self {
        Self::new(runner, String::new())
    }

    /// The VM name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Raw invocation.
    ///
    /// # Errors
    /// Propagates [`VboxError::ExternalTool`].
    pub async fn execute(&self, args: &[&str]) -> Result<String, VboxError> {
        self.runner.execute(args).await
    }

    async fn run(&self, args: &[&str]) -> Result<(), VboxError> {
        self.runner.execute(args).await.map(drop)
    }

    /// `showvminfo <vm> --machinereadable`
    ///
    /// # Errors
    /// Fails when the VM is not registered.
    pub async fn show_vm_info(&self) -> Result<String, VboxError> {
        self.execute(&["showvminfo", &self.name, "--machinereadable"]).await
    }

    /// Register a new VM with a SATA and an IDE controller.
    ///
    /// # Errors
    /// Propagates the first failing command.
    pub async fn create(&self, os_type: &str) -> Result<(), VboxError> {
        self.run(&["createvm", "--name", &self.name, "--ostype", os_type, "--register"])
            .await?;
        self.run(&["storagectl", &self.name, "--name", SATA_CONTROLLER, "--add", "sata"])
            .await?;
        self.run(&["storagectl", &self.name, "--name", IDE_CONTROLLER, "--add", "ide"])
            .await
    }

    /// `modifyvm <vm> args...`
    ///
    /// # Errors
    /// Propagates [`VboxError::ExternalTool`].
    pub async fn modify(&self, args: &[&str]) -> Result<(), VboxError> {
        let mut full = vec!["modifyvm", self.name.as_str()];
        full.extend_from_slice(args);
        self.run(&full).await
    }

    /// Boot without a GUI.
    ///
    /// # Errors
    /// Propagates [`VboxError::ExternalTool`].
    pub async fn start(&self) -> Result<(), VboxError> {
        self.run(&["startvm", &self.name, "--type", "headless"]).await
    }

    /// Hard power-off.
    ///
    /// # Errors
    /// Propagates [`VboxError::ExternalTool`].
    pub async fn power_off(&self) -> Result<(), VboxError> {
        self.run(&["controlvm", &self.name, "poweroff"]).await
    }

    /// Remove the VM from the hypervisor registry.
    ///
    /// # Errors
    /// Propagates [`VboxError::ExternalTool`].
    pub async fn unregister(&self) -> Result<(), VboxError> {
        self.run(&["unregistervm", &self.name]).await
    }

    /// Share `host_path` into the guest as `share` with symlinks enabled.
    ///
    /// # Errors
    /// Propagates the first failing command.
    pub async fn add_shared_folder(&self, host_path: &Path, share: &str) -> Result<(), VboxError> {
        let host_path = host_path.display().to_string();
        self.run(&["sharedfolder", "add", &self.name, "--name", share, "--hostpath", &host_path])
            .await?;
        let key = format!("VBoxInternal2/SharedFoldersEnableSymlinksCreate/{share}");
        self.run(&["setextradata", &self.name, &key, "1"]).await
    }

    /// Forward `host_ip:host_port` to `guest_port` on adapter 1.
    ///
    /// # Errors
    /// Propagates [`VboxError::ExternalTool`].
    pub async fn add_nat_rule(
        &self,
        key: &str,
        host_ip: &str,
        host_port: u16,
        guest_port: u16,
    ) -> Result<(), VboxError> {
        let rule = format!("{key},tcp,{host_ip},{host_port},,{guest_port}");
        self.modify(&["--natpf1", &rule]).await
    }

    /// Delete the forwarding rule `key` on adapter 1.
    ///
    /// # Errors
    /// Propagates [`VboxError::ExternalTool`].
    pub async fn delete_nat_rule(&self, key: &str) -> Result<(), VboxError> {
        self.modify(&["--natpf1", "delete", key]).await
    }

    /// Create a disk image of `size_mib` at `location`.
    ///
    /// # Errors
    /// Propagates [`VboxError::ExternalTool`].
    pub async fn create_medium(&self, location: &Path, size_mib: u64, format: &str) -> Result<(), VboxError> {
        let location = location.display().to_string();
        let size = size_mib.to_string();
        self.run(&["createmedium", "disk", "--filename", &location, "--size", &size, "--format", format])
            .await
    }

    /// Close a disk image and delete its file.
    ///
    /// # Errors
    /// Propagates [`VboxError::ExternalTool`].
    pub async fn remove_medium(&self, location: &Path) -> Result<(), VboxError> {
        let location = location.display().to_string();
        self.run(&["closemedium", "disk", &location, "--delete"]).await
    }

    /// Copy `source` into a new disk image at `target`.
    ///
    /// # Errors
    /// Propagates [`VboxError::ExternalTool`].
    pub async fn clone_medium(&self, source: &Path, target: &Path) -> Result<(), VboxError> {
        let source = source.display().to_string();
        let target = target.display().to_string();
        self.run(&["clonemedium", "disk", &source, &target]).await
    }

    /// Attach a disk on SATA `port`.
    ///
    /// # Errors
    /// Propagates [`VboxError::ExternalTool`].
    pub async fn attach_disk(&self, port: u32, medium: &Path) -> Result<(), VboxError> {
        let medium = medium.display().to_string();
        self.storage_attach(SATA_CONTROLLER, "hdd", port, 0, &medium).await
    }

    /// Empty SATA `port`.
    ///
    /// # Errors
    /// Propagates [`VboxError::ExternalTool`].
    pub async fn detach_disk(&self, port: u32) -> Result<(), VboxError> {
        self.storage_attach(SATA_CONTROLLER, "hdd", port, 0, "none").await
    }

    /// Insert an optical image in IDE port 0 slot `device`.
    ///
    /// # Errors
    /// Propagates [`VboxError::ExternalTool`].
    pub async fn attach_dvd(&self, device: u32, medium: &Path) -> Result<(), VboxError> {
        let medium = medium.display().to_string();
        self.storage_attach(IDE_CONTROLLER, "dvddrive", 0, device, &medium).await
    }

    /// Empty IDE port 0 slot `device`.
    ///
    /// # Errors
    /// Propagates [`VboxError::ExternalTool`].
    pub async fn detach_dvd(&self, device: u32) -> Result<(), VboxError> {
        self.storage_attach(IDE_CONTROLLER, "dvddrive", 0, device, "none").await
    }

    async fn storage_attach(
        &self,
        controller: &str,
        kind: &str,
        port: u32,
        device: u32,
        medium: &str,
    ) -> Result<(), VboxError> {
        let port = port.to_string();
        let device = device.to_string();
        self.run(&[
            "storageattach",
            &self.name,
            "--storagectl",
            controller,
            "--type",
            kind,
            "--port",
            &port,
            "--device",
            &device,
            "--medium",
            medium,
        ])
        .await
    }

    /// Export the VM as an OVF appliance at `ovf`.
    ///
    /// # Errors
    /// Propagates [`VboxError::ExternalTool`].
    pub async fn export(&self, ovf: &Path) -> Result<(), VboxError> {
        let ovf = ovf.display().to_string();
        self.run(&["export", &self.name, "-o", &ovf]).await
    }

    /// `guestproperty get <vm> <property>`; the raw `Value: ...` text.
    ///
    /// # Errors
    /// Propagates [`VboxError::ExternalTool`].
    pub async fn guest_property(&self, property: &str) -> Result<String, VboxError> {
        self.execute(&["guestproperty", "get", &self.name, property]).await
    }

    /// `list dhcpservers`, one record per server.
    ///
    /// # Errors
    /// Propagates [`VboxError::ExternalTool`].
    pub async fn list_dhcp_servers(&self) -> Result<Vec<Record>, VboxError> {
        Ok(parse_blocks(&self.execute(&["list", "dhcpservers"]).await?))
    }

    /// `list systemproperties` as one record.
    ///
    /// # Errors
    /// Propagates [`VboxError::ExternalTool`].
    pub async fn system_properties(&self) -> Result<Record, VboxError> {
        let out = self.execute(&["list", "systemproperties"]).await?;
        Ok(parse_blocks(&out).into_iter().flatten().collect())
    }

    /// Hypervisor version, e.g. `7.0.14` from `7.0.14r161095`.
    ///
    /// # Errors
    /// Propagates [`VboxError::ExternalTool`]; fails with
    /// [`VboxError::UnexpectedOutput`] if no version number is printed.
    pub async fn version(&self) -> Result<String, VboxError> {
        let out = self.execute(&["--version"]).await?;
        let version = extract_version(out.trim());
        if version.is_empty() {
            return Err(VboxError::UnexpectedOutput {
                field: "--version".to_owned(),
                value: out,
            });
        }
        Ok(version.to_owned())
    }
}

/// Leading run of digits and dots.
fn extract_version(raw: &str) -> &str {
    let end = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(raw.len());
    &raw[..end]
}

/// Value of a `Value: <v>` line from `guestproperty get`.
#[must_use]
pub fn guest_property_value(raw: &str) -> &str {
    let trimmed = raw.trim();
    trimmed.strip_prefix("Value: ").unwrap_or(trimmed)
}
