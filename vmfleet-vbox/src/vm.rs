//! Lifecycle of one VM.
//!
//! [`VmRuntime`] is re-entrant: every operation starts from the state the
//! hypervisor reports, so a VM left half-way by a failed run is picked up
//! where it stands on the next reconciliation.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use vmfleet_core::{is_host_folder, CoreError, HostSpec, InstanceInfo, LifecycleState, VmIdentity, VolumeSpec};

use crate::capability::{ArtifactStore, RemoteShell};
use crate::cli::{guest_property_value, Vbox};
use crate::context::VboxContext;
use crate::seed::SeedMedia;
use crate::volume::{share_name_for, VolumeRecord};
use crate::vminfo::{nat_key_for, MachineInfo, SSH_RULE, SYSTEM_DISK_PORT};
use crate::wait::poll_until;
use crate::{guest_tools, VboxError};

/// Share name of the host artifact cache.
pub const CACHE_SHARE: &str = "cache";

/// Guest mount point of the artifact cache.
pub const GUEST_CACHE_DIR: &str = "/var/cache/vmfleet";

/// System disk file inside the VM folder.
pub const SYSTEM_DISK: &str = "system.vmdk";

/// Address NAT forwards are reached on from the host.
pub const EXTERNAL_IP: &str = "127.0.0.1";

const GUEST_SSH_PORT: u16 = 22;
const IP_PROPERTY: &str = "/VirtualBox/GuestInfo/Net/1/V4/IP";
const NO_VALUE: &str = "No value set!";
const BOOT_FINISHED_PROBE: &str =
    "if [ -f /var/lib/cloud/instance/boot-finished ]; then echo 1; else echo 0; fi";

/// One VM across a single operation.
pub struct VmRuntime {
    ctx: Arc<VboxContext>,
    identity: VmIdentity,
    spec: HostSpec,
    vbox: Vbox,
    disks: Vec<VolumeRecord>,
    host_folders: Vec<PathBuf>,
    info: MachineInfo,
    initial_state: LifecycleState,
    ssh_port: Option<u16>,
    shell: Option<Arc<dyn RemoteShell>>,
    fresh_origin: bool,
}

impl std::fmt::Debug for VmRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmRuntime")
            .field("identity", &self.identity)
            .field("initial_state", &self.initial_state)
            .field("ssh_port", &self.ssh_port)
            .finish_non_exhaustive()
    }
}

impl VmRuntime {
    /// Resolve `spec` against the declared `volumes` and inspect the VM.
    ///
    /// # Errors
    /// Returns [`VboxError::Core`] for an invalid spec or an undeclared
    /// volume name, or the failing inspection.
    pub async fn discover(
        ctx: Arc<VboxContext>,
        identity: VmIdentity,
        spec: HostSpec,
        volumes: &[VolumeSpec],
    ) -> Result<Self, VboxError> {
        spec.validate()?;
        let mut disks = Vec::new();
        let mut host_folders = Vec::new();
        for name in &spec.volumes {
            if is_host_folder(name) {
                host_folders.push(PathBuf::from(name));
                continue;
            }
            let declared = volumes.iter().find(|v| &v.name == name).ok_or_else(|| {
                CoreError::HostValidation {
                    host: spec.name.clone(),
                    field: "volumes".to_owned(),
                    reason: format!("volume {name} is not declared"),
                }
            })?;
            disks.push(VolumeRecord::from_spec(declared, &ctx.config().volumes_dir()));
        }

        let vbox = ctx.vbox(&identity.vm_name());
        let info = inspect(&vbox).await?;
        let initial_state = info.state();
        let ssh_port = info.nat_rules().get(SSH_RULE).copied();
        tracing::debug!(vm = %identity, state = %initial_state, "discovered");
        Ok(Self {
            ctx,
            identity,
            spec,
            vbox,
            disks,
            host_folders,
            info,
            initial_state,
            ssh_port,
            shell: None,
            fresh_origin: false,
        })
    }

    #[must_use]
    pub fn identity(&self) -> &VmIdentity {
        &self.identity
    }

    #[must_use]
    pub fn spec(&self) -> &HostSpec {
        &self.spec
    }

    /// Last inspected machine state.
    #[must_use]
    pub fn info(&self) -> &MachineInfo {
        &self.info
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.info.state()
    }

    /// State when this runtime was discovered.
    #[must_use]
    pub fn initial_state(&self) -> LifecycleState {
        self.initial_state
    }

    #[must_use]
    pub fn was_not_existing(&self) -> bool {
        self.initial_state == LifecycleState::NotExisting
    }

    #[must_use]
    pub fn was_down(&self) -> bool {
        self.initial_state == LifecycleState::Down
    }

    /// Host port forwarded to the guest SSH port.
    #[must_use]
    pub fn ssh_port(&self) -> Option<u16> {
        self.ssh_port
    }

    /// Declared disk volumes with their guest devices once attached.
    #[must_use]
    pub fn disks(&self) -> &[VolumeRecord] {
        &self.disks
    }

    /// Per-VM folder under the machine folder.
    ///
    /// # Errors
    /// Propagates [`VboxContext::machine_folder`] failures.
    pub async fn folder(&self) -> Result<PathBuf, VboxError> {
        Ok(self.ctx.machine_folder().await?.join(self.identity.vm_name()))
    }

    /// Re-read the machine state. Required after every mutation.
    ///
    /// # Errors
    /// Returns the failing inspection.
    pub async fn refresh(&mut self) -> Result<(), VboxError> {
        self.info = inspect(&self.vbox).await?;
        Ok(())
    }

    /// NotExisting to Down: clone the origin disk, register the VM, attach
    /// storage, seed media and guest tooling, and wire both NICs.
    ///
    /// # Errors
    /// Aborts on the first failing step; nothing is rolled back.
    pub async fn prepare_for_creation(&mut self, network: &str) -> Result<(), VboxError> {
        let (origin, tools_iso) = self.resolve_origin().await?;
        let folder = self.folder().await?;
        let system_disk = folder.join(SYSTEM_DISK);
        tracing::info!(vm = %self.identity, origin = %origin.display(), "creating vm");

        if tokio::fs::try_exists(&system_disk).await? {
            tracing::warn!(vm = %self.identity, disk = %system_disk.display(), "system disk left by an earlier run, reusing it");
        } else {
            self.vbox.clone_medium(&origin, &system_disk).await?;
        }
        self.vbox.create(&self.spec.os_type).await?;
        self.vbox.modify(&["--boot1", "disk"]).await?;
        SeedMedia::in_folder(&folder)
            .create_and_attach(&self.vbox, self.ctx.packager(), &self.spec.name, &self.spec.bootstrap)
            .await?;
        if let Some(iso) = &tools_iso {
            guest_tools::attach(&self.vbox, iso).await?;
        }
        self.vbox.attach_disk(SYSTEM_DISK_PORT, &system_disk).await?;
        self.vbox
            .modify(&["--nic1", "nat", "--nic2", "intnet", "--intnet2", network])
            .await?;

        self.fresh_origin = tools_iso.is_some();
        self.refresh().await
    }

    /// Exported image if one exists, else the declared disk plus the
    /// matching guest tooling ISO.
    async fn resolve_origin(&self) -> Result<(PathBuf, Option<PathBuf>), VboxError> {
        let exported = self.ctx.exported_disk(&self.spec.name);
        if tokio::fs::try_exists(&exported).await? {
            return Ok((exported, None));
        }
        let downloaded = self.ctx.artifacts().resolve(&self.spec.disk).await?;
        let origin = locate_vmdk(&downloaded, self.ctx.artifacts()).await?;
        let iso = guest_tools::resolve_iso(&self.ctx.host(), self.ctx.artifacts()).await?;
        Ok((origin, Some(iso)))
    }

    /// Down: clear stale forwards, share the cache and host folders, attach
    /// disks, forward SSH and declared ports, size the VM.
    ///
    /// # Errors
    /// Aborts on the first failing step.
    pub async fn configure_before_start(&mut self) -> Result<(), VboxError> {
        self.delete_nat_rules().await?;
        self.ensure_shared_folders().await?;
        self.ensure_disks_attached().await?;
        for mapping in &self.spec.ports {
            if let Some(host) = mapping.host {
                if !self.ctx.ports().reserve(host).await {
                    tracing::debug!(vm = %self.identity, port = host, "pinned host port already reserved");
                }
            }
        }
        self.assign_ssh_port().await?;
        self.expose_ports().await?;
        let memory = self.spec.memory_mib.to_string();
        let cpus = self.spec.cpus.to_string();
        self.vbox.modify(&["--memory", &memory, "--cpus", &cpus]).await?;
        self.refresh().await
    }

    async fn ensure_shared_folders(&self) -> Result<(), VboxError> {
        let existing = self.info.shared_folders();
        if !existing.contains_key(CACHE_SHARE) {
            let cache = self.ctx.config().cache_dir();
            tokio::fs::create_dir_all(&cache).await?;
            self.vbox.add_shared_folder(&cache, CACHE_SHARE).await?;
        }
        for path in &self.host_folders {
            let share = share_name_for(path);
            if existing.contains_key(&share) {
                continue;
            }
            tokio::fs::create_dir_all(path).await?;
            tracing::info!(vm = %self.identity, share = %share, host = %path.display(), "sharing host folder");
            self.vbox.add_shared_folder(path, &share).await?;
        }
        Ok(())
    }

    async fn ensure_disks_attached(&mut self) -> Result<(), VboxError> {
        let host = self.ctx.host();
        for disk in &mut self.disks {
            disk.create(&host).await?;
            disk.ensure_attached(&self.vbox, &self.info).await?;
            self.info = inspect(&self.vbox).await?;
        }
        Ok(())
    }

    async fn assign_ssh_port(&mut self) -> Result<(), VboxError> {
        let floor = self.ctx.config().ssh_port_floor;
        let start = self.ssh_port.filter(|p| *p >= floor).unwrap_or(floor);
        let port = self.ctx.ports().next_free_port(Some(start)).await?;
        self.vbox
            .add_nat_rule(SSH_RULE, EXTERNAL_IP, port, GUEST_SSH_PORT)
            .await?;
        tracing::info!(vm = %self.identity, port, "assigned ssh port");
        self.ssh_port = Some(port);
        Ok(())
    }

    async fn expose_ports(&self) -> Result<(), VboxError> {
        let mut exposed: BTreeSet<String> = self.info.nat_rules().keys().cloned().collect();
        for mapping in &self.spec.ports {
            let key = nat_key_for(mapping);
            if !exposed.insert(key.clone()) {
                tracing::warn!(vm = %self.identity, port = %mapping, "port already exposed, skipping");
                continue;
            }
            let host_port = match mapping.host {
                Some(port) => port,
                None => {
                    let start = mapping.guest.max(self.ctx.config().port_floor);
                    self.ctx.ports().next_free_port(Some(start)).await?
                }
            };
            self.vbox.add_nat_rule(&key, "", host_port, mapping.guest).await?;
            tracing::debug!(vm = %self.identity, host_port, guest_port = mapping.guest, "exposed port");
        }
        Ok(())
    }

    /// Delete every forwarding rule on the NAT adapter.
    ///
    /// # Errors
    /// Returns the failing tool invocation.
    pub async fn delete_nat_rules(&mut self) -> Result<(), VboxError> {
        let names: Vec<String> = self.info.nat_rules().keys().cloned().collect();
        if names.is_empty() {
            return Ok(());
        }
        for name in &names {
            self.vbox.delete_nat_rule(name).await?;
        }
        tracing::debug!(vm = %self.identity, rules = names.len(), "deleted forwarding rules");
        self.refresh().await
    }

    /// Down to Up: configure, boot headless, re-inspect.
    ///
    /// # Errors
    /// Aborts on the first failing step.
    pub async fn start(&mut self) -> Result<(), VboxError> {
        self.configure_before_start().await?;
        tracing::info!(vm = %self.identity, "starting vm");
        self.vbox.start().await?;
        self.refresh().await
    }

    /// Block until the guest accepts a shell connection; keep it for later
    /// commands.
    ///
    /// # Errors
    /// Returns [`VboxError::Timeout`] after the shell deadline, or
    /// [`VboxError::Shell`] if no SSH port is forwarded.
    pub async fn wait_shell(&mut self) -> Result<(), VboxError> {
        let port = self
            .ssh_port
            .ok_or_else(|| VboxError::shell(self.identity.vm_name(), "no ssh port forwarded"))?;
        let shells = Arc::clone(self.ctx.shells());
        let user = self.spec.user.clone();
        let vm = self.identity.to_string();
        tracing::info!(vm = %vm, port, "waiting for shell");
        let shell = poll_until(
            &format!("shell on {vm}"),
            self.ctx.config().poll_interval(),
            self.ctx.config().shell_timeout(),
            || {
                let shells = Arc::clone(&shells);
                let user = user.clone();
                let vm = vm.clone();
                async move {
                    match shells.connect(EXTERNAL_IP, port, &user).await {
                        Ok(shell) => Ok(Some(shell)),
                        Err(e) => {
                            tracing::debug!(vm = %vm, port, error = %e, "shell not ready");
                            Ok(None)
                        }
                    }
                }
            },
        )
        .await?;
        tracing::info!(vm = %vm, "shell reachable");
        self.shell = Some(shell);
        Ok(())
    }

    fn connected_shell(&self) -> Result<Arc<dyn RemoteShell>, VboxError> {
        self.shell
            .clone()
            .ok_or_else(|| VboxError::shell(self.identity.vm_name(), "shell not connected"))
    }

    /// Block until cloud-init reports boot completion.
    ///
    /// # Errors
    /// Returns [`VboxError::Timeout`] after the boot deadline.
    pub async fn wait_boot_finished(&self) -> Result<(), VboxError> {
        let shell = self.connected_shell()?;
        poll_until(
            &format!("boot completion of {}", self.identity),
            self.ctx.config().poll_interval(),
            self.ctx.config().boot_timeout(),
            || {
                let shell = Arc::clone(&shell);
                async move {
                    let out = shell.run_command_output(BOOT_FINISHED_PROBE).await.unwrap_or_default();
                    Ok((out.trim() == "1").then_some(()))
                }
            },
        )
        .await?;
        tracing::info!(vm = %self.identity, "boot finished");
        Ok(())
    }

    /// After first boot from a non-exported disk: install guest tooling if
    /// the guest marker differs, then reset cloud-init state.
    ///
    /// # Errors
    /// Returns a shell failure.
    pub async fn install_guest_tools(&self) -> Result<(), VboxError> {
        if !self.fresh_origin {
            return Ok(());
        }
        let shell = self.connected_shell()?;
        let version = self.ctx.host().version().await?;
        if guest_tools::ensure_installed(shell.as_ref(), &version).await? {
            tracing::info!(vm = %self.identity, %version, "guest tooling installed");
        }
        shell.run_command("sudo cloud-init clean").await
    }

    /// Mount the shared artifact cache in the guest.
    ///
    /// # Errors
    /// Returns a shell failure.
    pub async fn mount_cache(&self) -> Result<(), VboxError> {
        let shell = self.connected_shell()?;
        shell
            .run_command(&format!(
                "sudo mkdir -p {GUEST_CACHE_DIR} && (mountpoint -q {GUEST_CACHE_DIR} || sudo mount -t vboxsf {CACHE_SHARE} {GUEST_CACHE_DIR})"
            ))
            .await?;
        tracing::debug!(vm = %self.identity, "cache folder mounted");
        Ok(())
    }

    /// Wait for power-off, then drop seed and tooling media and forwards.
    ///
    /// # Errors
    /// Returns [`VboxError::Timeout`] if the VM does not stop, or the
    /// failing tool invocation.
    pub async fn after_down(&mut self) -> Result<(), VboxError> {
        self.wait_down().await?;
        if self.info.is_seed_attached() {
            SeedMedia::in_folder(&self.folder().await?)
                .detach_and_delete(&self.vbox)
                .await?;
        }
        if self.info.is_guest_tools_attached() {
            guest_tools::detach(&self.vbox).await?;
        }
        self.refresh().await?;
        self.delete_nat_rules().await
    }

    async fn wait_down(&mut self) -> Result<(), VboxError> {
        let vbox = self.vbox.clone();
        self.info = poll_until(
            &format!("power-off of {}", self.identity),
            self.ctx.config().poll_interval(),
            self.ctx.config().boot_timeout(),
            || {
                let vbox = vbox.clone();
                async move {
                    let info = inspect(&vbox).await?;
                    let state = info.state();
                    Ok(matches!(state, LifecycleState::Down | LifecycleState::NotExisting).then_some(info))
                }
            },
        )
        .await?;
        Ok(())
    }

    /// Up/Down to NotExisting: power off, strip media, detach disks,
    /// unregister, delete the system disk and the VM folder.
    ///
    /// # Errors
    /// Returns [`VboxError::InvalidState`] for a paused, saved or otherwise
    /// unhandled VM without touching it; otherwise aborts on the first
    /// failing step.
    pub async fn destroy(&mut self) -> Result<(), VboxError> {
        match self.state() {
            LifecycleState::NotExisting => return Ok(()),
            LifecycleState::Up => self.vbox.power_off().await?,
            LifecycleState::Down => {}
            other => {
                return Err(VboxError::InvalidState {
                    vm: self.identity.vm_name(),
                    state: self.info.raw_state().unwrap_or(other.name()).to_owned(),
                    operation: "destroy".to_owned(),
                })
            }
        }
        self.after_down().await?;
        self.detach_disks().await?;
        self.vbox.unregister().await?;

        let folder = self.folder().await?;
        let system_disk = folder.join(SYSTEM_DISK);
        if tokio::fs::try_exists(&system_disk).await? {
            self.vbox.remove_medium(&system_disk).await?;
        }
        match tokio::fs::remove_dir_all(&folder).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.ssh_port = None;
        self.shell = None;
        self.refresh().await?;
        tracing::info!(vm = %self.identity, "vm removed");
        Ok(())
    }

    async fn detach_disks(&mut self) -> Result<(), VboxError> {
        let mut detached = false;
        for disk in &self.disks {
            detached |= disk.ensure_detached(&self.vbox, &self.info).await?;
        }
        if detached {
            self.refresh().await?;
        }
        Ok(())
    }

    /// Shut the running guest down and keep its system disk as the origin
    /// for future creations of this host.
    ///
    /// # Errors
    /// Aborts on the first failing step.
    pub async fn export_image(&mut self) -> Result<PathBuf, VboxError> {
        let port = self
            .ssh_port
            .ok_or_else(|| VboxError::shell(self.identity.vm_name(), "no ssh port forwarded"))?;
        let shell = self
            .ctx
            .shells()
            .connect(EXTERNAL_IP, port, &self.spec.user)
            .await?;
        shell.run_command("sudo cloud-init clean").await?;
        // The connection usually drops before the command returns.
        if let Err(e) = shell.run_command("sudo shutdown -P now").await {
            tracing::debug!(vm = %self.identity, error = %e, "shutdown command ended abruptly");
        }
        self.after_down().await?;
        // Export writes one vmdk per attached disk; only the system disk is kept.
        self.detach_disks().await?;

        let exports = self.ctx.config().exports_dir();
        tokio::fs::create_dir_all(&exports).await?;
        let staging = tempfile::tempdir_in(&exports)?;
        let ovf = staging.path().join(format!("{}.ovf", self.identity.vm_name()));
        tracing::info!(vm = %self.identity, ovf = %ovf.display(), "exporting vm");
        self.vbox.export(&ovf).await?;

        let vmdk = single_vmdk_in(staging.path())
            .await?
            .ok_or_else(|| VboxError::disk_image(staging.path(), "export produced no .vmdk"))?;
        let target = self.ctx.exported_disk(&self.spec.name);
        tokio::fs::rename(&vmdk, &target).await?;
        tracing::info!(vm = %self.identity, image = %target.display(), "image exported");
        Ok(target)
    }

    /// Report for the orchestrator.
    ///
    /// # Errors
    /// Returns the failing guest property query when the VM is up.
    pub async fn instance_info(&self) -> Result<InstanceInfo, VboxError> {
        let ip = if self.state() == LifecycleState::Up {
            self.query_ip().await?
        } else {
            None
        };
        Ok(self.info_with_ip(ip))
    }

    /// Like [`Self::instance_info`], but a running guest is polled until it
    /// publishes its internal address.
    ///
    /// # Errors
    /// Returns [`VboxError::Timeout`] after the IP deadline.
    pub async fn settled_instance_info(&self) -> Result<InstanceInfo, VboxError> {
        let ip = if self.state() == LifecycleState::Up {
            Some(self.internal_ip().await?)
        } else {
            None
        };
        Ok(self.info_with_ip(ip))
    }

    fn info_with_ip(&self, ip: Option<String>) -> InstanceInfo {
        InstanceInfo {
            name: self.spec.name.clone(),
            state: self.state(),
            initial_state: self.initial_state,
            external_ip: EXTERNAL_IP.to_owned(),
            ssh_port: self.ssh_port,
            ip,
            user: self.spec.user.clone(),
        }
    }

    async fn query_ip(&self) -> Result<Option<String>, VboxError> {
        let raw = self.vbox.guest_property(IP_PROPERTY).await?;
        let value = guest_property_value(&raw);
        Ok((value != NO_VALUE && !value.is_empty()).then(|| value.to_owned()))
    }

    /// Poll until the guest reports its address on the environment network.
    ///
    /// # Errors
    /// Returns [`VboxError::Timeout`] after the IP deadline.
    pub async fn internal_ip(&self) -> Result<String, VboxError> {
        poll_until(
            &format!("internal ip of {}", self.identity),
            self.ctx.config().poll_interval(),
            self.ctx.config().ip_timeout(),
            || self.query_ip(),
        )
        .await
    }
}

/// Inspect `vbox`'s VM. A failing `showvminfo` means it is not registered.
///
/// # Errors
/// Returns errors other than a failing tool invocation.
pub async fn inspect(vbox: &Vbox) -> Result<MachineInfo, VboxError> {
    match vbox.show_vm_info().await {
        Ok(out) => Ok(MachineInfo::from_output(&out)),
        Err(VboxError::ExternalTool { .. }) => Ok(MachineInfo::not_existing()),
        Err(e) => Err(e),
    }
}

/// Find the `.vmdk` to clone for a resolved origin artifact.
///
/// A `.vmdk` is used directly; a sibling `<stem>.vmdk` is preferred for
/// anything else; a `.box` archive is unpacked next to itself and must
/// contain exactly one `.vmdk`, which is kept as `<stem>.vmdk`.
///
/// # Errors
/// Returns [`VboxError::DiskImage`] for unrecognized or malformed images.
pub async fn locate_vmdk(artifact: &Path, artifacts: &dyn ArtifactStore) -> Result<PathBuf, VboxError> {
    if has_extension(artifact, "vmdk") {
        return Ok(artifact.to_path_buf());
    }
    let sibling = artifact.with_extension("vmdk");
    if tokio::fs::try_exists(&sibling).await? {
        return Ok(sibling);
    }
    if !has_extension(artifact, "box") {
        return Err(VboxError::disk_image(artifact, "unrecognized extension"));
    }

    let parent = artifact
        .parent()
        .ok_or_else(|| VboxError::disk_image(artifact, "archive has no parent directory"))?;
    let staging = tempfile::tempdir_in(parent)?;
    artifacts.unpack(artifact, staging.path()).await?;
    let found = single_vmdk_in(staging.path())
        .await?
        .ok_or_else(|| VboxError::disk_image(artifact, "archive contains no single .vmdk"))?;
    tokio::fs::rename(&found, &sibling).await?;
    tracing::info!(archive = %artifact.display(), disk = %sibling.display(), "unpacked origin disk");
    Ok(sibling)
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension().is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

/// The only `.vmdk` directly inside `dir`, or `None` if there are zero or
/// several.
async fn single_vmdk_in(dir: &Path) -> Result<Option<PathBuf>, VboxError> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut found = None;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if has_extension(&path, "vmdk") {
            if found.is_some() {
                return Ok(None);
            }
            found = Some(path);
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;

    struct TarLike;

    #[async_trait]
    impl ArtifactStore for TarLike {
        async fn resolve(&self, url: &str) -> Result<PathBuf, VboxError> {
            Ok(PathBuf::from(url))
        }

        async fn unpack(&self, _archive: &Path, into: &Path) -> Result<(), VboxError> {
            tokio::fs::write(into.join("box-disk001.vmdk"), b"disk").await?;
            tokio::fs::write(into.join("box.ovf"), b"<ovf/>").await?;
            Ok(())
        }
    }

    fn tempdir() -> tempfile::TempDir {
        match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("tempdir: {e}"),
        }
    }

    #[tokio::test]
    async fn vmdk_is_used_directly() {
        let path = Path::new("/images/jammy.vmdk");
        match locate_vmdk(path, &TarLike).await {
            Ok(p) => assert_eq!(p, path),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    #[tokio::test]
    async fn box_is_unpacked_to_sibling_vmdk() {
        let dir = tempdir();
        let archive = dir.path().join("jammy.box");
        if let Err(e) = std::fs::write(&archive, b"tar") {
            panic!("write: {e}");
        }
        match locate_vmdk(&archive, &TarLike).await {
            Ok(p) => {
                assert_eq!(p, dir.path().join("jammy.vmdk"));
                assert!(p.exists());
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
        // Second call finds the sibling without unpacking again.
        match locate_vmdk(&archive, &TarLike).await {
            Ok(p) => assert_eq!(p, dir.path().join("jammy.vmdk")),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    #[tokio::test]
    async fn unknown_extension_is_rejected() {
        let dir = tempdir();
        let raw = dir.path().join("jammy.qcow2");
        match locate_vmdk(&raw, &TarLike).await {
            Err(VboxError::DiskImage { reason, .. }) => assert_eq!(reason, "unrecognized extension"),
            other => panic!("expected DiskImage error, got {other:?}"),
        }
    }
}
