//! Hypervisor guest tooling (Guest Additions).

use std::path::{Path, PathBuf};

use crate::capability::{ArtifactStore, RemoteShell};
use crate::cli::Vbox;
use crate::vminfo::GUEST_TOOLS_DEVICE;
use crate::VboxError;

/// Guest file recording the installed tooling version.
pub const VERSION_MARKER: &str = "/var/vmfleet/guest_tools_version";

/// Download URL of the tooling ISO matching hypervisor `version`.
#[must_use]
pub fn iso_url(version: &str) -> String {
    format!("https://download.virtualbox.org/virtualbox/{version}/VBoxGuestAdditions_{version}.iso")
}

/// Install script for `version`.
///
/// The script checks the marker itself, so running it twice for the same
/// version is a no-op on the guest.
#[must_use]
pub fn install_script(version: &str) -> String {
    format!(
        r#"#!/bin/bash
set -e
install_guest () {{
    if [ -f /etc/os-release ]; then
        . /etc/os-release
        if [ "$NAME" == "Ubuntu" ]; then
            apt-get update
            apt-get install -y libxt6 libxmu6 bzip2 build-essential gcc make perl dkms
        fi
    fi
    mkdir -p /mnt/vbox
    mount /dev/sr1 /mnt/vbox
    # the installer exits 2 even on success
    sh /mnt/vbox/VBoxLinuxAdditions.run --nox11 || true
    umount /dev/sr1
    rm -rf /mnt/vbox
    echo {version} > {VERSION_MARKER}
}}

mkdir -p "$(dirname {VERSION_MARKER})"
if [ -f {VERSION_MARKER} ]; then
    if [ "$(cat {VERSION_MARKER})" != "{version}" ]; then
        install_guest
    fi
else
    install_guest
fi
"#
    )
}

/// Locate the tooling ISO for the running hypervisor.
///
/// # Errors
/// Returns the failing `--version` call or an artifact error.
pub async fn resolve_iso(host: &Vbox, artifacts: &dyn ArtifactStore) -> Result<PathBuf, VboxError> {
    let version = host.version().await?;
    artifacts.resolve(&iso_url(&version)).await
}

/// Insert the tooling ISO on IDE device 1.
///
/// # Errors
/// Returns the failing tool invocation.
pub async fn attach(vm: &Vbox, iso: &Path) -> Result<(), VboxError> {
    vm.attach_dvd(GUEST_TOOLS_DEVICE, iso).await
}

/// Empty IDE device 1.
///
/// # Errors
/// Returns the failing tool invocation.
pub async fn detach(vm: &Vbox) -> Result<(), VboxError> {
    vm.detach_dvd(GUEST_TOOLS_DEVICE).await
}

/// Version recorded on the guest, if any.
///
/// # Errors
/// Returns a shell failure.
pub async fn installed_version(shell: &dyn RemoteShell) -> Result<Option<String>, VboxError> {
    let out = shell
        .run_command_output(&format!("cat {VERSION_MARKER} 2>/dev/null || true"))
        .await?;
    let version = out.trim();
    Ok((!version.is_empty()).then(|| version.to_owned()))
}

/// Install tooling `version` unless the guest marker already records it.
/// Returns whether the install script ran.
///
/// # Errors
/// Returns a shell failure.
pub async fn ensure_installed(shell: &dyn RemoteShell, version: &str) -> Result<bool, VboxError> {
    if installed_version(shell).await?.as_deref() == Some(version) {
        tracing::debug!(version, "guest tooling already installed");
        return Ok(false);
    }
    shell.run_script(&install_script(version)).await?;
    Ok(true)
}
