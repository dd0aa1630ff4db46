//! cloud-init seed media.

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::capability::MediaPackager;
use crate::cli::Vbox;
use crate::vminfo::SEED_DEVICE;
use crate::VboxError;

/// Volume label cloud-init's NoCloud source looks for.
pub const SEED_LABEL: &str = "cidata";

/// File name of the seed image inside the VM folder.
pub const SEED_FILE: &str = "seed.iso";

/// Guest path the bootstrap script is written to.
const BOOTSTRAP_PATH: &str = "/run/authorized-data.sh";

/// NoCloud `meta-data` for `host_name`.
#[must_use]
pub fn meta_data(host_name: &str) -> String {
    format!("instance-id: iid-{host_name}\nlocal-hostname: {host_name}\n")
}

/// NoCloud `user-data` that writes `bootstrap` to the guest and runs it once.
#[must_use]
pub fn user_data(bootstrap: &str) -> String {
    let script = format!("#!/bin/bash\n{bootstrap}\n");
    let encoded = STANDARD.encode(script);
    format!(
        "#cloud-config\n\
         write_files:\n  \
         - encoding: b64\n    \
         content: {encoded}\n    \
         owner: root:root\n    \
         path: {BOOTSTRAP_PATH}\n\
         runcmd:\n  \
         - bash {BOOTSTRAP_PATH}\n"
    )
}

/// The seed image of one VM.
#[derive(Debug, Clone)]
pub struct SeedMedia {
    path: PathBuf,
}

impl SeedMedia {
    /// Seed image stored in `vm_folder`.
    #[must_use]
    pub fn in_folder(vm_folder: &Path) -> Self {
        Self {
            path: vm_folder.join(SEED_FILE),
        }
    }

    /// Image path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Render, package and attach the seed on IDE device 0.
    ///
    /// # Errors
    /// Returns packaging I/O failures or the failing tool invocation.
    pub async fn create_and_attach(
        &self,
        vm: &Vbox,
        packager: &dyn MediaPackager,
        host_name: &str,
        bootstrap: &str,
    ) -> Result<(), VboxError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let meta = meta_data(host_name);
        let user = user_data(bootstrap);
        packager
            .package(SEED_LABEL, &[("meta-data", &meta), ("user-data", &user)], &self.path)
            .await?;
        tracing::debug!(vm = %vm.name(), seed = %self.path.display(), "attaching seed media");
        vm.attach_dvd(SEED_DEVICE, &self.path).await
    }

    /// Detach the seed, then delete its file. The hypervisor holds the
    /// file while attached, so the order matters.
    ///
    /// # Errors
    /// Returns the failing tool invocation or a deletion failure other than
    /// the file already being gone.
    pub async fn detach_and_delete(&self, vm: &Vbox) -> Result<(), VboxError> {
        vm.detach_dvd(SEED_DEVICE).await?;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
