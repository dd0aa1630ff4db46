//! Process-scoped state shared by every VM runtime.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::OnceCell;

use crate::capability::{ArtifactStore, MediaPackager, ShellConnector};
use crate::cli::{CommandRunner, Vbox};
use crate::network::NetworkProvisioner;
use crate::ports::PortAllocator;
use crate::{VboxConfig, VboxError};

/// Handles, registries and collaborators for one provider process.
///
/// Created once at start-up and shared by reference; the port registry and
/// the network lock inside it are the only cross-VM mutable state.
pub struct VboxContext {
    config: VboxConfig,
    runner: Arc<dyn CommandRunner>,
    ports: PortAllocator,
    network: NetworkProvisioner,
    shells: Arc<dyn ShellConnector>,
    artifacts: Arc<dyn ArtifactStore>,
    packager: Arc<dyn MediaPackager>,
    machine_folder: OnceCell<PathBuf>,
}

impl std::fmt::Debug for VboxContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VboxContext")
            .field("config", &self.config)
            .field("ports", &self.ports)
            .field("network", &self.network)
            .finish_non_exhaustive()
    }
}

impl VboxContext {
    /// Assemble a context from configuration and collaborators.
    pub fn new(
        config: VboxConfig,
        runner: Arc<dyn CommandRunner>,
        shells: Arc<dyn ShellConnector>,
        artifacts: Arc<dyn ArtifactStore>,
        packager: Arc<dyn MediaPackager>,
    ) -> Self {
        let machine_folder = OnceCell::new_with(config.machine_folder.clone());
        Self {
            ports: PortAllocator::new(config.port_floor),
            network: NetworkProvisioner::new(Arc::clone(&runner), config.network_prefix.clone()),
            config,
            runner,
            shells,
            artifacts,
            packager,
            machine_folder,
        }
    }

    #[must_use]
    pub fn config(&self) -> &VboxConfig {
        &self.config
    }

    #[must_use]
    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    #[must_use]
    pub fn network(&self) -> &NetworkProvisioner {
        &self.network
    }

    #[must_use]
    pub fn shells(&self) -> &Arc<dyn ShellConnector> {
        &self.shells
    }

    #[must_use]
    pub fn artifacts(&self) -> &dyn ArtifactStore {
        self.artifacts.as_ref()
    }

    #[must_use]
    pub fn packager(&self) -> &dyn MediaPackager {
        self.packager.as_ref()
    }

    /// Host-level commands.
    #[must_use]
    pub fn host(&self) -> Vbox {
        Vbox::host(Arc::clone(&self.runner))
    }

    /// Commands addressed to VM `name`.
    #[must_use]
    pub fn vbox(&self, name: &str) -> Vbox {
        Vbox::new(Arc::clone(&self.runner), name)
    }

    /// Parent directory of per-VM folders, asked from the hypervisor once
    /// unless configured.
    ///
    /// # Errors
    /// Returns the failing tool invocation or
    /// [`VboxError::UnexpectedOutput`] if the property is missing.
    pub async fn machine_folder(&self) -> Result<&Path, VboxError> {
        let folder = self
            .machine_folder
            .get_or_try_init(|| async {
                let props = self.host().system_properties().await?;
                props
                    .get("Default machine folder")
                    .map(PathBuf::from)
                    .ok_or_else(|| VboxError::UnexpectedOutput {
                        field: "Default machine folder".to_owned(),
                        value: "missing from list systemproperties".to_owned(),
                    })
            })
            .await?;
        Ok(folder.as_path())
    }

    /// Where the exported system disk of `host_name` is kept.
    #[must_use]
    pub fn exported_disk(&self, host_name: &str) -> PathBuf {
        self.config.exports_dir().join(format!("{host_name}.vmdk"))
    }
}
