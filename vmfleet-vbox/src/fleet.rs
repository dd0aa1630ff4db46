//! Fleet-wide operations over every host declared for one environment.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use vmfleet_core::{EnvironmentId, HostSpec, InstanceInfo, LifecycleState, VmIdentity, VolumeSpec};

use crate::context::VboxContext;
use crate::vm::VmRuntime;
use crate::volume::VolumeRecord;
use crate::VboxError;

/// Outcome of [`Fleet::up`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct UpReport {
    pub environment: EnvironmentId,
    /// Environment network, when any VM needed it.
    pub network: Option<String>,
    pub observed_at: DateTime<Utc>,
    /// One record per discovered VM, in declaration order.
    pub instances: Vec<InstanceInfo>,
}

/// The declared hosts and volumes of one environment.
#[derive(Debug, Clone)]
pub struct Fleet {
    ctx: Arc<VboxContext>,
    environment: EnvironmentId,
    hosts: Vec<HostSpec>,
    volumes: Arc<[VolumeSpec]>,
}

impl Fleet {
    pub fn new(
        ctx: Arc<VboxContext>,
        environment: EnvironmentId,
        hosts: Vec<HostSpec>,
        volumes: Vec<VolumeSpec>,
    ) -> Self {
        Self {
            ctx,
            environment,
            hosts,
            volumes: volumes.into(),
        }
    }

    #[must_use]
    pub fn environment(&self) -> &EnvironmentId {
        &self.environment
    }

    /// Inspect every declared host concurrently.
    ///
    /// A host whose discovery fails is logged and left out; the others are
    /// returned in declaration order.
    pub async fn discover(&self) -> Vec<VmRuntime> {
        let mut workers = JoinSet::new();
        for (position, spec) in self.hosts.iter().cloned().enumerate() {
            let ctx = Arc::clone(&self.ctx);
            let identity = VmIdentity::new(spec.name.clone(), self.environment.clone());
            let volumes = Arc::clone(&self.volumes);
            workers.spawn(async move {
                let host = spec.name.clone();
                (position, host, VmRuntime::discover(ctx, identity, spec, &volumes).await)
            });
        }

        let mut found = Vec::with_capacity(self.hosts.len());
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((position, _, Ok(vm))) => found.push((position, vm)),
                Ok((_, host, Err(e))) => {
                    tracing::error!(host = %host, error = %e, "discovery failed, host skipped");
                }
                Err(e) => tracing::error!(error = %e, "discovery worker aborted"),
            }
        }
        found.sort_by_key(|(position, _)| *position);
        found.into_iter().map(|(_, vm)| vm).collect()
    }

    /// Bring every declared VM up.
    ///
    /// VMs that do not exist are created, stopped ones are started, one at a
    /// time. All of them are then waited on concurrently for shell
    /// reachability, and only after every one is reachable does boot
    /// completion, guest tooling and cache mounting proceed.
    ///
    /// # Errors
    /// Returns the first lifecycle failure. VMs already touched are left as
    /// they are for the next run to pick up.
    pub async fn up(&self) -> Result<UpReport, VboxError> {
        let (mut touched, settled): (Vec<_>, Vec<_>) = self
            .discover()
            .await
            .into_iter()
            .enumerate()
            .partition(|(_, vm)| vm.state().needs_bring_up());

        for (_, vm) in &settled {
            if vm.state() == LifecycleState::Other {
                tracing::warn!(vm = %vm.identity(), raw = ?vm.info().raw_state(), "vm in a state that is not acted upon");
            }
        }

        let network = if touched.is_empty() {
            None
        } else {
            Some(self.ctx.network().ensure_exists(&self.environment).await?)
        };

        for (_, vm) in &mut touched {
            if vm.was_not_existing() {
                if let Some(network) = &network {
                    vm.prepare_for_creation(network).await?;
                }
            }
            vm.start().await?;
        }

        let reachable = join_all(touched.iter_mut().map(|(_, vm)| vm.wait_shell())).await;
        reachable.into_iter().collect::<Result<Vec<()>, _>>()?;

        for (_, vm) in &touched {
            if vm.was_not_existing() {
                vm.wait_boot_finished().await?;
                vm.install_guest_tools().await?;
            }
            vm.mount_cache().await?;
        }

        let mut all: Vec<_> = touched.into_iter().chain(settled).collect();
        all.sort_by_key(|(position, _)| *position);
        let mut instances = Vec::with_capacity(all.len());
        for (_, vm) in &all {
            instances.push(vm.settled_instance_info().await?);
        }
        tracing::info!(environment = %self.environment, vms = instances.len(), "fleet up");
        Ok(UpReport {
            environment: self.environment.clone(),
            network,
            observed_at: Utc::now(),
            instances,
        })
    }

    /// Destroy every existing VM, then the environment network.
    ///
    /// VMs in a state other than up or down are left alone, and so is the
    /// network they use.
    ///
    /// # Errors
    /// Returns the first teardown failure.
    pub async fn delete(&self) -> Result<(), VboxError> {
        let mut skipped = 0usize;
        for mut vm in self.discover().await {
            match vm.state() {
                LifecycleState::NotExisting => {}
                LifecycleState::Up | LifecycleState::Down => vm.destroy().await?,
                _ => {
                    tracing::warn!(vm = %vm.identity(), raw = ?vm.info().raw_state(), "not destroying vm in this state");
                    skipped += 1;
                }
            }
        }
        if skipped == 0 {
            self.ctx.network().ensure_deleted(&self.environment).await?;
        }
        Ok(())
    }

    /// Report every discovered VM.
    ///
    /// # Errors
    /// Returns the first failing guest property query.
    pub async fn instance_infos(&self) -> Result<Vec<InstanceInfo>, VboxError> {
        let mut infos = Vec::new();
        for vm in self.discover().await {
            infos.push(vm.instance_info().await?);
        }
        Ok(infos)
    }

    /// Export every running VM's system disk for reuse as an origin disk.
    /// Returns the exported files.
    ///
    /// # Errors
    /// Returns the first export failure.
    pub async fn image(&self) -> Result<Vec<PathBuf>, VboxError> {
        let mut exported = Vec::new();
        for mut vm in self.discover().await {
            if vm.state() == LifecycleState::Up {
                exported.push(vm.export_image().await?);
            } else {
                tracing::warn!(vm = %vm.identity(), state = %vm.state(), "only running vms are exported");
            }
        }
        Ok(exported)
    }

    /// Close and delete the backing files of the named declared volumes.
    ///
    /// Unknown names, host folders and volumes without a backing file are
    /// skipped.
    ///
    /// # Errors
    /// Returns the first failing deletion.
    pub async fn destroy_volumes(&self, names: &[String]) -> Result<(), VboxError> {
        let host = self.ctx.host();
        let default_dir = self.ctx.config().volumes_dir();
        for name in names {
            let Some(spec) = self.volumes.iter().find(|v| &v.name == name) else {
                tracing::warn!(volume = %name, "volume is not declared, skipping");
                continue;
            };
            if spec.is_host_folder() {
                continue;
            }
            let record = VolumeRecord::from_spec(spec, &default_dir);
            if tokio::fs::try_exists(record.file()).await? {
                record.delete(&host).await?;
            } else {
                tracing::debug!(volume = %name, "no backing file");
            }
        }
        Ok(())
    }
}
