//! Request bodies accepted from the orchestrator and their validation.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use vmfleet_core::{is_host_folder, EnvironmentId, HostSpec, VolumeSpec};

use crate::error::GatewayError;

/// The desired state of one environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetDeclaration {
    pub environment: String,
    #[serde(default)]
    pub hosts: Vec<HostSpec>,
    #[serde(default)]
    pub volumes: Vec<VolumeSpec>,
}

/// A validated declaration, ready to hand to the provider.
#[derive(Debug, Clone)]
pub struct ValidDeclaration {
    pub environment: EnvironmentId,
    pub hosts: Vec<HostSpec>,
    pub volumes: Vec<VolumeSpec>,
}

impl FleetDeclaration {
    /// Check the declaration as a whole.
    ///
    /// # Errors
    /// Returns [`GatewayError::Declaration`] for an invalid environment or
    /// host field, and [`GatewayError::InvalidRequest`] for duplicate host
    /// or volume names and volume references with no declaration.
    pub fn validate(self) -> Result<ValidDeclaration, GatewayError> {
        let environment = EnvironmentId::new(self.environment)?;

        let mut volume_names = HashSet::new();
        for volume in &self.volumes {
            if !volume_names.insert(volume.name.as_str()) {
                return Err(GatewayError::InvalidRequest(format!(
                    "volume '{}' declared more than once",
                    volume.name
                )));
            }
        }

        let mut host_names = HashSet::new();
        for host in &self.hosts {
            host.validate()?;
            if !host_names.insert(host.name.as_str()) {
                return Err(GatewayError::InvalidRequest(format!(
                    "host '{}' declared more than once",
                    host.name
                )));
            }
            if let Some(missing) = host
                .volumes
                .iter()
                .find(|v| !is_host_folder(v) && !volume_names.contains(v.as_str()))
            {
                return Err(GatewayError::InvalidRequest(format!(
                    "host '{}' references undeclared volume '{missing}'",
                    host.name
                )));
            }
        }

        Ok(ValidDeclaration {
            environment,
            hosts: self.hosts,
            volumes: self.volumes,
        })
    }
}

/// Body of `POST /v1/volumes/destroy`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestroyVolumesBody {
    pub environment: String,
    #[serde(default)]
    pub volumes: Vec<VolumeSpec>,
    pub names: Vec<String>,
}

impl DestroyVolumesBody {
    /// Split into a host-less declaration and the names to destroy.
    ///
    /// # Errors
    /// Same as [`FleetDeclaration::validate`].
    pub fn validate(self) -> Result<(ValidDeclaration, Vec<String>), GatewayError> {
        let declaration = FleetDeclaration {
            environment: self.environment,
            hosts: Vec::new(),
            volumes: self.volumes,
        }
        .validate()?;
        Ok((declaration, self.names))
    }
}
