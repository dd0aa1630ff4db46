//! Core types for declaratively provisioned VM fleets.
//!
//! Defines what the orchestrator declares (hosts, ports, volumes), how VMs
//! are named inside an environment, and what is reported back.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod error;
pub mod host;
pub mod id;
pub mod instance;

pub use error::CoreError;
pub use host::{is_host_folder, HostSpec, PortMapping, VolumeSpec};
pub use id::{EnvironmentId, VmIdentity};
pub use instance::{InstanceInfo, LifecycleState};
