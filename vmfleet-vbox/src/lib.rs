//! VirtualBox provider for vmfleet.
//!
//! Drives `VBoxManage` to reconcile VMs against declared host
//! specifications: inspection and parsing of machine-readable output, port
//! and network allocation, volumes, seed media, the per-VM lifecycle and
//! fleet-wide bring-up and teardown.
//!
//! Every hypervisor call goes through [`CommandRunner`]; shells, artifacts
//! and media packaging are collaborators behind the traits in
//! [`capability`].

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod capability;
pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod fleet;
pub mod guest_tools;
pub mod network;
pub mod parser;
pub mod ports;
pub mod seed;
pub mod vm;
pub mod vminfo;
pub mod volume;
pub mod wait;

pub use capability::{ArtifactStore, CacheDirStore, IsoTool, MediaPackager, RemoteShell, ShellConnector, SshCli};
pub use cli::{CommandRunner, VBoxManage, Vbox};
pub use config::VboxConfig;
pub use context::VboxContext;
pub use error::VboxError;
pub use fleet::{Fleet, UpReport};
pub use network::{DhcpServer, NetworkProvisioner};
pub use ports::PortAllocator;
pub use vm::VmRuntime;
pub use vminfo::MachineInfo;
pub use volume::VolumeRecord;
