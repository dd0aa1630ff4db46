//! Environment-scoped private networks.
//!
//! Each environment gets one internal network backed by a hypervisor DHCP
//! server on `192.168.{index}.0/24`. Index selection and creation happen
//! under one process-wide lock so concurrent environments never pick the
//! same index.

use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::sync::Arc;

use tokio::sync::Mutex;
use vmfleet_core::EnvironmentId;

use crate::cli::{CommandRunner, Vbox};
use crate::parser::Record;
use crate::VboxError;

/// Third-octet values available to environment networks.
pub const NETWORK_INDEXES: RangeInclusive<u8> = 99..=254;

/// One DHCP server as reported by `list dhcpservers`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct DhcpServer {
    pub network_name: String,
    pub ip: String,
    pub network_mask: String,
    pub lower_ip: String,
    pub upper_ip: String,
    pub enabled: bool,
}

impl DhcpServer {
    /// The address plan for a new network at `index`.
    #[must_use]
    pub fn planned(network_name: impl Into<String>, index: u8) -> Self {
        Self {
            network_name: network_name.into(),
            ip: format!("192.168.{index}.1"),
            network_mask: "255.255.255.0".to_owned(),
            lower_ip: format!("192.168.{index}.2"),
            upper_ip: format!("192.168.{index}.254"),
            enabled: true,
        }
    }

    /// Read a server from one block of the listing. Blocks without a
    /// network name are not servers.
    #[must_use]
    pub fn from_record(record: &Record) -> Option<Self> {
        let field = |key: &str| record.get(key).cloned().unwrap_or_default();
        let network_name = record.get("NetworkName")?.clone();
        let ip = record
            .get("Dhcpd IP")
            .or_else(|| record.get("IP"))
            .cloned()
            .unwrap_or_default();
        Some(Self {
            network_name,
            ip,
            network_mask: field("NetworkMask"),
            lower_ip: field("LowerIPAddress"),
            upper_ip: field("UpperIPAddress"),
            enabled: record.get("Enabled").is_some_and(|v| v == "Yes"),
        })
    }

    /// Third octet of the server address.
    #[must_use]
    pub fn index(&self) -> Option<u8> {
        self.ip.split('.').nth(2)?.parse().ok()
    }
}

/// Servers on the host keyed by network name and by index.
#[derive(Debug, Default)]
struct DhcpServers {
    by_name: BTreeMap<String, DhcpServer>,
    by_index: BTreeMap<u8, String>,
}

impl DhcpServers {
    fn from_records(records: &[Record]) -> Self {
        let mut servers = Self::default();
        for server in records.iter().filter_map(DhcpServer::from_record) {
            if let Some(index) = server.index() {
                servers.by_index.insert(index, server.network_name.clone());
            }
            servers.by_name.insert(server.network_name.clone(), server);
        }
        servers
    }

    fn next_free_index(&self) -> Option<u8> {
        NETWORK_INDEXES.into_iter().find(|i| !self.by_index.contains_key(i))
    }
}

/// Creates and removes environment networks.
pub struct NetworkProvisioner {
    host: Vbox,
    prefix: String,
    lock: Mutex<()>,
}

impl std::fmt::Debug for NetworkProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkProvisioner")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl NetworkProvisioner {
    /// Network names are `{prefix}_{environment}`.
    pub fn new(runner: Arc<dyn CommandRunner>, prefix: impl Into<String>) -> Self {
        Self {
            host: Vbox::host(runner),
            prefix: prefix.into(),
            lock: Mutex::new(()),
        }
    }

    /// Name of the network for `environment`.
    #[must_use]
    pub fn network_name(&self, environment: &EnvironmentId) -> String {
        format!("{}_{}", self.prefix, environment)
    }

    /// Make sure the environment network exists and return its name.
    ///
    /// Idempotent: an existing network is returned untouched.
    ///
    /// # Errors
    /// Returns [`VboxError::NetworkIndexExhausted`] when every index is in
    /// use, or the failing tool invocation.
    pub async fn ensure_exists(&self, environment: &EnvironmentId) -> Result<String, VboxError> {
        let _guard = self.lock.lock().await;
        let name = self.network_name(environment);
        let servers = DhcpServers::from_records(&self.host.list_dhcp_servers().await?);
        if servers.by_name.contains_key(&name) {
            tracing::debug!(network = %name, "network already present");
            return Ok(name);
        }

        let index = servers
            .next_free_index()
            .ok_or_else(|| VboxError::NetworkIndexExhausted { network: name.clone() })?;
        let plan = DhcpServer::planned(name.clone(), index);
        self.host
            .execute(&[
                "dhcpserver",
                "add",
                "--netname",
                &plan.network_name,
                "--ip",
                &plan.ip,
                "--netmask",
                &plan.network_mask,
                "--lowerip",
                &plan.lower_ip,
                "--upperip",
                &plan.upper_ip,
                "--enable",
            ])
            .await?;
        tracing::info!(network = %name, index, "created environment network");
        Ok(name)
    }

    /// Remove the environment network if present.
    ///
    /// # Errors
    /// Returns the failing tool invocation.
    pub async fn ensure_deleted(&self, environment: &EnvironmentId) -> Result<(), VboxError> {
        let _guard = self.lock.lock().await;
        let name = self.network_name(environment);
        let servers = DhcpServers::from_records(&self.host.list_dhcp_servers().await?);
        let Some(server) = servers.by_name.get(&name) else {
            return Ok(());
        };
        if server.enabled {
            self.host
                .execute(&["dhcpserver", "modify", "--netname", &name, "--disable"])
                .await?;
        }
        self.host.execute(&["dhcpserver", "remove", "--netname", &name]).await?;
        tracing::info!(network = %name, "removed environment network");
        Ok(())
    }
}
