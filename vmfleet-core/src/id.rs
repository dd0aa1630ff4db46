use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Scopes every hypervisor resource (VM names, network names) so that
/// several independent deployments can share one host machine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EnvironmentId(String);

impl EnvironmentId {
    /// Creates an `EnvironmentId` after validating it.
    ///
    /// Allowed characters are ASCII alphanumerics, `-`, `.` and `_`, which
    /// keeps derived VM and network names valid for `VBoxManage`.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidEnvironmentId`] if `value` is empty or
    /// contains other characters.
    pub fn new(value: impl Into<String>) -> Result<Self, CoreError> {
        let value = value.into();
        if value.is_empty() {
            return Err(CoreError::InvalidEnvironmentId {
                value,
                reason: "must not be empty".to_owned(),
            });
        }
        if let Some(bad) = value
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_')))
        {
            return Err(CoreError::InvalidEnvironmentId {
                reason: format!("character '{bad}' is not allowed"),
                value,
            });
        }
        Ok(Self(value))
    }

    /// Returns the raw id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EnvironmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EnvironmentId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for EnvironmentId {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<EnvironmentId> for String {
    fn from(id: EnvironmentId) -> Self {
        id.0
    }
}

/// Name of a VM as registered with the hypervisor.
///
/// Always `"{host_name}_{environment}"`. It is a pure function of its two
/// inputs and is never persisted on its own.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct VmIdentity {
    host_name: String,
    environment: EnvironmentId,
}

impl VmIdentity {
    /// Derives the identity of `host_name` inside `environment`.
    pub fn new(host_name: impl Into<String>, environment: EnvironmentId) -> Self {
        Self {
            host_name: host_name.into(),
            environment,
        }
    }

    /// The declared host name (without the environment suffix).
    #[must_use]
    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    /// The environment this VM belongs to.
    #[must_use]
    pub fn environment(&self) -> &EnvironmentId {
        &self.environment
    }

    /// The hypervisor-level VM name.
    #[must_use]
    pub fn vm_name(&self) -> String {
        format!("{}_{}", self.host_name, self.environment)
    }
}

impl fmt::Display for VmIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.host_name, self.environment)
    }
}
