use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Lifecycle state of a VM as observed through the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum LifecycleState {
    /// The hypervisor does not know a VM by this name.
    NotExisting,
    /// Registered but powered off or aborted.
    Down,
    /// Running.
    Up,
    /// Any other hypervisor state (saved, paused, ...). Reported, never acted upon.
    Other,
}

impl LifecycleState {
    /// Short lowercase name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::NotExisting => "not_existing",
            Self::Down => "down",
            Self::Up => "up",
            Self::Other => "other",
        }
    }

    /// Whether bring-up has to create or start this VM.
    #[must_use]
    pub const fn needs_bring_up(self) -> bool {
        matches!(self, Self::NotExisting | Self::Down)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LifecycleState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_existing" => Ok(Self::NotExisting),
            "down" => Ok(Self::Down),
            "up" => Ok(Self::Up),
            "other" => Ok(Self::Other),
            other => Err(CoreError::UnknownState(other.to_owned())),
        }
    }
}

/// What the orchestrator learns about one VM after an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    /// Declared host name.
    pub name: String,
    /// State observed at the end of the operation.
    pub state: LifecycleState,
    /// State observed when the operation started.
    pub initial_state: LifecycleState,
    /// Address the host reaches the VM on (loopback, via NAT forwarding).
    pub external_ip: String,
    /// Host port forwarded to the guest SSH port, if assigned.
    pub ssh_port: Option<u16>,
    /// Guest address on the environment network, when the VM is up.
    pub ip: Option<String>,
    /// Login user.
    pub user: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_not_existing_and_down_need_bring_up() {
        assert!(LifecycleState::NotExisting.needs_bring_up());
        assert!(LifecycleState::Down.needs_bring_up());
        assert!(!LifecycleState::Up.needs_bring_up());
        assert!(!LifecycleState::Other.needs_bring_up());
    }

    #[test]
    fn state_names_parse_back() {
        for state in [
            LifecycleState::NotExisting,
            LifecycleState::Down,
            LifecycleState::Up,
            LifecycleState::Other,
        ] {
            assert_eq!(state.name().parse::<LifecycleState>().ok(), Some(state));
        }
        assert!("paused".parse::<LifecycleState>().is_err());
    }

    #[test]
    fn state_serializes_snake_case() {
        let json = match serde_json::to_string(&LifecycleState::NotExisting) {
            Ok(s) => s,
            Err(e) => panic!("serialization failed: {e}"),
        };
        assert_eq!(json, "\"not_existing\"");
    }
}
