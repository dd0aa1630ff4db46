//! Error types for the VirtualBox provider.

use std::path::PathBuf;
use std::time::Duration;

use vmfleet_core::CoreError;

/// Errors that can occur while driving VirtualBox.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum VboxError {
    /// A `VBoxManage` invocation exited non-zero.
    ///
    /// Carries the full command line and combined output; this is the main
    /// diagnostic surface, so it is never discarded.
    #[error("command {command} failed: output is:\n{output}")]
    ExternalTool { command: String, output: String },

    /// A bounded wait ran past its deadline.
    #[error("timed out after {}s waiting for {what}", after.as_secs())]
    Timeout { what: String, after: Duration },

    /// No free TCP port at or above the floor.
    #[error("no free port available at or above {floor}")]
    PortsExhausted { floor: u16 },

    /// Every network index in the supported range is taken.
    #[error("no free network index left for environment network {network}")]
    NetworkIndexExhausted { network: String },

    /// The origin disk could not be located or prepared.
    #[error("disk image {}: {reason}", path.display())]
    DiskImage { path: PathBuf, reason: String },

    /// The artifact capability could not provide a file.
    #[error("artifact {url}: {reason}")]
    Artifact { url: String, reason: String },

    /// The remote shell capability failed.
    #[error("shell on {host}: {reason}")]
    Shell { host: String, reason: String },

    /// A hypervisor-reported field had an unexpected shape.
    #[error("unexpected hypervisor output for {field}: {value}")]
    UnexpectedOutput { field: String, value: String },

    /// The VM is in a state the requested operation does not act on.
    #[error("vm {vm} is in state '{state}', which {operation} does not handle")]
    InvalidState {
        vm: String,
        state: String,
        operation: String,
    },

    /// The configuration file is not valid JSON for [`crate::VboxConfig`].
    #[error("config file {}: {source}", path.display())]
    Config {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Invalid declaration passed down from the orchestrator.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Underlying I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl VboxError {
    /// Create a shell error for `host`.
    pub fn shell(host: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Shell {
            host: host.into(),
            reason: reason.into(),
        }
    }

    /// Create a disk image error for `path`.
    pub fn disk_image(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::DiskImage {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
