/// Errors produced by the `vmfleet-core` crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CoreError {
    /// A port mapping could not be parsed as `guest` or `host:guest`.
    #[error("invalid port mapping '{spec}': {reason}")]
    InvalidPortMapping { spec: String, reason: String },

    /// An environment id was empty or contained characters unsafe in resource names.
    #[error("invalid environment id '{value}': {reason}")]
    InvalidEnvironmentId { value: String, reason: String },

    /// A host specification field failed validation.
    #[error("host '{host}' invalid field '{field}': {reason}")]
    HostValidation {
        host: String,
        field: String,
        reason: String,
    },

    /// A lifecycle state string did not name a known state.
    #[error("unknown lifecycle state '{0}'")]
    UnknownState(String),
}
