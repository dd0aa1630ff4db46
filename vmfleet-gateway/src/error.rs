//! Error types for the gateway crate.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use vmfleet_core::CoreError;
use vmfleet_vbox::VboxError;

/// Errors that can occur during gateway request handling.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum GatewayError {
    /// An error propagated from the provider.
    #[error("provider error: {0}")]
    Provider(#[from] VboxError),

    /// A declaration field failed domain validation.
    #[error("invalid declaration: {0}")]
    Declaration(#[from] CoreError),

    /// The request body is well-formed but inconsistent.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match &self {
            GatewayError::Provider(VboxError::Core(_))
            | GatewayError::Declaration(_)
            | GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Provider(VboxError::InvalidState { .. }) => StatusCode::CONFLICT,
            GatewayError::Provider(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(json!({"error": self.to_string()}))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_error_status_codes_map_correctly() {
        let bad_req = GatewayError::InvalidRequest("duplicate host web".to_owned());
        assert_eq!(bad_req.into_response().status(), StatusCode::BAD_REQUEST);

        let bad_env = GatewayError::Declaration(CoreError::InvalidEnvironmentId {
            value: String::new(),
            reason: "must not be empty".to_owned(),
        });
        assert_eq!(bad_env.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn vm_in_unhandled_state_is_a_conflict() {
        let err = GatewayError::Provider(VboxError::InvalidState {
            vm: "web_dev".to_owned(),
            state: "saved".to_owned(),
            operation: "destroy".to_owned(),
        });
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);
    }

    #[test]
    fn provider_tool_failures_return_500_with_output() {
        let err = GatewayError::Provider(VboxError::ExternalTool {
            command: "VBoxManage startvm web_dev --type headless".to_owned(),
            output: "VERR_VMX_NO_VMX".to_owned(),
        });
        let msg = err.to_string();
        assert!(msg.contains("VERR_VMX_NO_VMX"), "tool output must reach the caller");
        assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
