//! Error types for the gateway crate.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use vos_vm::VmError;

/// Errors that can occur during gateway request handling.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum GatewayError {
    /// An error propagated from the controller.
    #[error(transparent)]
    Vm(#[from] VmError),

    /// The engine was asked for while the VM is not ready.
    #[error("engine is not ready (VM is {0})")]
    EngineNotReady(vos_core::VmState),

    /// The request body is malformed or contains invalid values.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl GatewayError {
    /// HTTP status this error is reported with.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Vm(VmError::PreconditionMissing { .. } | VmError::BinaryNotFound { .. }) => {
                StatusCode::NOT_FOUND
            }
            Self::Vm(VmError::PermissionDenied { .. }) => StatusCode::FORBIDDEN,
            Self::Vm(VmError::ShuttingDown) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Vm(VmError::Tls(_) | VmError::Engine(_) | VmError::EngineClosed) => {
                StatusCode::BAD_GATEWAY
            }
            Self::EngineNotReady(_) => StatusCode::CONFLICT,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Vm(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), error = %self, "request failed");
        }
        (status, Json(json!({"error": self.to_string()}))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use vos_core::VmState;

    #[test]
    fn launch_failures_map_to_client_visible_statuses() {
        let missing = GatewayError::Vm(VmError::PreconditionMissing {
            what: "boot image",
            path: PathBuf::from("/nope.iso"),
        });
        assert_eq!(missing.into_response().status(), StatusCode::NOT_FOUND);

        let no_binary = GatewayError::Vm(VmError::BinaryNotFound { path: PathBuf::from("qemu") });
        assert_eq!(no_binary.into_response().status(), StatusCode::NOT_FOUND);

        let denied = GatewayError::Vm(VmError::PermissionDenied { path: PathBuf::from("qemu") });
        assert_eq!(denied.into_response().status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn shutting_down_returns_503() {
        let resp = GatewayError::Vm(VmError::ShuttingDown).into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn engine_not_ready_returns_409() {
        let resp = GatewayError::EngineNotReady(VmState::Starting).into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn spawn_failure_returns_500() {
        let err = GatewayError::Vm(VmError::SpawnFailed("exec format error".to_owned()));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn engine_failure_returns_502() {
        assert_eq!(GatewayError::Vm(VmError::EngineClosed).status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn display_includes_the_underlying_message() {
        let err = GatewayError::InvalidRequest("expected an object".to_owned());
        assert!(err.to_string().contains("expected an object"));
        let err = GatewayError::EngineNotReady(VmState::Stopped);
        assert!(err.to_string().contains("stopped"));
    }
}
