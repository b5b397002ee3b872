use axum::http::StatusCode;
use serde::Serialize;
use serde_json::Value as JsonValue;

use specscout_core::DomainError;
use specscout_infra::ServiceError;
use specscout_infra::jobs::{JobStoreError, ManagerError, ResolveError};

/// Error returned at the RPC boundary as `{id, error: {code, message, details?}}`.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct RpcError {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<JsonValue>,
}

impl RpcError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: JsonValue) -> Self {
        self.details = Some(details);
        self
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new("invalid_params", message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new("method_not_found", format!("unknown method: {method}"))
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", message)
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new("invalid_state", message)
    }

    pub fn source_error(message: impl Into<String>) -> Self {
        Self::new("source_error", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("internal", message)
    }

    pub fn status(&self) -> StatusCode {
        match self.code {
            "invalid_params" => StatusCode::BAD_REQUEST,
            "method_not_found" | "not_found" => StatusCode::NOT_FOUND,
            "invalid_state" => StatusCode::CONFLICT,
            "source_error" => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<DomainError> for RpcError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(_) | DomainError::InvalidId(_) => RpcError::invalid_params(err.to_string()),
            DomainError::InvalidTransition { .. } | DomainError::Conflict(_) | DomainError::InvariantViolation(_) => {
                RpcError::invalid_state(err.to_string())
            }
            DomainError::NotFound => RpcError::not_found(err.to_string()),
        }
    }
}

impl From<ManagerError> for RpcError {
    fn from(err: ManagerError) -> Self {
        match err {
            ManagerError::Domain(e) => e.into(),
            ManagerError::NotFound(_) | ManagerError::Store(JobStoreError::NotFound(_)) => {
                RpcError::not_found(err.to_string())
            }
            ManagerError::Resolve(ResolveError::UnknownFilter(_)) | ManagerError::NoRunner(_) => {
                RpcError::invalid_params(err.to_string())
            }
            ManagerError::Resolve(ResolveError::Store(_)) => RpcError::source_error(err.to_string()),
            ManagerError::Store(_) | ManagerError::Runtime(_) => RpcError::internal(err.to_string()),
        }
    }
}

impl From<ServiceError> for RpcError {
    fn from(err: ServiceError) -> Self {
        let code = match &err {
            ServiceError::UnknownSource { .. } => "invalid_params",
            ServiceError::Failed { .. } | ServiceError::Normalize { .. } => "source_error",
        };
        let details = serde_json::to_value(&err).ok();
        RpcError {
            code,
            message: err.to_string(),
            details,
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::invalid_params(format!("invalid params: {err}"))
    }
}
