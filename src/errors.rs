use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};
use tracing::error;

use crate::vf_sizing::SizingError;

/// How a caller should react to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorKind {
    RetryLater,
    Configuration,
    NotFound,
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, AsRefStr)]
pub enum AllocatorError {
    #[error("{what} {id} not found")]
    NotFound { what: &'static str, id: String },

    #[error("claim {claim_id} requests {requested} devices, only {available} qualify")]
    InsufficientResources {
        claim_id: String,
        requested: u64,
        available: u64,
    },

    #[error("no VF profile of device {model} can hold {requested_mib} MiB")]
    NoMatchingProfile { model: String, requested_mib: u64 },

    #[error("no VF profiles for device {model}")]
    NoProfilesForDevice { model: String },

    #[error("allocation state of node {node} kept changing, gave up after {attempts} attempts")]
    ConcurrentModification { node: String, attempts: u32 },

    #[error("exposure registry sync failed: {0}")]
    ExposureSyncFailure(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0} was cancelled")]
    Cancelled(String),

    #[error("{0}")]
    Environment(String),
}

impl AllocatorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AllocatorError::NotFound { .. } => ErrorKind::NotFound,
            AllocatorError::InsufficientResources { .. } |
            AllocatorError::ConcurrentModification { .. } |
            AllocatorError::Cancelled(_) => ErrorKind::RetryLater,
            AllocatorError::NoMatchingProfile { .. } |
            AllocatorError::NoProfilesForDevice { .. } |
            AllocatorError::InvalidRequest(_) => ErrorKind::Configuration,
            AllocatorError::ExposureSyncFailure(_) |
            AllocatorError::Environment(_) => ErrorKind::Fatal,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AllocatorError::NotFound { .. } => StatusCode::NOT_FOUND,
            AllocatorError::InsufficientResources { .. } |
            AllocatorError::ConcurrentModification { .. } => StatusCode::CONFLICT,
            AllocatorError::Cancelled(_) => StatusCode::REQUEST_TIMEOUT,
            AllocatorError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AllocatorError::NoMatchingProfile { .. } | AllocatorError::NoProfilesForDevice { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            AllocatorError::ExposureSyncFailure(_) |
            AllocatorError::Environment(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn not_found(what: &'static str, id: impl Into<String>) -> Self {
        AllocatorError::NotFound {
            what,
            id: id.into(),
        }
    }
}

impl From<SizingError> for AllocatorError {
    fn from(e: SizingError) -> Self {
        match e {
            SizingError::NoMatchingProfile {
                model,
                requested_mib,
            } => AllocatorError::NoMatchingProfile {
                model,
                requested_mib,
            },
            SizingError::NoProfilesForDevice { model } => {
                AllocatorError::NoProfilesForDevice { model }
            }
            e @ SizingError::NoFairSplit { .. } => AllocatorError::InvalidRequest(e.to_string()),
        }
    }
}

impl From<state_store::Error> for AllocatorError {
    fn from(e: state_store::Error) -> Self {
        match e {
            state_store::Error::Timeout { operation, timeout } => {
                AllocatorError::Cancelled(format!("state {operation} after {timeout:?}"))
            }
            e => AllocatorError::Environment(format!("allocation state store: {e}")),
        }
    }
}

impl From<crate::provisioning::ProvisionError> for AllocatorError {
    fn from(e: crate::provisioning::ProvisionError) -> Self {
        AllocatorError::Environment(format!("VF provisioning: {e}"))
    }
}

/// Error body returned to the node agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub error: String,
    pub message: String,
}

impl From<&AllocatorError> for ErrorBody {
    fn from(e: &AllocatorError) -> Self {
        Self {
            kind: e.kind(),
            error: e.as_ref().to_string(),
            message: e.to_string(),
        }
    }
}

impl IntoResponse for AllocatorError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!("API Error: {} - {}", status, self);
        }
        (status, Json(ErrorBody::from(&self))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        struct Case {
            error: AllocatorError,
            kind: ErrorKind,
            status: StatusCode,
        }
        let cases = [
            Case {
                error: AllocatorError::InsufficientResources {
                    claim_id: "c".to_string(),
                    requested: 2,
                    available: 1,
                },
                kind: ErrorKind::RetryLater,
                status: StatusCode::CONFLICT,
            },
            Case {
                error: AllocatorError::ConcurrentModification {
                    node: "n".to_string(),
                    attempts: 5,
                },
                kind: ErrorKind::RetryLater,
                status: StatusCode::CONFLICT,
            },
            Case {
                error: SizingError::NoMatchingProfile {
                    model: "0x56c0".to_string(),
                    requested_mib: 20000,
                }
                .into(),
                kind: ErrorKind::Configuration,
                status: StatusCode::UNPROCESSABLE_ENTITY,
            },
            Case {
                error: AllocatorError::Environment("sysfs unreadable".to_string()),
                kind: ErrorKind::Fatal,
                status: StatusCode::INTERNAL_SERVER_ERROR,
            },
            Case {
                error: AllocatorError::not_found("claim", "c"),
                kind: ErrorKind::NotFound,
                status: StatusCode::NOT_FOUND,
            },
        ];
        for case in cases {
            assert_eq!(case.error.kind(), case.kind, "{}", case.error);
            assert_eq!(case.error.status_code(), case.status, "{}", case.error);
        }
    }

    #[test]
    fn test_error_body() {
        let err = AllocatorError::NoProfilesForDevice {
            model: "0x4680".to_string(),
        };
        let body = serde_json::to_value(ErrorBody::from(&err)).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "kind": "configuration",
                "error": "NoProfilesForDevice",
                "message": "no VF profiles for device 0x4680",
            })
        );
    }

    #[test]
    fn test_state_store_timeout_is_retryable() {
        let err: AllocatorError = state_store::Error::Timeout {
            operation: "write",
            timeout: std::time::Duration::from_secs(1),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::RetryLater);
    }
}
