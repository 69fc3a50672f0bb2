//! Structured error types for the store, the allocator and API responses.

use rusqlite::ffi;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Error codes for programmatic error handling.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors
    MissingRequiredField,
    InvalidFieldValue,
    InvalidCount,
    ExceedMaxPerProject,
    InvalidPortUpdate,
    InvalidPortModification,
    NoPortsAllocated,
    PortsAlreadyAllocated,

    // Not found errors
    ProjectNotFound,
    TaskNotFound,

    // Conflict errors
    InsufficientPorts,

    // Internal errors
    AllocationFailed,
    DatabaseError,
}

impl ErrorCode {
    /// HTTP status an API layer should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCode::ProjectNotFound | ErrorCode::TaskNotFound => 404,
            ErrorCode::InsufficientPorts => 409,
            ErrorCode::AllocationFailed | ErrorCode::DatabaseError => 500,
            _ => 400,
        }
    }
}

/// Failures of the port allocator.
#[derive(Debug, Error)]
pub enum PortAllocationError {
    #[error("port count must be greater than 0, got {count}")]
    InvalidCount { count: i64 },

    #[error("a project may hold at most {max} ports, requested {requested}")]
    ExceedsMaxPerProject { requested: i64, max: u32 },

    #[error("project not found: {project_id}")]
    ProjectNotFound { project_id: String },

    #[error("project {project_id} already has ports allocated")]
    AlreadyAllocated { project_id: String },

    #[error("insufficient ports: requested {requested}, only {available} available")]
    InsufficientPorts { requested: usize, available: usize },

    #[error("project {project_id} has no ports allocated")]
    NoPortsAllocated { project_id: String },

    #[error("port {port} does not belong to this project")]
    InvalidPortUpdate { port: u16 },

    #[error("port number {port} cannot be modified")]
    InvalidPortModification { port: u16 },

    #[error("port allocation failed after {attempts} attempts: {source}")]
    AllocationFailed {
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Store(anyhow::Error),
}

impl PortAllocationError {
    /// Stable machine-readable code.
    pub fn code(&self) -> ErrorCode {
        match self {
            PortAllocationError::InvalidCount { .. } => ErrorCode::InvalidCount,
            PortAllocationError::ExceedsMaxPerProject { .. } => ErrorCode::ExceedMaxPerProject,
            PortAllocationError::ProjectNotFound { .. } => ErrorCode::ProjectNotFound,
            PortAllocationError::AlreadyAllocated { .. } => ErrorCode::PortsAlreadyAllocated,
            PortAllocationError::InsufficientPorts { .. } => ErrorCode::InsufficientPorts,
            PortAllocationError::NoPortsAllocated { .. } => ErrorCode::NoPortsAllocated,
            PortAllocationError::InvalidPortUpdate { .. } => ErrorCode::InvalidPortUpdate,
            PortAllocationError::InvalidPortModification { .. } => {
                ErrorCode::InvalidPortModification
            }
            PortAllocationError::AllocationFailed { .. } => ErrorCode::AllocationFailed,
            PortAllocationError::Store(_) => ErrorCode::DatabaseError,
        }
    }

    pub fn http_status(&self) -> u16 {
        self.code().http_status()
    }

    /// Whether the failure is a lost race on the ledger's uniqueness
    /// constraint, which a fresh transaction can recover from.
    pub fn is_retryable(&self) -> bool {
        match self {
            PortAllocationError::Store(err) => is_unique_violation(err),
            _ => false,
        }
    }
}

// Store code runs on anyhow; allocator errors raised inside it come back out
// as their own variant.
impl From<anyhow::Error> for PortAllocationError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<PortAllocationError>() {
            Ok(alloc_err) => alloc_err,
            Err(err) => PortAllocationError::Store(err),
        }
    }
}

impl From<rusqlite::Error> for PortAllocationError {
    fn from(err: rusqlite::Error) -> Self {
        PortAllocationError::Store(err.into())
    }
}

/// Result type for allocator operations.
pub type PortResult<T> = std::result::Result<T, PortAllocationError>;

/// Check whether an error chain contains a SQLite PRIMARY KEY / UNIQUE violation.
pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<rusqlite::Error>(),
            Some(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation
                    && (e.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                        || e.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE)
        )
    })
}

/// Structured error for API responses.
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            field: None,
            data: None,
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    // Convenience constructors

    pub fn missing_field(field: &str) -> Self {
        Self::new(
            ErrorCode::MissingRequiredField,
            format!("{} is required", field),
        )
        .with_field(field)
    }

    pub fn invalid_value(field: &str, reason: &str) -> Self {
        Self::new(ErrorCode::InvalidFieldValue, reason).with_field(field)
    }

    pub fn project_not_found(project_id: &str) -> Self {
        Self::new(
            ErrorCode::ProjectNotFound,
            format!("Project not found: {}", project_id),
        )
    }

    pub fn task_not_found(task_id: &str) -> Self {
        Self::new(
            ErrorCode::TaskNotFound,
            format!("Task not found: {}", task_id),
        )
    }

    pub fn database(err: impl fmt::Display) -> Self {
        Self::new(ErrorCode::DatabaseError, err.to_string())
    }

    pub fn http_status(&self) -> u16 {
        self.code.http_status()
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ApiError {}

// Allow using ? with anyhow errors by converting them
impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<ApiError>() {
            Ok(api_err) => api_err,
            Err(err) => ApiError::database(err),
        }
    }
}

impl From<PortAllocationError> for ApiError {
    fn from(err: PortAllocationError) -> Self {
        let api_err = ApiError::new(err.code(), err.to_string());
        match err {
            PortAllocationError::InsufficientPorts {
                requested,
                available,
            } => api_err.with_data(serde_json::json!({
                "requested": requested,
                "available": available,
            })),
            _ => api_err,
        }
    }
}

/// Result type for API operations.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn constraint_error(extended_code: i32) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(
            ffi::Error {
                code: rusqlite::ErrorCode::ConstraintViolation,
                extended_code,
            },
            Some("UNIQUE constraint failed: port_allocations.port".to_string()),
        )
    }

    #[test]
    fn test_unique_violation_detected() {
        let err = anyhow::Error::from(constraint_error(ffi::SQLITE_CONSTRAINT_PRIMARYKEY));
        assert!(is_unique_violation(&err));

        let err = anyhow::Error::from(constraint_error(ffi::SQLITE_CONSTRAINT_UNIQUE));
        assert!(is_unique_violation(&err));
    }

    #[test]
    fn test_other_constraints_not_retryable() {
        let err = anyhow::Error::from(constraint_error(ffi::SQLITE_CONSTRAINT_FOREIGNKEY));
        assert!(!is_unique_violation(&err));

        let err = anyhow::anyhow!("disk I/O error");
        assert!(!is_unique_violation(&err));
    }

    #[test]
    fn test_unique_violation_found_through_context() {
        let err = anyhow::Error::from(constraint_error(ffi::SQLITE_CONSTRAINT_PRIMARYKEY))
            .context("inserting ledger rows");
        assert!(is_unique_violation(&err));
        assert!(PortAllocationError::Store(err).is_retryable());
    }

    #[test]
    fn test_allocator_error_survives_anyhow_roundtrip() {
        let wrapped = anyhow::Error::from(PortAllocationError::InsufficientPorts {
            requested: 3,
            available: 1,
        });
        let err = PortAllocationError::from(wrapped);
        assert!(matches!(
            err,
            PortAllocationError::InsufficientPorts {
                requested: 3,
                available: 1
            }
        ));

        let err = PortAllocationError::from(anyhow::anyhow!("disk full"));
        assert!(matches!(err, PortAllocationError::Store(_)));
    }

    #[test]
    fn test_http_status_mapping() {
        let cases = [
            (
                PortAllocationError::InsufficientPorts {
                    requested: 10,
                    available: 5,
                },
                409,
            ),
            (
                PortAllocationError::ProjectNotFound {
                    project_id: "p".into(),
                },
                404,
            ),
            (PortAllocationError::InvalidCount { count: 0 }, 400),
            (
                PortAllocationError::ExceedsMaxPerProject {
                    requested: 60,
                    max: 50,
                },
                400,
            ),
            (
                PortAllocationError::AlreadyAllocated {
                    project_id: "p".into(),
                },
                400,
            ),
            (PortAllocationError::InvalidPortUpdate { port: 9999 }, 400),
            (
                PortAllocationError::AllocationFailed {
                    attempts: 4,
                    source: anyhow::anyhow!("conflict"),
                },
                500,
            ),
            (PortAllocationError::Store(anyhow::anyhow!("boom")), 500),
        ];
        for (err, status) in cases {
            assert_eq!(err.code().http_status(), status, "{:?}", err);
        }
    }

    #[test]
    fn test_api_error_carries_available_count() {
        let api_err = ApiError::from(PortAllocationError::InsufficientPorts {
            requested: 10,
            available: 5,
        });
        assert_eq!(api_err.code, ErrorCode::InsufficientPorts);
        assert_eq!(api_err.data.unwrap()["available"], 5);

        let api_err = ApiError::from(PortAllocationError::InvalidPortUpdate { port: 1 });
        assert_eq!(api_err.code, ErrorCode::InvalidPortUpdate);
        assert!(api_err.data.is_none());

        let json = serde_json::to_value(ApiError::missing_field("name")).unwrap();
        assert_eq!(json["code"], "MISSING_REQUIRED_FIELD");
        assert_eq!(json["field"], "name");
    }
}
