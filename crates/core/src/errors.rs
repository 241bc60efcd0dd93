use thiserror::Error;

use crate::domain::directory::EmployeeId;
use crate::domain::process::{ProcessId, StepId};
use crate::domain::request::{RequestAction, RequestId, RequestStatus};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntityKind {
    Process,
    Step,
    Responsibility,
    Request,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Process => "approval process",
            Self::Step => "approval step",
            Self::Responsibility => "approval responsibility",
            Self::Request => "approval request",
        })
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("actor `{actor_id}` is not eligible to {action} step `{step_id}` of request `{request_id}`")]
    Authorization {
        request_id: RequestId,
        step_id: StepId,
        actor_id: EmployeeId,
        action: RequestAction,
    },
    #[error("no eligible principal resolves for step `{step_id}` of request `{request_id}`")]
    UnresolvableStep { request_id: RequestId, step_id: StepId },
    #[error("cannot {action} request `{request_id}` while it is {status}")]
    InvalidTransition { request_id: RequestId, status: RequestStatus, action: RequestAction },
    #[error(
        "request `{request_id}` was modified concurrently (expected version {expected_version}, found {actual_version})"
    )]
    ConcurrentModification { request_id: RequestId, expected_version: u32, actual_version: u32 },
    #[error(
        "process `{process_id}` was modified concurrently (expected version {expected_version}, found {actual_version})"
    )]
    ProcessModified { process_id: ProcessId, expected_version: u32, actual_version: u32 },
    #[error("{entity} `{id}` not found")]
    NotFound { entity: EntityKind, id: String },
}

impl WorkflowError {
    pub fn not_found(entity: EntityKind, id: impl std::fmt::Display) -> Self {
        Self::NotFound { entity, id: id.to_string() }
    }

    /// Only lost races are worth retrying, and only against freshly read state.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrentModification { .. } | Self::ProcessModified { .. })
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("integration failure: {0}")]
    Integration(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("forbidden: {message}")]
    Forbidden { message: String, correlation_id: String },
    #[error("not found: {message}")]
    NotFound { message: String, correlation_id: String },
    #[error("conflict: {message}")]
    Conflict { message: String, correlation_id: String },
    #[error("unprocessable: {message}")]
    Unprocessable { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::Forbidden { .. } => "You are not eligible to act on this approval step.",
            Self::NotFound { .. } => "The requested approval record does not exist.",
            Self::Conflict { .. } => {
                "The approval record changed while you were acting on it. Reload and try again."
            }
            Self::Unprocessable { .. } => {
                "Nobody is currently eligible to act on this approval step. Contact an administrator."
            }
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }

    pub fn retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::ServiceUnavailable { .. })
    }

    fn correlation_id_mut(&mut self) -> &mut String {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::Forbidden { correlation_id, .. }
            | Self::NotFound { correlation_id, .. }
            | Self::Conflict { correlation_id, .. }
            | Self::Unprocessable { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let mut mapped = InterfaceError::from(self);
        *mapped.correlation_id_mut() = correlation_id.into();
        mapped
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        let correlation_id = "unassigned".to_owned();
        match value {
            ApplicationError::Workflow(error) => {
                let message = error.to_string();
                match error {
                    WorkflowError::Validation(_) | WorkflowError::InvalidTransition { .. } => {
                        Self::BadRequest { message, correlation_id }
                    }
                    WorkflowError::Authorization { .. } => Self::Forbidden { message, correlation_id },
                    WorkflowError::NotFound { .. } => Self::NotFound { message, correlation_id },
                    WorkflowError::ConcurrentModification { .. }
                    | WorkflowError::ProcessModified { .. } => {
                        Self::Conflict { message, correlation_id }
                    }
                    WorkflowError::UnresolvableStep { .. } => {
                        Self::Unprocessable { message, correlation_id }
                    }
                }
            }
            ApplicationError::Persistence(message) | ApplicationError::Integration(message) => {
                Self::ServiceUnavailable { message, correlation_id }
            }
            ApplicationError::Configuration(message) => Self::Internal { message, correlation_id },
        }
    }
}
