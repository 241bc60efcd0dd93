use async_trait::async_trait;
use thiserror::Error;

use signoff_core::domain::comment::ApprovalComment;
use signoff_core::domain::directory::OrganizationId;
use signoff_core::domain::log::ApprovalLog;
use signoff_core::domain::process::{
    ApprovalProcess, ApprovalResponsibility, ApprovalStep, ProcessId, ResponsibilityId, StepId,
};
use signoff_core::domain::request::{ApprovalRequest, RequestId, RequestStatus, SubjectRef};

pub mod comment;
pub mod directory;
pub mod memory;
pub mod process;
pub mod request;

pub use comment::SqlCommentRepository;
pub use directory::SqlDirectory;
pub use memory::{InMemoryCommentRepository, InMemoryProcessRepository, InMemoryRequestRepository};
pub use process::SqlProcessRepository;
pub use request::SqlRequestRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("version conflict: expected {expected}, found {actual}")]
    VersionConflict { expected: u32, actual: u32 },
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("approval process `{0}` is not an editable draft")]
    DefinitionFrozen(String),
    #[error("step order {step_order} is already used in approval process `{process_id}`")]
    DuplicateStepOrder { process_id: String, step_order: u32 },
}

/// Process definitions: processes, their ordered steps and the responsibilities
/// attached to each step.
///
/// Step and responsibility writes land only while the owning process is an
/// undeleted draft, and bump that process's version in the same unit of work.
/// Otherwise they fail with `DefinitionFrozen`, so a publish that validated a
/// definition either sees every edit or loses its version check.
#[async_trait]
pub trait ProcessRepository: Send + Sync {
    /// Includes soft-deleted processes so running requests keep their scope.
    async fn find_process(&self, id: &ProcessId)
        -> Result<Option<ApprovalProcess>, RepositoryError>;

    /// Excludes soft-deleted processes.
    async fn list_processes(
        &self,
        organization_id: Option<&OrganizationId>,
    ) -> Result<Vec<ApprovalProcess>, RepositoryError>;

    async fn insert_process(&self, process: ApprovalProcess) -> Result<(), RepositoryError>;

    /// Writes `process` only if the stored version still equals
    /// `expected_version`. On a mismatch nothing is written and
    /// `VersionConflict` carries the stored version.
    async fn update_process(
        &self,
        process: &ApprovalProcess,
        expected_version: u32,
    ) -> Result<(), RepositoryError>;

    async fn find_step(&self, id: &StepId) -> Result<Option<ApprovalStep>, RepositoryError>;

    /// Ordered by `step_order`, ties broken by id.
    async fn list_steps(&self, process_id: &ProcessId)
        -> Result<Vec<ApprovalStep>, RepositoryError>;

    /// Fails with `DuplicateStepOrder` when another step of the process already
    /// uses the order.
    async fn save_step(&self, step: ApprovalStep) -> Result<(), RepositoryError>;

    /// Removes the step together with its responsibilities. Returns whether a
    /// step was removed.
    async fn delete_step(&self, id: &StepId) -> Result<bool, RepositoryError>;

    async fn find_responsibility(
        &self,
        id: &ResponsibilityId,
    ) -> Result<Option<ApprovalResponsibility>, RepositoryError>;

    async fn list_responsibilities_for_step(
        &self,
        step_id: &StepId,
    ) -> Result<Vec<ApprovalResponsibility>, RepositoryError>;

    async fn list_responsibilities_for_process(
        &self,
        process_id: &ProcessId,
    ) -> Result<Vec<ApprovalResponsibility>, RepositoryError>;

    async fn save_responsibility(
        &self,
        responsibility: ApprovalResponsibility,
    ) -> Result<(), RepositoryError>;

    async fn delete_responsibility(&self, id: &ResponsibilityId)
        -> Result<bool, RepositoryError>;

    /// Inserts a complete new definition as one unit.
    async fn save_definition(
        &self,
        process: ApprovalProcess,
        steps: Vec<ApprovalStep>,
        responsibilities: Vec<ApprovalResponsibility>,
    ) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait RequestRepository: Send + Sync {
    async fn insert_request(&self, request: ApprovalRequest) -> Result<(), RepositoryError>;

    async fn find_request(&self, id: &RequestId)
        -> Result<Option<ApprovalRequest>, RepositoryError>;

    /// Newest first.
    async fn list_requests(
        &self,
        status: Option<RequestStatus>,
    ) -> Result<Vec<ApprovalRequest>, RepositoryError>;

    /// Newest first.
    async fn list_requests_by_subject(
        &self,
        subject: &SubjectRef,
    ) -> Result<Vec<ApprovalRequest>, RepositoryError>;

    /// Writes `request` only if the stored version still equals
    /// `expected_version`, appending `log` in the same unit of work. On a
    /// mismatch nothing is written and `VersionConflict` carries the stored
    /// version.
    async fn commit_transition(
        &self,
        request: &ApprovalRequest,
        expected_version: u32,
        log: &ApprovalLog,
    ) -> Result<(), RepositoryError>;

    /// In commit order.
    async fn list_logs(&self, request_id: &RequestId) -> Result<Vec<ApprovalLog>, RepositoryError>;
}

#[async_trait]
pub trait CommentRepository: Send + Sync {
    async fn append_comment(&self, comment: ApprovalComment) -> Result<(), RepositoryError>;

    /// Oldest first.
    async fn list_comments(
        &self,
        request_id: &RequestId,
    ) -> Result<Vec<ApprovalComment>, RepositoryError>;
}

pub(crate) fn parse_u32(column: &str, value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative u32): {value}"
        ))
    })
}

pub(crate) fn parse_timestamp(
    column: &str,
    value: String,
) -> Result<chrono::DateTime<chrono::Utc>, RepositoryError> {
    chrono::DateTime::parse_from_rfc3339(&value)
        .map(|timestamp| timestamp.with_timezone(&chrono::Utc))
        .map_err(|error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        })
}

pub(crate) fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<chrono::DateTime<chrono::Utc>>, RepositoryError> {
    value.map(|timestamp| parse_timestamp(column, timestamp)).transpose()
}
