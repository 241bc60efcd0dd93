pub mod catalog;
pub mod config;
pub mod domain;
pub mod errors;
pub mod resolver;
pub mod transitions;

pub use catalog::{derive_version, validate_for_publish, CatalogViolation, DerivedProcess, StepSequence};
pub use domain::comment::{ApprovalComment, CommentId};
pub use domain::directory::{EmployeeId, OrgUnitId, OrganizationId, RoleId};
pub use domain::log::{ActingAuthority, ApprovalLog, LogId};
pub use domain::process::{
    ApprovalProcess, ApprovalResponsibility, ApprovalStep, PrincipalSelector, ProcessId,
    ProcessStatus, ResponsibilityId, StepId,
};
pub use domain::request::{
    ApprovalRequest, RequestAction, RequestId, RequestStatus, SubjectRef,
};
pub use errors::{ApplicationError, EntityKind, InterfaceError, WorkflowError};
pub use resolver::{
    Directory, DirectoryError, InMemoryDirectory, Resolution, ResolutionSource,
    ResponsibilityResolver,
};
pub use transitions::{ActionContext, RequestStateMachine, TransitionOutcome};
