use chrono::{DateTime, Utc};

use crate::catalog::StepSequence;
use crate::domain::directory::EmployeeId;
use crate::domain::log::{ActingAuthority, ApprovalLog, LogId};
use crate::domain::process::{ApprovalProcess, StepId};
use crate::domain::request::{ApprovalRequest, RequestAction, RequestId, RequestStatus, SubjectRef};
use crate::errors::WorkflowError;
use crate::resolver::{Resolution, ResolutionSource};

/// The proposed next state of a request together with the log entry that must
/// be committed with it. `expected_version` is the version the commit has to
/// find in storage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransitionOutcome {
    pub request: ApprovalRequest,
    pub log: ApprovalLog,
    pub expected_version: u32,
}

#[derive(Clone, Debug)]
pub struct ActionContext {
    pub actor_id: EmployeeId,
    pub note: Option<String>,
    pub now: DateTime<Utc>,
}

impl ActionContext {
    pub fn new(actor_id: EmployeeId, now: DateTime<Utc>) -> Self {
        Self { actor_id, note: None, now }
    }

    pub fn with_note(mut self, note: Option<String>) -> Self {
        self.note = note.filter(|note| !note.trim().is_empty());
        self
    }
}

/// Pure transition rules for approval requests. Persistence and resolution
/// happen around it; nothing here performs I/O.
#[derive(Clone, Debug, Default)]
pub struct RequestStateMachine;

impl RequestStateMachine {
    pub fn new() -> Self {
        Self
    }

    /// Starts a request at the step with the smallest order.
    pub fn start(
        &self,
        process: &ApprovalProcess,
        steps: &StepSequence,
        subject: SubjectRef,
        requested_by: EmployeeId,
        now: DateTime<Utc>,
    ) -> Result<ApprovalRequest, WorkflowError> {
        if !process.accepts_requests() {
            return Err(WorkflowError::Validation(format!(
                "process `{}` is not published and active; requests cannot be created against it",
                process.id
            )));
        }
        let first = steps.first().ok_or_else(|| {
            WorkflowError::Validation(format!("process `{}` has no steps", process.id))
        })?;
        if subject.kind.trim().is_empty() || subject.id.trim().is_empty() {
            return Err(WorkflowError::Validation(
                "request subject must name both a kind and an identifier".to_string(),
            ));
        }

        Ok(ApprovalRequest {
            id: RequestId::generate(),
            process_id: process.id.clone(),
            current_step_id: Some(first.id.clone()),
            status: RequestStatus::Pending,
            subject,
            requested_by,
            version: 1,
            created_at: now,
            updated_at: now,
            completed_at: None,
        })
    }

    /// Returns the current step of a pending request, or the error explaining
    /// why `action` cannot be applied.
    pub fn ensure_actionable<'a>(
        &self,
        request: &'a ApprovalRequest,
        action: RequestAction,
    ) -> Result<&'a StepId, WorkflowError> {
        if request.status != RequestStatus::Pending {
            return Err(WorkflowError::InvalidTransition {
                request_id: request.id.clone(),
                status: request.status,
                action,
            });
        }
        request.current_step_id.as_ref().ok_or_else(|| {
            WorkflowError::Validation(format!(
                "pending request `{}` has no current step",
                request.id
            ))
        })
    }

    pub fn approve(
        &self,
        request: &ApprovalRequest,
        steps: &StepSequence,
        resolution: &Resolution,
        context: ActionContext,
    ) -> Result<TransitionOutcome, WorkflowError> {
        let current = self.ensure_actionable(request, RequestAction::Approve)?.clone();
        if steps.get(&current).is_none() {
            return Err(WorkflowError::Validation(format!(
                "step `{current}` of request `{}` is not part of process `{}`",
                request.id, request.process_id
            )));
        }
        let authority = authorize(request, &current, resolution, &context, RequestAction::Approve)?;

        let next = steps.next_after(&current).map(|step| step.id.clone());
        let status = if next.is_some() { RequestStatus::Pending } else { RequestStatus::Approved };
        Ok(commit(request, status, next, RequestAction::Approve, authority, context))
    }

    pub fn reject(
        &self,
        request: &ApprovalRequest,
        resolution: &Resolution,
        context: ActionContext,
    ) -> Result<TransitionOutcome, WorkflowError> {
        let current = self.ensure_actionable(request, RequestAction::Reject)?.clone();
        let authority = authorize(request, &current, resolution, &context, RequestAction::Reject)?;
        Ok(commit(request, RequestStatus::Rejected, None, RequestAction::Reject, authority, context))
    }

    /// Cancellation is not gated by the resolver: only the requester or an
    /// administrator may withdraw a pending request.
    pub fn cancel(
        &self,
        request: &ApprovalRequest,
        is_administrator: bool,
        context: ActionContext,
    ) -> Result<TransitionOutcome, WorkflowError> {
        let current = self.ensure_actionable(request, RequestAction::Cancel)?.clone();
        let authority = if context.actor_id == request.requested_by {
            ActingAuthority::Requester
        } else if is_administrator {
            ActingAuthority::Administrator
        } else {
            return Err(WorkflowError::Authorization {
                request_id: request.id.clone(),
                step_id: current,
                actor_id: context.actor_id,
                action: RequestAction::Cancel,
            });
        };
        Ok(commit(request, RequestStatus::Canceled, None, RequestAction::Cancel, authority, context))
    }
}

fn authorize(
    request: &ApprovalRequest,
    current: &StepId,
    resolution: &Resolution,
    context: &ActionContext,
    action: RequestAction,
) -> Result<ActingAuthority, WorkflowError> {
    if resolution.is_empty() {
        return Err(WorkflowError::UnresolvableStep {
            request_id: request.id.clone(),
            step_id: current.clone(),
        });
    }
    if !resolution.contains(&context.actor_id) {
        return Err(WorkflowError::Authorization {
            request_id: request.id.clone(),
            step_id: current.clone(),
            actor_id: context.actor_id.clone(),
            action,
        });
    }
    Ok(match resolution.source {
        ResolutionSource::Fallback => ActingAuthority::Fallback,
        ResolutionSource::Primary | ResolutionSource::Unresolved => ActingAuthority::Primary,
    })
}

fn commit(
    request: &ApprovalRequest,
    status: RequestStatus,
    next_step: Option<StepId>,
    action: RequestAction,
    authority: ActingAuthority,
    context: ActionContext,
) -> TransitionOutcome {
    let mut next = request.clone();
    next.status = status;
    next.current_step_id = if status.is_terminal() { None } else { next_step };
    next.version = request.version + 1;
    next.updated_at = context.now;
    if status.is_terminal() {
        next.completed_at = Some(context.now);
    }

    let log = ApprovalLog {
        id: LogId::generate(),
        request_id: request.id.clone(),
        actor_id: context.actor_id,
        action,
        authority,
        from_step_id: request.current_step_id.clone(),
        to_step_id: next.current_step_id.clone(),
        note: context.note,
        request_version: next.version,
        created_at: context.now,
    };

    TransitionOutcome { request: next, log, expected_version: request.version }
}
