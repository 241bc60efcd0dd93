use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use signoff_core::catalog::{derive_version, validate_for_publish, StepSequence};
use signoff_core::domain::comment::ApprovalComment;
use signoff_core::domain::directory::{EmployeeId, OrganizationId};
use signoff_core::domain::log::ApprovalLog;
use signoff_core::domain::process::{
    ApprovalProcess, ApprovalResponsibility, ApprovalStep, PrincipalSelector, ProcessId,
    ProcessStatus, ResponsibilityId, StepId,
};
use signoff_core::domain::request::{
    ApprovalRequest, RequestAction, RequestId, RequestStatus, SubjectRef,
};
use signoff_core::errors::{ApplicationError, EntityKind, WorkflowError};
use signoff_core::resolver::{Directory, DirectoryError, Resolution, ResponsibilityResolver};
use signoff_core::transitions::{ActionContext, RequestStateMachine, TransitionOutcome};
use signoff_db::repositories::{
    CommentRepository, InMemoryCommentRepository, InMemoryProcessRepository,
    InMemoryRequestRepository, ProcessRepository, RepositoryError, RequestRepository,
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewResponsibility {
    pub primary: PrincipalSelector,
    pub fallback: Option<PrincipalSelector>,
    pub action: String,
    pub extra_data: Option<Value>,
}

impl NewResponsibility {
    pub fn new(primary: PrincipalSelector, action: impl Into<String>) -> Self {
        Self { primary, fallback: None, action: action.into(), extra_data: None }
    }

    pub fn with_fallback(mut self, fallback: PrincipalSelector) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_extra_data(mut self, extra_data: Value) -> Self {
        self.extra_data = Some(extra_data);
        self
    }
}

/// Absent fields are left unchanged.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub active: Option<bool>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StepUpdate {
    pub name: Option<String>,
    pub step_order: Option<u32>,
}

/// `fallback: Some(None)` clears the fallback selector.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponsibilityUpdate {
    pub primary: Option<PrincipalSelector>,
    pub fallback: Option<Option<PrincipalSelector>>,
    pub action: Option<String>,
    pub extra_data: Option<Value>,
}

/// An actor's decision on a pending request. `observed_version` is the version
/// the actor last saw; when present it must still be current.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub request_id: RequestId,
    pub actor_id: EmployeeId,
    pub observed_version: Option<u32>,
    pub note: Option<String>,
}

impl Decision {
    pub fn new(request_id: RequestId, actor_id: EmployeeId) -> Self {
        Self { request_id, actor_id, observed_version: None, note: None }
    }

    pub fn at_version(mut self, version: u32) -> Self {
        self.observed_version = Some(version);
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Service boundary for process definitions and the requests running against
/// them. Every request state change goes through a single compare-and-swap
/// commit that also appends the audit log entry. Process rows are versioned the
/// same way, and definition edits are refused by storage once the process is
/// published.
pub struct ApprovalEngine {
    processes: Arc<dyn ProcessRepository>,
    requests: Arc<dyn RequestRepository>,
    comments: Arc<dyn CommentRepository>,
    resolver: ResponsibilityResolver<Arc<dyn Directory>>,
    machine: RequestStateMachine,
    administrators: HashSet<EmployeeId>,
}

impl ApprovalEngine {
    pub fn new(
        processes: Arc<dyn ProcessRepository>,
        requests: Arc<dyn RequestRepository>,
        comments: Arc<dyn CommentRepository>,
        directory: Arc<dyn Directory>,
    ) -> Self {
        Self {
            processes,
            requests,
            comments,
            resolver: ResponsibilityResolver::new(directory),
            machine: RequestStateMachine::new(),
            administrators: HashSet::new(),
        }
    }

    pub fn in_memory(directory: Arc<dyn Directory>) -> Self {
        Self::new(
            Arc::new(InMemoryProcessRepository::default()),
            Arc::new(InMemoryRequestRepository::default()),
            Arc::new(InMemoryCommentRepository::default()),
            directory,
        )
    }

    pub fn with_administrators<I, S>(mut self, administrators: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.administrators = administrators.into_iter().map(|id| EmployeeId(id.into())).collect();
        self
    }

    pub fn is_administrator(&self, employee_id: &EmployeeId) -> bool {
        self.administrators.contains(employee_id)
    }

    pub async fn define_process(
        &self,
        organization_id: OrganizationId,
        name: &str,
        description: Option<String>,
    ) -> Result<ApprovalProcess, ApplicationError> {
        let process = ApprovalProcess::draft(organization_id, name, description, Utc::now())?;
        self.processes.insert_process(process.clone()).await.map_err(persistence)?;

        info!(
            event_name = "approval.process.defined",
            process_id = %process.id,
            organization_id = %process.organization_id,
            "approval process drafted"
        );
        Ok(process)
    }

    pub async fn list_processes(&self) -> Result<Vec<ApprovalProcess>, ApplicationError> {
        self.processes.list_processes(None).await.map_err(persistence)
    }

    pub async fn list_processes_by_organization(
        &self,
        organization_id: &OrganizationId,
    ) -> Result<Vec<ApprovalProcess>, ApplicationError> {
        self.processes.list_processes(Some(organization_id)).await.map_err(persistence)
    }

    /// Soft-deleted processes are reported as missing.
    pub async fn get_process(&self, id: &ProcessId) -> Result<ApprovalProcess, ApplicationError> {
        match self.processes.find_process(id).await.map_err(persistence)? {
            Some(process) if !process.is_deleted() => Ok(process),
            _ => Err(WorkflowError::not_found(EntityKind::Process, id).into()),
        }
    }

    pub async fn update_process(
        &self,
        id: &ProcessId,
        update: ProcessUpdate,
    ) -> Result<ApprovalProcess, ApplicationError> {
        let mut process = self.get_process(id).await?;

        if update.name.is_some() || update.description.is_some() {
            process.ensure_editable()?;
        }
        if let Some(name) = update.name {
            if name.trim().is_empty() {
                return Err(
                    WorkflowError::Validation("process name must not be blank".to_string()).into()
                );
            }
            process.name = name;
        }
        if let Some(description) = update.description {
            process.description = Some(description).filter(|text| !text.trim().is_empty());
        }
        if let Some(active) = update.active {
            process.active = active;
        }
        process.updated_at = Utc::now();

        self.commit_process(&mut process).await?;
        Ok(process)
    }

    /// Running requests keep resolving against a deleted process; it only
    /// stops accepting new ones.
    pub async fn delete_process(&self, id: &ProcessId) -> Result<ApprovalProcess, ApplicationError> {
        let mut process = self.get_process(id).await?;
        let now = Utc::now();
        process.deleted_at = Some(now);
        process.active = false;
        process.updated_at = now;
        self.commit_process(&mut process).await?;

        info!(
            event_name = "approval.process.deleted",
            process_id = %process.id,
            "approval process soft-deleted"
        );
        Ok(process)
    }

    pub async fn add_step(
        &self,
        process_id: &ProcessId,
        name: &str,
        step_order: u32,
    ) -> Result<ApprovalStep, ApplicationError> {
        let process = self.editable_process(process_id).await?;
        let step = ApprovalStep::new(process.id.clone(), name, step_order, Utc::now())?;
        self.processes.save_step(step.clone()).await.map_err(definition_write)?;
        Ok(step)
    }

    pub async fn list_steps(
        &self,
        process_id: &ProcessId,
    ) -> Result<Vec<ApprovalStep>, ApplicationError> {
        let process = self.get_process(process_id).await?;
        self.processes.list_steps(&process.id).await.map_err(persistence)
    }

    pub async fn get_step(&self, id: &StepId) -> Result<ApprovalStep, ApplicationError> {
        self.processes
            .find_step(id)
            .await
            .map_err(persistence)?
            .ok_or_else(|| WorkflowError::not_found(EntityKind::Step, id).into())
    }

    pub async fn update_step(
        &self,
        id: &StepId,
        update: StepUpdate,
    ) -> Result<ApprovalStep, ApplicationError> {
        let mut step = self.get_step(id).await?;
        self.editable_process(&step.process_id).await?;

        if let Some(name) = update.name {
            step.name = name;
        }
        if let Some(step_order) = update.step_order {
            if step_order == 0 {
                return Err(WorkflowError::Validation(format!(
                    "step `{}` must have a positive order",
                    step.id
                ))
                .into());
            }
            step.step_order = step_order;
        }
        step.updated_at = Utc::now();

        self.processes.save_step(step.clone()).await.map_err(definition_write)?;
        Ok(step)
    }

    /// Removes the step and every responsibility attached to it.
    pub async fn remove_step(&self, id: &StepId) -> Result<(), ApplicationError> {
        let step = self.get_step(id).await?;
        self.editable_process(&step.process_id).await?;
        if !self.processes.delete_step(id).await.map_err(definition_write)? {
            return Err(WorkflowError::not_found(EntityKind::Step, id).into());
        }
        Ok(())
    }

    pub async fn add_responsibility(
        &self,
        step_id: &StepId,
        input: NewResponsibility,
    ) -> Result<ApprovalResponsibility, ApplicationError> {
        let step = self.get_step(step_id).await?;
        self.editable_process(&step.process_id).await?;

        let mut responsibility = ApprovalResponsibility::new(
            step.id.clone(),
            input.primary,
            input.fallback,
            input.action,
            Utc::now(),
        )?;
        if let Some(extra_data) = input.extra_data {
            responsibility = responsibility.with_extra_data(extra_data);
        }

        self.processes
            .save_responsibility(responsibility.clone())
            .await
            .map_err(definition_write)?;
        Ok(responsibility)
    }

    pub async fn list_responsibilities(
        &self,
        step_id: &StepId,
    ) -> Result<Vec<ApprovalResponsibility>, ApplicationError> {
        let step = self.get_step(step_id).await?;
        self.processes.list_responsibilities_for_step(&step.id).await.map_err(persistence)
    }

    pub async fn update_responsibility(
        &self,
        id: &ResponsibilityId,
        update: ResponsibilityUpdate,
    ) -> Result<ApprovalResponsibility, ApplicationError> {
        let mut responsibility = self.get_responsibility(id).await?;
        let step = self.get_step(&responsibility.step_id).await?;
        self.editable_process(&step.process_id).await?;

        if let Some(primary) = update.primary {
            responsibility.primary = primary;
        }
        if let Some(fallback) = update.fallback {
            responsibility.fallback = fallback;
        }
        if let Some(action) = update.action {
            responsibility.action = action;
        }
        if let Some(extra_data) = update.extra_data {
            responsibility.extra_data = Some(extra_data);
        }
        responsibility.validate_shape()?;
        responsibility.updated_at = Utc::now();

        self.processes
            .save_responsibility(responsibility.clone())
            .await
            .map_err(definition_write)?;
        Ok(responsibility)
    }

    pub async fn remove_responsibility(&self, id: &ResponsibilityId) -> Result<(), ApplicationError> {
        let responsibility = self.get_responsibility(id).await?;
        let step = self.get_step(&responsibility.step_id).await?;
        self.editable_process(&step.process_id).await?;
        if !self.processes.delete_responsibility(id).await.map_err(definition_write)? {
            return Err(WorkflowError::not_found(EntityKind::Responsibility, id).into());
        }
        Ok(())
    }

    /// Freezes a draft. After this the definition is immutable; changes go
    /// through `derive_process_version`. The status write only lands if no
    /// edit committed since the definition was read for validation.
    pub async fn publish_process(&self, id: &ProcessId) -> Result<ApprovalProcess, ApplicationError> {
        let mut process = self
            .processes
            .find_process(id)
            .await
            .map_err(persistence)?
            .ok_or_else(|| WorkflowError::not_found(EntityKind::Process, id))?;
        let steps = self.processes.list_steps(id).await.map_err(persistence)?;
        let responsibilities =
            self.processes.list_responsibilities_for_process(id).await.map_err(persistence)?;

        if let Err(violation) = validate_for_publish(&process, &steps, &responsibilities) {
            warn!(
                event_name = "approval.process.publish_rejected",
                process_id = %id,
                reason = %violation.reason(),
                "approval process failed publish validation"
            );
            return Err(WorkflowError::from(violation).into());
        }

        let now = Utc::now();
        process.status = ProcessStatus::Published;
        process.published_at = Some(now);
        process.updated_at = now;
        if let Err(error) = self.commit_process(&mut process).await {
            warn!(
                event_name = "approval.process.publish_rejected",
                process_id = %id,
                reason = %error,
                "approval process changed during publish"
            );
            return Err(error);
        }

        info!(
            event_name = "approval.process.published",
            process_id = %process.id,
            organization_id = %process.organization_id,
            step_count = steps.len(),
            "approval process published"
        );
        Ok(process)
    }

    /// Copies a process's steps and responsibilities into a new draft.
    pub async fn derive_process_version(
        &self,
        id: &ProcessId,
    ) -> Result<ApprovalProcess, ApplicationError> {
        let source = self.get_process(id).await?;
        let steps = self.processes.list_steps(id).await.map_err(persistence)?;
        let responsibilities =
            self.processes.list_responsibilities_for_process(id).await.map_err(persistence)?;

        let derived = derive_version(&source, &steps, &responsibilities, Utc::now());
        let process = derived.process.clone();
        self.processes
            .save_definition(derived.process, derived.steps, derived.responsibilities)
            .await
            .map_err(persistence)?;

        info!(
            event_name = "approval.process.derived",
            process_id = %process.id,
            derived_from = %source.id,
            "approval process version derived"
        );
        Ok(process)
    }

    /// Current eligible principals for a step, read live from the directory.
    pub async fn resolve_eligible_principals(
        &self,
        step_id: &StepId,
    ) -> Result<Resolution, ApplicationError> {
        let step = self.get_step(step_id).await?;
        let process = self.scope_process(&step.process_id).await?;
        self.resolve_step(&process, &step.id).await
    }

    pub async fn create_request(
        &self,
        process_id: &ProcessId,
        subject: SubjectRef,
        requested_by: EmployeeId,
    ) -> Result<ApprovalRequest, ApplicationError> {
        let process = self
            .processes
            .find_process(process_id)
            .await
            .map_err(persistence)?
            .ok_or_else(|| WorkflowError::not_found(EntityKind::Process, process_id))?;
        let steps = StepSequence::new(self.processes.list_steps(process_id).await.map_err(persistence)?);

        let request = self.machine.start(&process, &steps, subject, requested_by, Utc::now())?;
        self.requests.insert_request(request.clone()).await.map_err(persistence)?;

        info!(
            event_name = "approval.request.created",
            request_id = %request.id,
            process_id = %request.process_id,
            step_id = step_label(request.current_step_id.as_ref()),
            actor_id = %request.requested_by,
            version = request.version,
            "approval request created"
        );
        Ok(request)
    }

    pub async fn approve(&self, decision: Decision) -> Result<ApprovalRequest, ApplicationError> {
        self.decide(RequestAction::Approve, decision).await
    }

    pub async fn reject(&self, decision: Decision) -> Result<ApprovalRequest, ApplicationError> {
        self.decide(RequestAction::Reject, decision).await
    }

    pub async fn cancel(&self, decision: Decision) -> Result<ApprovalRequest, ApplicationError> {
        self.decide(RequestAction::Cancel, decision).await
    }

    pub async fn get_request(&self, id: &RequestId) -> Result<ApprovalRequest, ApplicationError> {
        self.requests
            .find_request(id)
            .await
            .map_err(persistence)?
            .ok_or_else(|| WorkflowError::not_found(EntityKind::Request, id).into())
    }

    pub async fn list_requests(
        &self,
        status: Option<RequestStatus>,
    ) -> Result<Vec<ApprovalRequest>, ApplicationError> {
        self.requests.list_requests(status).await.map_err(persistence)
    }

    pub async fn list_requests_by_subject(
        &self,
        subject: &SubjectRef,
    ) -> Result<Vec<ApprovalRequest>, ApplicationError> {
        self.requests.list_requests_by_subject(subject).await.map_err(persistence)
    }

    pub async fn list_logs(&self, request_id: &RequestId) -> Result<Vec<ApprovalLog>, ApplicationError> {
        let request = self.get_request(request_id).await?;
        self.requests.list_logs(&request.id).await.map_err(persistence)
    }

    pub async fn list_comments(
        &self,
        request_id: &RequestId,
    ) -> Result<Vec<ApprovalComment>, ApplicationError> {
        let request = self.get_request(request_id).await?;
        self.comments.list_comments(&request.id).await.map_err(persistence)
    }

    /// Comments never change request state and are accepted in any status.
    pub async fn add_comment(
        &self,
        request_id: &RequestId,
        author_id: EmployeeId,
        text: &str,
    ) -> Result<ApprovalComment, ApplicationError> {
        let request = self.get_request(request_id).await?;
        let comment = ApprovalComment::new(request.id, author_id, text, Utc::now())?;
        self.comments.append_comment(comment.clone()).await.map_err(persistence)?;
        Ok(comment)
    }

    async fn decide(
        &self,
        action: RequestAction,
        decision: Decision,
    ) -> Result<ApprovalRequest, ApplicationError> {
        let request = self.get_request(&decision.request_id).await?;

        let outcome = match self.plan(action, &request, &decision).await {
            Ok(outcome) => outcome,
            Err(error) => {
                if let ApplicationError::Workflow(reason) = &error {
                    warn!(
                        event_name = "approval.request.rejected_action",
                        request_id = %request.id,
                        process_id = %request.process_id,
                        step_id = step_label(request.current_step_id.as_ref()),
                        actor_id = %decision.actor_id,
                        version = request.version,
                        action = action.as_str(),
                        reason = %reason,
                        "approval action refused"
                    );
                }
                return Err(error);
            }
        };

        self.requests
            .commit_transition(&outcome.request, outcome.expected_version, &outcome.log)
            .await
            .map_err(|error| match error {
                RepositoryError::VersionConflict { expected, actual } => {
                    warn!(
                        event_name = "approval.request.rejected_action",
                        request_id = %request.id,
                        actor_id = %decision.actor_id,
                        action = action.as_str(),
                        expected_version = expected,
                        actual_version = actual,
                        "approval action lost a concurrent update"
                    );
                    ApplicationError::from(WorkflowError::ConcurrentModification {
                        request_id: request.id.clone(),
                        expected_version: expected,
                        actual_version: actual,
                    })
                }
                RepositoryError::NotFound(_) => {
                    WorkflowError::not_found(EntityKind::Request, &request.id).into()
                }
                other => persistence(other),
            })?;

        info!(
            event_name = "approval.request.transitioned",
            request_id = %outcome.request.id,
            process_id = %outcome.request.process_id,
            step_id = step_label(outcome.log.from_step_id.as_ref()),
            next_step_id = step_label(outcome.request.current_step_id.as_ref()),
            actor_id = %outcome.log.actor_id,
            action = action.as_str(),
            authority = outcome.log.authority.as_str(),
            status = outcome.request.status.as_str(),
            version = outcome.request.version,
            "approval request transitioned"
        );
        Ok(outcome.request)
    }

    /// Computes the transition without writing anything.
    async fn plan(
        &self,
        action: RequestAction,
        request: &ApprovalRequest,
        decision: &Decision,
    ) -> Result<TransitionOutcome, ApplicationError> {
        if let Some(observed) = decision.observed_version {
            if observed != request.version {
                return Err(WorkflowError::ConcurrentModification {
                    request_id: request.id.clone(),
                    expected_version: observed,
                    actual_version: request.version,
                }
                .into());
            }
        }

        let context =
            ActionContext::new(decision.actor_id.clone(), Utc::now()).with_note(decision.note.clone());

        if action == RequestAction::Cancel {
            let is_administrator = self.is_administrator(&decision.actor_id);
            return Ok(self.machine.cancel(request, is_administrator, context)?);
        }

        let step_id = self.machine.ensure_actionable(request, action)?.clone();
        let process = self.scope_process(&request.process_id).await?;
        let resolution = self.resolve_step(&process, &step_id).await?;

        let outcome = match action {
            RequestAction::Approve => {
                let steps = StepSequence::new(
                    self.processes.list_steps(&process.id).await.map_err(persistence)?,
                );
                self.machine.approve(request, &steps, &resolution, context)?
            }
            _ => self.machine.reject(request, &resolution, context)?,
        };
        Ok(outcome)
    }

    async fn resolve_step(
        &self,
        process: &ApprovalProcess,
        step_id: &StepId,
    ) -> Result<Resolution, ApplicationError> {
        let responsibilities =
            self.processes.list_responsibilities_for_step(step_id).await.map_err(persistence)?;
        self.resolver
            .resolve_eligible_principals(&process.organization_id, &responsibilities)
            .await
            .map_err(integration)
    }

    /// Includes soft-deleted processes: requests already running keep their
    /// organization scope.
    async fn scope_process(&self, id: &ProcessId) -> Result<ApprovalProcess, ApplicationError> {
        self.processes
            .find_process(id)
            .await
            .map_err(persistence)?
            .ok_or_else(|| WorkflowError::not_found(EntityKind::Process, id).into())
    }

    async fn editable_process(&self, id: &ProcessId) -> Result<ApprovalProcess, ApplicationError> {
        let process = self.scope_process(id).await?;
        process.ensure_editable()?;
        Ok(process)
    }

    async fn get_responsibility(
        &self,
        id: &ResponsibilityId,
    ) -> Result<ApprovalResponsibility, ApplicationError> {
        self.processes
            .find_responsibility(id)
            .await
            .map_err(persistence)?
            .ok_or_else(|| WorkflowError::not_found(EntityKind::Responsibility, id).into())
    }

    /// Writes the process under its version, bumping it on success.
    async fn commit_process(&self, process: &mut ApprovalProcess) -> Result<(), ApplicationError> {
        let expected_version = process.version;
        process.version = expected_version + 1;
        self.processes.update_process(process, expected_version).await.map_err(|error| {
            match error {
                RepositoryError::VersionConflict { expected, actual } => {
                    WorkflowError::ProcessModified {
                        process_id: process.id.clone(),
                        expected_version: expected,
                        actual_version: actual,
                    }
                    .into()
                }
                RepositoryError::NotFound(_) => {
                    WorkflowError::not_found(EntityKind::Process, &process.id).into()
                }
                other => persistence(other),
            }
        })
    }
}

fn step_label(step_id: Option<&StepId>) -> &str {
    step_id.map(StepId::as_str).unwrap_or("none")
}

fn persistence(error: RepositoryError) -> ApplicationError {
    ApplicationError::Persistence(error.to_string())
}

fn definition_write(error: RepositoryError) -> ApplicationError {
    match error {
        RepositoryError::DefinitionFrozen(process_id) => WorkflowError::Validation(format!(
            "process `{process_id}` is no longer an editable draft; derive a new process version to change it"
        ))
        .into(),
        RepositoryError::DuplicateStepOrder { process_id, step_order } => WorkflowError::Validation(
            format!("step order {step_order} is already used in process `{process_id}`"),
        )
        .into(),
        other => persistence(other),
    }
}

fn integration(error: DirectoryError) -> ApplicationError {
    ApplicationError::Integration(error.to_string())
}
