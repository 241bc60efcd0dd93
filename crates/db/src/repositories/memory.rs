use std::collections::HashMap;

use tokio::sync::RwLock;

use signoff_core::domain::comment::ApprovalComment;
use signoff_core::domain::directory::OrganizationId;
use signoff_core::domain::log::ApprovalLog;
use signoff_core::domain::process::{
    ApprovalProcess, ApprovalResponsibility, ApprovalStep, ProcessId, ResponsibilityId, StepId,
};
use signoff_core::domain::request::{ApprovalRequest, RequestId, RequestStatus, SubjectRef};

use super::{CommentRepository, ProcessRepository, RepositoryError, RequestRepository};

#[derive(Default)]
struct Catalog {
    processes: HashMap<String, ApprovalProcess>,
    steps: HashMap<String, ApprovalStep>,
    responsibilities: HashMap<String, ApprovalResponsibility>,
}

impl Catalog {
    fn steps_of(&self, process_id: &ProcessId) -> Vec<ApprovalStep> {
        let mut steps: Vec<_> =
            self.steps.values().filter(|step| &step.process_id == process_id).cloned().collect();
        steps.sort_by(|left, right| {
            left.step_order.cmp(&right.step_order).then_with(|| left.id.cmp(&right.id))
        });
        steps
    }

    fn responsibilities_of(&self, step_id: &StepId) -> Vec<ApprovalResponsibility> {
        let mut responsibilities: Vec<_> = self
            .responsibilities
            .values()
            .filter(|responsibility| &responsibility.step_id == step_id)
            .cloned()
            .collect();
        responsibilities.sort_by(|left, right| {
            left.created_at.cmp(&right.created_at).then_with(|| left.id.cmp(&right.id))
        });
        responsibilities
    }

    /// The owning process, provided it is still an undeleted draft.
    fn draft_mut(&mut self, process_id: &ProcessId) -> Result<&mut ApprovalProcess, RepositoryError> {
        let process = self
            .processes
            .get_mut(process_id.as_str())
            .ok_or_else(|| RepositoryError::NotFound(format!("approval process `{process_id}`")))?;
        if process.is_published() || process.is_deleted() {
            return Err(RepositoryError::DefinitionFrozen(process_id.to_string()));
        }
        Ok(process)
    }

    fn owner_of_step(&self, step_id: &StepId) -> Option<ProcessId> {
        self.steps.get(step_id.as_str()).map(|step| step.process_id.clone())
    }
}

/// Every check and the write it guards happen under one `catalog` write lock.
#[derive(Default)]
pub struct InMemoryProcessRepository {
    catalog: RwLock<Catalog>,
}

#[async_trait::async_trait]
impl ProcessRepository for InMemoryProcessRepository {
    async fn find_process(
        &self,
        id: &ProcessId,
    ) -> Result<Option<ApprovalProcess>, RepositoryError> {
        let catalog = self.catalog.read().await;
        Ok(catalog.processes.get(id.as_str()).cloned())
    }

    async fn list_processes(
        &self,
        organization_id: Option<&OrganizationId>,
    ) -> Result<Vec<ApprovalProcess>, RepositoryError> {
        let catalog = self.catalog.read().await;
        let mut processes: Vec<_> = catalog
            .processes
            .values()
            .filter(|process| !process.is_deleted())
            .filter(|process| organization_id.map_or(true, |org| &process.organization_id == org))
            .cloned()
            .collect();
        processes.sort_by(|left, right| {
            left.created_at.cmp(&right.created_at).then_with(|| left.id.cmp(&right.id))
        });
        Ok(processes)
    }

    async fn insert_process(&self, process: ApprovalProcess) -> Result<(), RepositoryError> {
        let mut catalog = self.catalog.write().await;
        if catalog.processes.contains_key(process.id.as_str()) {
            return Err(RepositoryError::Decode(format!(
                "approval process `{}` already exists",
                process.id
            )));
        }
        catalog.processes.insert(process.id.as_str().to_string(), process);
        Ok(())
    }

    async fn update_process(
        &self,
        process: &ApprovalProcess,
        expected_version: u32,
    ) -> Result<(), RepositoryError> {
        let mut catalog = self.catalog.write().await;
        let Some(stored) = catalog.processes.get_mut(process.id.as_str()) else {
            return Err(RepositoryError::NotFound(format!("approval process `{}`", process.id)));
        };
        if stored.version != expected_version {
            return Err(RepositoryError::VersionConflict {
                expected: expected_version,
                actual: stored.version,
            });
        }

        *stored = process.clone();
        Ok(())
    }

    async fn find_step(&self, id: &StepId) -> Result<Option<ApprovalStep>, RepositoryError> {
        let catalog = self.catalog.read().await;
        Ok(catalog.steps.get(id.as_str()).cloned())
    }

    async fn list_steps(
        &self,
        process_id: &ProcessId,
    ) -> Result<Vec<ApprovalStep>, RepositoryError> {
        let catalog = self.catalog.read().await;
        Ok(catalog.steps_of(process_id))
    }

    async fn save_step(&self, step: ApprovalStep) -> Result<(), RepositoryError> {
        let mut catalog = self.catalog.write().await;
        catalog.draft_mut(&step.process_id)?;
        let taken = catalog.steps.values().any(|other| {
            other.process_id == step.process_id
                && other.step_order == step.step_order
                && other.id != step.id
        });
        if taken {
            return Err(RepositoryError::DuplicateStepOrder {
                process_id: step.process_id.to_string(),
                step_order: step.step_order,
            });
        }

        catalog.draft_mut(&step.process_id)?.version += 1;
        catalog.steps.insert(step.id.as_str().to_string(), step);
        Ok(())
    }

    async fn delete_step(&self, id: &StepId) -> Result<bool, RepositoryError> {
        let mut catalog = self.catalog.write().await;
        let Some(process_id) = catalog.owner_of_step(id) else {
            return Ok(false);
        };
        catalog.draft_mut(&process_id)?.version += 1;
        catalog.responsibilities.retain(|_, responsibility| &responsibility.step_id != id);
        Ok(catalog.steps.remove(id.as_str()).is_some())
    }

    async fn find_responsibility(
        &self,
        id: &ResponsibilityId,
    ) -> Result<Option<ApprovalResponsibility>, RepositoryError> {
        let catalog = self.catalog.read().await;
        Ok(catalog.responsibilities.get(id.as_str()).cloned())
    }

    async fn list_responsibilities_for_step(
        &self,
        step_id: &StepId,
    ) -> Result<Vec<ApprovalResponsibility>, RepositoryError> {
        let catalog = self.catalog.read().await;
        Ok(catalog.responsibilities_of(step_id))
    }

    async fn list_responsibilities_for_process(
        &self,
        process_id: &ProcessId,
    ) -> Result<Vec<ApprovalResponsibility>, RepositoryError> {
        let catalog = self.catalog.read().await;
        Ok(catalog
            .steps_of(process_id)
            .iter()
            .flat_map(|step| catalog.responsibilities_of(&step.id))
            .collect())
    }

    async fn save_responsibility(
        &self,
        responsibility: ApprovalResponsibility,
    ) -> Result<(), RepositoryError> {
        let mut catalog = self.catalog.write().await;
        let Some(process_id) = catalog.owner_of_step(&responsibility.step_id) else {
            return Err(RepositoryError::NotFound(format!(
                "approval step `{}`",
                responsibility.step_id
            )));
        };
        catalog.draft_mut(&process_id)?.version += 1;
        catalog.responsibilities.insert(responsibility.id.as_str().to_string(), responsibility);
        Ok(())
    }

    async fn delete_responsibility(
        &self,
        id: &ResponsibilityId,
    ) -> Result<bool, RepositoryError> {
        let mut catalog = self.catalog.write().await;
        let owner = catalog
            .responsibilities
            .get(id.as_str())
            .and_then(|responsibility| catalog.owner_of_step(&responsibility.step_id));
        let Some(process_id) = owner else {
            return Ok(false);
        };
        catalog.draft_mut(&process_id)?.version += 1;
        Ok(catalog.responsibilities.remove(id.as_str()).is_some())
    }

    async fn save_definition(
        &self,
        process: ApprovalProcess,
        steps: Vec<ApprovalStep>,
        responsibilities: Vec<ApprovalResponsibility>,
    ) -> Result<(), RepositoryError> {
        let mut catalog = self.catalog.write().await;
        catalog.processes.insert(process.id.as_str().to_string(), process);
        for step in steps {
            catalog.steps.insert(step.id.as_str().to_string(), step);
        }
        for responsibility in responsibilities {
            catalog.responsibilities.insert(responsibility.id.as_str().to_string(), responsibility);
        }
        Ok(())
    }
}

#[derive(Default)]
struct RequestLedger {
    requests: HashMap<String, (u64, ApprovalRequest)>,
    logs: HashMap<String, Vec<ApprovalLog>>,
    inserted: u64,
}

impl RequestLedger {
    fn newest_first(&self, filter: impl Fn(&ApprovalRequest) -> bool) -> Vec<ApprovalRequest> {
        let mut matching: Vec<_> =
            self.requests.values().filter(|(_, request)| filter(request)).collect();
        matching.sort_by(|(left_seq, left), (right_seq, right)| {
            right.created_at.cmp(&left.created_at).then_with(|| right_seq.cmp(left_seq))
        });
        matching.into_iter().map(|(_, request)| request.clone()).collect()
    }
}

/// Requests and their logs share one lock so a transition and its log entry
/// become visible together.
#[derive(Default)]
pub struct InMemoryRequestRepository {
    ledger: RwLock<RequestLedger>,
}

#[async_trait::async_trait]
impl RequestRepository for InMemoryRequestRepository {
    async fn insert_request(&self, request: ApprovalRequest) -> Result<(), RepositoryError> {
        let mut ledger = self.ledger.write().await;
        if ledger.requests.contains_key(request.id.as_str()) {
            return Err(RepositoryError::Decode(format!(
                "approval request `{}` already exists",
                request.id
            )));
        }
        ledger.inserted += 1;
        let sequence = ledger.inserted;
        ledger.requests.insert(request.id.as_str().to_string(), (sequence, request));
        Ok(())
    }

    async fn find_request(
        &self,
        id: &RequestId,
    ) -> Result<Option<ApprovalRequest>, RepositoryError> {
        let ledger = self.ledger.read().await;
        Ok(ledger.requests.get(id.as_str()).map(|(_, request)| request.clone()))
    }

    async fn list_requests(
        &self,
        status: Option<RequestStatus>,
    ) -> Result<Vec<ApprovalRequest>, RepositoryError> {
        let ledger = self.ledger.read().await;
        Ok(ledger.newest_first(|request| status.map_or(true, |status| request.status == status)))
    }

    async fn list_requests_by_subject(
        &self,
        subject: &SubjectRef,
    ) -> Result<Vec<ApprovalRequest>, RepositoryError> {
        let ledger = self.ledger.read().await;
        Ok(ledger.newest_first(|request| &request.subject == subject))
    }

    async fn commit_transition(
        &self,
        request: &ApprovalRequest,
        expected_version: u32,
        log: &ApprovalLog,
    ) -> Result<(), RepositoryError> {
        let mut ledger = self.ledger.write().await;
        let Some((_, stored)) = ledger.requests.get_mut(request.id.as_str()) else {
            return Err(RepositoryError::NotFound(format!("approval request `{}`", request.id)));
        };
        if stored.version != expected_version {
            return Err(RepositoryError::VersionConflict {
                expected: expected_version,
                actual: stored.version,
            });
        }

        *stored = request.clone();
        ledger.logs.entry(request.id.as_str().to_string()).or_default().push(log.clone());
        Ok(())
    }

    async fn list_logs(&self, request_id: &RequestId) -> Result<Vec<ApprovalLog>, RepositoryError> {
        let ledger = self.ledger.read().await;
        Ok(ledger.logs.get(request_id.as_str()).cloned().unwrap_or_default())
    }
}

#[derive(Default)]
pub struct InMemoryCommentRepository {
    comments: RwLock<HashMap<String, Vec<ApprovalComment>>>,
}

#[async_trait::async_trait]
impl CommentRepository for InMemoryCommentRepository {
    async fn append_comment(&self, comment: ApprovalComment) -> Result<(), RepositoryError> {
        let mut comments = self.comments.write().await;
        comments.entry(comment.request_id.as_str().to_string()).or_default().push(comment);
        Ok(())
    }

    async fn list_comments(
        &self,
        request_id: &RequestId,
    ) -> Result<Vec<ApprovalComment>, RepositoryError> {
        let comments = self.comments.read().await;
        Ok(comments.get(request_id.as_str()).cloned().unwrap_or_default())
    }
}
