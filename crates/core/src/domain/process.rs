use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::directory::{EmployeeId, OrgUnitId, OrganizationId, RoleId};
use crate::domain::identifier;
use crate::errors::WorkflowError;

identifier!(ProcessId);
identifier!(StepId);
identifier!(ResponsibilityId);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Draft,
    Published,
}

impl ProcessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Published => "published",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "draft" => Some(Self::Draft),
            "published" => Some(Self::Published),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalProcess {
    pub id: ProcessId,
    pub organization_id: OrganizationId,
    pub name: String,
    pub description: Option<String>,
    pub status: ProcessStatus,
    pub active: bool,
    pub derived_from: Option<ProcessId>,
    /// Bumped by every write to the process row or its definition.
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl ApprovalProcess {
    pub fn draft(
        organization_id: OrganizationId,
        name: impl Into<String>,
        description: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Self, WorkflowError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(WorkflowError::Validation("process name must not be blank".to_string()));
        }

        Ok(Self {
            id: ProcessId::generate(),
            organization_id,
            name,
            description,
            status: ProcessStatus::Draft,
            active: true,
            derived_from: None,
            version: 1,
            created_at: now,
            updated_at: now,
            published_at: None,
            deleted_at: None,
        })
    }

    pub fn is_published(&self) -> bool {
        self.status == ProcessStatus::Published
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// New requests may only start against a live, published definition.
    pub fn accepts_requests(&self) -> bool {
        self.is_published() && self.active && !self.is_deleted()
    }

    /// Steps and responsibilities may only change while the process is an undeleted draft.
    pub fn ensure_editable(&self) -> Result<(), WorkflowError> {
        if self.is_deleted() {
            return Err(WorkflowError::Validation(format!(
                "process `{}` is deleted and can no longer be edited",
                self.id
            )));
        }
        if self.is_published() {
            return Err(WorkflowError::Validation(format!(
                "process `{}` is published; derive a new process version to change it",
                self.id
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalStep {
    pub id: StepId,
    pub process_id: ProcessId,
    pub name: String,
    pub step_order: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApprovalStep {
    pub fn new(
        process_id: ProcessId,
        name: impl Into<String>,
        step_order: u32,
        now: DateTime<Utc>,
    ) -> Result<Self, WorkflowError> {
        if step_order == 0 {
            return Err(WorkflowError::Validation(format!(
                "step order must be a positive integer for process `{process_id}`"
            )));
        }

        Ok(Self {
            id: StepId::generate(),
            process_id,
            name: name.into(),
            step_order,
            created_at: now,
            updated_at: now,
        })
    }
}

/// Who a responsibility points at. Exactly one case is populated by construction.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum PrincipalSelector {
    Role(RoleId),
    OrgUnit(OrgUnitId),
    Employee(EmployeeId),
}

impl PrincipalSelector {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Role(_) => "role",
            Self::OrgUnit(_) => "org_unit",
            Self::Employee(_) => "employee",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Role(id) => id.as_str(),
            Self::OrgUnit(id) => id.as_str(),
            Self::Employee(id) => id.as_str(),
        }
    }

    pub fn parse(kind: &str, id: &str) -> Option<Self> {
        if id.trim().is_empty() {
            return None;
        }
        match kind.trim().to_ascii_lowercase().as_str() {
            "role" => Some(Self::Role(RoleId::new(id))),
            "org_unit" => Some(Self::OrgUnit(OrgUnitId::new(id))),
            "employee" => Some(Self::Employee(EmployeeId::new(id))),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApprovalResponsibility {
    pub id: ResponsibilityId,
    pub step_id: StepId,
    pub primary: PrincipalSelector,
    pub fallback: Option<PrincipalSelector>,
    pub action: String,
    pub extra_data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApprovalResponsibility {
    pub fn new(
        step_id: StepId,
        primary: PrincipalSelector,
        fallback: Option<PrincipalSelector>,
        action: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Self, WorkflowError> {
        let responsibility = Self {
            id: ResponsibilityId::generate(),
            step_id,
            primary,
            fallback,
            action: action.into(),
            extra_data: None,
            created_at: now,
            updated_at: now,
        };
        responsibility.validate_shape()?;
        Ok(responsibility)
    }

    pub fn with_extra_data(mut self, extra_data: serde_json::Value) -> Self {
        self.extra_data = Some(extra_data);
        self
    }

    pub fn validate_shape(&self) -> Result<(), WorkflowError> {
        if self.action.trim().is_empty() {
            return Err(WorkflowError::Validation(format!(
                "responsibility `{}` must carry an action tag",
                self.id
            )));
        }
        if self.fallback.as_ref() == Some(&self.primary) {
            return Err(WorkflowError::Validation(format!(
                "responsibility `{}` uses the same {} selector `{}` as primary and fallback",
                self.id,
                self.primary.kind(),
                self.primary.id()
            )));
        }
        Ok(())
    }
}
