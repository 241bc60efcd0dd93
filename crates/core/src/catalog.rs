use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::process::{
    ApprovalProcess, ApprovalResponsibility, ApprovalStep, ProcessId, ProcessStatus,
    ResponsibilityId, StepId,
};
use crate::errors::WorkflowError;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CatalogViolation {
    AlreadyPublished { process_id: ProcessId },
    Deleted { process_id: ProcessId },
    NoSteps { process_id: ProcessId },
    ForeignStep { process_id: ProcessId, step_id: StepId },
    DuplicateStepOrder { step_order: u32, first: StepId, second: StepId },
    StepWithoutResponsibility { step_id: StepId },
    OrphanResponsibility { responsibility_id: ResponsibilityId, step_id: StepId },
    MalformedResponsibility { responsibility_id: ResponsibilityId, reason: String },
}

impl CatalogViolation {
    pub fn reason(&self) -> String {
        match self {
            Self::AlreadyPublished { process_id } => {
                format!("process `{process_id}` is already published")
            }
            Self::Deleted { process_id } => format!("process `{process_id}` is deleted"),
            Self::NoSteps { process_id } => {
                format!("process `{process_id}` needs at least one step before publishing")
            }
            Self::ForeignStep { process_id, step_id } => {
                format!("step `{step_id}` does not belong to process `{process_id}`")
            }
            Self::DuplicateStepOrder { step_order, first, second } => {
                format!(
                    "steps `{first}` and `{second}` share step order {step_order}; orders must be strictly increasing"
                )
            }
            Self::StepWithoutResponsibility { step_id } => {
                format!("step `{step_id}` has no responsibility that can resolve an approver")
            }
            Self::OrphanResponsibility { responsibility_id, step_id } => {
                format!(
                    "responsibility `{responsibility_id}` references step `{step_id}` outside the process"
                )
            }
            Self::MalformedResponsibility { responsibility_id, reason } => {
                format!("responsibility `{responsibility_id}` is malformed: {reason}")
            }
        }
    }
}

impl From<CatalogViolation> for WorkflowError {
    fn from(value: CatalogViolation) -> Self {
        WorkflowError::Validation(value.reason())
    }
}

/// Checks every structural rule a process must satisfy before it is published.
pub fn validate_for_publish(
    process: &ApprovalProcess,
    steps: &[ApprovalStep],
    responsibilities: &[ApprovalResponsibility],
) -> Result<(), CatalogViolation> {
    if process.is_deleted() {
        return Err(CatalogViolation::Deleted { process_id: process.id.clone() });
    }
    if process.is_published() {
        return Err(CatalogViolation::AlreadyPublished { process_id: process.id.clone() });
    }
    if steps.is_empty() {
        return Err(CatalogViolation::NoSteps { process_id: process.id.clone() });
    }

    if let Some(step) = steps.iter().find(|step| step.process_id != process.id) {
        return Err(CatalogViolation::ForeignStep {
            process_id: process.id.clone(),
            step_id: step.id.clone(),
        });
    }

    let mut ordered: Vec<&ApprovalStep> = steps.iter().collect();
    ordered.sort_by_key(|step| step.step_order);
    for pair in ordered.windows(2) {
        if pair[0].step_order >= pair[1].step_order {
            return Err(CatalogViolation::DuplicateStepOrder {
                step_order: pair[1].step_order,
                first: pair[0].id.clone(),
                second: pair[1].id.clone(),
            });
        }
    }

    let step_ids: HashSet<&StepId> = steps.iter().map(|step| &step.id).collect();
    let mut covered: HashSet<&StepId> = HashSet::new();
    for responsibility in responsibilities {
        if !step_ids.contains(&responsibility.step_id) {
            return Err(CatalogViolation::OrphanResponsibility {
                responsibility_id: responsibility.id.clone(),
                step_id: responsibility.step_id.clone(),
            });
        }
        if let Err(error) = responsibility.validate_shape() {
            return Err(CatalogViolation::MalformedResponsibility {
                responsibility_id: responsibility.id.clone(),
                reason: error.to_string(),
            });
        }
        covered.insert(&responsibility.step_id);
    }

    if let Some(step) = ordered.iter().find(|step| !covered.contains(&step.id)) {
        return Err(CatalogViolation::StepWithoutResponsibility { step_id: step.id.clone() });
    }

    Ok(())
}

/// The steps of one process in ascending `step_order`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StepSequence {
    steps: Vec<ApprovalStep>,
}

impl StepSequence {
    pub fn new(mut steps: Vec<ApprovalStep>) -> Self {
        steps.sort_by(|left, right| {
            left.step_order.cmp(&right.step_order).then_with(|| left.id.cmp(&right.id))
        });
        Self { steps }
    }

    pub fn first(&self) -> Option<&ApprovalStep> {
        self.steps.first()
    }

    pub fn get(&self, step_id: &StepId) -> Option<&ApprovalStep> {
        self.steps.iter().find(|step| &step.id == step_id)
    }

    /// The step with the next-greater order, or `None` when `step_id` is the last one.
    pub fn next_after(&self, step_id: &StepId) -> Option<&ApprovalStep> {
        let current = self.get(step_id)?;
        self.steps.iter().find(|step| step.step_order > current.step_order)
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ApprovalStep> {
        self.steps.iter()
    }
}

/// A complete copy of a process definition under fresh identifiers.
#[derive(Clone, Debug, PartialEq)]
pub struct DerivedProcess {
    pub process: ApprovalProcess,
    pub steps: Vec<ApprovalStep>,
    pub responsibilities: Vec<ApprovalResponsibility>,
}

/// Copies a definition into a new draft so a published process can evolve
/// without changing the meaning of requests already running against it.
pub fn derive_version(
    source: &ApprovalProcess,
    steps: &[ApprovalStep],
    responsibilities: &[ApprovalResponsibility],
    now: DateTime<Utc>,
) -> DerivedProcess {
    let process = ApprovalProcess {
        id: ProcessId::generate(),
        organization_id: source.organization_id.clone(),
        name: source.name.clone(),
        description: source.description.clone(),
        status: ProcessStatus::Draft,
        active: true,
        derived_from: Some(source.id.clone()),
        version: 1,
        created_at: now,
        updated_at: now,
        published_at: None,
        deleted_at: None,
    };

    let mut step_ids: HashMap<StepId, StepId> = HashMap::new();
    let steps = steps
        .iter()
        .map(|step| {
            let id = StepId::generate();
            step_ids.insert(step.id.clone(), id.clone());
            ApprovalStep {
                id,
                process_id: process.id.clone(),
                name: step.name.clone(),
                step_order: step.step_order,
                created_at: now,
                updated_at: now,
            }
        })
        .collect();

    let responsibilities = responsibilities
        .iter()
        .filter_map(|responsibility| {
            let step_id = step_ids.get(&responsibility.step_id)?;
            Some(ApprovalResponsibility {
                id: ResponsibilityId::generate(),
                step_id: step_id.clone(),
                primary: responsibility.primary.clone(),
                fallback: responsibility.fallback.clone(),
                action: responsibility.action.clone(),
                extra_data: responsibility.extra_data.clone(),
                created_at: now,
                updated_at: now,
            })
        })
        .collect();

    DerivedProcess { process, steps, responsibilities }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{derive_version, validate_for_publish, CatalogViolation, StepSequence};
    use crate::domain::directory::{EmployeeId, OrganizationId, RoleId};
    use crate::domain::process::{
        ApprovalProcess, ApprovalResponsibility, ApprovalStep, PrincipalSelector, ProcessStatus,
        StepId,
    };

    fn process() -> ApprovalProcess {
        ApprovalProcess::draft(OrganizationId::new("org-1"), "Supplier onboarding", None, Utc::now())
            .expect("draft")
    }

    fn step(process: &ApprovalProcess, order: u32) -> ApprovalStep {
        ApprovalStep::new(process.id.clone(), format!("step {order}"), order, Utc::now())
            .expect("step")
    }

    fn role_responsibility(step: &ApprovalStep, role: &str) -> ApprovalResponsibility {
        ApprovalResponsibility::new(
            step.id.clone(),
            PrincipalSelector::Role(RoleId::new(role)),
            None,
            "approve",
            Utc::now(),
        )
        .expect("responsibility")
    }

    #[test]
    fn publish_requires_at_least_one_step() {
        let process = process();
        let violation = validate_for_publish(&process, &[], &[]).expect_err("empty process");
        assert!(matches!(violation, CatalogViolation::NoSteps { .. }));
    }

    #[test]
    fn publish_rejects_duplicate_step_orders() {
        let process = process();
        let first = step(&process, 1);
        let second = step(&process, 1);
        let responsibilities =
            vec![role_responsibility(&first, "r-buyer"), role_responsibility(&second, "r-legal")];

        let violation = validate_for_publish(&process, &[first, second], &responsibilities)
            .expect_err("duplicate orders");
        assert!(matches!(violation, CatalogViolation::DuplicateStepOrder { step_order: 1, .. }));
    }

    #[test]
    fn publish_accepts_gapped_but_strictly_increasing_orders() {
        let process = process();
        let first = step(&process, 10);
        let second = step(&process, 30);
        let responsibilities =
            vec![role_responsibility(&first, "r-buyer"), role_responsibility(&second, "r-legal")];

        assert_eq!(validate_for_publish(&process, &[second, first], &responsibilities), Ok(()));
    }

    #[test]
    fn publish_rejects_step_without_responsibility() {
        let process = process();
        let first = step(&process, 1);
        let second = step(&process, 2);
        let responsibilities = vec![role_responsibility(&first, "r-buyer")];

        let violation = validate_for_publish(&process, &[first, second.clone()], &responsibilities)
            .expect_err("second step is unguarded");
        assert_eq!(violation, CatalogViolation::StepWithoutResponsibility { step_id: second.id });
    }

    #[test]
    fn publish_rejects_responsibility_whose_fallback_duplicates_primary() {
        let process = process();
        let only = step(&process, 1);
        let mut responsibility = ApprovalResponsibility::new(
            only.id.clone(),
            PrincipalSelector::Employee(EmployeeId::new("e-1")),
            None,
            "approve",
            Utc::now(),
        )
        .expect("responsibility");
        responsibility.fallback = Some(PrincipalSelector::Employee(EmployeeId::new("e-1")));

        let violation = validate_for_publish(&process, &[only], &[responsibility])
            .expect_err("fallback duplicates primary");
        assert!(matches!(violation, CatalogViolation::MalformedResponsibility { .. }));
    }

    #[test]
    fn publish_rejects_already_published_process() {
        let mut process = process();
        let only = step(&process, 1);
        let responsibility = role_responsibility(&only, "r-buyer");
        process.status = ProcessStatus::Published;

        let violation =
            validate_for_publish(&process, &[only], &[responsibility]).expect_err("published");
        assert!(matches!(violation, CatalogViolation::AlreadyPublished { .. }));
    }

    #[test]
    fn step_sequence_walks_by_order_not_insertion() {
        let process = process();
        let third = step(&process, 30);
        let first = step(&process, 5);
        let second = step(&process, 12);
        let sequence = StepSequence::new(vec![third.clone(), first.clone(), second.clone()]);

        assert_eq!(sequence.first().map(|step| &step.id), Some(&first.id));
        assert_eq!(sequence.next_after(&first.id).map(|step| &step.id), Some(&second.id));
        assert_eq!(sequence.next_after(&second.id).map(|step| &step.id), Some(&third.id));
        assert_eq!(sequence.next_after(&third.id), None);
        assert_eq!(sequence.next_after(&StepId::new("unknown")), None);
    }

    #[test]
    fn derived_version_is_a_fresh_draft_with_remapped_steps() {
        let mut source = process();
        let first = step(&source, 1);
        let responsibility = role_responsibility(&first, "r-buyer");
        source.status = ProcessStatus::Published;

        let derived = derive_version(&source, &[first.clone()], &[responsibility], Utc::now());

        assert_eq!(derived.process.status, ProcessStatus::Draft);
        assert_eq!(derived.process.derived_from.as_ref(), Some(&source.id));
        assert_ne!(derived.process.id, source.id);
        assert_eq!(derived.steps.len(), 1);
        assert_ne!(derived.steps[0].id, first.id);
        assert_eq!(derived.steps[0].process_id, derived.process.id);
        assert_eq!(derived.responsibilities[0].step_id, derived.steps[0].id);
        assert_eq!(
            validate_for_publish(&derived.process, &derived.steps, &derived.responsibilities),
            Ok(())
        );
    }
}
