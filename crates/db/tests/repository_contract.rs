use chrono::{DateTime, Duration, Utc};

use signoff_core::domain::directory::{EmployeeId, OrganizationId, RoleId};
use signoff_core::domain::log::{ActingAuthority, ApprovalLog, LogId};
use signoff_core::domain::process::{
    ApprovalProcess, ApprovalResponsibility, ApprovalStep, PrincipalSelector, ProcessStatus,
};
use signoff_core::domain::request::{
    ApprovalRequest, RequestAction, RequestId, RequestStatus, SubjectRef,
};
use signoff_db::repositories::{
    InMemoryProcessRepository, InMemoryRequestRepository, ProcessRepository, RepositoryError,
    RequestRepository, SqlProcessRepository, SqlRequestRepository,
};
use signoff_db::{connect_with_settings, migrations};

type ContractResult<T = ()> = Result<T, String>;

macro_rules! require {
    ($cond:expr) => {
        if !$cond {
            return Err(format!("assertion failed: `{}`", stringify!($cond)));
        }
    };
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            return Err(format!($($arg)*));
        }
    };
}

macro_rules! require_eq {
    ($left:expr, $right:expr) => {
        match (&$left, &$right) {
            (left, right) => {
                if left != right {
                    return Err(format!(
                        "assertion failed: `left == right` (`{:?}` != `{:?}`)",
                        left, right
                    ));
                }
            }
        }
    };
}

fn storage(error: RepositoryError) -> String {
    format!("repository call failed: {error}")
}

fn base_time() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-04-01T08:00:00Z")
        .map(|time| time.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn responsibility_for(step: &ApprovalStep, order: u32) -> ContractResult<ApprovalResponsibility> {
    Ok(ApprovalResponsibility::new(
        step.id.clone(),
        PrincipalSelector::Role(RoleId::new("r-buyer")),
        Some(PrincipalSelector::Employee(EmployeeId::new("e-cfo"))),
        "approve",
        base_time(),
    )
    .map_err(|error| error.to_string())?
    .with_extra_data(serde_json::json!({ "threshold": order })))
}

/// A published process with steps stored out of order and a responsibility per step.
async fn seed_definition(
    processes: &dyn ProcessRepository,
) -> ContractResult<(ApprovalProcess, Vec<ApprovalStep>)> {
    let now = base_time();
    let mut process =
        ApprovalProcess::draft(OrganizationId::new("org-1"), "Supplier onboarding", None, now)
            .map_err(|error| error.to_string())?;
    process.status = ProcessStatus::Published;
    process.published_at = Some(now);

    let mut steps = Vec::new();
    let mut responsibilities = Vec::new();
    for order in [20, 10] {
        let step = ApprovalStep::new(process.id.clone(), format!("step {order}"), order, now)
            .map_err(|error| error.to_string())?;
        responsibilities.push(responsibility_for(&step, order)?);
        steps.push(step);
    }
    processes
        .save_definition(process.clone(), steps.clone(), responsibilities)
        .await
        .map_err(storage)?;

    steps.sort_by_key(|step| step.step_order);
    Ok((process, steps))
}

async fn process_contract(processes: &dyn ProcessRepository) -> ContractResult {
    let (mut process, steps) = seed_definition(processes).await?;

    let listed = processes.list_steps(&process.id).await.map_err(storage)?;
    require_eq!(listed.iter().map(|step| step.step_order).collect::<Vec<_>>(), vec![10, 20]);

    let all = processes.list_responsibilities_for_process(&process.id).await.map_err(storage)?;
    require_eq!(all.len(), 2);
    require!(
        all.iter().all(|item| item.extra_data.is_some()),
        "extra data should survive storage: {all:?}"
    );

    let late = ApprovalStep::new(process.id.clone(), "late", 30, base_time())
        .map_err(|error| error.to_string())?;
    match processes.save_step(late).await {
        Err(RepositoryError::DefinitionFrozen(id)) if id == process.id.as_str() => {}
        other => return Err(format!("published definitions must refuse new steps, got {other:?}")),
    }
    match processes.delete_step(&steps[0].id).await {
        Err(RepositoryError::DefinitionFrozen(_)) => {}
        other => return Err(format!("published definitions must keep their steps, got {other:?}")),
    }
    match processes.delete_responsibility(&all[0].id).await {
        Err(RepositoryError::DefinitionFrozen(_)) => {}
        other => return Err(format!("published responsibilities must stay, got {other:?}")),
    }
    require_eq!(processes.list_steps(&process.id).await.map_err(storage)?.len(), 2);
    require_eq!(
        processes.find_process(&process.id).await.map_err(storage)?.map(|stored| stored.version),
        Some(1)
    );

    let mut stale = process.clone();
    stale.status = ProcessStatus::Draft;
    stale.version = 2;
    process.deleted_at = Some(base_time() + Duration::minutes(5));
    process.active = false;
    process.version = 2;
    processes.update_process(&process, 1).await.map_err(storage)?;
    match processes.update_process(&stale, 1).await {
        Err(RepositoryError::VersionConflict { expected: 1, actual: 2 }) => {}
        other => return Err(format!("stale process write should conflict, got {other:?}")),
    }

    require!(processes.list_processes(None).await.map_err(storage)?.is_empty());
    require_eq!(processes.find_process(&process.id).await.map_err(storage)?, Some(process));
    Ok(())
}

async fn draft_contract(processes: &dyn ProcessRepository) -> ContractResult {
    let now = base_time();
    let draft = ApprovalProcess::draft(OrganizationId::new("org-1"), "Draft", None, now)
        .map_err(|error| error.to_string())?;
    processes.insert_process(draft.clone()).await.map_err(storage)?;

    let first = ApprovalStep::new(draft.id.clone(), "first", 1, now).map_err(|e| e.to_string())?;
    let clash = ApprovalStep::new(draft.id.clone(), "clash", 1, now).map_err(|e| e.to_string())?;
    processes.save_step(first.clone()).await.map_err(storage)?;
    match processes.save_step(clash).await {
        Err(RepositoryError::DuplicateStepOrder { step_order: 1, .. }) => {}
        other => return Err(format!("step orders must be unique per process, got {other:?}")),
    }
    let renamed = ApprovalStep { name: "renamed".to_string(), ..first.clone() };
    processes.save_step(renamed).await.map_err(storage)?;

    let responsibility = responsibility_for(&first, 1)?;
    processes.save_responsibility(responsibility.clone()).await.map_err(storage)?;
    require!(processes.delete_responsibility(&responsibility.id).await.map_err(storage)?);
    require!(!processes.delete_responsibility(&responsibility.id).await.map_err(storage)?);
    require!(processes.delete_step(&first.id).await.map_err(storage)?);
    require!(!processes.delete_step(&first.id).await.map_err(storage)?);

    let stored = processes.find_process(&draft.id).await.map_err(storage)?;
    require_eq!(stored.map(|process| process.version), Some(6));
    Ok(())
}

async fn request_contract(
    processes: &dyn ProcessRepository,
    requests: &dyn RequestRepository,
) -> ContractResult {
    let (process, steps) = seed_definition(processes).await?;
    let now = base_time();
    let request = ApprovalRequest {
        id: RequestId::generate(),
        process_id: process.id.clone(),
        current_step_id: Some(steps[0].id.clone()),
        status: RequestStatus::Pending,
        subject: SubjectRef::supplier("sup-1"),
        requested_by: EmployeeId::new("e-req"),
        version: 1,
        created_at: now,
        updated_at: now,
        completed_at: None,
    };
    requests.insert_request(request.clone()).await.map_err(storage)?;

    let mut advanced = request.clone();
    advanced.current_step_id = Some(steps[1].id.clone());
    advanced.version = 2;
    advanced.updated_at = now + Duration::minutes(1);
    let log = ApprovalLog {
        id: LogId::generate(),
        request_id: request.id.clone(),
        actor_id: EmployeeId::new("e-buyer"),
        action: RequestAction::Approve,
        authority: ActingAuthority::Primary,
        from_step_id: request.current_step_id.clone(),
        to_step_id: advanced.current_step_id.clone(),
        note: None,
        request_version: 2,
        created_at: advanced.updated_at,
    };
    requests.commit_transition(&advanced, 1, &log).await.map_err(storage)?;

    let mut stale = request.clone();
    stale.status = RequestStatus::Rejected;
    stale.current_step_id = None;
    stale.version = 2;
    let stale_log = ApprovalLog {
        id: LogId::generate(),
        action: RequestAction::Reject,
        to_step_id: None,
        ..log.clone()
    };
    match requests.commit_transition(&stale, 1, &stale_log).await {
        Err(RepositoryError::VersionConflict { expected: 1, actual: 2 }) => {}
        other => return Err(format!("stale commit should conflict, got {other:?}")),
    }

    let stored = requests.find_request(&request.id).await.map_err(storage)?;
    require_eq!(stored, Some(advanced));
    let logs = requests.list_logs(&request.id).await.map_err(storage)?;
    require_eq!(logs, vec![log]);
    Ok(())
}

#[tokio::test]
async fn sql_repositories_honor_the_storage_contract() -> ContractResult {
    let pool = connect_with_settings("sqlite::memory:", 1, 30).await.map_err(|e| e.to_string())?;
    migrations::run_pending(&pool).await.map_err(|e| e.to_string())?;
    let processes = SqlProcessRepository::new(pool.clone());
    let requests = SqlRequestRepository::new(pool.clone());

    process_contract(&processes).await?;
    draft_contract(&processes).await?;
    request_contract(&processes, &requests).await?;

    pool.close().await;
    Ok(())
}

#[tokio::test]
async fn in_memory_repositories_honor_the_storage_contract() -> ContractResult {
    let processes = InMemoryProcessRepository::default();
    let requests = InMemoryRequestRepository::default();

    process_contract(&processes).await?;
    draft_contract(&processes).await?;
    request_contract(&processes, &requests).await
}
