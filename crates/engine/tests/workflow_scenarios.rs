use std::sync::Arc;

use chrono::Utc;
use signoff_core::domain::directory::{EmployeeId, OrganizationId, RoleId};
use signoff_core::domain::log::ActingAuthority;
use signoff_core::domain::process::{ApprovalProcess, PrincipalSelector, ProcessId};
use signoff_core::domain::request::{ApprovalRequest, RequestAction, RequestStatus, SubjectRef};
use signoff_core::errors::{ApplicationError, EntityKind, WorkflowError};
use signoff_core::resolver::{InMemoryDirectory, ResolutionSource};
use signoff_db::repositories::SqlDirectory;
use signoff_db::{connect_with_settings, migrations, DbPool};
use signoff_engine::{sql_engine, ApprovalEngine, Decision, NewResponsibility, ProcessUpdate};
use tempfile::TempDir;

const ORG: &str = "org-acme";
const BUYER_ROLE: &str = "r-buyer";

fn org() -> OrganizationId {
    OrganizationId::new(ORG)
}

fn employee(id: &str) -> EmployeeId {
    EmployeeId::new(id)
}

fn role(id: &str) -> PrincipalSelector {
    PrincipalSelector::Role(RoleId::new(id))
}

fn named(id: &str) -> PrincipalSelector {
    PrincipalSelector::Employee(employee(id))
}

/// Buyers `e-buyer-1` and `e-buyer-2`, an inactive controller `e-controller`,
/// a requester and an unrelated employee.
fn directory() -> InMemoryDirectory {
    let directory = InMemoryDirectory::default();
    for (id, active) in [
        ("e-buyer-1", true),
        ("e-buyer-2", true),
        ("e-controller", false),
        ("e-requester", true),
        ("e-outsider", true),
        ("e-admin", true),
    ] {
        directory.add_employee(employee(id), active);
    }
    directory.grant_role(org(), RoleId::new(BUYER_ROLE), employee("e-buyer-1"));
    directory.grant_role(org(), RoleId::new(BUYER_ROLE), employee("e-buyer-2"));
    directory
}

fn engine_over(directory: &InMemoryDirectory) -> ApprovalEngine {
    ApprovalEngine::in_memory(Arc::new(directory.clone())).with_administrators(["e-admin"])
}

/// S1 (order 1, buyers) then S2 (order 2, the controller with buyers as fallback).
async fn two_step_process(engine: &ApprovalEngine) -> ApprovalProcess {
    let process = engine
        .define_process(org(), "Supplier onboarding", Some("New supplier checks".to_string()))
        .await
        .expect("define process");
    let first = engine.add_step(&process.id, "Buyer review", 1).await.expect("first step");
    engine
        .add_responsibility(&first.id, NewResponsibility::new(role(BUYER_ROLE), "approve"))
        .await
        .expect("first responsibility");
    let second = engine.add_step(&process.id, "Controller sign-off", 2).await.expect("second step");
    engine
        .add_responsibility(
            &second.id,
            NewResponsibility::new(named("e-controller"), "approve").with_fallback(role(BUYER_ROLE)),
        )
        .await
        .expect("second responsibility");
    engine.publish_process(&process.id).await.expect("publish")
}

async fn open_request(engine: &ApprovalEngine, process_id: &ProcessId) -> ApprovalRequest {
    engine
        .create_request(process_id, SubjectRef::supplier("sup-42"), employee("e-requester"))
        .await
        .expect("create request")
}

fn workflow_error(result: Result<ApprovalRequest, ApplicationError>) -> WorkflowError {
    match result {
        Err(ApplicationError::Workflow(error)) => error,
        other => panic!("expected a workflow error, got {other:?}"),
    }
}

async fn assert_two_step_scenario(engine: &ApprovalEngine) {
    let process = two_step_process(engine).await;
    let steps = engine.list_steps(&process.id).await.expect("steps");
    let request = open_request(engine, &process.id).await;
    assert_eq!(request.status, RequestStatus::Pending);
    assert_eq!(request.current_step_id.as_ref(), Some(&steps[0].id));
    assert_eq!(request.version, 1);

    let advanced = engine
        .approve(Decision::new(request.id.clone(), employee("e-buyer-1")).at_version(1))
        .await
        .expect("buyer approves first step");
    assert_eq!(advanced.status, RequestStatus::Pending);
    assert_eq!(advanced.current_step_id.as_ref(), Some(&steps[1].id));
    assert_eq!(advanced.version, 2);

    let resolution = engine.resolve_eligible_principals(&steps[1].id).await.expect("resolve");
    assert_eq!(resolution.source, ResolutionSource::Fallback);

    let refused = workflow_error(
        engine.approve(Decision::new(request.id.clone(), employee("e-outsider"))).await,
    );
    assert!(matches!(refused, WorkflowError::Authorization { ref step_id, .. } if step_id == &steps[1].id));

    let completed = engine
        .approve(
            Decision::new(request.id.clone(), employee("e-buyer-2"))
                .at_version(2)
                .with_note("controller on leave"),
        )
        .await
        .expect("fallback buyer approves second step");
    assert_eq!(completed.status, RequestStatus::Approved);
    assert_eq!(completed.current_step_id, None);
    assert!(completed.completed_at.is_some());

    let logs = engine.list_logs(&request.id).await.expect("logs");
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0].actor_id, employee("e-buyer-1"));
    assert_eq!(logs[0].authority, ActingAuthority::Primary);
    assert_eq!(logs[0].from_step_id.as_ref(), Some(&steps[0].id));
    assert_eq!(logs[0].to_step_id.as_ref(), Some(&steps[1].id));
    assert_eq!(logs[1].actor_id, employee("e-buyer-2"));
    assert_eq!(logs[1].authority, ActingAuthority::Fallback);
    assert_eq!(logs[1].to_step_id, None);
    assert_eq!(logs[1].note.as_deref(), Some("controller on leave"));
    assert_eq!(logs.iter().map(|log| log.request_version).collect::<Vec<_>>(), vec![2, 3]);
    assert!(logs.iter().all(|log| log.action == RequestAction::Approve));
}

#[tokio::test]
async fn two_step_process_completes_through_fallback_in_memory() {
    let directory = directory();
    assert_two_step_scenario(&engine_over(&directory)).await;
}

/// Migrates the database behind `url` and seeds the same people as `directory`.
async fn seeded_sqlite(url: &str, max_connections: u32) -> DbPool {
    let pool = connect_with_settings(url, max_connections, 30).await.expect("connect");
    migrations::run_pending(&pool).await.expect("migrate");

    let seed = SqlDirectory::new(pool.clone());
    let now = Utc::now();
    for (id, active) in [
        ("e-buyer-1", true),
        ("e-buyer-2", true),
        ("e-controller", false),
        ("e-requester", true),
        ("e-outsider", true),
    ] {
        seed.upsert_employee(&employee(id), id, active, now).await.expect("employee");
    }
    for buyer in ["e-buyer-1", "e-buyer-2"] {
        seed.grant_role(&employee(buyer), &RoleId::new(BUYER_ROLE), &org()).await.expect("grant");
    }
    pool
}

#[tokio::test]
async fn two_step_process_completes_through_fallback_on_sqlite() {
    let pool = seeded_sqlite("sqlite::memory:", 1).await;

    let engine = sql_engine(pool.clone(), &[]);
    assert_two_step_scenario(&engine).await;

    pool.close().await;
}

#[tokio::test]
async fn reject_is_terminal_from_any_pending_step() {
    let directory = directory();
    let engine = engine_over(&directory);
    let process = two_step_process(&engine).await;
    let request = open_request(&engine, &process.id).await;

    engine
        .approve(Decision::new(request.id.clone(), employee("e-buyer-1")))
        .await
        .expect("first step");
    let rejected = engine
        .reject(Decision::new(request.id.clone(), employee("e-buyer-2")).with_note("missing VAT id"))
        .await
        .expect("reject on second step");
    assert_eq!(rejected.status, RequestStatus::Rejected);
    assert_eq!(rejected.current_step_id, None);

    for error in [
        workflow_error(engine.approve(Decision::new(request.id.clone(), employee("e-buyer-1"))).await),
        workflow_error(engine.reject(Decision::new(request.id.clone(), employee("e-buyer-1"))).await),
        workflow_error(engine.cancel(Decision::new(request.id.clone(), employee("e-requester"))).await),
    ] {
        assert!(
            matches!(error, WorkflowError::InvalidTransition { status: RequestStatus::Rejected, .. }),
            "unexpected error: {error:?}"
        );
    }

    let logs = engine.list_logs(&request.id).await.expect("logs");
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[1].action, RequestAction::Reject);
    assert_eq!(logs[1].note.as_deref(), Some("missing VAT id"));
}

#[tokio::test]
async fn cancel_is_limited_to_requester_or_administrator() {
    let directory = directory();
    let engine = engine_over(&directory);
    let process = two_step_process(&engine).await;

    let first = open_request(&engine, &process.id).await;
    let refused =
        workflow_error(engine.cancel(Decision::new(first.id.clone(), employee("e-buyer-1"))).await);
    assert!(matches!(refused, WorkflowError::Authorization { action: RequestAction::Cancel, .. }));

    let canceled = engine
        .cancel(Decision::new(first.id.clone(), employee("e-requester")))
        .await
        .expect("requester cancels");
    assert_eq!(canceled.status, RequestStatus::Canceled);

    let second = open_request(&engine, &process.id).await;
    engine
        .cancel(Decision::new(second.id.clone(), employee("e-admin")))
        .await
        .expect("administrator cancels");
    let logs = engine.list_logs(&second.id).await.expect("logs");
    assert_eq!(logs[0].authority, ActingAuthority::Administrator);

    let third = open_request(&engine, &process.id).await;
    for actor in ["e-buyer-1", "e-buyer-2"] {
        engine.approve(Decision::new(third.id.clone(), employee(actor))).await.expect("approve");
    }
    let late =
        workflow_error(engine.cancel(Decision::new(third.id.clone(), employee("e-requester"))).await);
    assert!(matches!(late, WorkflowError::InvalidTransition { status: RequestStatus::Approved, .. }));
}

async fn assert_single_commit(engine: Arc<ApprovalEngine>) {
    let process = two_step_process(&engine).await;
    let request = open_request(&engine, &process.id).await;

    let left = {
        let engine = Arc::clone(&engine);
        let id = request.id.clone();
        tokio::spawn(async move {
            engine.approve(Decision::new(id, employee("e-buyer-1")).at_version(1)).await
        })
    };
    let right = {
        let engine = Arc::clone(&engine);
        let id = request.id.clone();
        tokio::spawn(async move {
            engine.approve(Decision::new(id, employee("e-buyer-2")).at_version(1)).await
        })
    };
    let outcomes = [left.await.expect("join"), right.await.expect("join")];

    let committed = outcomes.iter().filter(|outcome| outcome.is_ok()).count();
    assert_eq!(committed, 1);
    assert!(outcomes.iter().any(|outcome| matches!(
        outcome,
        Err(ApplicationError::Workflow(WorkflowError::ConcurrentModification { .. }))
    )));

    let stored = engine.get_request(&request.id).await.expect("request");
    assert_eq!(stored.version, 2);
    assert_eq!(engine.list_logs(&request.id).await.expect("logs").len(), 1);
}

#[tokio::test]
async fn concurrent_approvals_commit_exactly_once() {
    let directory = directory();
    assert_single_commit(Arc::new(engine_over(&directory))).await;
}

#[tokio::test]
async fn concurrent_approvals_commit_exactly_once_on_sqlite() {
    let dir = TempDir::new().expect("temp dir");
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("signoff.db").display());
    let pool = seeded_sqlite(&url, 4).await;

    assert_single_commit(Arc::new(sql_engine(pool.clone(), &[]))).await;

    pool.close().await;
}

#[tokio::test]
async fn current_step_order_never_decreases() {
    let directory = directory();
    let engine = engine_over(&directory);
    let process = engine.define_process(org(), "Capex", None).await.expect("process");
    for order in [30, 10, 20] {
        let step = engine.add_step(&process.id, &format!("step {order}"), order).await.expect("step");
        engine
            .add_responsibility(&step.id, NewResponsibility::new(role(BUYER_ROLE), "approve"))
            .await
            .expect("responsibility");
    }
    engine.publish_process(&process.id).await.expect("publish");

    let steps = engine.list_steps(&process.id).await.expect("steps");
    assert_eq!(steps.iter().map(|step| step.step_order).collect::<Vec<_>>(), vec![10, 20, 30]);
    let order_of = |request: &ApprovalRequest| {
        request.current_step_id.as_ref().and_then(|id| {
            steps.iter().find(|step| &step.id == id).map(|step| step.step_order)
        })
    };

    let mut request = open_request(&engine, &process.id).await;
    let mut seen = vec![order_of(&request)];
    while request.status == RequestStatus::Pending {
        request = engine
            .approve(Decision::new(request.id.clone(), employee("e-buyer-1")))
            .await
            .expect("approve");
        seen.push(order_of(&request));
    }

    assert_eq!(seen, vec![Some(10), Some(20), Some(30), None]);
    assert_eq!(request.status, RequestStatus::Approved);
}

#[tokio::test]
async fn unresolvable_step_refuses_action_without_writing() {
    let directory = directory();
    let engine = engine_over(&directory);
    let process = engine.define_process(org(), "Legal", None).await.expect("process");
    let step = engine.add_step(&process.id, "Controller", 1).await.expect("step");
    engine
        .add_responsibility(&step.id, NewResponsibility::new(named("e-controller"), "approve"))
        .await
        .expect("responsibility");
    engine.publish_process(&process.id).await.expect("publish");
    let request = open_request(&engine, &process.id).await;

    let error =
        workflow_error(engine.approve(Decision::new(request.id.clone(), employee("e-controller"))).await);
    assert_eq!(
        error,
        WorkflowError::UnresolvableStep { request_id: request.id.clone(), step_id: step.id.clone() }
    );

    assert_eq!(engine.get_request(&request.id).await.expect("request"), request);
    assert!(engine.list_logs(&request.id).await.expect("logs").is_empty());

    directory.set_active(&employee("e-controller"), true);
    let approved = engine
        .approve(Decision::new(request.id.clone(), employee("e-controller")))
        .await
        .expect("controller is back");
    assert_eq!(approved.status, RequestStatus::Approved);
}

#[tokio::test]
async fn membership_is_read_live_at_action_time() {
    let directory = directory();
    let engine = engine_over(&directory);
    let process = two_step_process(&engine).await;
    let request = open_request(&engine, &process.id).await;

    directory.revoke_role(&org(), &RoleId::new(BUYER_ROLE), &employee("e-buyer-1"));
    let revoked =
        workflow_error(engine.approve(Decision::new(request.id.clone(), employee("e-buyer-1"))).await);
    assert!(matches!(revoked, WorkflowError::Authorization { .. }));

    directory.grant_role(org(), RoleId::new(BUYER_ROLE), employee("e-outsider"));
    let approved = engine
        .approve(Decision::new(request.id.clone(), employee("e-outsider")))
        .await
        .expect("newly granted buyer approves");
    assert_eq!(approved.version, 2);
}

#[tokio::test]
async fn publish_enforces_catalog_rules_and_freezes_the_definition() {
    let directory = directory();
    let engine = engine_over(&directory);
    let process = engine.define_process(org(), "Empty", None).await.expect("process");

    let empty = engine.publish_process(&process.id).await;
    assert!(matches!(empty, Err(ApplicationError::Workflow(WorkflowError::Validation(_)))));

    let step = engine.add_step(&process.id, "Buyer", 1).await.expect("step");
    let uncovered = engine.publish_process(&process.id).await;
    assert!(matches!(uncovered, Err(ApplicationError::Workflow(WorkflowError::Validation(_)))));

    let same_selector = engine
        .add_responsibility(
            &step.id,
            NewResponsibility::new(role(BUYER_ROLE), "approve").with_fallback(role(BUYER_ROLE)),
        )
        .await;
    assert!(matches!(same_selector, Err(ApplicationError::Workflow(WorkflowError::Validation(_)))));

    let draft_request = engine
        .create_request(&process.id, SubjectRef::supplier("sup-1"), employee("e-requester"))
        .await;
    assert!(matches!(draft_request, Err(ApplicationError::Workflow(WorkflowError::Validation(_)))));

    engine
        .add_responsibility(&step.id, NewResponsibility::new(role(BUYER_ROLE), "approve"))
        .await
        .expect("responsibility");
    let published = engine.publish_process(&process.id).await.expect("publish");
    assert!(published.published_at.is_some());

    for refused in [
        engine.add_step(&process.id, "Late", 2).await.err(),
        engine.remove_step(&step.id).await.err(),
        engine.publish_process(&process.id).await.err(),
    ] {
        assert!(
            matches!(refused, Some(ApplicationError::Workflow(WorkflowError::Validation(_)))),
            "published definitions must stay frozen: {refused:?}"
        );
    }
}

#[tokio::test]
async fn derived_version_is_an_editable_copy_and_leaves_running_requests_alone() {
    let directory = directory();
    let engine = engine_over(&directory);
    let process = two_step_process(&engine).await;
    let request = open_request(&engine, &process.id).await;

    let derived = engine.derive_process_version(&process.id).await.expect("derive");
    assert_eq!(derived.derived_from.as_ref(), Some(&process.id));
    assert!(!derived.is_published());

    let derived_steps = engine.list_steps(&derived.id).await.expect("derived steps");
    assert_eq!(derived_steps.len(), 2);
    for step in &derived_steps {
        assert_eq!(engine.list_responsibilities(&step.id).await.expect("responsibilities").len(), 1);
    }

    engine.add_step(&derived.id, "Legal", 3).await.expect("derived draft is editable");
    assert_eq!(engine.list_steps(&process.id).await.expect("original steps").len(), 2);

    let approved = engine
        .approve(Decision::new(request.id.clone(), employee("e-buyer-1")))
        .await
        .expect("original request keeps running");
    assert_eq!(approved.process_id, process.id);
}

#[tokio::test]
async fn soft_deleted_process_hides_from_catalog_but_running_requests_finish() {
    let directory = directory();
    let engine = engine_over(&directory);
    let process = two_step_process(&engine).await;
    let request = open_request(&engine, &process.id).await;

    engine.delete_process(&process.id).await.expect("delete");

    let missing = engine.get_process(&process.id).await;
    assert!(matches!(
        missing,
        Err(ApplicationError::Workflow(WorkflowError::NotFound { entity: EntityKind::Process, .. }))
    ));
    assert!(engine.list_processes().await.expect("list").is_empty());
    assert!(engine.list_processes_by_organization(&org()).await.expect("list").is_empty());

    let refused = engine
        .create_request(&process.id, SubjectRef::supplier("sup-7"), employee("e-requester"))
        .await;
    assert!(matches!(refused, Err(ApplicationError::Workflow(WorkflowError::Validation(_)))));

    for actor in ["e-buyer-1", "e-buyer-2"] {
        engine.approve(Decision::new(request.id.clone(), employee(actor))).await.expect("approve");
    }
    assert_eq!(
        engine.get_request(&request.id).await.expect("request").status,
        RequestStatus::Approved
    );
}

#[tokio::test]
async fn inactive_process_refuses_new_requests_until_reactivated() {
    let directory = directory();
    let engine = engine_over(&directory);
    let process = two_step_process(&engine).await;

    engine
        .update_process(&process.id, ProcessUpdate { active: Some(false), ..ProcessUpdate::default() })
        .await
        .expect("deactivate");
    let refused = engine
        .create_request(&process.id, SubjectRef::supplier("sup-1"), employee("e-requester"))
        .await;
    assert!(matches!(refused, Err(ApplicationError::Workflow(WorkflowError::Validation(_)))));

    engine
        .update_process(&process.id, ProcessUpdate { active: Some(true), ..ProcessUpdate::default() })
        .await
        .expect("reactivate");
    open_request(&engine, &process.id).await;
}

#[tokio::test]
async fn comments_are_kept_per_request_and_never_change_state() {
    let directory = directory();
    let engine = engine_over(&directory);
    let process = two_step_process(&engine).await;
    let request = open_request(&engine, &process.id).await;

    engine
        .add_comment(&request.id, employee("e-buyer-1"), "Please attach the bank letter.")
        .await
        .expect("comment");
    engine.cancel(Decision::new(request.id.clone(), employee("e-requester"))).await.expect("cancel");
    engine
        .add_comment(&request.id, employee("e-requester"), "Withdrawn, resubmitting next week.")
        .await
        .expect("comment on a closed request");

    let blank = engine.add_comment(&request.id, employee("e-buyer-1"), "   ").await;
    assert!(matches!(blank, Err(ApplicationError::Workflow(WorkflowError::Validation(_)))));

    let comments = engine.list_comments(&request.id).await.expect("comments");
    assert_eq!(comments.len(), 2);
    assert_eq!(comments[0].author_id, employee("e-buyer-1"));
    assert_eq!(comments[1].author_id, employee("e-requester"));

    let stored = engine.get_request(&request.id).await.expect("request");
    assert_eq!(stored.version, 2);
    assert_eq!(stored.status, RequestStatus::Canceled);
}

#[tokio::test]
async fn requests_are_listed_by_status_and_subject_newest_first() {
    let directory = directory();
    let engine = engine_over(&directory);
    let process = two_step_process(&engine).await;

    let older = open_request(&engine, &process.id).await;
    let newer = open_request(&engine, &process.id).await;
    let other = engine
        .create_request(&process.id, SubjectRef::supplier("sup-99"), employee("e-requester"))
        .await
        .expect("other subject");
    engine.cancel(Decision::new(other.id.clone(), employee("e-requester"))).await.expect("cancel");

    let for_subject = engine
        .list_requests_by_subject(&SubjectRef::supplier("sup-42"))
        .await
        .expect("by subject");
    assert_eq!(
        for_subject.iter().map(|request| request.id.clone()).collect::<Vec<_>>(),
        vec![newer.id.clone(), older.id.clone()]
    );

    let pending = engine.list_requests(Some(RequestStatus::Pending)).await.expect("pending");
    assert_eq!(pending.len(), 2);
    let canceled = engine.list_requests(Some(RequestStatus::Canceled)).await.expect("canceled");
    assert_eq!(canceled.iter().map(|request| &request.id).collect::<Vec<_>>(), vec![&other.id]);
    assert_eq!(engine.list_requests(None).await.expect("all").len(), 3);
}
