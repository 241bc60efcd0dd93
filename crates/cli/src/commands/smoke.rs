use std::time::Instant;

use chrono::Utc;
use serde::Serialize;

use crate::commands::CommandResult;
use signoff_core::config::{AppConfig, LoadOptions};
use signoff_core::domain::directory::{EmployeeId, OrganizationId, RoleId};
use signoff_core::domain::process::PrincipalSelector;
use signoff_core::domain::request::{RequestStatus, SubjectRef};
use signoff_db::repositories::SqlDirectory;
use signoff_db::{connect_from_config, migrations, DbPool};
use signoff_engine::{sql_engine, Decision, NewResponsibility};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum SmokeStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct SmokeCheck {
    name: &'static str,
    status: SmokeStatus,
    elapsed_ms: u64,
    message: String,
}

#[derive(Debug, Serialize)]
struct SmokeReport {
    command: &'static str,
    status: SmokeStatus,
    summary: String,
    total_elapsed_ms: u64,
    checks: Vec<SmokeCheck>,
}

pub fn run() -> CommandResult {
    let started = Instant::now();
    let mut checks = Vec::new();

    let config = match timed_check(|| AppConfig::load(LoadOptions::default())) {
        Ok((elapsed_ms, config)) => {
            checks.push(SmokeCheck {
                name: "config_validation",
                status: SmokeStatus::Pass,
                elapsed_ms,
                message: "configuration loaded and validated".to_string(),
            });
            config
        }
        Err((elapsed_ms, error)) => {
            checks.push(SmokeCheck {
                name: "config_validation",
                status: SmokeStatus::Fail,
                elapsed_ms,
                message: error.to_string(),
            });
            checks.push(skipped("db_connectivity"));
            checks.push(skipped("migration_visibility"));
            checks.push(skipped("approval_scenario"));
            return finalize_report(checks, started.elapsed().as_millis() as u64);
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            checks.push(SmokeCheck {
                name: "db_connectivity",
                status: SmokeStatus::Fail,
                elapsed_ms: 0,
                message: format!("failed to initialize async runtime: {error}"),
            });
            checks.push(skipped("migration_visibility"));
            checks.push(skipped("approval_scenario"));
            return finalize_report(checks, started.elapsed().as_millis() as u64);
        }
    };

    let db_started = Instant::now();
    let pool = match runtime.block_on(connect_from_config(&config.database)) {
        Ok(pool) => {
            checks.push(SmokeCheck {
                name: "db_connectivity",
                status: SmokeStatus::Pass,
                elapsed_ms: db_started.elapsed().as_millis() as u64,
                message: format!("connected using `{}`", config.database.url),
            });
            pool
        }
        Err(error) => {
            checks.push(SmokeCheck {
                name: "db_connectivity",
                status: SmokeStatus::Fail,
                elapsed_ms: db_started.elapsed().as_millis() as u64,
                message: format!("failed to connect: {error}"),
            });
            checks.push(skipped("migration_visibility"));
            checks.push(skipped("approval_scenario"));
            return finalize_report(checks, started.elapsed().as_millis() as u64);
        }
    };

    let migration_started = Instant::now();
    match runtime.block_on(migrations::run_pending(&pool)) {
        Ok(()) => checks.push(SmokeCheck {
            name: "migration_visibility",
            status: SmokeStatus::Pass,
            elapsed_ms: migration_started.elapsed().as_millis() as u64,
            message: "migrations are visible and executable".to_string(),
        }),
        Err(error) => {
            checks.push(SmokeCheck {
                name: "migration_visibility",
                status: SmokeStatus::Fail,
                elapsed_ms: migration_started.elapsed().as_millis() as u64,
                message: format!("migration execution failed: {error}"),
            });
            checks.push(skipped("approval_scenario"));
            runtime.block_on(pool.close());
            return finalize_report(checks, started.elapsed().as_millis() as u64);
        }
    }

    let scenario_started = Instant::now();
    let scenario = runtime.block_on(approval_scenario(&pool, &config.engine.administrators));
    runtime.block_on(pool.close());
    checks.push(SmokeCheck {
        name: "approval_scenario",
        status: if scenario.is_ok() { SmokeStatus::Pass } else { SmokeStatus::Fail },
        elapsed_ms: scenario_started.elapsed().as_millis() as u64,
        message: scenario.unwrap_or_else(|error| format!("approval scenario failed: {error}")),
    });

    finalize_report(checks, started.elapsed().as_millis() as u64)
}

/// Two steps: a role holder approves the first; the second names an inactive
/// employee so it resolves through its fallback role. The process is deleted
/// afterwards so repeated runs do not clutter the catalog.
async fn approval_scenario(pool: &DbPool, administrators: &[String]) -> Result<String, String> {
    let directory = SqlDirectory::new(pool.clone());
    let engine = sql_engine(pool.clone(), administrators);

    let organization = OrganizationId::new(format!("smoke-{}", OrganizationId::generate()));
    let role = RoleId::generate();
    let buyer = EmployeeId::generate();
    let controller = EmployeeId::generate();
    let requester = EmployeeId::generate();

    let now = Utc::now();
    for (employee, name, active) in [
        (&buyer, "smoke buyer", true),
        (&controller, "smoke controller", false),
        (&requester, "smoke requester", true),
    ] {
        directory.upsert_employee(employee, name, active, now).await.map_err(describe)?;
    }
    directory.grant_role(&buyer, &role, &organization).await.map_err(describe)?;

    let process = engine
        .define_process(organization, "Smoke supplier onboarding", None)
        .await
        .map_err(describe)?;
    let first = engine.add_step(&process.id, "Buyer review", 1).await.map_err(describe)?;
    engine
        .add_responsibility(
            &first.id,
            NewResponsibility::new(PrincipalSelector::Role(role.clone()), "approve"),
        )
        .await
        .map_err(describe)?;
    let second = engine.add_step(&process.id, "Controller sign-off", 2).await.map_err(describe)?;
    engine
        .add_responsibility(
            &second.id,
            NewResponsibility::new(PrincipalSelector::Employee(controller), "approve")
                .with_fallback(PrincipalSelector::Role(role)),
        )
        .await
        .map_err(describe)?;
    engine.publish_process(&process.id).await.map_err(describe)?;

    let mut request = engine
        .create_request(&process.id, SubjectRef::new("smoke", process.id.as_str()), requester)
        .await
        .map_err(describe)?;
    while request.status == RequestStatus::Pending {
        request = engine
            .approve(Decision::new(request.id.clone(), buyer.clone()).at_version(request.version))
            .await
            .map_err(describe)?;
    }

    let logs = engine.list_logs(&request.id).await.map_err(describe)?;
    engine.delete_process(&process.id).await.map_err(describe)?;

    if request.status != RequestStatus::Approved || logs.len() != 2 {
        return Err(format!(
            "request `{}` ended {} with {} log entries; expected APPROVED with 2",
            request.id,
            request.status,
            logs.len()
        ));
    }

    Ok(format!("request `{}` approved through {} steps", request.id, logs.len()))
}

fn describe(error: impl std::fmt::Display) -> String {
    error.to_string()
}

fn timed_check<T, E>(check: impl FnOnce() -> Result<T, E>) -> Result<(u64, T), (u64, E)> {
    let started = Instant::now();
    match check() {
        Ok(value) => Ok((started.elapsed().as_millis() as u64, value)),
        Err(error) => Err((started.elapsed().as_millis() as u64, error)),
    }
}

fn skipped(name: &'static str) -> SmokeCheck {
    SmokeCheck {
        name,
        status: SmokeStatus::Skipped,
        elapsed_ms: 0,
        message: "skipped due previous failure".to_string(),
    }
}

fn finalize_report(checks: Vec<SmokeCheck>, total_elapsed_ms: u64) -> CommandResult {
    let passed = checks.iter().filter(|check| check.status == SmokeStatus::Pass).count();
    let total = checks.len();
    let failed = checks.iter().any(|check| check.status == SmokeStatus::Fail);

    let report = SmokeReport {
        command: "smoke",
        status: if failed { SmokeStatus::Fail } else { SmokeStatus::Pass },
        summary: format!("smoke: {passed}/{total} checks passed in {total_elapsed_ms}ms"),
        total_elapsed_ms,
        checks,
    };

    let human = report.summary.clone();
    let machine = serde_json::to_string(&report).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"smoke\",\"status\":\"fail\",\"summary\":\"serialization failed\",\"error\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    });

    CommandResult { exit_code: if failed { 6 } else { 0 }, output: format!("{human}\n{machine}") }
}
