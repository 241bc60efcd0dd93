use sqlx::sqlite::SqliteRow;
use sqlx::{Executor, Row, Sqlite, SqliteConnection};

use signoff_core::domain::directory::OrganizationId;
use signoff_core::domain::process::{
    ApprovalProcess, ApprovalResponsibility, ApprovalStep, PrincipalSelector, ProcessId,
    ProcessStatus, ResponsibilityId, StepId,
};

use super::{
    parse_optional_timestamp, parse_timestamp, parse_u32, ProcessRepository, RepositoryError,
};
use crate::DbPool;

const PROCESS_COLUMNS: &str = "id, organization_id, name, description, status, active,
    derived_from, version, created_at, updated_at, published_at, deleted_at";
const STEP_COLUMNS: &str = "id, process_id, name, step_order, created_at, updated_at";
const RESPONSIBILITY_COLUMNS: &str = "r.id, r.step_id, r.primary_kind, r.primary_id,
    r.fallback_kind, r.fallback_id, r.action, r.extra_data_json, r.created_at, r.updated_at";

pub struct SqlProcessRepository {
    pool: DbPool,
}

impl SqlProcessRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ProcessRepository for SqlProcessRepository {
    async fn find_process(
        &self,
        id: &ProcessId,
    ) -> Result<Option<ApprovalProcess>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {PROCESS_COLUMNS} FROM approval_process WHERE id = ?"))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.map(process_from_row).transpose()
    }

    async fn list_processes(
        &self,
        organization_id: Option<&OrganizationId>,
    ) -> Result<Vec<ApprovalProcess>, RepositoryError> {
        let rows = match organization_id {
            Some(organization_id) => {
                sqlx::query(&format!(
                    "SELECT {PROCESS_COLUMNS} FROM approval_process
                     WHERE deleted_at IS NULL AND organization_id = ?
                     ORDER BY created_at ASC, id ASC"
                ))
                .bind(organization_id.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {PROCESS_COLUMNS} FROM approval_process
                     WHERE deleted_at IS NULL
                     ORDER BY created_at ASC, id ASC"
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(process_from_row).collect()
    }

    async fn insert_process(&self, process: ApprovalProcess) -> Result<(), RepositoryError> {
        insert_process_row(&self.pool, &process).await
    }

    async fn update_process(
        &self,
        process: &ApprovalProcess,
        expected_version: u32,
    ) -> Result<(), RepositoryError> {
        let updated = sqlx::query(
            "UPDATE approval_process
             SET name = ?, description = ?, status = ?, active = ?, version = ?,
                 updated_at = ?, published_at = ?, deleted_at = ?
             WHERE id = ? AND version = ?",
        )
        .bind(&process.name)
        .bind(&process.description)
        .bind(process.status.as_str())
        .bind(process.active)
        .bind(i64::from(process.version))
        .bind(process.updated_at.to_rfc3339())
        .bind(process.published_at.map(|at| at.to_rfc3339()))
        .bind(process.deleted_at.map(|at| at.to_rfc3339()))
        .bind(process.id.as_str())
        .bind(i64::from(expected_version))
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            let actual = sqlx::query("SELECT version FROM approval_process WHERE id = ?")
                .bind(process.id.as_str())
                .fetch_optional(&self.pool)
                .await?;

            return match actual {
                Some(row) => Err(RepositoryError::VersionConflict {
                    expected: expected_version,
                    actual: parse_u32("version", row.try_get("version")?)?,
                }),
                None => Err(RepositoryError::NotFound(format!("approval process `{}`", process.id))),
            };
        }

        Ok(())
    }

    async fn find_step(&self, id: &StepId) -> Result<Option<ApprovalStep>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {STEP_COLUMNS} FROM approval_step WHERE id = ?"))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.map(step_from_row).transpose()
    }

    async fn list_steps(
        &self,
        process_id: &ProcessId,
    ) -> Result<Vec<ApprovalStep>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM approval_step
             WHERE process_id = ?
             ORDER BY step_order ASC, id ASC"
        ))
        .bind(process_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(step_from_row).collect()
    }

    async fn save_step(&self, step: ApprovalStep) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;
        if !claim_draft(&mut tx, DefinitionOwner::Process(step.process_id.as_str())).await? {
            return Err(RepositoryError::NotFound(format!("approval process `{}`", step.process_id)));
        }
        upsert_step(&mut *tx, &step).await?;
        tx.commit().await?;

        Ok(())
    }

    async fn delete_step(&self, id: &StepId) -> Result<bool, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        if !claim_draft(&mut tx, DefinitionOwner::Step(id.as_str())).await? {
            return Ok(false);
        }
        sqlx::query("DELETE FROM approval_responsibility WHERE step_id = ?")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM approval_step WHERE id = ?")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;

        Ok(deleted > 0)
    }

    async fn find_responsibility(
        &self,
        id: &ResponsibilityId,
    ) -> Result<Option<ApprovalResponsibility>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {RESPONSIBILITY_COLUMNS} FROM approval_responsibility r WHERE r.id = ?"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(responsibility_from_row).transpose()
    }

    async fn list_responsibilities_for_step(
        &self,
        step_id: &StepId,
    ) -> Result<Vec<ApprovalResponsibility>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {RESPONSIBILITY_COLUMNS} FROM approval_responsibility r
             WHERE r.step_id = ?
             ORDER BY r.created_at ASC, r.id ASC"
        ))
        .bind(step_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(responsibility_from_row).collect()
    }

    async fn list_responsibilities_for_process(
        &self,
        process_id: &ProcessId,
    ) -> Result<Vec<ApprovalResponsibility>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {RESPONSIBILITY_COLUMNS} FROM approval_responsibility r
             JOIN approval_step s ON s.id = r.step_id
             WHERE s.process_id = ?
             ORDER BY s.step_order ASC, r.created_at ASC, r.id ASC"
        ))
        .bind(process_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(responsibility_from_row).collect()
    }

    async fn save_responsibility(
        &self,
        responsibility: ApprovalResponsibility,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;
        if !claim_draft(&mut tx, DefinitionOwner::Step(responsibility.step_id.as_str())).await? {
            return Err(RepositoryError::NotFound(format!(
                "approval step `{}`",
                responsibility.step_id
            )));
        }
        upsert_responsibility(&mut *tx, &responsibility).await?;
        tx.commit().await?;

        Ok(())
    }

    async fn delete_responsibility(
        &self,
        id: &ResponsibilityId,
    ) -> Result<bool, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        if !claim_draft(&mut tx, DefinitionOwner::Responsibility(id.as_str())).await? {
            return Ok(false);
        }
        let deleted = sqlx::query("DELETE FROM approval_responsibility WHERE id = ?")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;

        Ok(deleted > 0)
    }

    async fn save_definition(
        &self,
        process: ApprovalProcess,
        steps: Vec<ApprovalStep>,
        responsibilities: Vec<ApprovalResponsibility>,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;
        insert_process_row(&mut *tx, &process).await?;
        for step in &steps {
            upsert_step(&mut *tx, step).await?;
        }
        for responsibility in &responsibilities {
            upsert_responsibility(&mut *tx, responsibility).await?;
        }
        tx.commit().await?;

        Ok(())
    }
}

/// The row a definition write hangs off, used to find the owning process.
#[derive(Clone, Copy)]
enum DefinitionOwner<'a> {
    Process(&'a str),
    Step(&'a str),
    Responsibility(&'a str),
}

impl<'a> DefinitionOwner<'a> {
    fn process_lookup(self) -> (&'static str, &'a str) {
        match self {
            Self::Process(id) => ("SELECT id FROM approval_process WHERE id = ?", id),
            Self::Step(id) => ("SELECT process_id FROM approval_step WHERE id = ?", id),
            Self::Responsibility(id) => (
                "SELECT s.process_id FROM approval_step s
                 JOIN approval_responsibility r ON r.step_id = s.id
                 WHERE r.id = ?",
                id,
            ),
        }
    }
}

/// Bumps the version of the draft that owns `owner`. The bump is the first
/// write of the transaction, so it takes the database write lock before any
/// definition row changes. Returns `Ok(false)` when `owner` does not exist.
async fn claim_draft(
    conn: &mut SqliteConnection,
    owner: DefinitionOwner<'_>,
) -> Result<bool, RepositoryError> {
    let (lookup, id) = owner.process_lookup();
    let claimed = sqlx::query(&format!(
        "UPDATE approval_process SET version = version + 1
         WHERE status = 'draft' AND deleted_at IS NULL AND id = ({lookup})"
    ))
    .bind(id)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    if claimed > 0 {
        return Ok(true);
    }

    let process_id: Option<String> =
        sqlx::query_scalar(lookup).bind(id).fetch_optional(&mut *conn).await?;
    match process_id {
        Some(process_id) => Err(RepositoryError::DefinitionFrozen(process_id)),
        None => Ok(false),
    }
}

async fn insert_process_row<'e, E>(
    executor: E,
    process: &ApprovalProcess,
) -> Result<(), RepositoryError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO approval_process (id, organization_id, name, description, status, active,
                                       derived_from, version, created_at, updated_at, published_at,
                                       deleted_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(process.id.as_str())
    .bind(process.organization_id.as_str())
    .bind(&process.name)
    .bind(&process.description)
    .bind(process.status.as_str())
    .bind(process.active)
    .bind(process.derived_from.as_ref().map(|id| id.as_str()))
    .bind(i64::from(process.version))
    .bind(process.created_at.to_rfc3339())
    .bind(process.updated_at.to_rfc3339())
    .bind(process.published_at.map(|at| at.to_rfc3339()))
    .bind(process.deleted_at.map(|at| at.to_rfc3339()))
    .execute(executor)
    .await?;

    Ok(())
}

async fn upsert_step<'e, E>(executor: E, step: &ApprovalStep) -> Result<(), RepositoryError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO approval_step (id, process_id, name, step_order, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
             name = excluded.name,
             step_order = excluded.step_order,
             updated_at = excluded.updated_at",
    )
    .bind(step.id.as_str())
    .bind(step.process_id.as_str())
    .bind(&step.name)
    .bind(i64::from(step.step_order))
    .bind(step.created_at.to_rfc3339())
    .bind(step.updated_at.to_rfc3339())
    .execute(executor)
    .await
    .map_err(|error| match error {
        sqlx::Error::Database(ref database) if database.is_unique_violation() => {
            RepositoryError::DuplicateStepOrder {
                process_id: step.process_id.to_string(),
                step_order: step.step_order,
            }
        }
        other => RepositoryError::from(other),
    })?;

    Ok(())
}

async fn upsert_responsibility<'e, E>(
    executor: E,
    responsibility: &ApprovalResponsibility,
) -> Result<(), RepositoryError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let extra_data_json = responsibility
        .extra_data
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|error| RepositoryError::Decode(format!("invalid extra_data: {error}")))?;

    sqlx::query(
        "INSERT INTO approval_responsibility (id, step_id, primary_kind, primary_id, fallback_kind,
                                              fallback_id, action, extra_data_json, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
             primary_kind = excluded.primary_kind,
             primary_id = excluded.primary_id,
             fallback_kind = excluded.fallback_kind,
             fallback_id = excluded.fallback_id,
             action = excluded.action,
             extra_data_json = excluded.extra_data_json,
             updated_at = excluded.updated_at",
    )
    .bind(responsibility.id.as_str())
    .bind(responsibility.step_id.as_str())
    .bind(responsibility.primary.kind())
    .bind(responsibility.primary.id())
    .bind(responsibility.fallback.as_ref().map(|selector| selector.kind()))
    .bind(responsibility.fallback.as_ref().map(|selector| selector.id().to_string()))
    .bind(&responsibility.action)
    .bind(extra_data_json)
    .bind(responsibility.created_at.to_rfc3339())
    .bind(responsibility.updated_at.to_rfc3339())
    .execute(executor)
    .await?;

    Ok(())
}

fn process_from_row(row: SqliteRow) -> Result<ApprovalProcess, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = ProcessStatus::parse(&status_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown process status `{status_raw}`"))
    })?;

    Ok(ApprovalProcess {
        id: ProcessId(row.try_get("id")?),
        organization_id: OrganizationId(row.try_get("organization_id")?),
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        status,
        active: row.try_get("active")?,
        derived_from: row.try_get::<Option<String>, _>("derived_from")?.map(ProcessId),
        version: parse_u32("version", row.try_get("version")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
        published_at: parse_optional_timestamp("published_at", row.try_get("published_at")?)?,
        deleted_at: parse_optional_timestamp("deleted_at", row.try_get("deleted_at")?)?,
    })
}

fn step_from_row(row: SqliteRow) -> Result<ApprovalStep, RepositoryError> {
    Ok(ApprovalStep {
        id: StepId(row.try_get("id")?),
        process_id: ProcessId(row.try_get("process_id")?),
        name: row.try_get("name")?,
        step_order: parse_u32("step_order", row.try_get("step_order")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

fn responsibility_from_row(row: SqliteRow) -> Result<ApprovalResponsibility, RepositoryError> {
    let primary_kind = row.try_get::<String, _>("primary_kind")?;
    let primary_id = row.try_get::<String, _>("primary_id")?;
    let primary = PrincipalSelector::parse(&primary_kind, &primary_id).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown primary selector `{primary_kind}:{primary_id}`"))
    })?;

    let fallback_kind = row.try_get::<Option<String>, _>("fallback_kind")?;
    let fallback_id = row.try_get::<Option<String>, _>("fallback_id")?;
    let fallback = match (fallback_kind, fallback_id) {
        (Some(kind), Some(id)) => Some(PrincipalSelector::parse(&kind, &id).ok_or_else(|| {
            RepositoryError::Decode(format!("unknown fallback selector `{kind}:{id}`"))
        })?),
        (None, None) => None,
        _ => {
            return Err(RepositoryError::Decode(
                "fallback selector must store both kind and id".to_string(),
            ))
        }
    };

    let extra_data = row
        .try_get::<Option<String>, _>("extra_data_json")?
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|error| RepositoryError::Decode(format!("invalid extra_data_json: {error}")))?;

    Ok(ApprovalResponsibility {
        id: ResponsibilityId(row.try_get("id")?),
        step_id: StepId(row.try_get("step_id")?),
        primary,
        fallback,
        action: row.try_get("action")?,
        extra_data,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}
