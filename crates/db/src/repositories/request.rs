use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use signoff_core::domain::directory::EmployeeId;
use signoff_core::domain::log::{ActingAuthority, ApprovalLog, LogId};
use signoff_core::domain::process::{ProcessId, StepId};
use signoff_core::domain::request::{
    ApprovalRequest, RequestAction, RequestId, RequestStatus, SubjectRef,
};

use super::{
    parse_optional_timestamp, parse_timestamp, parse_u32, RepositoryError, RequestRepository,
};
use crate::DbPool;

const REQUEST_COLUMNS: &str = "id, process_id, current_step_id, status, subject_kind, subject_id,
    requested_by, version, created_at, updated_at, completed_at";

pub struct SqlRequestRepository {
    pool: DbPool,
}

impl SqlRequestRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl RequestRepository for SqlRequestRepository {
    async fn insert_request(&self, request: ApprovalRequest) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO approval_request (id, process_id, current_step_id, status, subject_kind,
                                           subject_id, requested_by, version, created_at,
                                           updated_at, completed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(request.id.as_str())
        .bind(request.process_id.as_str())
        .bind(request.current_step_id.as_ref().map(|id| id.as_str()))
        .bind(request.status.as_str())
        .bind(&request.subject.kind)
        .bind(&request.subject.id)
        .bind(request.requested_by.as_str())
        .bind(i64::from(request.version))
        .bind(request.created_at.to_rfc3339())
        .bind(request.updated_at.to_rfc3339())
        .bind(request.completed_at.map(|at| at.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_request(
        &self,
        id: &RequestId,
    ) -> Result<Option<ApprovalRequest>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {REQUEST_COLUMNS} FROM approval_request WHERE id = ?"))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.map(request_from_row).transpose()
    }

    async fn list_requests(
        &self,
        status: Option<RequestStatus>,
    ) -> Result<Vec<ApprovalRequest>, RepositoryError> {
        let rows = match status {
            Some(status) => {
                sqlx::query(&format!(
                    "SELECT {REQUEST_COLUMNS} FROM approval_request
                     WHERE status = ?
                     ORDER BY created_at DESC, rowid DESC"
                ))
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {REQUEST_COLUMNS} FROM approval_request
                     ORDER BY created_at DESC, rowid DESC"
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(request_from_row).collect()
    }

    async fn list_requests_by_subject(
        &self,
        subject: &SubjectRef,
    ) -> Result<Vec<ApprovalRequest>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM approval_request
             WHERE subject_kind = ? AND subject_id = ?
             ORDER BY created_at DESC, rowid DESC"
        ))
        .bind(&subject.kind)
        .bind(&subject.id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(request_from_row).collect()
    }

    async fn commit_transition(
        &self,
        request: &ApprovalRequest,
        expected_version: u32,
        log: &ApprovalLog,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE approval_request
             SET current_step_id = ?, status = ?, version = ?, updated_at = ?, completed_at = ?
             WHERE id = ? AND version = ?",
        )
        .bind(request.current_step_id.as_ref().map(|id| id.as_str()))
        .bind(request.status.as_str())
        .bind(i64::from(request.version))
        .bind(request.updated_at.to_rfc3339())
        .bind(request.completed_at.map(|at| at.to_rfc3339()))
        .bind(request.id.as_str())
        .bind(i64::from(expected_version))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            let actual = sqlx::query("SELECT version FROM approval_request WHERE id = ?")
                .bind(request.id.as_str())
                .fetch_optional(&mut *tx)
                .await?;
            tx.rollback().await?;

            return match actual {
                Some(row) => Err(RepositoryError::VersionConflict {
                    expected: expected_version,
                    actual: parse_u32("version", row.try_get("version")?)?,
                }),
                None => Err(RepositoryError::NotFound(format!("approval request `{}`", request.id))),
            };
        }

        sqlx::query(
            "INSERT INTO approval_log (id, request_id, actor_id, action, authority, from_step_id,
                                       to_step_id, note, request_version, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(log.id.as_str())
        .bind(log.request_id.as_str())
        .bind(log.actor_id.as_str())
        .bind(log.action.as_str())
        .bind(log.authority.as_str())
        .bind(log.from_step_id.as_ref().map(|id| id.as_str()))
        .bind(log.to_step_id.as_ref().map(|id| id.as_str()))
        .bind(&log.note)
        .bind(i64::from(log.request_version))
        .bind(log.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn list_logs(&self, request_id: &RequestId) -> Result<Vec<ApprovalLog>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, request_id, actor_id, action, authority, from_step_id, to_step_id, note,
                    request_version, created_at
             FROM approval_log
             WHERE request_id = ?
             ORDER BY request_version ASC",
        )
        .bind(request_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(log_from_row).collect()
    }
}

fn request_from_row(row: SqliteRow) -> Result<ApprovalRequest, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = RequestStatus::parse(&status_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown request status `{status_raw}`"))
    })?;

    Ok(ApprovalRequest {
        id: RequestId(row.try_get("id")?),
        process_id: ProcessId(row.try_get("process_id")?),
        current_step_id: row.try_get::<Option<String>, _>("current_step_id")?.map(StepId),
        status,
        subject: SubjectRef::new(
            row.try_get::<String, _>("subject_kind")?,
            row.try_get::<String, _>("subject_id")?,
        ),
        requested_by: EmployeeId(row.try_get("requested_by")?),
        version: parse_u32("version", row.try_get("version")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
        completed_at: parse_optional_timestamp("completed_at", row.try_get("completed_at")?)?,
    })
}

fn log_from_row(row: SqliteRow) -> Result<ApprovalLog, RepositoryError> {
    let action_raw = row.try_get::<String, _>("action")?;
    let action = RequestAction::parse(&action_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown log action `{action_raw}`")))?;
    let authority_raw = row.try_get::<String, _>("authority")?;
    let authority = ActingAuthority::parse(&authority_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown acting authority `{authority_raw}`"))
    })?;

    Ok(ApprovalLog {
        id: LogId(row.try_get("id")?),
        request_id: RequestId(row.try_get("request_id")?),
        actor_id: EmployeeId(row.try_get("actor_id")?),
        action,
        authority,
        from_step_id: row.try_get::<Option<String>, _>("from_step_id")?.map(StepId),
        to_step_id: row.try_get::<Option<String>, _>("to_step_id")?.map(StepId),
        note: row.try_get("note")?,
        request_version: parse_u32("request_version", row.try_get("request_version")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}
