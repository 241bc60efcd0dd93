use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use signoff_core::domain::directory::{EmployeeId, OrgUnitId, OrganizationId, RoleId};
use signoff_core::resolver::{Directory, DirectoryError};

use super::RepositoryError;
use crate::DbPool;

/// `Directory` over the master-data tables. Every call reads current rows.
pub struct SqlDirectory {
    pool: DbPool,
}

impl SqlDirectory {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Master-data maintenance for operators and fixtures. The engine itself
    /// only reads through `Directory`.
    pub async fn upsert_employee(
        &self,
        employee_id: &EmployeeId,
        display_name: &str,
        active: bool,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO employee (id, display_name, active, created_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 display_name = excluded.display_name,
                 active = excluded.active",
        )
        .bind(employee_id.as_str())
        .bind(display_name)
        .bind(active)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn grant_role(
        &self,
        employee_id: &EmployeeId,
        role_id: &RoleId,
        scope: &OrganizationId,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT OR IGNORE INTO employee_role (employee_id, role_id, organization_id)
             VALUES (?, ?, ?)",
        )
        .bind(employee_id.as_str())
        .bind(role_id.as_str())
        .bind(scope.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn revoke_role(
        &self,
        employee_id: &EmployeeId,
        role_id: &RoleId,
        scope: &OrganizationId,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "DELETE FROM employee_role
             WHERE employee_id = ? AND role_id = ? AND organization_id = ?",
        )
        .bind(employee_id.as_str())
        .bind(role_id.as_str())
        .bind(scope.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn add_unit_member(
        &self,
        employee_id: &EmployeeId,
        org_unit_id: &OrgUnitId,
    ) -> Result<(), RepositoryError> {
        sqlx::query("INSERT OR IGNORE INTO org_unit_member (employee_id, org_unit_id) VALUES (?, ?)")
            .bind(employee_id.as_str())
            .bind(org_unit_id.as_str())
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl Directory for SqlDirectory {
    async fn members_with_role(
        &self,
        role_id: &RoleId,
        scope: &OrganizationId,
    ) -> Result<BTreeSet<EmployeeId>, DirectoryError> {
        let rows = sqlx::query(
            "SELECT er.employee_id
             FROM employee_role er
             JOIN employee e ON e.id = er.employee_id
             WHERE er.role_id = ? AND er.organization_id = ? AND e.active = 1",
        )
        .bind(role_id.as_str())
        .bind(scope.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(lookup_failed)?;

        employee_ids(rows)
    }

    async fn members_of_unit(
        &self,
        org_unit_id: &OrgUnitId,
    ) -> Result<BTreeSet<EmployeeId>, DirectoryError> {
        let rows = sqlx::query(
            "SELECT m.employee_id
             FROM org_unit_member m
             JOIN employee e ON e.id = m.employee_id
             WHERE m.org_unit_id = ? AND e.active = 1",
        )
        .bind(org_unit_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(lookup_failed)?;

        employee_ids(rows)
    }

    async fn employee_is_active(&self, employee_id: &EmployeeId) -> Result<bool, DirectoryError> {
        let row = sqlx::query("SELECT active FROM employee WHERE id = ?")
            .bind(employee_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(lookup_failed)?;

        match row {
            Some(row) => row.try_get::<bool, _>("active").map_err(lookup_failed),
            None => Ok(false),
        }
    }
}

fn employee_ids(rows: Vec<SqliteRow>) -> Result<BTreeSet<EmployeeId>, DirectoryError> {
    rows.into_iter()
        .map(|row| row.try_get::<String, _>("employee_id").map(EmployeeId).map_err(lookup_failed))
        .collect()
}

fn lookup_failed(error: sqlx::Error) -> DirectoryError {
    DirectoryError(error.to_string())
}
