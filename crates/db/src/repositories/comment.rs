use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use signoff_core::domain::comment::{ApprovalComment, CommentId};
use signoff_core::domain::directory::EmployeeId;
use signoff_core::domain::request::RequestId;

use super::{parse_timestamp, CommentRepository, RepositoryError};
use crate::DbPool;

pub struct SqlCommentRepository {
    pool: DbPool,
}

impl SqlCommentRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl CommentRepository for SqlCommentRepository {
    async fn append_comment(&self, comment: ApprovalComment) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO approval_comment (id, request_id, author_id, content, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(comment.id.as_str())
        .bind(comment.request_id.as_str())
        .bind(comment.author_id.as_str())
        .bind(&comment.content)
        .bind(comment.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_comments(
        &self,
        request_id: &RequestId,
    ) -> Result<Vec<ApprovalComment>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, request_id, author_id, content, created_at
             FROM approval_comment
             WHERE request_id = ?
             ORDER BY created_at ASC, rowid ASC",
        )
        .bind(request_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(comment_from_row).collect()
    }
}

fn comment_from_row(row: SqliteRow) -> Result<ApprovalComment, RepositoryError> {
    Ok(ApprovalComment {
        id: CommentId(row.try_get("id")?),
        request_id: RequestId(row.try_get("request_id")?),
        author_id: EmployeeId(row.try_get("author_id")?),
        content: row.try_get("content")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}
