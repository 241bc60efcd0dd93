use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::directory::EmployeeId;
use crate::domain::identifier;
use crate::domain::request::RequestId;
use crate::errors::WorkflowError;

identifier!(CommentId);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalComment {
    pub id: CommentId,
    pub request_id: RequestId,
    pub author_id: EmployeeId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl ApprovalComment {
    pub fn new(
        request_id: RequestId,
        author_id: EmployeeId,
        content: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Self, WorkflowError> {
        let content = content.into();
        if content.trim().is_empty() {
            return Err(WorkflowError::Validation(format!(
                "comment on request `{request_id}` must not be blank"
            )));
        }

        Ok(Self { id: CommentId::generate(), request_id, author_id, content, created_at: now })
    }
}
