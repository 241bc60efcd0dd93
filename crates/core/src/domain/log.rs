use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::directory::EmployeeId;
use crate::domain::identifier;
use crate::domain::process::StepId;
use crate::domain::request::{RequestAction, RequestId};

identifier!(LogId);

/// Why the actor was allowed to perform the logged action.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActingAuthority {
    Primary,
    Fallback,
    Requester,
    Administrator,
}

impl ActingAuthority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Fallback => "fallback",
            Self::Requester => "requester",
            Self::Administrator => "administrator",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "primary" => Some(Self::Primary),
            "fallback" => Some(Self::Fallback),
            "requester" => Some(Self::Requester),
            "administrator" => Some(Self::Administrator),
            _ => None,
        }
    }
}

/// Immutable record of one committed transition.
///
/// `from_step_id` is the step the action was taken on; `to_step_id` is where the
/// request pointed afterwards (`None` once terminal). `actor_id` is the resolved
/// employee, never a selector, so history stays meaningful after org changes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalLog {
    pub id: LogId,
    pub request_id: RequestId,
    pub actor_id: EmployeeId,
    pub action: RequestAction,
    pub authority: ActingAuthority,
    pub from_step_id: Option<StepId>,
    pub to_step_id: Option<StepId>,
    pub note: Option<String>,
    pub request_version: u32,
    pub created_at: DateTime<Utc>,
}
