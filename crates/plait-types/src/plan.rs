use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A unit of work tracked across one or more branches. Append-only except
/// for explicit rewind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub org_id: String,
    pub owner_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Plan {
    pub fn new(org_id: impl Into<String>, owner_id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            org_id: org_id.into(),
            owner_id: owner_id.into(),
            name: name.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BranchStatus {
    Draft,
    Active,
    Finished,
    Stopped,
}

/// A named, forkable line of plan history backed by an isolated
/// version-controlled working copy. The default branch is `main`, created
/// implicitly with the plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    pub id: String,
    pub plan_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_branch_id: Option<String>,
    pub name: String,
    pub status: BranchStatus,
    #[serde(default)]
    pub context_tokens: u64,
    #[serde(default)]
    pub convo_tokens: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Branch {
    pub fn new(plan_id: impl Into<String>, name: impl Into<String>, parent: Option<&Branch>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            plan_id: plan_id.into(),
            parent_branch_id: parent.map(|p| p.id.clone()),
            name: name.into(),
            status: BranchStatus::Draft,
            context_tokens: parent.map(|p| p.context_tokens).unwrap_or(0),
            convo_tokens: parent.map(|p| p.convo_tokens).unwrap_or(0),
            created_at: now,
            updated_at: now,
        }
    }
}

pub const DEFAULT_BRANCH: &str = "main";

/// Actual token usage reported by a provider, reconciled against the
/// estimate that drove role selection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
}

/// Rough token estimate used for role selection before a provider reports
/// real usage. ~4 chars per token is close enough for budget checks since
/// selection applies its own padding percentage on top.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64).div_ceil(4)
}
