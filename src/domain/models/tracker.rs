//! Models shared between Orca and its single external tracker collaborator.
//!
//! Unlike a pluggable multi-adapter registry, Orca talks to exactly one
//! issue tracker through [`crate::domain::ports::tracker_client::TrackerClient`];
//! these types are the normalized shapes that cross that boundary.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A tracker issue normalized into the fields Orca's sync logic needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalIssue {
    /// The tracker's own identifier (becomes `Task::issue_id`).
    pub external_id: String,
    pub title: String,
    pub description: String,
    /// Name of the issue's current workflow state in the tracker (e.g.
    /// "Todo", "In Review", "Done", "Canceled").
    pub state_name: String,
    /// Coarse state-type classification the tracker assigns to `state_name`
    /// (e.g. "unstarted", "started", "completed", "canceled").
    pub state_type: String,
    pub priority: Option<u8>,
    pub project_id: String,
    /// `issueId` of a parent issue, if this issue is a sub-issue.
    pub parent_external_id: Option<String>,
    /// Other issue ids that block this one from being ready.
    pub blocking_external_ids: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

/// Inbound webhook payload. Only `Issue` events are acted on; other `type`
/// values are logged and skipped at the boundary per the dynamic-typing
/// design note.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub action: WebhookAction,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookAction {
    Create,
    Update,
    Remove,
}

impl WebhookEvent {
    /// Whether this event is an `Issue` event Orca should act on.
    pub fn is_issue_event(&self) -> bool {
        self.entity_type.eq_ignore_ascii_case("issue")
    }
}

/// A write-back directive sent to the tracker via
/// [`crate::domain::ports::tracker_client::TrackerClient::execute`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum EgressAction {
    UpdateState {
        external_id: String,
        new_state_name: String,
    },
    PostComment {
        external_id: String,
        body: String,
    },
    ClosePullRequests {
        /// Only PRs whose branch name starts with this prefix are closed
        /// (`orca/<issueId>-`), so cancelling one issue never touches
        /// another issue's branches.
        branch_prefix: String,
    },
}

/// Result of executing an [`EgressAction`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EgressResult {
    pub success: bool,
    pub detail: Option<String>,
}

impl EgressResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            detail: None,
        }
    }

    pub fn fail(detail: impl Into<String>) -> Self {
        Self {
            success: false,
            detail: Some(detail.into()),
        }
    }
}

/// A recorded suppression entry: an inbound webhook matching
/// `(issue_id, target_state_name)` within the TTL is a change Orca itself
/// caused via `writeBack`, and must not be reprocessed.
#[derive(Debug, Clone)]
pub struct ExpectedChange {
    pub issue_id: String,
    pub target_state_name: String,
    pub expires_at: DateTime<Utc>,
}

impl ExpectedChange {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn matches(&self, issue_id: &str, target_state_name: &str) -> bool {
        self.issue_id == issue_id && self.target_state_name == target_state_name
    }
}

/// Catalog of a tracker project's workflow states, used by `mapStateToPhase`.
#[derive(Debug, Clone, Default)]
pub struct WorkflowStateCatalog {
    /// state name -> state type
    pub state_types: HashMap<String, String>,
}

impl WorkflowStateCatalog {
    pub fn state_type_of(&self, state_name: &str) -> Option<&str> {
        self.state_types.get(state_name).map(String::as_str)
    }
}
