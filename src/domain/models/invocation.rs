//! Invocation domain model.
//!
//! One row per agent child-process run. Invocations are created with
//! `status = running` and receive exactly one terminal write.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::errors::{DomainError, DomainResult};

/// Which phase of the task lifecycle this invocation executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationPhase {
    Implement,
    Review,
    Fix,
}

impl InvocationPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Implement => "implement",
            Self::Review => "review",
            Self::Fix => "fix",
        }
    }

    pub fn from_str(s: &str) -> DomainResult<Self> {
        match s {
            "implement" => Ok(Self::Implement),
            "review" => Ok(Self::Review),
            "fix" => Ok(Self::Fix),
            other => Err(DomainError::SerializationError(format!(
                "unknown invocation phase: {other}"
            ))),
        }
    }
}

/// Terminal classification of an invocation's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl InvocationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }

    pub fn from_str(s: &str) -> DomainResult<Self> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timed_out" => Ok(Self::TimedOut),
            other => Err(DomainError::SerializationError(format!(
                "unknown invocation status: {other}"
            ))),
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// One execution of the agent child process for a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Invocation {
    /// `None` until the Store assigns one on insert.
    pub id: Option<i64>,
    pub issue_id: String,
    pub phase: InvocationPhase,
    pub status: InvocationStatus,
    pub session_id: Option<String>,
    pub branch_name: Option<String>,
    pub worktree_path: Option<String>,
    pub model: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub cost_usd: Option<f64>,
    pub num_turns: Option<i64>,
    pub output_summary: Option<String>,
    pub log_path: Option<String>,
}

/// Summary produced by a resumable max-turns invocation, read back by the
/// Scheduler to decide whether a retry can resume the prior session.
pub const MAX_TURNS_SUMMARY: &str = "max turns reached";

/// Summary written when a Runner is cancelled mid-flight.
pub const CANCELED_SUMMARY: &str = "canceled";

impl Invocation {
    /// Build a freshly-dispatched invocation row (`status = running`,
    /// `endedAt`/`costUsd`/`numTurns` all null, per the Invocation
    /// invariant).
    pub fn new_running(
        issue_id: impl Into<String>,
        phase: InvocationPhase,
        branch_name: Option<String>,
        worktree_path: Option<String>,
        session_id: Option<String>,
        model: Option<String>,
        log_path: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            issue_id: issue_id.into(),
            phase,
            status: InvocationStatus::Running,
            session_id,
            branch_name,
            worktree_path,
            model,
            started_at: now,
            ended_at: None,
            cost_usd: None,
            num_turns: None,
            output_summary: None,
            log_path,
        }
    }

    /// Whether this invocation is eligible to have its session resumed by a
    /// subsequent invocation (implement-phase max-turns timeout with a
    /// recorded session and worktree).
    pub fn is_resumable(&self) -> bool {
        self.phase == InvocationPhase::Implement
            && self.output_summary.as_deref() == Some(MAX_TURNS_SUMMARY)
            && self.session_id.is_some()
            && self.worktree_path.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_running_invocation_has_null_terminal_fields() {
        let inv = Invocation::new_running(
            "A-1",
            InvocationPhase::Implement,
            Some("orca/A-1-inv-1".into()),
            Some("/tmp/w".into()),
            None,
            Some("claude-opus".into()),
            Some("/tmp/logs/1.jsonl".into()),
            Utc::now(),
        );
        assert_eq!(inv.status, InvocationStatus::Running);
        assert!(inv.ended_at.is_none());
        assert!(inv.cost_usd.is_none());
        assert!(inv.num_turns.is_none());
    }

    #[test]
    fn resumable_requires_max_turns_session_and_worktree() {
        let mut inv = Invocation::new_running(
            "A-2",
            InvocationPhase::Implement,
            None,
            Some("/tmp/w".into()),
            Some("s1".into()),
            None,
            None,
            Utc::now(),
        );
        assert!(!inv.is_resumable());
        inv.output_summary = Some(MAX_TURNS_SUMMARY.to_string());
        assert!(inv.is_resumable());
    }

    #[test]
    fn review_phase_invocation_is_never_resumable() {
        let mut inv = Invocation::new_running(
            "A-3",
            InvocationPhase::Review,
            None,
            Some("/tmp/w".into()),
            Some("s1".into()),
            None,
            None,
            Utc::now(),
        );
        inv.output_summary = Some(MAX_TURNS_SUMMARY.to_string());
        assert!(!inv.is_resumable());
    }
}
