//! Task domain model.
//!
//! A `Task` is one row per external issue that Orca manages. It tracks the
//! Orca-owned orchestration phase, which is distinct from the tracker's own
//! workflow state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::errors::{DomainError, DomainResult};

/// Orca-owned phase of a task along the orchestration pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    /// Synced from the tracker but not yet in a dispatchable state.
    Backlog,
    /// Dispatchable; the Scheduler may admit it on the next tick.
    Ready,
    /// Admitted; an invocation is about to be created.
    Dispatched,
    /// An invocation is actively running against this task.
    Running,
    /// Implementation finished successfully; awaiting review.
    InReview,
    /// Review requested changes; a fix invocation is scheduled.
    ChangesRequested,
    /// Review approved; waiting on CI to validate the merge.
    AwaitingCi,
    /// CI passed; a deploy is in flight.
    Deploying,
    /// Terminal: work is complete.
    Done,
    /// Terminal but recoverable: explicit retry moves back to `Ready`.
    Failed,
}

impl TaskPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Backlog => "backlog",
            Self::Ready => "ready",
            Self::Dispatched => "dispatched",
            Self::Running => "running",
            Self::InReview => "in_review",
            Self::ChangesRequested => "changes_requested",
            Self::AwaitingCi => "awaiting_ci",
            Self::Deploying => "deploying",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> DomainResult<Self> {
        match s {
            "backlog" => Ok(Self::Backlog),
            "ready" => Ok(Self::Ready),
            "dispatched" => Ok(Self::Dispatched),
            "running" => Ok(Self::Running),
            "in_review" => Ok(Self::InReview),
            "changes_requested" => Ok(Self::ChangesRequested),
            "awaiting_ci" => Ok(Self::AwaitingCi),
            "deploying" => Ok(Self::Deploying),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => Err(DomainError::SerializationError(format!(
                "unknown task phase: {other}"
            ))),
        }
    }

    /// Terminal phases: `done` and `failed`. `failed` is recoverable via an
    /// explicit retry that moves the task back to `ready`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Phases from which the Scheduler may spawn an invocation this tick.
    /// `AwaitingCi` is deliberately excluded: that phase is CIMonitor's
    /// exclusive domain (it polls, it does not dispatch a new invocation),
    /// and has its own `awaiting_ci_tasks()` store selector. `InReview` is
    /// included here (it dispatches a Review invocation) but gated by
    /// `reviewCycleCount < maxReviewCycles`, which only `Task::is_dispatchable`
    /// can evaluate.
    pub fn is_dispatchable(self) -> bool {
        matches!(self, Self::Ready | Self::ChangesRequested | Self::InReview)
    }

    /// Whether `self -> to` is an allowed transition per the phase machine
    /// in §4.2. This only encodes the *shape* of the graph; side effects
    /// (retry counters, timestamps) are applied by the Scheduler.
    pub fn can_transition_to(self, to: Self) -> bool {
        use TaskPhase::{
            AwaitingCi, Backlog, ChangesRequested, Deploying, Dispatched, Done, Failed, InReview,
            Ready, Running,
        };
        matches!(
            (self, to),
            (Backlog, Ready)
                | (Ready, Dispatched)
                | (Dispatched, Running)
                | (Running, InReview)
                | (Running, Ready) // max-turns resume
                | (InReview, AwaitingCi)
                | (InReview, Done)
                | (InReview, ChangesRequested)
                | (InReview, Failed)
                | (ChangesRequested, Running)
                | (ChangesRequested, Ready) // max-turns resume during fix
                | (AwaitingCi, Deploying)
                | (AwaitingCi, Failed)
                | (Deploying, Done)
                | (Deploying, Failed)
                | (Failed, Ready) // explicit retry
        ) || (!self.is_terminal() && to == Failed) // retry-eligible failure from any non-terminal phase
            || (!self.is_terminal() && to == Ready) // external reset (webhook conflict resolution)
            || (to == Done) // human override / parent roll-up may force-complete from any phase
    }
}

/// The identity + orchestration state of one tracker issue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    /// Primary key: the tracker's own external issue identifier.
    pub issue_id: String,
    pub agent_prompt: String,
    pub repo_path: String,
    pub project_name: Option<String>,
    pub phase: TaskPhase,
    /// 0..4, lower = higher priority.
    pub priority: u8,
    pub retry_count: u32,
    pub review_cycle_count: u32,
    pub pr_branch_name: Option<String>,
    pub pr_number: Option<i64>,
    pub merge_commit_sha: Option<String>,
    pub deploy_started_at: Option<DateTime<Utc>>,
    pub ci_started_at: Option<DateTime<Utc>>,
    pub done_at: Option<DateTime<Utc>>,
    pub parent_identifier: Option<String>,
    pub is_parent: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Construct a fresh task synced from the tracker for the first time.
    ///
    /// Initial phase is `ready` when `is_ready_state` is true and the issue
    /// has no dispatch-blocking parent; `backlog` otherwise, per §4.2.
    pub fn new_synced(
        issue_id: impl Into<String>,
        agent_prompt: impl Into<String>,
        repo_path: impl Into<String>,
        priority: u8,
        is_ready_state: bool,
        has_blocking_parent: bool,
        now: DateTime<Utc>,
    ) -> Self {
        let phase = if is_ready_state && !has_blocking_parent {
            TaskPhase::Ready
        } else {
            TaskPhase::Backlog
        };
        Self {
            issue_id: issue_id.into(),
            agent_prompt: agent_prompt.into(),
            repo_path: repo_path.into(),
            project_name: None,
            phase,
            priority: priority.min(4),
            retry_count: 0,
            review_cycle_count: 0,
            pr_branch_name: None,
            pr_number: None,
            merge_commit_sha: None,
            deploy_started_at: None,
            ci_started_at: None,
            done_at: None,
            parent_identifier: None,
            is_parent: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// A task with `is_parent = true` is never dispatchable, regardless of
    /// its own phase. `InReview` additionally requires `reviewCycleCount`
    /// to be under `maxReviewCycles` (§4.3 step 3).
    pub fn is_dispatchable(&self, max_review_cycles: u32) -> bool {
        if self.is_parent || !self.phase.is_dispatchable() {
            return false;
        }
        if self.phase == TaskPhase::InReview {
            return self.review_cycle_count < max_review_cycles;
        }
        true
    }

    /// Branch name convention for the invocation about to run: `orca/<issueId>-inv-<N>`.
    pub fn branch_name_for_invocation(&self, invocation_seq: u64) -> String {
        format!("orca/{}-inv-{invocation_seq}", self.issue_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_round_trips_through_str() {
        for phase in [
            TaskPhase::Backlog,
            TaskPhase::Ready,
            TaskPhase::Dispatched,
            TaskPhase::Running,
            TaskPhase::InReview,
            TaskPhase::ChangesRequested,
            TaskPhase::AwaitingCi,
            TaskPhase::Deploying,
            TaskPhase::Done,
            TaskPhase::Failed,
        ] {
            assert_eq!(TaskPhase::from_str(phase.as_str()).unwrap(), phase);
        }
    }

    #[test]
    fn unknown_phase_is_an_error() {
        assert!(TaskPhase::from_str("bogus").is_err());
    }

    #[test]
    fn terminal_phases_are_done_and_failed() {
        assert!(TaskPhase::Done.is_terminal());
        assert!(TaskPhase::Failed.is_terminal());
        assert!(!TaskPhase::Running.is_terminal());
    }

    #[test]
    fn failed_can_retry_to_ready() {
        assert!(TaskPhase::Failed.can_transition_to(TaskPhase::Ready));
    }

    #[test]
    fn done_cannot_transition_further_except_via_override() {
        assert!(!TaskPhase::Done.can_transition_to(TaskPhase::Ready));
        assert!(!TaskPhase::Done.can_transition_to(TaskPhase::Failed));
    }

    #[test]
    fn parent_task_is_never_dispatchable() {
        let mut task = Task::new_synced(
            "EMI-1",
            "do the thing",
            "/tmp/r",
            1,
            true,
            false,
            Utc::now(),
        );
        assert!(task.is_dispatchable(3));
        task.is_parent = true;
        assert!(!task.is_dispatchable(3));
    }

    #[test]
    fn in_review_dispatchable_only_under_max_cycles() {
        let mut task = Task::new_synced("EMI-2", "do the thing", "/tmp/r", 1, true, false, Utc::now());
        task.phase = TaskPhase::InReview;
        task.review_cycle_count = 1;
        assert!(task.is_dispatchable(3));
        task.review_cycle_count = 3;
        assert!(!task.is_dispatchable(3));
    }

    #[test]
    fn backlog_when_not_ready_state_or_blocked_by_parent() {
        let now = Utc::now();
        let t = Task::new_synced("A-1", "p", "/r", 1, false, false, now);
        assert_eq!(t.phase, TaskPhase::Backlog);
        let t2 = Task::new_synced("A-2", "p", "/r", 1, true, true, now);
        assert_eq!(t2.phase, TaskPhase::Backlog);
        let t3 = Task::new_synced("A-3", "p", "/r", 1, true, false, now);
        assert_eq!(t3.phase, TaskPhase::Ready);
    }

    fn all_phases() -> [TaskPhase; 10] {
        [
            TaskPhase::Backlog,
            TaskPhase::Ready,
            TaskPhase::Dispatched,
            TaskPhase::Running,
            TaskPhase::InReview,
            TaskPhase::ChangesRequested,
            TaskPhase::AwaitingCi,
            TaskPhase::Deploying,
            TaskPhase::Done,
            TaskPhase::Failed,
        ]
    }

    fn phase_strategy() -> impl proptest::strategy::Strategy<Value = TaskPhase> {
        use proptest::prelude::*;
        prop_oneof![
            Just(TaskPhase::Backlog),
            Just(TaskPhase::Ready),
            Just(TaskPhase::Dispatched),
            Just(TaskPhase::Running),
            Just(TaskPhase::InReview),
            Just(TaskPhase::ChangesRequested),
            Just(TaskPhase::AwaitingCi),
            Just(TaskPhase::Deploying),
            Just(TaskPhase::Done),
            Just(TaskPhase::Failed),
        ]
    }

    proptest::proptest! {
        /// Every phase, including terminal ones, can be force-completed
        /// (parent roll-up / human override) straight to `Done`.
        #[test]
        fn any_phase_can_be_forced_to_done(from in phase_strategy()) {
            proptest::prop_assert!(from.can_transition_to(TaskPhase::Done));
        }

        /// `Done` has no real successor: its only allowed target is itself,
        /// reached only via the force-complete override.
        #[test]
        fn done_has_no_successor_but_itself(to in phase_strategy()) {
            proptest::prop_assert_eq!(TaskPhase::Done.can_transition_to(to), to == TaskPhase::Done);
        }

        /// `as_str`/`from_str` round-trip for every phase the enum defines.
        #[test]
        fn phase_str_round_trip_is_total(phase in phase_strategy()) {
            proptest::prop_assert_eq!(TaskPhase::from_str(phase.as_str()).unwrap(), phase);
        }
    }

    #[test]
    fn every_nonterminal_phase_has_at_least_one_successor() {
        for phase in all_phases() {
            if phase.is_terminal() {
                continue;
            }
            let has_successor = all_phases()
                .iter()
                .any(|&to| to != phase && phase.can_transition_to(to));
            assert!(has_successor, "{phase:?} has no outgoing transition");
        }
    }
}
