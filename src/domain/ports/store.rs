//! The `Store` port: Orca's single-writer persistent state.
//!
//! All task/invocation/budget mutations funnel through this trait. The
//! concrete `SqliteStore` (see `adapters::sqlite::store`) serializes writes
//! through a pool configured for a single writer connection.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::errors::DomainResult;
use crate::domain::models::{BudgetEvent, Invocation, Task, TaskPhase};

/// Crash-safe relational store for tasks, invocations, and budget events.
#[async_trait]
pub trait Store: Send + Sync {
    // -- Task CRUD --------------------------------------------------------
    async fn insert_task(&self, task: &Task) -> DomainResult<()>;
    async fn get_task(&self, issue_id: &str) -> DomainResult<Option<Task>>;
    async fn update_task(&self, task: &Task) -> DomainResult<()>;
    async fn delete_task(&self, issue_id: &str) -> DomainResult<()>;
    async fn list_tasks(&self) -> DomainResult<Vec<Task>>;

    /// Atomically transition a task's phase iff it is currently
    /// `expected_phase`. Returns `true` if the transition applied. This is
    /// the CAS guard the Scheduler uses for `ready -> dispatched` so that
    /// event-driven reentry can never double-dispatch.
    async fn try_transition_phase(
        &self,
        issue_id: &str,
        expected_phase: TaskPhase,
        new_phase: TaskPhase,
    ) -> DomainResult<bool>;

    // -- Task selectors -----------------------------------------------------
    /// Dispatchable tasks ordered by (priority ASC, createdAt ASC).
    async fn ready_tasks(&self) -> DomainResult<Vec<Task>>;
    async fn deploying_tasks(&self) -> DomainResult<Vec<Task>>;
    async fn awaiting_ci_tasks(&self) -> DomainResult<Vec<Task>>;
    async fn parent_tasks(&self) -> DomainResult<Vec<Task>>;
    async fn children_of(&self, parent_issue_id: &str) -> DomainResult<Vec<Task>>;

    // -- Invocation CRUD ------------------------------------------------
    /// Inserts a running invocation row and returns its assigned id.
    async fn insert_invocation(&self, invocation: &Invocation) -> DomainResult<i64>;
    async fn get_invocation(&self, id: i64) -> DomainResult<Option<Invocation>>;
    /// Applies the single terminal write (status, endedAt, cost/turns/summary)
    /// and appends the corresponding `BudgetEvent` in one transaction when
    /// `cost_usd` is present.
    async fn complete_invocation(
        &self,
        invocation: &Invocation,
        budget_event: Option<&BudgetEvent>,
    ) -> DomainResult<()>;
    async fn list_invocations_for_task(&self, issue_id: &str) -> DomainResult<Vec<Invocation>>;

    /// Most recent implement-phase invocation eligible for session resume
    /// (see `Invocation::is_resumable`), newest first.
    async fn last_resumable_invocation(&self, issue_id: &str) -> DomainResult<Option<Invocation>>;

    /// Count of invocation rows with `status = running`.
    async fn active_invocation_count(&self) -> DomainResult<u32>;

    // -- Budget -----------------------------------------------------------
    /// Sum of `BudgetEvent.cost_usd` with `recorded_at >= since`.
    async fn cost_in_window(&self, since: DateTime<Utc>) -> DomainResult<f64>;
}
