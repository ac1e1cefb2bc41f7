//! SQLite implementation of the [`Store`] port.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    BudgetEvent, Invocation, InvocationPhase, InvocationStatus, Task, TaskPhase,
};
use crate::domain::ports::Store;

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn parse_dt(s: &str) -> DomainResult<DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DomainError::SerializationError(e.to_string()))
}

fn parse_opt_dt(s: Option<String>) -> DomainResult<Option<DateTime<Utc>>> {
    s.map(|s| parse_dt(&s)).transpose()
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    issue_id: String,
    agent_prompt: String,
    repo_path: String,
    project_name: Option<String>,
    phase: String,
    priority: i64,
    retry_count: i64,
    review_cycle_count: i64,
    pr_branch_name: Option<String>,
    pr_number: Option<i64>,
    merge_commit_sha: Option<String>,
    deploy_started_at: Option<String>,
    ci_started_at: Option<String>,
    done_at: Option<String>,
    parent_identifier: Option<String>,
    is_parent: i64,
    created_at: String,
    updated_at: String,
}

impl TryFrom<TaskRow> for Task {
    type Error = DomainError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        Ok(Task {
            issue_id: row.issue_id,
            agent_prompt: row.agent_prompt,
            repo_path: row.repo_path,
            project_name: row.project_name,
            phase: TaskPhase::from_str(&row.phase)?,
            priority: row.priority as u8,
            retry_count: row.retry_count as u32,
            review_cycle_count: row.review_cycle_count as u32,
            pr_branch_name: row.pr_branch_name,
            pr_number: row.pr_number,
            merge_commit_sha: row.merge_commit_sha,
            deploy_started_at: parse_opt_dt(row.deploy_started_at)?,
            ci_started_at: parse_opt_dt(row.ci_started_at)?,
            done_at: parse_opt_dt(row.done_at)?,
            parent_identifier: row.parent_identifier,
            is_parent: row.is_parent != 0,
            created_at: parse_dt(&row.created_at)?,
            updated_at: parse_dt(&row.updated_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct InvocationRow {
    id: i64,
    issue_id: String,
    phase: String,
    status: String,
    session_id: Option<String>,
    branch_name: Option<String>,
    worktree_path: Option<String>,
    model: Option<String>,
    started_at: String,
    ended_at: Option<String>,
    cost_usd: Option<f64>,
    num_turns: Option<i64>,
    output_summary: Option<String>,
    log_path: Option<String>,
}

impl TryFrom<InvocationRow> for Invocation {
    type Error = DomainError;

    fn try_from(row: InvocationRow) -> Result<Self, Self::Error> {
        Ok(Invocation {
            id: Some(row.id),
            issue_id: row.issue_id,
            phase: InvocationPhase::from_str(&row.phase)?,
            status: InvocationStatus::from_str(&row.status)?,
            session_id: row.session_id,
            branch_name: row.branch_name,
            worktree_path: row.worktree_path,
            model: row.model,
            started_at: parse_dt(&row.started_at)?,
            ended_at: parse_opt_dt(row.ended_at)?,
            cost_usd: row.cost_usd,
            num_turns: row.num_turns,
            output_summary: row.output_summary,
            log_path: row.log_path,
        })
    }
}

const DISPATCHABLE_PHASES: &[TaskPhase] = &[
    TaskPhase::Ready,
    TaskPhase::ChangesRequested,
    TaskPhase::InReview,
];

#[async_trait]
impl Store for SqliteStore {
    async fn insert_task(&self, task: &Task) -> DomainResult<()> {
        sqlx::query(
            r#"INSERT INTO tasks (issue_id, agent_prompt, repo_path, project_name, phase,
               priority, retry_count, review_cycle_count, pr_branch_name, pr_number,
               merge_commit_sha, deploy_started_at, ci_started_at, done_at, parent_identifier,
               is_parent, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&task.issue_id)
        .bind(&task.agent_prompt)
        .bind(&task.repo_path)
        .bind(&task.project_name)
        .bind(task.phase.as_str())
        .bind(i64::from(task.priority))
        .bind(i64::from(task.retry_count))
        .bind(i64::from(task.review_cycle_count))
        .bind(&task.pr_branch_name)
        .bind(task.pr_number)
        .bind(&task.merge_commit_sha)
        .bind(task.deploy_started_at.map(|t| t.to_rfc3339()))
        .bind(task.ci_started_at.map(|t| t.to_rfc3339()))
        .bind(task.done_at.map(|t| t.to_rfc3339()))
        .bind(&task.parent_identifier)
        .bind(task.is_parent)
        .bind(task.created_at.to_rfc3339())
        .bind(task.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_task(&self, issue_id: &str) -> DomainResult<Option<Task>> {
        let row: Option<TaskRow> = sqlx::query_as("SELECT * FROM tasks WHERE issue_id = ?")
            .bind(issue_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Task::try_from).transpose()
    }

    async fn update_task(&self, task: &Task) -> DomainResult<()> {
        let result = sqlx::query(
            r#"UPDATE tasks SET agent_prompt = ?, repo_path = ?, project_name = ?, phase = ?,
               priority = ?, retry_count = ?, review_cycle_count = ?, pr_branch_name = ?,
               pr_number = ?, merge_commit_sha = ?, deploy_started_at = ?, ci_started_at = ?,
               done_at = ?, parent_identifier = ?, is_parent = ?, updated_at = ?
               WHERE issue_id = ?"#,
        )
        .bind(&task.agent_prompt)
        .bind(&task.repo_path)
        .bind(&task.project_name)
        .bind(task.phase.as_str())
        .bind(i64::from(task.priority))
        .bind(i64::from(task.retry_count))
        .bind(i64::from(task.review_cycle_count))
        .bind(&task.pr_branch_name)
        .bind(task.pr_number)
        .bind(&task.merge_commit_sha)
        .bind(task.deploy_started_at.map(|t| t.to_rfc3339()))
        .bind(task.ci_started_at.map(|t| t.to_rfc3339()))
        .bind(task.done_at.map(|t| t.to_rfc3339()))
        .bind(&task.parent_identifier)
        .bind(task.is_parent)
        .bind(task.updated_at.to_rfc3339())
        .bind(&task.issue_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DomainError::TaskNotFound(task.issue_id.clone()));
        }
        Ok(())
    }

    async fn delete_task(&self, issue_id: &str) -> DomainResult<()> {
        // Invocations (and their budget events) cascade-delete via FK ON
        // DELETE CASCADE, so the rolling cost window only loses historical
        // attribution, never retroactively adjusts — see DESIGN.md 9.1(a).
        sqlx::query("DELETE FROM tasks WHERE issue_id = ?")
            .bind(issue_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_tasks(&self) -> DomainResult<Vec<Task>> {
        let rows: Vec<TaskRow> =
            sqlx::query_as("SELECT * FROM tasks ORDER BY priority ASC, created_at ASC")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(Task::try_from).collect()
    }

    async fn try_transition_phase(
        &self,
        issue_id: &str,
        expected_phase: TaskPhase,
        new_phase: TaskPhase,
    ) -> DomainResult<bool> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE tasks SET phase = ?, updated_at = ? WHERE issue_id = ? AND phase = ?",
        )
        .bind(new_phase.as_str())
        .bind(&now)
        .bind(issue_id)
        .bind(expected_phase.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn ready_tasks(&self) -> DomainResult<Vec<Task>> {
        let phases: Vec<&str> = DISPATCHABLE_PHASES.iter().map(|p| p.as_str()).collect();
        let placeholders = phases.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let sql = format!(
            "SELECT * FROM tasks WHERE is_parent = 0 AND phase IN ({placeholders}) \
             ORDER BY priority ASC, created_at ASC"
        );
        let mut query = sqlx::query_as::<_, TaskRow>(&sql);
        for phase in &phases {
            query = query.bind(*phase);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(Task::try_from).collect()
    }

    async fn deploying_tasks(&self) -> DomainResult<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            "SELECT * FROM tasks WHERE phase = 'deploying' ORDER BY priority ASC, created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Task::try_from).collect()
    }

    async fn awaiting_ci_tasks(&self) -> DomainResult<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            "SELECT * FROM tasks WHERE phase = 'awaiting_ci' ORDER BY priority ASC, created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Task::try_from).collect()
    }

    async fn parent_tasks(&self) -> DomainResult<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as("SELECT * FROM tasks WHERE is_parent = 1")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Task::try_from).collect()
    }

    async fn children_of(&self, parent_issue_id: &str) -> DomainResult<Vec<Task>> {
        let rows: Vec<TaskRow> =
            sqlx::query_as("SELECT * FROM tasks WHERE parent_identifier = ?")
                .bind(parent_issue_id)
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(Task::try_from).collect()
    }

    async fn insert_invocation(&self, invocation: &Invocation) -> DomainResult<i64> {
        let result = sqlx::query(
            r#"INSERT INTO invocations (issue_id, phase, status, session_id, branch_name,
               worktree_path, model, started_at, ended_at, cost_usd, num_turns, output_summary, log_path)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&invocation.issue_id)
        .bind(invocation.phase.as_str())
        .bind(invocation.status.as_str())
        .bind(&invocation.session_id)
        .bind(&invocation.branch_name)
        .bind(&invocation.worktree_path)
        .bind(&invocation.model)
        .bind(invocation.started_at.to_rfc3339())
        .bind(invocation.ended_at.map(|t| t.to_rfc3339()))
        .bind(invocation.cost_usd)
        .bind(invocation.num_turns)
        .bind(&invocation.output_summary)
        .bind(&invocation.log_path)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn get_invocation(&self, id: i64) -> DomainResult<Option<Invocation>> {
        let row: Option<InvocationRow> =
            sqlx::query_as("SELECT * FROM invocations WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(Invocation::try_from).transpose()
    }

    async fn complete_invocation(
        &self,
        invocation: &Invocation,
        budget_event: Option<&BudgetEvent>,
    ) -> DomainResult<()> {
        let id = invocation
            .id
            .ok_or_else(|| DomainError::ValidationFailed("invocation has no id".to_string()))?;

        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"UPDATE invocations SET status = ?, session_id = ?, ended_at = ?, cost_usd = ?,
               num_turns = ?, output_summary = ? WHERE id = ? AND status = 'running'"#,
        )
        .bind(invocation.status.as_str())
        .bind(&invocation.session_id)
        .bind(invocation.ended_at.map(|t| t.to_rfc3339()))
        .bind(invocation.cost_usd)
        .bind(invocation.num_turns)
        .bind(&invocation.output_summary)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DomainError::ConcurrencyConflict {
                entity: "invocation".to_string(),
                id: id.to_string(),
            });
        }

        if let Some(event) = budget_event {
            sqlx::query(
                "INSERT INTO budget_events (invocation_id, cost_usd, recorded_at) VALUES (?, ?, ?)",
            )
            .bind(event.invocation_id)
            .bind(event.cost_usd)
            .bind(event.recorded_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_invocations_for_task(&self, issue_id: &str) -> DomainResult<Vec<Invocation>> {
        let rows: Vec<InvocationRow> = sqlx::query_as(
            "SELECT * FROM invocations WHERE issue_id = ? ORDER BY started_at ASC",
        )
        .bind(issue_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Invocation::try_from).collect()
    }

    async fn last_resumable_invocation(&self, issue_id: &str) -> DomainResult<Option<Invocation>> {
        let row: Option<InvocationRow> = sqlx::query_as(
            r#"SELECT * FROM invocations
               WHERE issue_id = ? AND phase = 'implement' AND output_summary = 'max turns reached'
                 AND session_id IS NOT NULL AND worktree_path IS NOT NULL
               ORDER BY started_at DESC LIMIT 1"#,
        )
        .bind(issue_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Invocation::try_from).transpose()
    }

    async fn active_invocation_count(&self) -> DomainResult<u32> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM invocations WHERE status = 'running'")
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u32)
    }

    async fn cost_in_window(&self, since: DateTime<Utc>) -> DomainResult<f64> {
        let (sum,): (Option<f64>,) = sqlx::query_as(
            "SELECT SUM(cost_usd) FROM budget_events WHERE recorded_at >= ?",
        )
        .bind(since.to_rfc3339())
        .fetch_one(&self.pool)
        .await?;
        Ok(sum.unwrap_or(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::create_migrated_test_pool;

    async fn test_store() -> SqliteStore {
        SqliteStore::new(create_migrated_test_pool().await.unwrap())
    }

    fn sample_task(issue_id: &str, phase: TaskPhase) -> Task {
        let now = Utc::now();
        Task {
            issue_id: issue_id.to_string(),
            agent_prompt: "do it".to_string(),
            repo_path: "/tmp/repo".to_string(),
            project_name: None,
            phase,
            priority: 2,
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

    #[tokio::test]
    async fn insert_and_get_round_trips() {
        let store = test_store().await;
        let task = sample_task("A-1", TaskPhase::Ready);
        store.insert_task(&task).await.unwrap();
        let fetched = store.get_task("A-1").await.unwrap().unwrap();
        assert_eq!(fetched, task);
    }

    #[tokio::test]
    async fn try_transition_phase_is_a_cas_guard() {
        let store = test_store().await;
        store
            .insert_task(&sample_task("A-2", TaskPhase::Ready))
            .await
            .unwrap();

        let first = store
            .try_transition_phase("A-2", TaskPhase::Ready, TaskPhase::Dispatched)
            .await
            .unwrap();
        assert!(first);

        // Second attempt against the stale expected phase fails — this is
        // what prevents double-dispatch under event-driven reentry.
        let second = store
            .try_transition_phase("A-2", TaskPhase::Ready, TaskPhase::Dispatched)
            .await
            .unwrap();
        assert!(!second);
    }

    #[tokio::test]
    async fn ready_tasks_excludes_parents() {
        let store = test_store().await;
        let mut parent = sample_task("P-1", TaskPhase::Ready);
        parent.is_parent = true;
        store.insert_task(&parent).await.unwrap();
        store
            .insert_task(&sample_task("A-3", TaskPhase::Ready))
            .await
            .unwrap();

        let ready = store.ready_tasks().await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].issue_id, "A-3");
    }

    #[tokio::test]
    async fn complete_invocation_writes_budget_event_atomically() {
        let store = test_store().await;
        store
            .insert_task(&sample_task("A-4", TaskPhase::Dispatched))
            .await
            .unwrap();

        let invocation = Invocation::new_running(
            "A-4",
            InvocationPhase::Implement,
            Some("orca/A-4-inv-1".to_string()),
            Some("/tmp/w".to_string()),
            None,
            None,
            Some("/tmp/log.jsonl".to_string()),
            Utc::now(),
        );
        let id = store.insert_invocation(&invocation).await.unwrap();

        let mut terminal = invocation.clone();
        terminal.id = Some(id);
        terminal.status = InvocationStatus::Completed;
        terminal.ended_at = Some(Utc::now());
        terminal.cost_usd = Some(1.25);
        terminal.num_turns = Some(3);

        let event = BudgetEvent::new(id, 1.25, Utc::now());
        store
            .complete_invocation(&terminal, Some(&event))
            .await
            .unwrap();

        let cost = store.cost_in_window(Utc::now() - chrono::Duration::hours(1)).await.unwrap();
        assert!((cost - 1.25).abs() < f64::EPSILON);

        let active = store.active_invocation_count().await.unwrap();
        assert_eq!(active, 0);
    }

    #[tokio::test]
    async fn last_resumable_invocation_requires_max_turns_summary() {
        let store = test_store().await;
        store
            .insert_task(&sample_task("A-5", TaskPhase::Dispatched))
            .await
            .unwrap();

        let mut invocation = Invocation::new_running(
            "A-5",
            InvocationPhase::Implement,
            Some("orca/A-5-inv-1".to_string()),
            Some("/tmp/w".to_string()),
            Some("s1".to_string()),
            None,
            None,
            Utc::now(),
        );
        let id = store.insert_invocation(&invocation).await.unwrap();
        invocation.id = Some(id);
        invocation.status = InvocationStatus::TimedOut;
        invocation.ended_at = Some(Utc::now());
        invocation.output_summary = Some("max turns reached".to_string());
        store.complete_invocation(&invocation, None).await.unwrap();

        let resumable = store.last_resumable_invocation("A-5").await.unwrap();
        assert!(resumable.is_some());
        assert_eq!(resumable.unwrap().session_id.as_deref(), Some("s1"));
    }
}
