//! `orca status`: print queue depth, active invocation count, and the
//! rolling-window cost against the configured budget — the same figures
//! `GET /api/status` reports (§6.2).

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};

use crate::cli::display::{colorize_status, DetailView};
use crate::domain::models::{Config, TaskPhase};
use crate::services::supervisor::Supervisor;

pub async fn handle_status(config: Config, json: bool) -> Result<()> {
    let supervisor = Supervisor::bootstrap(config).await?;
    let state = supervisor.app_state();

    let tasks = state.store.list_tasks().await?;
    let queued_tasks = tasks
        .iter()
        .filter(|t| t.is_dispatchable(state.config.max_review_cycles))
        .count();
    let active_sessions = state.store.active_invocation_count().await?;
    let since = Utc::now() - ChronoDuration::hours(state.config.budget_window_hours as i64);
    let cost_in_window = state.store.cost_in_window(since).await?;
    let active_tasks: Vec<&crate::domain::models::Task> = tasks
        .iter()
        .filter(|t| matches!(t.phase, TaskPhase::Dispatched | TaskPhase::Running))
        .collect();
    let active_task_ids: Vec<String> = active_tasks.iter().map(|t| t.issue_id.clone()).collect();

    if json {
        let payload = serde_json::json!({
            "activeSessions": active_sessions,
            "queuedTasks": queued_tasks,
            "costInWindow": cost_in_window,
            "budgetLimit": state.config.budget_max_cost_usd,
            "budgetWindowHours": state.config.budget_window_hours,
            "concurrencyCap": state.config.concurrency_cap,
            "activeTaskIds": active_task_ids,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    let mut view = DetailView::new("orca status")
        .field("Active sessions", &format!("{active_sessions}/{}", state.config.concurrency_cap))
        .field("Queued tasks", &queued_tasks.to_string())
        .field(
            "Cost in window",
            &format!(
                "${cost_in_window:.2} / ${:.2} ({}h window)",
                state.config.budget_max_cost_usd, state.config.budget_window_hours
            ),
        );

    if active_tasks.is_empty() {
        view = view.section("Active tasks").item("none");
    } else {
        view = view.section("Active tasks");
        for task in &active_tasks {
            view = view.item(&format!("{} ({})", task.issue_id, colorize_status(task.phase.as_str())));
        }
    }

    println!("{}", view.render());
    Ok(())
}
