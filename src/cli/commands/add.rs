//! `orca add <issue-id>`: seed a task by fetching one issue from the
//! tracker and upserting it, without knowing in advance which configured
//! project it lives in.

use anyhow::{bail, Result};

use crate::cli::display;
use crate::domain::models::Config;
use crate::services::supervisor::Supervisor;

pub async fn handle_add(config: Config, issue_id: String, json: bool) -> Result<()> {
    let supervisor = Supervisor::bootstrap(config).await?;
    let state = supervisor.app_state();

    let found = state.sync_engine.sync_one(&issue_id).await?;
    if !found {
        bail!("issue '{issue_id}' was not found in any configured tracker project");
    }

    let task = state.store.get_task(&issue_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&task)?);
        return Ok(());
    }

    match task {
        Some(task) => println!(
            "{}",
            display::action_success(&format!(
                "seeded {} (phase={}, priority={})",
                task.issue_id,
                task.phase.as_str(),
                task.priority
            ))
        ),
        None => println!(
            "{}",
            display::action_failure(&format!(
                "synced '{issue_id}' but could not read it back from the store"
            ))
        ),
    }

    Ok(())
}
