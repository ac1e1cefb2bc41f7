//! `orca start`: run the orchestrator — initial full sync, then the
//! scheduler tick loop, monitors, and API server concurrently until
//! shutdown.

use anyhow::Result;

use crate::domain::models::Config;
use crate::services::supervisor::Supervisor;

pub async fn handle_start(config: Config) -> Result<()> {
    let supervisor = Supervisor::bootstrap(config).await?;
    supervisor.run().await
}
