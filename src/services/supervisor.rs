//! Supervisor: the orchestrator's composition root and graceful-shutdown
//! coordinator.
//!
//! Grounded in the teacher's `SwarmOrchestrator`/`main.rs` wiring style: one
//! place assembles every collaborator and owns the handful of long-running
//! tasks (Scheduler tick loop, CIMonitor, DeployMonitor, write-back
//! listener, API server), then waits on a shutdown signal and unwinds them
//! in order.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::adapters::agent::ProcessAgentSubstrate;
use crate::adapters::sqlite::SqliteStore;
use crate::adapters::tracker::HttpTrackerClient;
use crate::adapters::vcs::GitVcsClient;
use crate::api::AppState;
use crate::domain::models::{Config, WebhookEvent};
use crate::domain::ports::{AgentSubstrate, Store, TrackerClient, VcsClient};
use crate::infrastructure::logging::AuditLogger;
use crate::services::event_bus::{EventBus, OrcaEvent};
use crate::services::monitors::{CiMonitor, DeployMonitor};
use crate::services::runner::Runner;
use crate::services::scheduler::{Scheduler, SchedulerHandle};
use crate::services::sync_engine::SyncEngine;

/// Everything the running process needs to shut down cleanly: the
/// scheduler handle (to stop admission and cancel in-flight invocations)
/// and the webhook sender (dropped to let `SyncEngine`'s worker drain and
/// exit).
pub struct Supervisor {
    config: Arc<Config>,
    store: Arc<dyn Store>,
    event_bus: EventBus,
    scheduler: Arc<Scheduler>,
    scheduler_handle: SchedulerHandle,
    sync_engine: Arc<SyncEngine>,
    ci_monitor: Arc<CiMonitor>,
    deploy_monitor: Arc<DeployMonitor>,
    webhook_tx: mpsc::Sender<WebhookEvent>,
}

impl Supervisor {
    /// Assemble every collaborator from `config`. Opens the database pool,
    /// runs migrations, and probes the agent binary's availability before
    /// returning so startup failures surface before `run()` is ever called.
    pub async fn bootstrap(config: Config) -> anyhow::Result<Self> {
        let config = Arc::new(config);

        let database_url = format!("sqlite:{}", config.db_path);
        let pool = crate::adapters::sqlite::initialize_database(&database_url).await?;
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool));

        let vcs: Arc<dyn VcsClient> = Arc::new(GitVcsClient::new());
        let agent: Arc<dyn AgentSubstrate> = Arc::new(ProcessAgentSubstrate::new(config.agent_path.clone()));
        if !agent.is_available().await {
            tracing::warn!(agent_path = %config.agent_path, "configured agent binary did not respond to --version at startup");
        }
        let tracker: Arc<dyn TrackerClient> = Arc::new(HttpTrackerClient::new(
            config.tracker_api_base.clone(),
            config.tracker_api_key.clone(),
        ));

        let audit = AuditLogger::new(&config.audit_log_path).await?;

        let event_bus = EventBus::new();
        spawn_audit_subscriber(event_bus.subscribe(), audit.clone());

        let runner = Arc::new(Runner::new(agent, vcs.clone(), store.clone(), config.clone(), event_bus.clone()));
        let (scheduler, scheduler_handle) = Scheduler::new(store.clone(), vcs.clone(), runner, event_bus.clone(), config.clone());
        let scheduler = Arc::new(scheduler);

        let sync_engine = Arc::new(SyncEngine::new(
            tracker,
            vcs.clone(),
            store.clone(),
            event_bus.clone(),
            config.clone(),
            scheduler_handle.clone(),
            audit,
        ));
        let webhook_tx = sync_engine.clone().spawn_webhook_worker();
        sync_engine.clone().spawn_write_back_listener();

        let ci_monitor = Arc::new(CiMonitor::new(store.clone(), vcs.clone(), event_bus.clone(), config.clone()));
        let deploy_monitor = Arc::new(DeployMonitor::new(store.clone(), vcs, event_bus.clone(), config.clone()));

        Ok(Self {
            config,
            store,
            event_bus,
            scheduler,
            scheduler_handle,
            sync_engine,
            ci_monitor,
            deploy_monitor,
            webhook_tx,
        })
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            store: self.store.clone(),
            event_bus: self.event_bus.clone(),
            scheduler: self.scheduler_handle.clone(),
            sync_engine: self.sync_engine.clone(),
            webhook_tx: self.webhook_tx.clone(),
            config: self.config.clone(),
        }
    }

    /// Run an initial full sync, then drive the tick loop, monitors, and
    /// API server concurrently until `ctrl_c` (or an external shutdown
    /// future) completes, at which point every task is unwound in order:
    /// stop admission, cancel and drain active invocations, then let the
    /// webhook worker finish draining its queue.
    pub async fn run(self) -> anyhow::Result<()> {
        if let Err(err) = self.sync_engine.full_sync().await {
            tracing::error!(error = %err, "initial full sync failed, continuing with whatever tasks are already local");
        }

        let (monitor_shutdown_tx, monitor_shutdown_rx) = tokio::sync::watch::channel(false);

        let scheduler_task = tokio::spawn(self.scheduler.clone().run());
        let ci_task = tokio::spawn(self.ci_monitor.clone().run(monitor_shutdown_rx.clone()));
        let deploy_task = tokio::spawn(self.deploy_monitor.clone().run(monitor_shutdown_rx));

        let app = crate::api::router(self.app_state());
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], self.config.port));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(%addr, "api server listening");
        let api_task = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                tracing::error!(error = %err, "api server exited with an error");
            }
        });

        tokio::signal::ctrl_c().await?;
        tracing::info!("shutdown signal received, stopping admission");

        self.scheduler_handle.shutdown().await;
        let _ = monitor_shutdown_tx.send(true);
        drop(self.webhook_tx);

        api_task.abort();
        ci_task.abort();
        deploy_task.abort();
        let _ = scheduler_task.await;

        tracing::info!("supervisor shutdown complete");
        Ok(())
    }
}

/// Mirror task/invocation lifecycle events onto the audit trail. Runs for
/// the life of the process; the broadcast receiver is simply dropped on
/// shutdown along with every other `EventBus` subscriber.
fn spawn_audit_subscriber(mut events: tokio::sync::broadcast::Receiver<OrcaEvent>, audit: AuditLogger) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(OrcaEvent::TaskUpdated { issue_id, phase, .. }) => {
                    let _ = audit
                        .log_operation("phase_transition", "scheduler", Some(&issue_id), true, Some(serde_json::json!({"phase": phase.as_str()})))
                        .await;
                }
                Ok(OrcaEvent::InvocationStarted { issue_id, invocation_id, .. }) => {
                    let _ = audit
                        .log_operation("dispatch_task", "scheduler", Some(&issue_id), true, Some(serde_json::json!({"invocationId": invocation_id})))
                        .await;
                }
                Ok(OrcaEvent::InvocationCompleted { issue_id, invocation_id, status, .. }) => {
                    let success = status != "failed";
                    let _ = audit
                        .log_operation("invocation_completed", "runner", Some(&issue_id), success, Some(serde_json::json!({"invocationId": invocation_id, "status": status})))
                        .await;
                }
                Ok(OrcaEvent::StatusUpdated { .. }) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
