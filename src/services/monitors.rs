//! CIMonitor / DeployMonitor (§4.6): timer loops that advance the minority
//! of tasks waiting on external, asynchronous progress (CI checks, a
//! deploy pipeline) rather than an active agent invocation.
//!
//! Grounded in the teacher's `EventScheduler`'s own tick/interval shape,
//! generalized from arbitrary cron/interval schedules to two fixed,
//! purpose-built polling loops over `awaiting_ci_tasks`/`deploying_tasks`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::domain::models::{Config, Task, TaskPhase};
use crate::domain::ports::vcs_client::{CheckStatus, DeployStatus};
use crate::domain::ports::{Store, VcsClient};
use crate::services::event_bus::{EventBus, OrcaEvent};

/// Watches `awaiting_ci` tasks' PR commit checks and advances them to
/// `deploying` on success, `failed` on failure or timeout.
pub struct CiMonitor {
    store: Arc<dyn Store>,
    vcs: Arc<dyn VcsClient>,
    event_bus: EventBus,
    config: Arc<Config>,
}

impl CiMonitor {
    pub fn new(store: Arc<dyn Store>, vcs: Arc<dyn VcsClient>, event_bus: EventBus, config: Arc<Config>) -> Self {
        Self { store, vcs, event_bus, config }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.deploy_poll_interval_sec));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.poll_once().await {
                        tracing::error!(error = %err, "ci monitor poll failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn poll_once(&self) -> crate::domain::errors::DomainResult<()> {
        let tasks = self.store.awaiting_ci_tasks().await?;
        for task in tasks {
            if let Err(err) = self.poll_task(task).await {
                tracing::error!(error = %err, "ci monitor failed to poll task");
            }
        }
        Ok(())
    }

    async fn poll_task(&self, task: Task) -> crate::domain::errors::DomainResult<()> {
        let Some(pr_number) = task.pr_number else {
            tracing::warn!(issue_id = %task.issue_id, "task awaiting_ci has no pr_number, force-completing");
            return self.transition(task, TaskPhase::Failed).await;
        };

        if let Some(started) = task.ci_started_at {
            let elapsed = Utc::now().signed_duration_since(started);
            if elapsed.num_minutes() >= self.config.ci_timeout_min as i64 {
                tracing::warn!(issue_id = %task.issue_id, "ci check timed out");
                return self.transition(task, TaskPhase::Failed).await;
            }
        }

        match self.vcs.pr_check_status(&task.repo_path, pr_number).await {
            Ok(CheckStatus::Success) => self.transition_to_deploying(task).await,
            Ok(CheckStatus::Failure) => self.transition(task, TaskPhase::Failed).await,
            Ok(CheckStatus::Pending) => Ok(()),
            Err(err) => {
                tracing::warn!(issue_id = %task.issue_id, error = %err, "failed to poll pr check status, will retry next tick");
                Ok(())
            }
        }
    }

    async fn transition_to_deploying(&self, task: Task) -> crate::domain::errors::DomainResult<()> {
        let mut updated = task;
        updated.phase = TaskPhase::Deploying;
        updated.deploy_started_at = Some(Utc::now());
        updated.updated_at = Utc::now();
        self.store.update_task(&updated).await?;
        self.event_bus.publish(OrcaEvent::task_updated(&updated));
        Ok(())
    }

    async fn transition(&self, task: Task, phase: TaskPhase) -> crate::domain::errors::DomainResult<()> {
        let mut updated = task;
        updated.phase = phase;
        updated.updated_at = Utc::now();
        self.store.update_task(&updated).await?;
        self.event_bus.publish(OrcaEvent::task_updated(&updated));
        Ok(())
    }
}

/// Watches `deploying` tasks' deploy pipeline and advances them to `done`
/// on success, `failed` on failure or timeout.
pub struct DeployMonitor {
    store: Arc<dyn Store>,
    vcs: Arc<dyn VcsClient>,
    event_bus: EventBus,
    config: Arc<Config>,
}

impl DeployMonitor {
    pub fn new(store: Arc<dyn Store>, vcs: Arc<dyn VcsClient>, event_bus: EventBus, config: Arc<Config>) -> Self {
        Self { store, vcs, event_bus, config }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.deploy_poll_interval_sec));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.poll_once().await {
                        tracing::error!(error = %err, "deploy monitor poll failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn poll_once(&self) -> crate::domain::errors::DomainResult<()> {
        let tasks = self.store.deploying_tasks().await?;
        for task in tasks {
            if let Err(err) = self.poll_task(task).await {
                tracing::error!(error = %err, "deploy monitor failed to poll task");
            }
        }
        Ok(())
    }

    /// Missing merge SHA or deploy-start timestamp is a warning, and the
    /// task is force-completed rather than held indefinitely (§4.6).
    async fn poll_task(&self, task: Task) -> crate::domain::errors::DomainResult<()> {
        let (Some(commit_sha), Some(started)) = (task.merge_commit_sha.clone(), task.deploy_started_at) else {
            if task.merge_commit_sha.is_none() {
                if let Some(pr_number) = task.pr_number {
                    match self.vcs.merge_pull_request(&task.repo_path, pr_number).await {
                        Ok(sha) => {
                            let mut updated = task.clone();
                            updated.merge_commit_sha = Some(sha);
                            updated.updated_at = Utc::now();
                            self.store.update_task(&updated).await?;
                            return Ok(());
                        }
                        Err(err) => {
                            tracing::warn!(issue_id = %task.issue_id, error = %err, "failed to merge pull request, will retry next tick");
                            return Ok(());
                        }
                    }
                }
            }
            tracing::warn!(issue_id = %task.issue_id, "deploying task missing merge sha or deploy start timestamp, force-completing");
            return self.transition(task, TaskPhase::Done, true).await;
        };

        let elapsed = Utc::now().signed_duration_since(started);
        if elapsed.num_minutes() >= self.config.deploy_timeout_min as i64 {
            tracing::warn!(issue_id = %task.issue_id, "deploy timed out");
            return self.transition(task, TaskPhase::Failed, false).await;
        }

        match self.vcs.deployment_status(&task.repo_path, &commit_sha).await {
            Ok(DeployStatus::Success) => self.transition(task, TaskPhase::Done, true).await,
            Ok(DeployStatus::Failure) => self.transition(task, TaskPhase::Failed, false).await,
            Ok(DeployStatus::Pending) => Ok(()),
            Err(err) => {
                tracing::warn!(issue_id = %task.issue_id, error = %err, "failed to poll deployment status, will retry next tick");
                Ok(())
            }
        }
    }

    async fn transition(&self, task: Task, phase: TaskPhase, mark_done_at: bool) -> crate::domain::errors::DomainResult<()> {
        let mut updated = task;
        updated.phase = phase;
        updated.updated_at = Utc::now();
        if mark_done_at {
            updated.done_at = Some(Utc::now());
        }
        self.store.update_task(&updated).await?;
        self.event_bus.publish(OrcaEvent::task_updated(&updated));
        Ok(())
    }
}
