//! Scheduler (§4.3): the tick loop that admits ready tasks under the
//! concurrency cap and budget, dispatches them to the [`crate::services::runner::Runner`],
//! and resolves the resulting phase transition.
//!
//! Grounded in the teacher's `SwarmOrchestrator::run` main loop (status
//! check, per-tick work, sleep) and its `agent_semaphore`/active-handle
//! bookkeeping, generalized here to Orca's five-step admission algorithm
//! (§4.3) and its own transition table (§4.2) rather than the teacher's
//! goal/DAG decomposition model.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;

use crate::domain::errors::DomainResult;
use crate::domain::models::{Config, DeployStrategy, InvocationPhase, InvocationStatus, Task, TaskPhase};
use crate::domain::ports::{CancelHandle, Store, VcsClient};
use crate::services::event_bus::{EventBus, OrcaEvent};
use crate::services::runner::{parse_review_verdict, Runner, ReviewVerdict, RunOutcome};

/// Live run state for one in-flight invocation, kept so the Scheduler can
/// cancel it (shutdown, or a future explicit cancel endpoint) and so
/// `active_invocation_count` has a process-local mirror independent of the
/// store round-trip.
struct ActiveHandle {
    cancel: CancelHandle,
    join: JoinHandle<()>,
}

/// Registry of currently-running invocations, keyed by issue id. A task can
/// only ever have one active invocation at a time, so the issue id is a
/// sufficient key.
#[derive(Default)]
struct ActiveHandleRegistry {
    handles: Mutex<HashMap<String, ActiveHandle>>,
}

impl ActiveHandleRegistry {
    async fn insert(&self, issue_id: String, handle: ActiveHandle) {
        self.handles.lock().await.insert(issue_id, handle);
    }

    async fn remove(&self, issue_id: &str) {
        self.handles.lock().await.remove(issue_id);
    }

    async fn len(&self) -> usize {
        self.handles.lock().await.len()
    }

    /// Cancel the active invocation for one issue, if any. Used by
    /// SyncEngine's `resolveConflict` when an external state change
    /// (reset to Todo, or Canceled) invalidates the in-flight invocation.
    async fn cancel_one(&self, issue_id: &str) {
        if let Some(handle) = self.handles.lock().await.get(issue_id) {
            handle.cancel.cancel();
        }
    }

    /// Cancel every active invocation and wait for its driving task to
    /// observe the cancellation and exit. Used on graceful shutdown.
    async fn cancel_all(&self) {
        let mut handles = self.handles.lock().await;
        for (_, handle) in handles.iter() {
            handle.cancel.cancel();
        }
        for (_, handle) in handles.drain() {
            let _ = handle.join.await;
        }
    }
}

/// Handle for interacting with a running Scheduler from outside its tick
/// loop task (shutdown, and eventually a "wake now" signal from the API).
#[derive(Clone)]
pub struct SchedulerHandle {
    shutdown: Arc<tokio::sync::Notify>,
    registry: Arc<ActiveHandleRegistry>,
}

impl SchedulerHandle {
    /// Signal the Scheduler to stop admitting new work and wait for all
    /// active invocations to finish cancelling.
    pub async fn shutdown(&self) {
        self.shutdown.notify_waiters();
        self.registry.cancel_all().await;
    }

    pub async fn active_count(&self) -> usize {
        self.registry.len().await
    }

    /// Cancel the in-flight invocation for `issue_id`, if one is running.
    /// No-op if the task has no active invocation.
    pub async fn cancel_issue(&self, issue_id: &str) {
        self.registry.cancel_one(issue_id).await;
    }
}

/// The Scheduler owns the tick loop: every `scheduler_interval_sec`, admit
/// as many ready tasks as the concurrency cap and budget window allow, and
/// react to each invocation's terminal outcome by resolving the task's next
/// phase per §4.2's transition table.
pub struct Scheduler {
    store: Arc<dyn Store>,
    vcs: Arc<dyn VcsClient>,
    runner: Arc<Runner>,
    event_bus: EventBus,
    config: Arc<Config>,
    semaphore: Arc<Semaphore>,
    registry: Arc<ActiveHandleRegistry>,
    shutdown: Arc<tokio::sync::Notify>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Store>,
        vcs: Arc<dyn VcsClient>,
        runner: Arc<Runner>,
        event_bus: EventBus,
        config: Arc<Config>,
    ) -> (Self, SchedulerHandle) {
        let registry = Arc::new(ActiveHandleRegistry::default());
        let shutdown = Arc::new(tokio::sync::Notify::new());
        let scheduler = Self {
            store,
            vcs,
            runner,
            event_bus,
            semaphore: Arc::new(Semaphore::new(config.concurrency_cap as usize)),
            config,
            registry: registry.clone(),
            shutdown: shutdown.clone(),
        };
        let handle = SchedulerHandle { shutdown, registry };
        (scheduler, handle)
    }

    /// Run the tick loop until shutdown is signalled. Intended to be spawned
    /// as its own task by the Supervisor.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.scheduler_interval_sec));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.tick().await {
                        tracing::error!(error = %err, "scheduler tick failed");
                    }
                }
                _ = self.shutdown.notified() => {
                    tracing::info!("scheduler received shutdown signal, stopping admission");
                    break;
                }
            }
        }
    }

    /// Run a single admission pass outside the interval loop. Exposed for
    /// tests that need deterministic control over when a tick happens
    /// rather than waiting on `scheduler_interval_sec`.
    pub async fn tick_once(&self) -> DomainResult<()> {
        self.tick().await
    }

    /// One admission pass: the five steps of §4.3.
    async fn tick(&self) -> DomainResult<()> {
        // 1. How many admission slots remain under the concurrency cap.
        let active = self.store.active_invocation_count().await?;
        let cap = self.config.concurrency_cap;
        if active >= cap {
            return Ok(());
        }
        let mut available = (cap - active) as usize;

        // 2. Budget gate: stop admitting if the rolling window is exhausted.
        let window_start = chrono::Utc::now() - chrono::Duration::hours(self.config.budget_window_hours as i64);
        let spent = self.store.cost_in_window(window_start).await?;
        if spent >= self.config.budget_max_cost_usd {
            tracing::warn!(spent, cap = self.config.budget_max_cost_usd, "budget window exhausted, skipping admission");
            self.publish_status(active, spent).await;
            return Ok(());
        }

        // 3. Candidate tasks, already ordered (priority ASC, createdAt ASC)
        //    by the store selector.
        let candidates = self.store.ready_tasks().await?;

        // 4. Admit up to `available` candidates, CAS-guarded against
        //    double-dispatch from concurrent ticks or event-driven reentry.
        for task in candidates {
            if available == 0 {
                break;
            }
            if !task.is_dispatchable(self.config.max_review_cycles) {
                continue;
            }
            let transitioned = self
                .store
                .try_transition_phase(&task.issue_id, task.phase, TaskPhase::Dispatched)
                .await?;
            if !transitioned {
                continue;
            }
            available -= 1;
            self.admit(task).await;
        }

        // 5. Publish a status snapshot for observers (§6 SSE `status` topic).
        self.publish_status(active, spent).await;
        Ok(())
    }

    async fn publish_status(&self, active: u32, spent: f64) {
        self.event_bus.publish(OrcaEvent::StatusUpdated {
            active_invocations: active,
            cost_in_window_usd: spent,
            at: chrono::Utc::now(),
        });
    }

    /// Spawn the invocation for `task` as a background task and register it
    /// so it can be cancelled on shutdown.
    async fn admit(&self, task: Task) {
        let phase = match task.phase {
            TaskPhase::ChangesRequested => InvocationPhase::Fix,
            TaskPhase::InReview => InvocationPhase::Review,
            _ => InvocationPhase::Implement,
        };

        let permit = match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                // Cap already reflected in step 1; this would only happen
                // under a racing tick, so just skip this task this round.
                tracing::debug!(issue_id = %task.issue_id, "no semaphore permit available this tick");
                let _ = self
                    .store
                    .try_transition_phase(&task.issue_id, TaskPhase::Dispatched, task.phase)
                    .await;
                return;
            }
        };

        let cancel = CancelHandle::new();
        let issue_id = task.issue_id.clone();

        if let Err(err) = self
            .store
            .try_transition_phase(&task.issue_id, TaskPhase::Dispatched, TaskPhase::Running)
            .await
        {
            tracing::error!(issue_id = %issue_id, error = %err, "failed to mark task running after admission");
            return;
        }
        self.event_bus.publish(OrcaEvent::task_updated(&Task {
            phase: TaskPhase::Running,
            ..task.clone()
        }));

        let runner = self.runner.clone();
        let store = self.store.clone();
        let vcs = self.vcs.clone();
        let event_bus = self.event_bus.clone();
        let config = self.config.clone();
        let registry = self.registry.clone();
        let cancel_for_task = cancel.clone();

        let join = tokio::spawn(async move {
            let _permit = permit;
            let outcome = runner.execute(&task, phase, cancel_for_task).await;
            resolve_outcome(&store, &vcs, &event_bus, &config, &task, phase, outcome).await;
            registry.remove(&task.issue_id).await;
        });

        self.registry.insert(issue_id, ActiveHandle { cancel, join }).await;
    }
}

/// Resolve the next task phase per §4.2's transition table, given the
/// Runner's outcome for one invocation.
async fn resolve_outcome(
    store: &Arc<dyn Store>,
    vcs: &Arc<dyn VcsClient>,
    event_bus: &EventBus,
    config: &Arc<Config>,
    task: &Task,
    phase: InvocationPhase,
    outcome: DomainResult<RunOutcome>,
) {
    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(err) => {
            tracing::error!(issue_id = %task.issue_id, error = %err, "runner execution failed before producing an outcome");
            mark_failed(store, event_bus, task, &err.to_string()).await;
            return;
        }
    };

    event_bus.publish(OrcaEvent::InvocationCompleted {
        issue_id: task.issue_id.clone(),
        invocation_id: outcome.invocation_id,
        status: invocation_status_label(outcome.status).to_string(),
        at: chrono::Utc::now(),
    });

    match outcome.status {
        InvocationStatus::Completed => complete(store, vcs, event_bus, config, task, phase, &outcome).await,
        InvocationStatus::TimedOut => timed_out(store, event_bus, config, task).await,
        InvocationStatus::Failed => retry_or_fail(store, event_bus, config, task).await,
        InvocationStatus::Running => {
            tracing::error!(issue_id = %task.issue_id, "runner returned a non-terminal status, treating as failed");
            mark_failed(store, event_bus, task, "invocation ended in a non-terminal status").await;
        }
    }
}

fn invocation_status_label(status: InvocationStatus) -> &'static str {
    status.as_str()
}

/// Successful invocation: Implement/Fix -> InReview, which re-enters the
/// normal priority/createdAt-ordered admission queue on the next tick like
/// any other dispatchable phase (§4.3 step 3); Review -> approved means
/// AwaitingCi or Done depending on deploy strategy, changes-requested means
/// back to fix.
async fn complete(
    store: &Arc<dyn Store>,
    vcs: &Arc<dyn VcsClient>,
    event_bus: &EventBus,
    config: &Arc<Config>,
    task: &Task,
    phase: InvocationPhase,
    outcome: &RunOutcome,
) {
    match phase {
        InvocationPhase::Implement | InvocationPhase::Fix => {
            let mut updated = task.clone();
            updated.phase = TaskPhase::InReview;
            updated.pr_branch_name = outcome.branch_name.clone().or(updated.pr_branch_name);
            updated.updated_at = chrono::Utc::now();

            if updated.pr_number.is_none() {
                if let Some(branch) = &updated.pr_branch_name {
                    match vcs
                        .open_pull_request(
                            &task.repo_path,
                            branch,
                            &format!("Orca: {}", task.issue_id),
                            outcome.summary.as_deref().unwrap_or(""),
                        )
                        .await
                    {
                        Ok(pr_number) => updated.pr_number = Some(pr_number),
                        Err(err) => {
                            tracing::warn!(issue_id = %task.issue_id, error = %err, "failed to open pull request, leaving task in review for manual follow-up");
                        }
                    }
                }
            }

            if let Err(err) = store.update_task(&updated).await {
                tracing::error!(issue_id = %task.issue_id, error = %err, "failed to persist in_review transition");
                return;
            }
            event_bus.publish(OrcaEvent::task_updated(&updated));
        }
        InvocationPhase::Review => {
            let verdict = parse_review_verdict(outcome.summary.as_deref());
            let mut updated = task.clone();
            updated.updated_at = chrono::Utc::now();
            match verdict {
                ReviewVerdict::Approved => {
                    if config.deploy_strategy == DeployStrategy::None {
                        updated.phase = TaskPhase::Done;
                        updated.done_at = Some(chrono::Utc::now());
                    } else {
                        updated.phase = TaskPhase::AwaitingCi;
                        updated.ci_started_at = Some(chrono::Utc::now());
                    }
                }
                ReviewVerdict::ChangesRequested => {
                    updated.phase = TaskPhase::ChangesRequested;
                    updated.review_cycle_count += 1;
                    if updated.review_cycle_count >= config.max_review_cycles {
                        updated.phase = TaskPhase::Failed;
                    }
                }
            }
            if let Err(err) = store.update_task(&updated).await {
                tracing::error!(issue_id = %task.issue_id, error = %err, "failed to persist review verdict transition");
                return;
            }
            event_bus.publish(OrcaEvent::task_updated(&updated));
        }
    }
}

/// Timed-out (max-turns) invocation: per §4.2, Implement/Fix resume
/// eligible invocations move back to `Ready`/`ChangesRequested` respectively
/// for a fresh dispatch that will pick up the resumable session; anything
/// past the retry budget fails the task.
async fn timed_out(store: &Arc<dyn Store>, event_bus: &EventBus, config: &Arc<Config>, task: &Task) {
    let mut updated = task.clone();
    updated.updated_at = chrono::Utc::now();
    if config.resume_on_max_turns && updated.retry_count < config.max_retries {
        updated.retry_count += 1;
        // No PR yet means this was an Implement run; a PR already open
        // means it was a Fix run, which should resume straight back into
        // Fix rather than re-running Implement from scratch.
        updated.phase = if task.pr_branch_name.is_some() {
            TaskPhase::ChangesRequested
        } else {
            TaskPhase::Ready
        };
    } else {
        updated.phase = TaskPhase::Failed;
    }
    if let Err(err) = store.update_task(&updated).await {
        tracing::error!(issue_id = %task.issue_id, error = %err, "failed to persist max-turns transition");
        return;
    }
    event_bus.publish(OrcaEvent::task_updated(&updated));
}

/// Generic failure: retry up to `max_retries`, otherwise fail the task.
async fn retry_or_fail(store: &Arc<dyn Store>, event_bus: &EventBus, config: &Arc<Config>, task: &Task) {
    let mut updated = task.clone();
    updated.updated_at = chrono::Utc::now();
    if updated.retry_count < config.max_retries {
        updated.retry_count += 1;
        updated.phase = if task.pr_branch_name.is_some() {
            TaskPhase::ChangesRequested
        } else {
            TaskPhase::Ready
        };
    } else {
        updated.phase = TaskPhase::Failed;
    }
    if let Err(err) = store.update_task(&updated).await {
        tracing::error!(issue_id = %task.issue_id, error = %err, "failed to persist failure transition");
        return;
    }
    event_bus.publish(OrcaEvent::task_updated(&updated));
}

async fn mark_failed(store: &Arc<dyn Store>, event_bus: &EventBus, task: &Task, reason: &str) {
    let mut updated = task.clone();
    updated.phase = TaskPhase::Failed;
    updated.updated_at = chrono::Utc::now();
    if let Err(err) = store.update_task(&updated).await {
        tracing::error!(issue_id = %task.issue_id, error = %err, reason, "failed to persist forced-failure transition");
        return;
    }
    event_bus.publish(OrcaEvent::task_updated(&updated));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invocation_status_label_matches_as_str() {
        assert_eq!(invocation_status_label(InvocationStatus::Completed), "completed");
        assert_eq!(invocation_status_label(InvocationStatus::Failed), "failed");
    }
}
