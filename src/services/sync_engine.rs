//! SyncEngine (§4.5): reconciles Orca's task queue with the external
//! tracker. Three entry points: [`SyncEngine::full_sync`], webhook ingestion
//! via [`SyncEngine::spawn_webhook_worker`], and [`SyncEngine::write_back`].
//!
//! Grounded in the teacher's ingestion/egress split
//! (`domain::ports::{IngestionAdapter, EgressAdapter}` elsewhere in the
//! corpus) collapsed, per [`crate::domain::ports::tracker_client::TrackerClient`]'s
//! own doc comment, into a single tracker collaborator; the expected-change
//! suppression set and per-worker webhook draining follow the teacher's
//! `EventScheduler`'s single-worker-drains-a-queue shape.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::{mpsc, Mutex};

use crate::domain::errors::DomainResult;
use crate::domain::models::{
    Config, EgressAction, ExpectedChange, ExternalIssue, Task, TaskPhase, WebhookAction,
    WebhookEvent, WorkflowStateCatalog,
};
use crate::domain::ports::{Store, TrackerClient, VcsClient};
use crate::infrastructure::logging::AuditLogger;
use crate::services::event_bus::{EventBus, OrcaEvent};
use crate::services::scheduler::SchedulerHandle;

/// How long a write-back's expected-change suppression entry survives
/// before an inbound webhook for the same `(issue_id, state)` pair is
/// treated as a genuine, independently-originated change.
const EXPECTED_CHANGE_TTL_SECS: i64 = 60;

/// Bound on the webhook ingestion queue; a burst larger than this applies
/// backpressure to the API handler rather than growing unbounded.
const WEBHOOK_QUEUE_CAPACITY: usize = 256;

pub struct SyncEngine {
    tracker: Arc<dyn TrackerClient>,
    vcs: Arc<dyn VcsClient>,
    store: Arc<dyn Store>,
    event_bus: EventBus,
    config: Arc<Config>,
    scheduler: SchedulerHandle,
    audit: AuditLogger,
    expected_changes: Mutex<Vec<ExpectedChange>>,
}

impl SyncEngine {
    pub fn new(
        tracker: Arc<dyn TrackerClient>,
        vcs: Arc<dyn VcsClient>,
        store: Arc<dyn Store>,
        event_bus: EventBus,
        config: Arc<Config>,
        scheduler: SchedulerHandle,
        audit: AuditLogger,
    ) -> Self {
        Self {
            tracker,
            vcs,
            store,
            event_bus,
            config,
            scheduler,
            audit,
            expected_changes: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the single worker that drains the webhook queue in arrival
    /// order, preserving per-issue ordering (and, as a simplification,
    /// global ordering across issues too — the spec only requires the
    /// former). Returns the sender side the API layer clones into its
    /// webhook handler.
    pub fn spawn_webhook_worker(self: Arc<Self>) -> mpsc::Sender<WebhookEvent> {
        let (tx, mut rx) = mpsc::channel::<WebhookEvent>(WEBHOOK_QUEUE_CAPACITY);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(err) = self.handle_webhook(event).await {
                    tracing::error!(error = %err, "failed to process webhook event");
                }
            }
        });
        tx
    }

    /// Subscribe to the EventBus and push every `TaskUpdated` phase back to
    /// the tracker. This is how the control flow in §4 ("SyncEngine,
    /// reacting to the same events, writes phase back to the tracker")
    /// is wired: the Scheduler and Monitors only ever touch the Store and
    /// the bus, never the tracker directly.
    pub fn spawn_write_back_listener(self: Arc<Self>) {
        let mut receiver = self.event_bus.subscribe();
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(OrcaEvent::TaskUpdated { issue_id, .. }) => {
                        if let Err(err) = self.write_back(&issue_id).await {
                            tracing::warn!(issue_id = %issue_id, error = %err, "write-back failed");
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "write-back listener lagged, some task updates were not mirrored");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    // -- fullSync (§4.5.1) -------------------------------------------------

    /// Sync every configured project's issues into the local task queue and
    /// roll up parent statuses. Returns the number of issues synced.
    pub async fn full_sync(&self) -> DomainResult<u32> {
        let mut synced = 0u32;
        for project_id in &self.config.tracker_project_ids {
            let (issues, catalog) = self.tracker.fetch_issues(project_id).await?;
            for issue in &issues {
                self.upsert_task(issue, &catalog).await?;
                synced += 1;
            }
        }
        self.evaluate_parent_statuses(None).await?;
        Ok(synced)
    }

    /// Seed a single task from the tracker by issue id, searching every
    /// configured project (the CLI's `add <issue-id>` entry point, which
    /// knows nothing about which project the issue lives in). Returns
    /// whether a matching issue was found.
    pub async fn sync_one(&self, issue_id: &str) -> DomainResult<bool> {
        for project_id in &self.config.tracker_project_ids {
            let (issues, catalog) = self.tracker.fetch_issues(project_id).await?;
            if let Some(issue) = issues.iter().find(|i| i.external_id == issue_id) {
                self.upsert_task(issue, &catalog).await?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Classify a freshly-synced issue's initial phase from its tracker
    /// workflow state, honoring any blocking parent/dependency.
    fn initial_phase(&self, issue: &ExternalIssue, catalog: &WorkflowStateCatalog, blocked: bool) -> TaskPhase {
        let state_type = catalog.state_type_of(&issue.state_name).unwrap_or(&issue.state_type);
        if is_completed_state_type(state_type) {
            TaskPhase::Done
        } else if is_canceled_state_type(state_type) {
            TaskPhase::Failed
        } else if state_type == self.config.tracker_ready_state_type && !blocked {
            TaskPhase::Ready
        } else {
            TaskPhase::Backlog
        }
    }

    /// Whether `issue` is blocked from being ready by a non-terminal parent
    /// or blocking issue. Orca's `Task` model carries no persisted
    /// dependency graph (see DESIGN.md); this recomputes blocking status
    /// transiently against the Store on every sync pass instead.
    async fn is_blocked(&self, issue: &ExternalIssue) -> DomainResult<bool> {
        if let Some(parent_id) = &issue.parent_external_id {
            if let Some(parent) = self.store.get_task(parent_id).await? {
                if !parent.phase.is_terminal() {
                    return Ok(true);
                }
            }
        }
        for blocker_id in &issue.blocking_external_ids {
            if let Some(blocker) = self.store.get_task(blocker_id).await? {
                if !blocker.phase.is_terminal() {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Insert a brand-new task, or update the tracker-owned fields of an
    /// existing one. Fields Orca owns (phase beyond the initial
    /// classification, retry counters, PR/deploy bookkeeping) are left
    /// untouched here; only `resolveConflict` (webhook path) may move
    /// `phase`.
    async fn upsert_task(&self, issue: &ExternalIssue, catalog: &WorkflowStateCatalog) -> DomainResult<()> {
        let existing = self.store.get_task(&issue.external_id).await?;
        let repo_path = self.repo_path_for(&issue.project_id);

        match existing {
            None => {
                let blocked = self.is_blocked(issue).await?;
                let mut task = Task::new_synced(
                    issue.external_id.clone(),
                    prompt_for_issue(issue),
                    repo_path,
                    issue.priority.unwrap_or(2),
                    false,
                    blocked,
                    Utc::now(),
                );
                task.phase = self.initial_phase(issue, catalog, blocked);
                if task.phase == TaskPhase::Done {
                    task.done_at = Some(Utc::now());
                }
                task.project_name = Some(issue.project_id.clone());
                task.parent_identifier = issue.parent_external_id.clone();
                self.store.insert_task(&task).await?;
                self.event_bus.publish(OrcaEvent::task_updated(&task));
            }
            Some(mut task) => {
                task.agent_prompt = prompt_for_issue(issue);
                task.priority = issue.priority.unwrap_or(task.priority).min(4);
                task.project_name = Some(issue.project_id.clone());
                task.parent_identifier = issue.parent_external_id.clone();
                task.updated_at = Utc::now();
                self.store.update_task(&task).await?;
            }
        }
        Ok(())
    }

    fn repo_path_for(&self, project_id: &str) -> String {
        self.config
            .project_repo_map
            .get(project_id)
            .cloned()
            .unwrap_or_else(|| project_id.to_string())
    }

    // -- Webhook ingestion (§4.5.2) -----------------------------------------

    async fn handle_webhook(&self, event: WebhookEvent) -> DomainResult<()> {
        if !event.is_issue_event() {
            tracing::debug!(entity_type = %event.entity_type, "ignoring non-issue webhook event");
            return Ok(());
        }

        let result = match event.action {
            WebhookAction::Remove => self.handle_remove(&event).await,
            WebhookAction::Create => self.handle_create(&event).await,
            WebhookAction::Update => self.handle_update(&event).await,
        };

        let action = match event.action {
            WebhookAction::Remove => "webhook_remove",
            WebhookAction::Create => "webhook_create",
            WebhookAction::Update => "webhook_update",
        };
        if let Err(err) = self
            .audit
            .log_operation(action, "tracker", None, result.is_ok(), None)
            .await
        {
            tracing::warn!(error = %err, "failed to write audit log entry for webhook event");
        }

        result
    }

    async fn handle_create(&self, event: &WebhookEvent) -> DomainResult<()> {
        let issue: ExternalIssue = serde_json::from_value(event.data.clone())?;
        if self.store.get_task(&issue.external_id).await?.is_some() {
            return Ok(());
        }
        let catalog = WorkflowStateCatalog::default();
        self.upsert_task(&issue, &catalog).await
    }

    async fn handle_update(&self, event: &WebhookEvent) -> DomainResult<()> {
        let issue: ExternalIssue = serde_json::from_value(event.data.clone())?;

        if self.consume_expected_change(&issue.external_id, &issue.state_name).await {
            tracing::debug!(issue_id = %issue.external_id, state = %issue.state_name, "suppressing self-originated webhook");
            return Ok(());
        }

        if let Some(task) = self.store.get_task(&issue.external_id).await? {
            self.resolve_conflict(&task, &issue).await?;
        }

        let catalog = WorkflowStateCatalog::default();
        self.upsert_task(&issue, &catalog).await
    }

    async fn handle_remove(&self, event: &WebhookEvent) -> DomainResult<()> {
        #[derive(serde::Deserialize)]
        struct IdOnly {
            external_id: String,
        }
        let IdOnly { external_id } = serde_json::from_value(event.data.clone())?;

        let Some(task) = self.store.get_task(&external_id).await? else {
            return Ok(());
        };
        self.store.delete_task(&external_id).await?;
        let branch_prefix = format!("orca/{external_id}-");
        if let Err(err) = self
            .vcs
            .close_pull_requests_with_prefix(&task.repo_path, &branch_prefix)
            .await
        {
            tracing::warn!(issue_id = %external_id, error = %err, "failed to close pull requests for removed task");
        }
        self.scheduler.cancel_issue(&external_id).await;
        Ok(())
    }

    /// §4.5.4's explicit state-divergence table. `issue.state_name` and
    /// `issue.state_type` are the tracker's reported external state; omitted
    /// rows fall through with no mutation.
    async fn resolve_conflict(&self, task: &Task, issue: &ExternalIssue) -> DomainResult<()> {
        let state_type = issue.state_type.as_str();
        let state_name = issue.state_name.as_str();

        let resolution = match (task.phase, state_name, state_type) {
            (TaskPhase::Deploying, "In Review", _) => None,
            (TaskPhase::Deploying, "Todo", _) => Some((TaskPhase::Ready, false)),
            (TaskPhase::Deploying, _, t) if is_completed_state_type(t) => Some((TaskPhase::Done, false)),
            (TaskPhase::Deploying, _, t) if is_canceled_state_type(t) => Some((TaskPhase::Failed, true)),
            (_, _, t) if is_canceled_state_type(t) => Some((TaskPhase::Failed, true)),
            (_, _, t) if is_completed_state_type(t) => Some((TaskPhase::Done, false)),
            (TaskPhase::Running, "Todo", _) | (TaskPhase::Dispatched, "Todo", _) => Some((TaskPhase::Ready, true)),
            (TaskPhase::Running, "In Review", _) | (TaskPhase::InReview, "In Review", _) => None,
            (TaskPhase::InReview, _, t) if is_completed_state_type(t) => Some((TaskPhase::Done, false)),
            _ => None,
        };

        let Some((new_phase, cancel_active)) = resolution else {
            return Ok(());
        };
        if !task.phase.can_transition_to(new_phase) {
            return Ok(());
        }

        if cancel_active {
            self.scheduler.cancel_issue(&task.issue_id).await;
        }

        let mut updated = task.clone();
        updated.phase = new_phase;
        updated.updated_at = Utc::now();
        if new_phase == TaskPhase::Done {
            updated.done_at = Some(Utc::now());
        }
        self.store.update_task(&updated).await?;
        self.event_bus.publish(OrcaEvent::task_updated(&updated));

        if new_phase == TaskPhase::Failed {
            let branch_prefix = format!("orca/{}-", task.issue_id);
            if let Err(err) = self.vcs.close_pull_requests_with_prefix(&task.repo_path, &branch_prefix).await {
                tracing::warn!(issue_id = %task.issue_id, error = %err, "failed to close pull requests after conflict resolution");
            }
        }

        Ok(())
    }

    // -- writeBack (§4.5.3) -------------------------------------------------

    /// Map `phase` to a tracker workflow state and push it. Transient
    /// Orca-internal phases (`Dispatched`, `AwaitingCi`, `Deploying`) are
    /// never mirrored. Registers a suppression entry on every real write so
    /// the resulting webhook echo doesn't get reprocessed.
    pub async fn write_back(&self, issue_id: &str) -> DomainResult<()> {
        let Some(task) = self.store.get_task(issue_id).await? else {
            return Ok(());
        };
        let Some(state_name) = state_for_phase(task.phase) else {
            return Ok(());
        };
        self.tracker
            .execute(&EgressAction::UpdateState {
                external_id: issue_id.to_string(),
                new_state_name: state_name.to_string(),
            })
            .await?;
        self.register_expected_change(issue_id.to_string(), state_name.to_string())
            .await;
        Ok(())
    }

    async fn register_expected_change(&self, issue_id: String, target_state_name: String) {
        let mut guard = self.expected_changes.lock().await;
        guard.retain(|e| !e.is_expired(Utc::now()));
        guard.push(ExpectedChange {
            issue_id,
            target_state_name,
            expires_at: Utc::now() + ChronoDuration::seconds(EXPECTED_CHANGE_TTL_SECS),
        });
    }

    /// Consume (remove) a matching expected-change entry, returning whether
    /// one was found. Expired entries are pruned opportunistically.
    async fn consume_expected_change(&self, issue_id: &str, target_state_name: &str) -> bool {
        let mut guard = self.expected_changes.lock().await;
        let now = Utc::now();
        guard.retain(|e| !e.is_expired(now));
        if let Some(pos) = guard.iter().position(|e| e.matches(issue_id, target_state_name)) {
            guard.remove(pos);
            true
        } else {
            false
        }
    }

    // -- evaluateParentStatuses (§4.5.5) ------------------------------------

    /// Roll up child completion into parent phase. When `scope` is
    /// provided, only those parent issue ids are re-evaluated (used after a
    /// single child's transition rather than a full pass).
    pub async fn evaluate_parent_statuses(&self, scope: Option<&[String]>) -> DomainResult<()> {
        let parents = match scope {
            Some(ids) => {
                let mut out = Vec::with_capacity(ids.len());
                for id in ids {
                    if let Some(task) = self.store.get_task(id).await? {
                        if task.is_parent {
                            out.push(task);
                        }
                    }
                }
                out
            }
            None => self.store.parent_tasks().await?,
        };

        for parent in parents {
            let children = self.store.children_of(&parent.issue_id).await?;
            if children.is_empty() {
                continue;
            }

            let all_done = children.iter().all(|c| c.phase == TaskPhase::Done);
            let any_active = children
                .iter()
                .any(|c| !c.phase.is_terminal() && c.phase != TaskPhase::Ready);

            let mut updated = parent.clone();
            if all_done && parent.phase != TaskPhase::Done {
                updated.phase = TaskPhase::Done;
                updated.done_at = Some(Utc::now());
            } else if any_active && matches!(parent.phase, TaskPhase::Ready | TaskPhase::Backlog) {
                updated.phase = TaskPhase::Running;
            } else {
                continue;
            }

            updated.updated_at = Utc::now();
            self.store.update_task(&updated).await?;
            self.event_bus.publish(OrcaEvent::task_updated(&updated));
            if updated.phase == TaskPhase::Done {
                if let Err(err) = self.write_back(&updated.issue_id).await {
                    tracing::warn!(issue_id = %updated.issue_id, error = %err, "failed to write back parent roll-up");
                }
            }
        }
        Ok(())
    }
}

fn is_completed_state_type(state_type: &str) -> bool {
    state_type.eq_ignore_ascii_case("completed") || state_type.eq_ignore_ascii_case("done")
}

fn is_canceled_state_type(state_type: &str) -> bool {
    state_type.eq_ignore_ascii_case("canceled") || state_type.eq_ignore_ascii_case("cancelled")
}

fn prompt_for_issue(issue: &ExternalIssue) -> String {
    if issue.description.is_empty() {
        issue.title.clone()
    } else {
        format!("{}\n\n{}", issue.title, issue.description)
    }
}

/// `stateMap`: Orca phase -> tracker workflow state name. `None` marks a
/// transient, Orca-internal phase that is never mirrored back.
fn state_for_phase(phase: TaskPhase) -> Option<&'static str> {
    match phase {
        TaskPhase::Backlog => None,
        TaskPhase::Ready => Some("Todo"),
        TaskPhase::Dispatched => None,
        TaskPhase::Running => Some("In Progress"),
        TaskPhase::InReview => Some("In Review"),
        TaskPhase::ChangesRequested => Some("In Review"),
        TaskPhase::AwaitingCi => None,
        TaskPhase::Deploying => None,
        TaskPhase::Done => Some("Done"),
        TaskPhase::Failed => Some("Canceled"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_map_omits_transient_phases() {
        assert_eq!(state_for_phase(TaskPhase::Dispatched), None);
        assert_eq!(state_for_phase(TaskPhase::AwaitingCi), None);
        assert_eq!(state_for_phase(TaskPhase::Deploying), None);
    }

    #[test]
    fn state_map_mirrors_stable_phases() {
        assert_eq!(state_for_phase(TaskPhase::Ready), Some("Todo"));
        assert_eq!(state_for_phase(TaskPhase::Done), Some("Done"));
        assert_eq!(state_for_phase(TaskPhase::Failed), Some("Canceled"));
    }

    #[test]
    fn completed_and_canceled_state_types_are_case_insensitive() {
        assert!(is_completed_state_type("Completed"));
        assert!(is_canceled_state_type("Cancelled"));
        assert!(!is_completed_state_type("started"));
    }

    #[test]
    fn prompt_falls_back_to_title_when_description_empty() {
        let issue = ExternalIssue {
            external_id: "A-1".into(),
            title: "Fix the thing".into(),
            description: String::new(),
            state_name: "Todo".into(),
            state_type: "unstarted".into(),
            priority: Some(1),
            project_id: "proj".into(),
            parent_external_id: None,
            blocking_external_ids: Vec::new(),
            updated_at: Utc::now(),
        };
        assert_eq!(prompt_for_issue(&issue), "Fix the thing");
    }
}
