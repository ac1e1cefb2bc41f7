//! Route handlers for the HTTP/SSE API (§6.2).

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::api::error::ApiError;
use crate::api::state::AppState;
use crate::api::webhook::verify_signature;
use crate::domain::models::{Invocation, Task, TaskPhase, WebhookEvent};

#[derive(Serialize)]
pub struct TaskWithInvocations {
    #[serde(flatten)]
    pub task: Task,
    pub invocations: Vec<Invocation>,
}

pub async fn list_tasks(State(state): State<AppState>) -> Result<Json<Vec<Task>>, ApiError> {
    let mut tasks = state.store.list_tasks().await?;
    tasks.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.created_at.cmp(&b.created_at)));
    Ok(Json(tasks))
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(issue_id): Path<String>,
) -> Result<Json<TaskWithInvocations>, ApiError> {
    let task = state
        .store
        .get_task(&issue_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("task not found: {issue_id}")))?;
    let invocations = state.store.list_invocations_for_task(&issue_id).await?;
    Ok(Json(TaskWithInvocations { task, invocations }))
}

#[derive(Deserialize)]
pub struct UpdateStatusBody {
    pub status: String,
}

/// The three statuses an operator may force a task into directly. Anything
/// else is a 400, matching §6.2's enumerated `status` values.
fn parse_forceable_status(raw: &str) -> Option<TaskPhase> {
    match raw {
        "ready" => Some(TaskPhase::Ready),
        "backlog" => Some(TaskPhase::Backlog),
        "done" => Some(TaskPhase::Done),
        _ => None,
    }
}

pub async fn update_task_status(
    State(state): State<AppState>,
    Path(issue_id): Path<String>,
    Json(body): Json<UpdateStatusBody>,
) -> Result<Json<Task>, ApiError> {
    let new_phase = parse_forceable_status(&body.status)
        .ok_or_else(|| ApiError::BadRequest(format!("unsupported status: {}", body.status)))?;

    let mut task = state
        .store
        .get_task(&issue_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("task not found: {issue_id}")))?;

    if !task.phase.can_transition_to(new_phase) {
        return Err(ApiError::Conflict(format!(
            "cannot move task {issue_id} from {} to {}",
            task.phase.as_str(),
            new_phase.as_str()
        )));
    }

    let now = Utc::now();
    task.phase = new_phase;
    task.updated_at = now;
    match new_phase {
        TaskPhase::Ready | TaskPhase::Backlog => {
            task.retry_count = 0;
            task.review_cycle_count = 0;
        }
        TaskPhase::Done => {
            task.done_at = Some(now);
        }
        _ => {}
    }

    state.store.update_task(&task).await?;
    state
        .event_bus
        .publish(crate::services::event_bus::OrcaEvent::task_updated(&task));
    Ok(Json(task))
}

#[derive(Serialize)]
pub struct SyncResult {
    pub synced: u32,
}

pub async fn trigger_sync(State(state): State<AppState>) -> Result<Json<SyncResult>, ApiError> {
    let synced = state.sync_engine.full_sync().await?;
    Ok(Json(SyncResult { synced }))
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub active_sessions: u32,
    pub queued_tasks: usize,
    pub cost_in_window: f64,
    pub budget_limit: f64,
    pub budget_window_hours: u64,
    pub concurrency_cap: u32,
    pub active_task_ids: Vec<String>,
}

pub async fn get_status(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    let active_sessions = state.store.active_invocation_count().await?;
    let ready = state.store.ready_tasks().await?;
    let since = Utc::now() - chrono::Duration::hours(state.config.budget_window_hours as i64);
    let cost_in_window = state.store.cost_in_window(since).await?;

    let all_tasks = state.store.list_tasks().await?;
    let active_task_ids = all_tasks
        .into_iter()
        .filter(|t| matches!(t.phase, TaskPhase::Dispatched | TaskPhase::Running))
        .map(|t| t.issue_id)
        .collect();

    Ok(Json(StatusResponse {
        active_sessions,
        queued_tasks: ready.len(),
        cost_in_window,
        budget_limit: state.config.budget_max_cost_usd,
        budget_window_hours: state.config.budget_window_hours,
        concurrency_cap: state.config.concurrency_cap,
        active_task_ids,
    }))
}

pub async fn sse_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.event_bus.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|msg| match msg {
        Ok(event) => {
            let data = serde_json::to_string(&event).unwrap_or_default();
            Some(Ok(Event::default().event(event.topic()).data(data)))
        }
        Err(tokio_stream::wrappers::errors::BroadcastStreamRecvError::Lagged(skipped)) => {
            tracing::warn!(skipped, "sse subscriber lagged, some events were dropped");
            None
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

/// Verifies the `X-Tracker-Signature` header against the raw body before
/// parsing, then hands the event to `SyncEngine`'s webhook worker (§4.5.2).
/// Returns 401 on a missing/invalid signature, 400 on a malformed body, 202
/// once the event is queued (processing itself is asynchronous).
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let secret = state
        .config
        .tracker_webhook_secret
        .as_deref()
        .ok_or_else(|| ApiError::Internal(crate::domain::errors::DomainError::ValidationFailed(
            "tracker_webhook_secret is not configured".to_string(),
        )))?;

    let signature = headers
        .get("x-tracker-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("missing X-Tracker-Signature header".to_string()))?;

    if !verify_signature(secret, &body, signature) {
        return Err(ApiError::BadRequest("invalid webhook signature".to_string()));
    }

    let event: WebhookEvent = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("malformed webhook payload: {e}")))?;

    state
        .webhook_tx
        .send(event)
        .await
        .map_err(|_| ApiError::Internal(crate::domain::errors::DomainError::ExecutionFailed(
            "webhook queue is closed".to_string(),
        )))?;

    Ok((StatusCode::ACCEPTED, Json(json!({ "queued": true }))))
}
