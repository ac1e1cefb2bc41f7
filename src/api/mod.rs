//! HTTP/SSE API surface (§6.2): a thin axum router over the same
//! Store/EventBus/Scheduler/SyncEngine collaborators the CLI and Supervisor
//! use. Grounded in the teacher's own `axum`-based MCP HTTP servers for the
//! router/handler/state shape, with the handler set narrowed to the six
//! endpoints plus the webhook sink the spec actually calls for.

pub mod error;
pub mod handlers;
pub mod state;
pub mod webhook;

pub use state::AppState;

use axum::routing::{get, post};
use axum::Router;

/// Build the full router. `AppState` is cloned into every handler by axum's
/// `State` extractor, so the caller holds the only long-lived copy.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/tasks", get(handlers::list_tasks))
        .route("/api/tasks/:id", get(handlers::get_task))
        .route("/api/tasks/:id/status", post(handlers::update_task_status))
        .route("/api/sync", post(handlers::trigger_sync))
        .route("/api/status", get(handlers::get_status))
        .route("/api/events", get(handlers::sse_events))
        .route("/webhook", post(handlers::webhook))
        .with_state(state)
}
