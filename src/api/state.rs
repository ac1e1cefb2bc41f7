//! Shared handler state (the teacher's `AppState` shape, narrowed to Orca's
//! four collaborators).

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::domain::models::{Config, WebhookEvent};
use crate::domain::ports::Store;
use crate::services::event_bus::EventBus;
use crate::services::scheduler::SchedulerHandle;
use crate::services::sync_engine::SyncEngine;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub event_bus: EventBus,
    pub scheduler: SchedulerHandle,
    pub sync_engine: Arc<SyncEngine>,
    pub webhook_tx: mpsc::Sender<WebhookEvent>,
    pub config: Arc<Config>,
}
