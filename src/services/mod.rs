//! Orchestration services: the Scheduler's admission/dispatch loop, the
//! Runner that drives one agent invocation, the SyncEngine that reconciles
//! state with the external tracker, the CI/Deploy monitors, the event bus
//! they all publish to, and the Supervisor that wires them together.

pub mod event_bus;
pub mod monitors;
pub mod runner;
pub mod scheduler;
pub mod supervisor;
pub mod sync_engine;

pub use event_bus::{EventBus, OrcaEvent};
pub use monitors::{CiMonitor, DeployMonitor};
pub use runner::Runner;
pub use scheduler::{Scheduler, SchedulerHandle};
pub use supervisor::Supervisor;
pub use sync_engine::SyncEngine;
