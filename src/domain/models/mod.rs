//! Domain models
//!
//! Pure domain entities with business logic and validation rules.
//! These models are framework-agnostic and contain no infrastructure concerns.

pub mod budget_event;
pub mod config;
pub mod invocation;
pub mod task;
pub mod tracker;

pub use budget_event::BudgetEvent;
pub use config::{Config, DeployStrategy};
pub use invocation::{
    Invocation, InvocationPhase, InvocationStatus, CANCELED_SUMMARY, MAX_TURNS_SUMMARY,
};
pub use task::{Task, TaskPhase};
pub use tracker::{
    EgressAction, EgressResult, ExpectedChange, ExternalIssue, WebhookAction, WebhookEvent,
    WorkflowStateCatalog,
};
