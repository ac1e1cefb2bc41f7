//! Domain ports (interfaces) for Orca.

pub mod agent_runner;
pub mod store;
pub mod tracker_client;
pub mod vcs_client;

pub use agent_runner::{
    AgentInvocationOutcome, AgentInvocationRequest, AgentResultKind, AgentSubstrate, CancelHandle,
};
pub use store::Store;
pub use tracker_client::TrackerClient;
pub use vcs_client::VcsClient;
