//! Port for the coding-agent child process.
//!
//! The "coding-agent CLI itself" and its stream-JSON schema are an external
//! collaborator per spec; this trait is the seam the Runner drives it
//! through, so the Runner's supervision logic (deadline, cancellation,
//! log tee) is testable against a fake substrate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::domain::errors::DomainResult;
use crate::domain::models::InvocationPhase;

/// Cooperative cancellation signal shared between the Scheduler's
/// active-handle registry and a running invocation. Cloning shares the same
/// underlying flag.
#[derive(Clone, Default)]
pub struct CancelHandle {
    canceled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel()` has been called. Resolves immediately if
    /// it already has been.
    pub async fn canceled(&self) {
        if self.is_canceled() {
            return;
        }
        self.notify.notified().await;
    }
}

/// Everything the Runner needs to drive one agent invocation.
pub struct AgentInvocationRequest {
    pub issue_id: String,
    pub phase: InvocationPhase,
    pub prompt: String,
    pub worktree_path: String,
    /// Present when resuming a prior session after a max-turns timeout.
    pub resume_session_id: Option<String>,
    pub model_override: Option<String>,
    pub max_turns: u32,
    pub disallowed_tools: Vec<String>,
    pub system_prompt: Option<String>,
    /// Destination for the newline-delimited JSON transcript.
    pub log_path: String,
    pub deadline: Duration,
    pub cancel: CancelHandle,
}

/// How the agent's terminal `result` line classified the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentResultKind {
    Success,
    MaxTurns,
    Error,
}

/// Outcome reported by the substrate once the child process has exited,
/// the deadline fired, or cancellation was observed.
#[derive(Debug, Clone)]
pub struct AgentInvocationOutcome {
    pub kind: AgentResultKind,
    pub session_id: Option<String>,
    pub cost_usd: Option<f64>,
    pub num_turns: Option<i64>,
    pub summary: Option<String>,
    /// `true` if the deadline elapsed (vs. the process exiting on its own
    /// with a max_turns subtype).
    pub deadline_exceeded: bool,
    /// `true` if the invocation's `CancelHandle` fired before the process
    /// exited on its own or the deadline elapsed.
    pub canceled: bool,
}

/// Port to the coding-agent subprocess.
#[async_trait]
pub trait AgentSubstrate: Send + Sync {
    /// Run one invocation end-to-end: spawn, stream-parse stdout while
    /// tee-ing to `request.log_path`, and resolve on process exit, deadline,
    /// or cancellation (whichever comes first).
    async fn run(&self, request: AgentInvocationRequest) -> DomainResult<AgentInvocationOutcome>;

    /// Cheap availability probe (e.g. `agent --version`), used at startup.
    async fn is_available(&self) -> bool;
}
