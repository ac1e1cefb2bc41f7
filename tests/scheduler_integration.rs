//! Crate-root integration coverage for the Scheduler's admission and
//! cancellation behavior (spec.md §8: concurrency cap, cancel cascades),
//! driven against a real `SqliteStore` with a fake `AgentSubstrate` and
//! `VcsClient` standing in for the external collaborators.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use orca::adapters::sqlite::{create_migrated_test_pool, SqliteStore};
use orca::domain::errors::DomainResult;
use orca::domain::models::{Config, Task, TaskPhase};
use orca::domain::ports::agent_runner::{
    AgentInvocationOutcome, AgentInvocationRequest, AgentResultKind, AgentSubstrate,
};
use orca::domain::ports::vcs_client::{CheckStatus, DeployStatus};
use orca::domain::ports::{Store, VcsClient};
use orca::services::event_bus::EventBus;
use orca::services::runner::Runner;
use orca::services::scheduler::Scheduler;

/// No-op VCS: worktrees are never touched on disk, PRs are tracked purely
/// in memory so the prefix-filtered close could be asserted against.
#[derive(Default)]
struct FakeVcsClient {
    open_prs: Mutex<HashMap<i64, String>>,
    next_pr: AtomicUsize,
}

#[async_trait]
impl VcsClient for FakeVcsClient {
    async fn create_worktree(&self, _repo_path: &str, _worktree_path: &str, _branch_name: &str) -> DomainResult<()> {
        Ok(())
    }

    async fn remove_worktree(&self, _repo_path: &str, _worktree_path: &str) -> DomainResult<()> {
        Ok(())
    }

    async fn branch_exists(&self, _repo_path: &str, _branch_name: &str) -> DomainResult<bool> {
        Ok(false)
    }

    async fn close_pull_requests_with_prefix(&self, _repo_path: &str, branch_prefix: &str) -> DomainResult<u32> {
        let mut prs = self.open_prs.lock().await;
        let before = prs.len();
        prs.retain(|_, branch| !branch.starts_with(branch_prefix));
        Ok((before - prs.len()) as u32)
    }

    async fn open_pull_request(&self, _repo_path: &str, branch_name: &str, _title: &str, _body: &str) -> DomainResult<i64> {
        let pr_number = self.next_pr.fetch_add(1, Ordering::SeqCst) as i64 + 1;
        self.open_prs.lock().await.insert(pr_number, branch_name.to_string());
        Ok(pr_number)
    }

    async fn pr_check_status(&self, _repo_path: &str, _pr_number: i64) -> DomainResult<CheckStatus> {
        Ok(CheckStatus::Pending)
    }

    async fn merge_pull_request(&self, _repo_path: &str, _pr_number: i64) -> DomainResult<String> {
        Ok("deadbeef".to_string())
    }

    async fn deployment_status(&self, _repo_path: &str, _commit_sha: &str) -> DomainResult<DeployStatus> {
        Ok(DeployStatus::Pending)
    }
}

/// Agent substrate whose `run()` blocks until explicitly released (or
/// observes cancellation first), so tests can hold an invocation open to
/// probe concurrency and cancellation without a real subprocess.
#[derive(Default)]
struct FakeAgentSubstrate {
    running: AtomicUsize,
    max_concurrent: AtomicUsize,
    gates: Mutex<HashMap<String, Arc<Notify>>>,
}

impl FakeAgentSubstrate {
    async fn gate_for(&self, issue_id: &str) -> Arc<Notify> {
        let mut gates = self.gates.lock().await;
        gates
            .entry(issue_id.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Release a previously-blocked invocation so it completes successfully.
    async fn release(&self, issue_id: &str) {
        self.gate_for(issue_id).await.notify_one();
    }

    fn max_concurrent_seen(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentSubstrate for FakeAgentSubstrate {
    async fn run(&self, request: AgentInvocationRequest) -> DomainResult<AgentInvocationOutcome> {
        let current = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(current, Ordering::SeqCst);

        let gate = self.gate_for(&request.issue_id).await;
        let outcome = tokio::select! {
            () = gate.notified() => {
                AgentInvocationOutcome {
                    kind: AgentResultKind::Success,
                    session_id: Some(format!("sess-{}", request.issue_id)),
                    cost_usd: Some(0.1),
                    num_turns: Some(1),
                    summary: Some("approve, looks good".to_string()),
                    deadline_exceeded: false,
                    canceled: false,
                }
            }
            () = request.cancel.canceled() => {
                AgentInvocationOutcome {
                    kind: AgentResultKind::Error,
                    session_id: None,
                    cost_usd: None,
                    num_turns: None,
                    summary: None,
                    deadline_exceeded: false,
                    canceled: true,
                }
            }
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(outcome)
    }

    async fn is_available(&self) -> bool {
        true
    }
}

fn test_config(concurrency_cap: u32) -> Config {
    Config {
        concurrency_cap,
        scheduler_interval_sec: 1,
        ..Config::default()
    }
}

fn sample_task(issue_id: &str, priority: u8) -> Task {
    Task::new_synced(issue_id, "do the thing", "/tmp/repo", priority, true, false, chrono::Utc::now())
}

async fn wait_until<F, Fut>(mut predicate: F, timeout: Duration)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    loop {
        if predicate().await {
            return;
        }
        assert!(start.elapsed() < timeout, "condition did not become true in time");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn concurrency_cap_limits_admission_and_frees_up_on_completion() {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::new(create_migrated_test_pool().await.unwrap()));
    let vcs: Arc<dyn VcsClient> = Arc::new(FakeVcsClient::default());
    let agent = Arc::new(FakeAgentSubstrate::default());
    let event_bus = EventBus::new();
    let config = Arc::new(test_config(2));

    let runner = Arc::new(Runner::new(agent.clone(), vcs.clone(), store.clone(), config.clone(), event_bus.clone()));
    let (scheduler, handle) = Scheduler::new(store.clone(), vcs, runner, event_bus, config);

    // A-3 carries the highest priority (lowest number) so it is the one
    // picked up once a slot frees, regardless of which task's InReview
    // continuation also becomes dispatchable at the same time.
    store.insert_task(&sample_task("A-1", 1)).await.unwrap();
    store.insert_task(&sample_task("A-2", 1)).await.unwrap();
    store.insert_task(&sample_task("A-3", 0)).await.unwrap();

    scheduler.tick_once().await.unwrap();

    wait_until(|| async { store.active_invocation_count().await.unwrap() == 2 }, Duration::from_secs(2)).await;
    assert_eq!(handle.active_count().await, 2);

    let a3 = store.get_task("A-3").await.unwrap().unwrap();
    assert_eq!(a3.phase, TaskPhase::Ready, "third task stays queued while cap is full");

    // Cap is full: a second tick must not push active invocations over 2.
    scheduler.tick_once().await.unwrap();
    assert!(store.active_invocation_count().await.unwrap() <= 2);

    // Complete A-1 successfully, freeing a slot.
    agent.release("A-1").await;
    wait_until(|| async { handle.active_count().await < 2 }, Duration::from_secs(2)).await;

    scheduler.tick_once().await.unwrap();
    wait_until(
        || async { store.get_task("A-3").await.unwrap().unwrap().phase != TaskPhase::Ready },
        Duration::from_secs(2),
    )
    .await;

    let a3 = store.get_task("A-3").await.unwrap().unwrap();
    assert_ne!(a3.phase, TaskPhase::Ready, "freed capacity admits the next-highest-priority task");
    assert!(agent.max_concurrent_seen() <= 2, "concurrency cap was never exceeded");

    agent.release("A-2").await;
    agent.release("A-3").await;
    handle.shutdown().await;
}

#[tokio::test]
async fn cancel_marks_invocation_failed_with_canceled_summary() {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::new(create_migrated_test_pool().await.unwrap()));
    let vcs: Arc<dyn VcsClient> = Arc::new(FakeVcsClient::default());
    let agent = Arc::new(FakeAgentSubstrate::default());
    let event_bus = EventBus::new();
    let config = Arc::new(test_config(2));

    let runner = Arc::new(Runner::new(agent.clone(), vcs.clone(), store.clone(), config.clone(), event_bus.clone()));
    let (scheduler, handle) = Scheduler::new(store.clone(), vcs, runner, event_bus, config);

    store.insert_task(&sample_task("EMI-95", 1)).await.unwrap();

    scheduler.tick_once().await.unwrap();
    wait_until(|| async { handle.active_count().await == 1 }, Duration::from_secs(2)).await;

    handle.cancel_issue("EMI-95").await;

    wait_until(|| async { handle.active_count().await == 0 }, Duration::from_secs(2)).await;

    let invocations = store.list_invocations_for_task("EMI-95").await.unwrap();
    let terminal = invocations.last().expect("invocation row recorded");
    assert_eq!(terminal.status.as_str(), "failed");
    assert_eq!(terminal.output_summary.as_deref(), Some("canceled"));
}
