//! Port for the source-control wrapper (worktree + PR plumbing).
//!
//! Out of scope per §1: this is an external collaborator, specified as an
//! interface only. The concrete adapter wraps `git`/`gh`; no deep behavioral
//! contract is tested beyond "the CLI command ran and its result was parsed".

use async_trait::async_trait;

use crate::domain::errors::DomainResult;

/// Outcome of polling a PR's commit checks (CIMonitor).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Pending,
    Success,
    Failure,
}

/// Outcome of polling a deployment run for a merged commit (DeployMonitor).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployStatus {
    Pending,
    Success,
    Failure,
}

/// Thin interface over the VCS operations the Runner, Scheduler, and Monitors
/// need. Every method is a wrapper around the `git` CLI (or host-provider CLI
/// for PR/CI/deploy operations) run against `repo_path`.
#[async_trait]
pub trait VcsClient: Send + Sync {
    /// Create a worktree at `worktree_path` on a new branch `branch_name`
    /// (or reuse an existing worktree if `worktree_path` already exists and
    /// is valid).
    async fn create_worktree(
        &self,
        repo_path: &str,
        worktree_path: &str,
        branch_name: &str,
    ) -> DomainResult<()>;

    /// Remove a worktree and its branch. Used on successful invocation
    /// completion; failed invocations preserve their worktree for
    /// inspection, so this is only called in the success path.
    async fn remove_worktree(&self, repo_path: &str, worktree_path: &str) -> DomainResult<()>;

    async fn branch_exists(&self, repo_path: &str, branch_name: &str) -> DomainResult<bool>;

    /// Close all open pull requests whose branch name starts with
    /// `branch_prefix` (the `orca/<issueId>-` convention). Fire-and-forget
    /// from the caller's perspective; errors are returned here but callers
    /// log-and-continue rather than propagate.
    async fn close_pull_requests_with_prefix(
        &self,
        repo_path: &str,
        branch_prefix: &str,
    ) -> DomainResult<u32>;

    /// Open a pull request for `branch_name` against the repo's default
    /// branch. Returns the assigned PR number.
    async fn open_pull_request(
        &self,
        repo_path: &str,
        branch_name: &str,
        title: &str,
        body: &str,
    ) -> DomainResult<i64>;

    /// Poll the commit-check status of an open PR (CIMonitor).
    async fn pr_check_status(&self, repo_path: &str, pr_number: i64) -> DomainResult<CheckStatus>;

    /// Merge an approved, CI-green PR. Returns the merge commit SHA.
    async fn merge_pull_request(&self, repo_path: &str, pr_number: i64) -> DomainResult<String>;

    /// Poll the deployment run associated with a merged commit
    /// (DeployMonitor, `deployStrategy = github_actions`).
    async fn deployment_status(&self, repo_path: &str, commit_sha: &str) -> DomainResult<DeployStatus>;
}
