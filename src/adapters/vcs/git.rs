//! `git` (+ `gh`) backed implementation of [`VcsClient`].
//!
//! Every operation shells out to the `git` CLI against `repo_path`; PR
//! closing additionally shells out to the GitHub CLI (`gh`), filtered
//! client-side by the `orca/<issueId>-` branch prefix per §4.5.4.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::ports::vcs_client::{CheckStatus, DeployStatus};
use crate::domain::ports::VcsClient;

/// Concrete [`VcsClient`] over the `git` and `gh` CLIs.
#[derive(Debug, Clone, Default)]
pub struct GitVcsClient;

impl GitVcsClient {
    pub fn new() -> Self {
        Self
    }

    async fn branch_ref_exists(repo_path: &str, branch_name: &str) -> DomainResult<bool> {
        let status = Command::new("git")
            .current_dir(repo_path)
            .args(["show-ref", "--verify", "--quiet", &format!("refs/heads/{branch_name}")])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| DomainError::ExecutionFailed(format!("git show-ref failed: {e}")))?;
        Ok(status.success())
    }

    async fn is_valid_worktree(worktree_path: &str) -> bool {
        let path = Path::new(worktree_path);
        if !path.join(".git").is_file() {
            return false;
        }
        Command::new("git")
            .current_dir(worktree_path)
            .args(["rev-parse", "--git-dir"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }
}

#[async_trait]
impl VcsClient for GitVcsClient {
    async fn create_worktree(
        &self,
        repo_path: &str,
        worktree_path: &str,
        branch_name: &str,
    ) -> DomainResult<()> {
        if Path::new(worktree_path).exists() {
            if Self::is_valid_worktree(worktree_path).await {
                tracing::debug!(worktree_path, "reusing existing worktree");
                return Ok(());
            }
            tokio::fs::remove_dir_all(worktree_path).await.map_err(|e| {
                DomainError::ExecutionFailed(format!(
                    "failed to remove invalid worktree at {worktree_path}: {e}"
                ))
            })?;
        }

        if let Some(parent) = Path::new(worktree_path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    DomainError::ExecutionFailed(format!("failed to create worktree parent: {e}"))
                })?;
            }
        }

        let branch_exists = Self::branch_ref_exists(repo_path, branch_name).await?;
        let output = if branch_exists {
            Command::new("git")
                .current_dir(repo_path)
                .args(["worktree", "add", worktree_path, branch_name])
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output()
                .await
        } else {
            Command::new("git")
                .current_dir(repo_path)
                .args(["worktree", "add", "-b", branch_name, worktree_path])
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output()
                .await
        }
        .map_err(|e| DomainError::ExecutionFailed(format!("git worktree add failed to spawn: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DomainError::ExecutionFailed(format!(
                "git worktree add failed for branch {branch_name}: {stderr}"
            )));
        }
        Ok(())
    }

    async fn remove_worktree(&self, repo_path: &str, worktree_path: &str) -> DomainResult<()> {
        if !Path::new(worktree_path).exists() {
            return Ok(());
        }

        let output = Command::new("git")
            .current_dir(repo_path)
            .args(["worktree", "remove", worktree_path])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| DomainError::ExecutionFailed(format!("git worktree remove failed to spawn: {e}")))?;

        if output.status.success() {
            return Ok(());
        }

        tracing::warn!(
            worktree_path,
            stderr = %String::from_utf8_lossy(&output.stderr),
            "worktree remove failed, retrying with --force"
        );
        let forced = Command::new("git")
            .current_dir(repo_path)
            .args(["worktree", "remove", "--force", worktree_path])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| DomainError::ExecutionFailed(format!("git worktree remove --force failed to spawn: {e}")))?;

        if !forced.status.success() {
            let stderr = String::from_utf8_lossy(&forced.stderr);
            return Err(DomainError::ExecutionFailed(format!(
                "git worktree remove --force failed for {worktree_path}: {stderr}"
            )));
        }
        Ok(())
    }

    async fn branch_exists(&self, repo_path: &str, branch_name: &str) -> DomainResult<bool> {
        Self::branch_ref_exists(repo_path, branch_name).await
    }

    async fn close_pull_requests_with_prefix(
        &self,
        repo_path: &str,
        branch_prefix: &str,
    ) -> DomainResult<u32> {
        #[derive(Deserialize)]
        struct PrListEntry {
            number: u32,
            #[serde(rename = "headRefName")]
            head_ref_name: String,
        }

        let output = Command::new("gh")
            .current_dir(repo_path)
            .args(["pr", "list", "--state", "open", "--json", "number,headRefName"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| DomainError::ExecutionFailed(format!("gh pr list failed to spawn: {e}")))?;

        if !output.status.success() {
            return Err(DomainError::ExecutionFailed(format!(
                "gh pr list failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        let entries: Vec<PrListEntry> = serde_json::from_slice(&output.stdout)
            .map_err(|e| DomainError::ExecutionFailed(format!("gh pr list parse failed: {e}")))?;

        let mut closed = 0u32;
        for entry in entries {
            if !entry.head_ref_name.starts_with(branch_prefix) {
                continue;
            }
            let close = Command::new("gh")
                .current_dir(repo_path)
                .args(["pr", "close", &entry.number.to_string()])
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .output()
                .await
                .map_err(|e| DomainError::ExecutionFailed(format!("gh pr close failed to spawn: {e}")))?;
            if close.status.success() {
                closed += 1;
            } else {
                tracing::warn!(
                    pr_number = entry.number,
                    stderr = %String::from_utf8_lossy(&close.stderr),
                    "gh pr close failed"
                );
            }
        }
        Ok(closed)
    }

    async fn open_pull_request(
        &self,
        repo_path: &str,
        branch_name: &str,
        title: &str,
        body: &str,
    ) -> DomainResult<i64> {
        #[derive(Deserialize)]
        struct PrCreated {
            number: i64,
        }

        let output = Command::new("gh")
            .current_dir(repo_path)
            .args(["pr", "create", "--head", branch_name, "--title", title, "--body", body, "--json", "number"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| DomainError::ExecutionFailed(format!("gh pr create failed to spawn: {e}")))?;

        if !output.status.success() {
            return Err(DomainError::ExecutionFailed(format!(
                "gh pr create failed for branch {branch_name}: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        let created: PrCreated = serde_json::from_slice(&output.stdout)
            .map_err(|e| DomainError::ExecutionFailed(format!("gh pr create parse failed: {e}")))?;
        Ok(created.number)
    }

    async fn pr_check_status(&self, repo_path: &str, pr_number: i64) -> DomainResult<CheckStatus> {
        #[derive(Deserialize)]
        struct Rollup {
            state: Option<String>,
        }
        #[derive(Deserialize)]
        struct PrView {
            #[serde(rename = "statusCheckRollup")]
            status_check_rollup: Vec<Rollup>,
        }

        let output = Command::new("gh")
            .current_dir(repo_path)
            .args(["pr", "view", &pr_number.to_string(), "--json", "statusCheckRollup"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| DomainError::ExecutionFailed(format!("gh pr view failed to spawn: {e}")))?;

        if !output.status.success() {
            return Err(DomainError::ExecutionFailed(format!(
                "gh pr view failed for PR {pr_number}: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        let view: PrView = serde_json::from_slice(&output.stdout)
            .map_err(|e| DomainError::ExecutionFailed(format!("gh pr view parse failed: {e}")))?;

        if view.status_check_rollup.is_empty() {
            return Ok(CheckStatus::Pending);
        }
        let any_failed = view
            .status_check_rollup
            .iter()
            .any(|r| matches!(r.state.as_deref(), Some("FAILURE") | Some("ERROR")));
        if any_failed {
            return Ok(CheckStatus::Failure);
        }
        let all_success = view
            .status_check_rollup
            .iter()
            .all(|r| r.state.as_deref() == Some("SUCCESS"));
        Ok(if all_success { CheckStatus::Success } else { CheckStatus::Pending })
    }

    async fn merge_pull_request(&self, repo_path: &str, pr_number: i64) -> DomainResult<String> {
        let merge = Command::new("gh")
            .current_dir(repo_path)
            .args(["pr", "merge", &pr_number.to_string(), "--squash", "--delete-branch=false"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| DomainError::ExecutionFailed(format!("gh pr merge failed to spawn: {e}")))?;

        if !merge.status.success() {
            return Err(DomainError::ExecutionFailed(format!(
                "gh pr merge failed for PR {pr_number}: {}",
                String::from_utf8_lossy(&merge.stderr)
            )));
        }

        #[derive(Deserialize)]
        struct MergeCommit {
            oid: Option<String>,
        }
        #[derive(Deserialize)]
        struct PrView {
            #[serde(rename = "mergeCommit")]
            merge_commit: Option<MergeCommit>,
        }

        let view = Command::new("gh")
            .current_dir(repo_path)
            .args(["pr", "view", &pr_number.to_string(), "--json", "mergeCommit"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| DomainError::ExecutionFailed(format!("gh pr view (post-merge) failed to spawn: {e}")))?;

        if !view.status.success() {
            return Err(DomainError::ExecutionFailed(format!(
                "gh pr view (post-merge) failed for PR {pr_number}: {}",
                String::from_utf8_lossy(&view.stderr)
            )));
        }

        let parsed: PrView = serde_json::from_slice(&view.stdout)
            .map_err(|e| DomainError::ExecutionFailed(format!("gh pr view (post-merge) parse failed: {e}")))?;
        parsed
            .merge_commit
            .and_then(|c| c.oid)
            .ok_or_else(|| DomainError::ExecutionFailed(format!("PR {pr_number} merged but no merge commit SHA reported")))
    }

    async fn deployment_status(&self, repo_path: &str, commit_sha: &str) -> DomainResult<DeployStatus> {
        #[derive(Deserialize)]
        struct RunEntry {
            status: String,
            conclusion: Option<String>,
        }

        let output = Command::new("gh")
            .current_dir(repo_path)
            .args(["run", "list", "--commit", commit_sha, "--json", "status,conclusion", "-L", "1"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| DomainError::ExecutionFailed(format!("gh run list failed to spawn: {e}")))?;

        if !output.status.success() {
            return Err(DomainError::ExecutionFailed(format!(
                "gh run list failed for commit {commit_sha}: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        let runs: Vec<RunEntry> = serde_json::from_slice(&output.stdout)
            .map_err(|e| DomainError::ExecutionFailed(format!("gh run list parse failed: {e}")))?;

        let Some(run) = runs.into_iter().next() else {
            return Ok(DeployStatus::Pending);
        };
        if run.status != "completed" {
            return Ok(DeployStatus::Pending);
        }
        Ok(match run.conclusion.as_deref() {
            Some("success") => DeployStatus::Success,
            _ => DeployStatus::Failure,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::process::Command as TokioCommand;

    async fn init_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        let path = dir.path();
        for args in [
            vec!["init", "-q"],
            vec!["config", "user.email", "test@orca.dev"],
            vec!["config", "user.name", "orca-test"],
        ] {
            TokioCommand::new("git").current_dir(path).args(args).output().await.unwrap();
        }
        tokio::fs::write(path.join("README.md"), "orca").await.unwrap();
        TokioCommand::new("git")
            .current_dir(path)
            .args(["add", "."])
            .output()
            .await
            .unwrap();
        TokioCommand::new("git")
            .current_dir(path)
            .args(["commit", "-q", "-m", "init"])
            .output()
            .await
            .unwrap();
        dir
    }

    #[tokio::test]
    async fn create_worktree_creates_new_branch() {
        let repo = init_repo().await;
        let client = GitVcsClient::new();
        let worktree_path = repo.path().join("wt").to_string_lossy().to_string();

        client
            .create_worktree(
                repo.path().to_str().unwrap(),
                &worktree_path,
                "orca/A-1-inv-1",
            )
            .await
            .unwrap();

        assert!(Path::new(&worktree_path).join(".git").is_file());
        assert!(client
            .branch_exists(repo.path().to_str().unwrap(), "orca/A-1-inv-1")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn remove_worktree_is_a_no_op_when_missing() {
        let repo = init_repo().await;
        let client = GitVcsClient::new();
        client
            .remove_worktree(repo.path().to_str().unwrap(), "/does/not/exist")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn create_then_remove_worktree_round_trips() {
        let repo = init_repo().await;
        let client = GitVcsClient::new();
        let worktree_path = repo.path().join("wt2").to_string_lossy().to_string();

        client
            .create_worktree(repo.path().to_str().unwrap(), &worktree_path, "orca/A-2-inv-1")
            .await
            .unwrap();
        client
            .remove_worktree(repo.path().to_str().unwrap(), &worktree_path)
            .await
            .unwrap();
        assert!(!Path::new(&worktree_path).exists());
    }
}
