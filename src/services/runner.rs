//! Runner (§4.4): executes one agent invocation end-to-end inside a
//! disposable worktree and records its terminal outcome.
//!
//! Grounded in the teacher's `ClaudeCodeSubstrate::execute` for the
//! spawn/deadline/cleanup shape, generalized here to the worktree-per-
//! invocation model and delegated to [`crate::adapters::agent::ProcessAgentSubstrate`]
//! for the actual subprocess supervision (the three-way exit/deadline/cancel
//! race lives there; the Runner's job is everything around it: worktree
//! lifecycle, invocation bookkeeping, and classification).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::domain::errors::DomainResult;
use crate::domain::models::{BudgetEvent, Config, Invocation, InvocationPhase, InvocationStatus, Task};
use crate::domain::ports::{AgentInvocationRequest, AgentSubstrate, CancelHandle, Store, VcsClient};
use crate::services::event_bus::{EventBus, OrcaEvent};

/// What the Runner produced, handed back to the Scheduler to resolve the
/// next task phase.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub invocation_id: i64,
    pub phase: InvocationPhase,
    pub status: InvocationStatus,
    pub session_id: Option<String>,
    pub branch_name: Option<String>,
    pub worktree_path: Option<String>,
    pub summary: Option<String>,
}

pub struct Runner {
    agent: Arc<dyn AgentSubstrate>,
    vcs: Arc<dyn VcsClient>,
    store: Arc<dyn Store>,
    config: Arc<Config>,
    event_bus: EventBus,
}

impl Runner {
    pub fn new(
        agent: Arc<dyn AgentSubstrate>,
        vcs: Arc<dyn VcsClient>,
        store: Arc<dyn Store>,
        config: Arc<Config>,
        event_bus: EventBus,
    ) -> Self {
        Self {
            agent,
            vcs,
            store,
            config,
            event_bus,
        }
    }

    fn system_prompt_for(&self, phase: InvocationPhase) -> Option<String> {
        match phase {
            InvocationPhase::Implement => self.config.implement_system_prompt.clone(),
            InvocationPhase::Review => self.config.review_system_prompt.clone(),
            InvocationPhase::Fix => self.config.fix_system_prompt.clone(),
        }
    }

    fn max_turns_for(&self, phase: InvocationPhase) -> u32 {
        match phase {
            InvocationPhase::Review => self.config.review_max_turns,
            InvocationPhase::Implement | InvocationPhase::Fix => self.config.default_max_turns,
        }
    }

    fn prompt_for(&self, task: &Task, phase: InvocationPhase) -> String {
        match phase {
            InvocationPhase::Implement => task.agent_prompt.clone(),
            InvocationPhase::Fix => format!(
                "Address the review feedback on branch {} and update the existing pull request.\n\n{}",
                task.pr_branch_name.as_deref().unwrap_or("(unknown)"),
                task.agent_prompt
            ),
            InvocationPhase::Review => format!(
                "Review the changes on branch {}. State clearly whether you APPROVE or request CHANGES, and why.\n\nOriginal task:\n{}",
                task.pr_branch_name.as_deref().unwrap_or("(unknown)"),
                task.agent_prompt
            ),
        }
    }

    /// Execute one invocation for `task` in `phase`. If `phase = Implement`
    /// and a resumable prior invocation exists, reuses its worktree, branch,
    /// and session id instead of creating a fresh worktree (step 1 of §4.4).
    pub async fn execute(&self, task: &Task, phase: InvocationPhase, cancel: CancelHandle) -> DomainResult<RunOutcome> {
        let resumable = if phase == InvocationPhase::Implement {
            self.store.last_resumable_invocation(&task.issue_id).await?
        } else {
            None
        };

        let (branch_name, worktree_path, resume_session_id) = if let Some(prior) = &resumable {
            (
                prior.branch_name.clone(),
                prior.worktree_path.clone(),
                prior.session_id.clone(),
            )
        } else {
            let existing = self.store.list_invocations_for_task(&task.issue_id).await?;
            let seq = existing.len() as u64 + 1;
            let branch = task.branch_name_for_invocation(seq);
            let worktree = format!("{}-wt-{}-{seq}", task.repo_path.trim_end_matches('/'), task.issue_id);
            self.vcs.create_worktree(&task.repo_path, &worktree, &branch).await?;
            (Some(branch), Some(worktree), None)
        };

        let now = Utc::now();
        let log_path = worktree_path
            .as_deref()
            .map(|w| format!("{w}.log.jsonl"))
            .unwrap_or_else(|| format!("/tmp/orca-{}-{}.log.jsonl", task.issue_id, now.timestamp_millis()));

        let invocation = Invocation::new_running(
            task.issue_id.clone(),
            phase,
            branch_name.clone(),
            worktree_path.clone(),
            resume_session_id.clone(),
            None,
            Some(log_path.clone()),
            now,
        );
        let invocation_id = self.store.insert_invocation(&invocation).await?;
        self.event_bus.publish(OrcaEvent::InvocationStarted {
            issue_id: task.issue_id.clone(),
            invocation_id,
            at: now,
        });

        let worktree_path_str = worktree_path.clone().unwrap_or_else(|| task.repo_path.clone());
        let request = AgentInvocationRequest {
            issue_id: task.issue_id.clone(),
            phase,
            prompt: self.prompt_for(task, phase),
            worktree_path: worktree_path_str,
            resume_session_id,
            model_override: None,
            max_turns: self.max_turns_for(phase),
            disallowed_tools: self.config.disallowed_tools.clone(),
            system_prompt: self.system_prompt_for(phase),
            log_path,
            deadline: Duration::from_secs(self.config.session_timeout_min * 60),
            cancel,
        };

        let outcome = self.agent.run(request).await?;

        let status = classify_status(&outcome);
        let ended_at = Some(Utc::now());
        let summary = outcome
            .summary
            .clone()
            .or_else(|| outcome.canceled.then(|| crate::domain::models::CANCELED_SUMMARY.to_string()))
            .or_else(|| outcome.deadline_exceeded.then(|| crate::domain::models::MAX_TURNS_SUMMARY.to_string()));

        let mut terminal = invocation;
        terminal.id = Some(invocation_id);
        terminal.status = status;
        terminal.ended_at = ended_at;
        terminal.cost_usd = outcome.cost_usd;
        terminal.num_turns = outcome.num_turns;
        terminal.output_summary = summary.clone();
        terminal.session_id = outcome.session_id.clone().or(terminal.session_id);

        let budget_event = outcome
            .cost_usd
            .map(|cost| BudgetEvent::new(invocation_id, cost, Utc::now()));
        self.store.complete_invocation(&terminal, budget_event.as_ref()).await?;

        if status == InvocationStatus::Completed {
            if let Some(worktree) = &worktree_path {
                if let Err(err) = self.vcs.remove_worktree(&task.repo_path, worktree).await {
                    tracing::warn!(issue_id = %task.issue_id, worktree, error = %err, "failed to clean up worktree after successful invocation");
                }
            }
        }

        Ok(RunOutcome {
            invocation_id,
            phase,
            status,
            session_id: terminal.session_id,
            branch_name: terminal.branch_name,
            worktree_path: terminal.worktree_path,
            summary,
        })
    }
}

fn classify_status(outcome: &crate::domain::ports::AgentInvocationOutcome) -> InvocationStatus {
    use crate::domain::ports::AgentResultKind;
    if outcome.canceled {
        return InvocationStatus::Failed;
    }
    if outcome.deadline_exceeded {
        return InvocationStatus::TimedOut;
    }
    match outcome.kind {
        AgentResultKind::Success => InvocationStatus::Completed,
        AgentResultKind::MaxTurns => InvocationStatus::TimedOut,
        AgentResultKind::Error => InvocationStatus::Failed,
    }
}

/// Review verdict parsed from a review invocation's summary text. The agent
/// stream protocol carries no structured approve/reject field (§9 "dynamic
/// typing of the inbound event payload"), so this is a conservative
/// keyword scan: ambiguous or missing summaries default to
/// `ChangesRequested` rather than silently approving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewVerdict {
    Approved,
    ChangesRequested,
}

pub fn parse_review_verdict(summary: Option<&str>) -> ReviewVerdict {
    let Some(summary) = summary else {
        return ReviewVerdict::ChangesRequested;
    };
    let lower = summary.to_lowercase();
    if lower.contains("approve") && !lower.contains("not approve") && !lower.contains("cannot approve") {
        ReviewVerdict::Approved
    } else {
        ReviewVerdict::ChangesRequested
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_defaults_to_changes_requested_when_ambiguous() {
        assert_eq!(parse_review_verdict(None), ReviewVerdict::ChangesRequested);
        assert_eq!(parse_review_verdict(Some("looks fine, minor nit")), ReviewVerdict::ChangesRequested);
    }

    #[test]
    fn verdict_detects_approval_keyword() {
        assert_eq!(parse_review_verdict(Some("I approve these changes.")), ReviewVerdict::Approved);
    }

    #[test]
    fn verdict_detects_negated_approval() {
        assert_eq!(
            parse_review_verdict(Some("I cannot approve this, please fix the tests.")),
            ReviewVerdict::ChangesRequested
        );
    }
}
