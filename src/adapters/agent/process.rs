//! Process-backed implementation of [`AgentSubstrate`].
//!
//! Spawns the coding-agent CLI with stream-JSON output and drains stdout
//! continuously: each line is tee'd to `log_path` and parsed for the
//! newest `system` line's `session_id` and the terminal `result` line.
//! Supervision is a three-way race between process exit, the session
//! deadline, and external cancellation (§4.4, §5).

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::Mutex;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::ports::agent_runner::{
    AgentInvocationOutcome, AgentInvocationRequest, AgentResultKind, AgentSubstrate,
};

/// Grace period between SIGTERM and SIGKILL on deadline/cancel.
const TERM_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Default, Deserialize)]
struct StreamLine {
    #[serde(rename = "type")]
    line_type: Option<String>,
    session_id: Option<String>,
    subtype: Option<String>,
    total_cost_usd: Option<f64>,
    num_turns: Option<i64>,
    result: Option<String>,
}

#[derive(Debug, Default)]
struct ParsedState {
    session_id: Option<String>,
    kind: Option<AgentResultKind>,
    cost_usd: Option<f64>,
    num_turns: Option<i64>,
    summary: Option<String>,
}

fn classify_subtype(subtype: &str) -> AgentResultKind {
    match subtype {
        "success" => AgentResultKind::Success,
        "max_turns" | "error_max_turns" => AgentResultKind::MaxTurns,
        _ => AgentResultKind::Error,
    }
}

/// Concrete [`AgentSubstrate`] shelling out to the configured agent CLI.
pub struct ProcessAgentSubstrate {
    agent_path: String,
}

impl ProcessAgentSubstrate {
    pub fn new(agent_path: impl Into<String>) -> Self {
        Self {
            agent_path: agent_path.into(),
        }
    }

    fn build_command(&self, request: &AgentInvocationRequest) -> Command {
        let mut cmd = Command::new(&self.agent_path);
        cmd.current_dir(&request.worktree_path);
        cmd.arg("--print");
        cmd.arg("--output-format").arg("stream-json").arg("--verbose");
        cmd.arg("--max-turns").arg(request.max_turns.to_string());

        if let Some(session_id) = &request.resume_session_id {
            cmd.arg("--resume").arg(session_id);
        }
        if let Some(model) = &request.model_override {
            cmd.arg("--model").arg(model);
        }
        if let Some(system_prompt) = &request.system_prompt {
            cmd.arg("--append-system-prompt").arg(system_prompt);
        }
        if !request.disallowed_tools.is_empty() {
            cmd.arg("--disallowedTools").arg(request.disallowed_tools.join(","));
        }

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        cmd
    }

    /// Drain stdout line-by-line: tee to `log_path`, fold each line into
    /// `state`. Runs concurrently with the exit/deadline/cancel race so
    /// reading never blocks on, or is blocked by, that supervision.
    async fn drain_stdout(stdout: ChildStdout, log_path: String, state: Arc<Mutex<ParsedState>>) {
        let mut reader = BufReader::new(stdout).lines();

        let mut log_file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(file) => Some(file),
            Err(e) => {
                tracing::warn!(log_path, error = %e, "failed to open invocation log path");
                None
            }
        };

        loop {
            let line = match reader.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read agent stdout");
                    break;
                }
            };

            if let Some(file) = log_file.as_mut() {
                let _ = file.write_all(line.as_bytes()).await;
                let _ = file.write_all(b"\n").await;
            }

            let Ok(parsed) = serde_json::from_str::<StreamLine>(&line) else {
                continue; // unknown/malformed line: log-and-skip
            };

            let mut state = state.lock().await;
            match parsed.line_type.as_deref() {
                Some("system") => {
                    if let Some(session_id) = parsed.session_id {
                        state.session_id = Some(session_id);
                    }
                }
                Some("result") => {
                    if let Some(session_id) = parsed.session_id {
                        state.session_id = Some(session_id);
                    }
                    state.kind = parsed.subtype.as_deref().map(classify_subtype);
                    state.cost_usd = parsed.total_cost_usd;
                    state.num_turns = parsed.num_turns;
                    state.summary = parsed.result;
                }
                _ => {}
            }
        }
    }

    async fn terminate(child: &mut Child) {
        if let Some(id) = child.id() {
            let pid = Pid::from_raw(id as i32);
            let _ = kill(pid, Signal::SIGTERM);
            if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_err() {
                let _ = kill(pid, Signal::SIGKILL);
                let _ = child.wait().await;
            }
        } else {
            let _ = child.kill().await;
        }
    }
}

#[async_trait]
impl AgentSubstrate for ProcessAgentSubstrate {
    async fn run(&self, request: AgentInvocationRequest) -> DomainResult<AgentInvocationOutcome> {
        let mut cmd = self.build_command(&request);
        let mut child = cmd
            .spawn()
            .map_err(|e| DomainError::ExecutionFailed(format!("failed to spawn agent process: {e}")))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| DomainError::ExecutionFailed("agent process has no stdin".to_string()))?;
        stdin
            .write_all(request.prompt.as_bytes())
            .await
            .map_err(|e| DomainError::ExecutionFailed(format!("failed to write agent prompt: {e}")))?;
        drop(stdin);

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DomainError::ExecutionFailed("agent process has no stdout".to_string()))?;

        let state = Arc::new(Mutex::new(ParsedState::default()));
        let drain_handle = tokio::spawn(Self::drain_stdout(stdout, request.log_path.clone(), state.clone()));

        let deadline_exceeded;
        let canceled;
        tokio::select! {
            exit = child.wait() => {
                deadline_exceeded = false;
                canceled = false;
                exit.map_err(|e| DomainError::ExecutionFailed(format!("failed to wait for agent process: {e}")))?;
            }
            () = tokio::time::sleep(request.deadline) => {
                deadline_exceeded = true;
                canceled = false;
                Self::terminate(&mut child).await;
            }
            () = request.cancel.canceled() => {
                deadline_exceeded = false;
                canceled = true;
                Self::terminate(&mut child).await;
            }
        }

        // stdout closes with the (now-dead) child; give the drain task a
        // bounded moment to flush the final lines before reading state.
        let _ = tokio::time::timeout(Duration::from_secs(5), drain_handle).await;

        let final_state = state.lock().await;
        let kind = if deadline_exceeded {
            AgentResultKind::MaxTurns
        } else {
            final_state.kind.unwrap_or(AgentResultKind::Error)
        };
        Ok(AgentInvocationOutcome {
            kind,
            session_id: final_state.session_id.clone(),
            cost_usd: final_state.cost_usd,
            num_turns: final_state.num_turns,
            summary: final_state.summary.clone(),
            deadline_exceeded,
            canceled,
        })
    }

    async fn is_available(&self) -> bool {
        Command::new(&self.agent_path)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::agent_runner::CancelHandle;
    use std::io::Write as _;

    fn request_with(tmp: &tempfile::TempDir, deadline: Duration) -> AgentInvocationRequest {
        AgentInvocationRequest {
            issue_id: "T-1".to_string(),
            phase: crate::domain::models::InvocationPhase::Implement,
            prompt: "do the thing".to_string(),
            worktree_path: tmp.path().to_string_lossy().to_string(),
            resume_session_id: None,
            model_override: None,
            max_turns: 10,
            disallowed_tools: vec![],
            system_prompt: None,
            log_path: tmp.path().join("invocation.log").to_string_lossy().to_string(),
            deadline,
            cancel: CancelHandle::default(),
        }
    }

    fn fake_agent_script(tmp: &tempfile::TempDir, body: &str) -> String {
        let path = tmp.path().join("fake-agent.sh");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh").unwrap();
        writeln!(file, "{body}").unwrap();
        drop(file);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path.to_string_lossy().to_string()
    }

    #[tokio::test]
    async fn run_parses_terminal_result_line() {
        let tmp = tempfile::TempDir::new().unwrap();
        let script = fake_agent_script(
            &tmp,
            r#"cat >/dev/null
echo '{"type":"system","session_id":"sess-1"}'
echo '{"type":"result","subtype":"success","total_cost_usd":0.42,"num_turns":3,"result":"done"}'
"#,
        );
        let substrate = ProcessAgentSubstrate::new(script);
        let outcome = substrate
            .run(request_with(&tmp, Duration::from_secs(5)))
            .await
            .unwrap();

        assert_eq!(outcome.kind, AgentResultKind::Success);
        assert_eq!(outcome.session_id.as_deref(), Some("sess-1"));
        assert_eq!(outcome.cost_usd, Some(0.42));
        assert_eq!(outcome.num_turns, Some(3));
        assert!(!outcome.deadline_exceeded);
    }

    #[tokio::test]
    async fn run_treats_deadline_as_max_turns() {
        let tmp = tempfile::TempDir::new().unwrap();
        let script = fake_agent_script(&tmp, "cat >/dev/null\nsleep 30\n");
        let substrate = ProcessAgentSubstrate::new(script);
        let outcome = substrate
            .run(request_with(&tmp, Duration::from_millis(200)))
            .await
            .unwrap();

        assert_eq!(outcome.kind, AgentResultKind::MaxTurns);
        assert!(outcome.deadline_exceeded);
    }

    #[tokio::test]
    async fn unavailable_binary_reports_not_available() {
        let substrate = ProcessAgentSubstrate::new("/nonexistent/orca-agent-binary");
        assert!(!substrate.is_available().await);
    }
}
