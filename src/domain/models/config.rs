//! Top-level configuration for the Orca process.
//!
//! Loaded by [`crate::infrastructure::config::ConfigLoader`] from
//! environment variables (§6). Every field has a `default_xxx()` so a
//! partially-specified environment still produces a usable `Config`;
//! [`Config::validate`] is what turns missing *required* values (tracker
//! credentials, project/repo mapping) into a startup error.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Deploy strategy selector. `None` disables CI/deploy monitoring entirely
/// (a task moves straight from `in_review` approval to `done`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployStrategy {
    None,
    GithubActions,
}

impl DeployStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::GithubActions => "github_actions",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Self::None),
            "github_actions" => Some(Self::GithubActions),
            _ => None,
        }
    }
}

impl Default for DeployStrategy {
    fn default() -> Self {
        Self::None
    }
}

/// Scheduler / budget / timeout knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    #[serde(default = "default_concurrency_cap")]
    pub concurrency_cap: u32,
    #[serde(default = "default_session_timeout_min")]
    pub session_timeout_min: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_budget_window_hours")]
    pub budget_window_hours: u64,
    #[serde(default = "default_budget_max_cost_usd")]
    pub budget_max_cost_usd: f64,
    #[serde(default = "default_scheduler_interval_sec")]
    pub scheduler_interval_sec: u64,

    #[serde(default = "default_agent_path")]
    pub agent_path: String,
    #[serde(default = "default_max_turns")]
    pub default_max_turns: u32,
    #[serde(default)]
    pub disallowed_tools: Vec<String>,

    #[serde(default)]
    pub implement_system_prompt: Option<String>,
    #[serde(default)]
    pub review_system_prompt: Option<String>,
    #[serde(default)]
    pub fix_system_prompt: Option<String>,
    #[serde(default = "default_max_turns")]
    pub review_max_turns: u32,
    #[serde(default = "default_max_review_cycles")]
    pub max_review_cycles: u32,

    #[serde(default)]
    pub deploy_strategy: DeployStrategy,
    #[serde(default = "default_deploy_poll_interval_sec")]
    pub deploy_poll_interval_sec: u64,
    #[serde(default = "default_deploy_timeout_min")]
    pub deploy_timeout_min: u64,
    #[serde(default = "default_ci_timeout_min")]
    pub ci_timeout_min: u64,

    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_audit_log_path")]
    pub audit_log_path: String,
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_tracker_api_base")]
    pub tracker_api_base: String,
    #[serde(default)]
    pub tracker_api_key: Option<String>,
    #[serde(default)]
    pub tracker_webhook_secret: Option<String>,
    #[serde(default)]
    pub tracker_project_ids: Vec<String>,
    #[serde(default = "default_tracker_ready_state_type")]
    pub tracker_ready_state_type: String,

    /// Tracker project id -> absolute local repo checkout path.
    #[serde(default)]
    pub project_repo_map: HashMap<String, String>,

    #[serde(default = "default_resume_on_max_turns")]
    pub resume_on_max_turns: bool,
}

fn default_concurrency_cap() -> u32 {
    4
}
fn default_session_timeout_min() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_budget_window_hours() -> u64 {
    24
}
fn default_budget_max_cost_usd() -> f64 {
    50.0
}
fn default_scheduler_interval_sec() -> u64 {
    10
}
fn default_agent_path() -> String {
    "claude".to_string()
}
fn default_max_turns() -> u32 {
    40
}
fn default_max_review_cycles() -> u32 {
    3
}
fn default_deploy_poll_interval_sec() -> u64 {
    30
}
fn default_deploy_timeout_min() -> u64 {
    30
}
fn default_ci_timeout_min() -> u64 {
    30
}
fn default_db_path() -> String {
    ".orca/orca.db".to_string()
}
fn default_audit_log_path() -> String {
    ".orca/audit.log".to_string()
}
fn default_port() -> u16 {
    7777
}
fn default_tracker_ready_state_type() -> String {
    "unstarted".to_string()
}
fn default_tracker_api_base() -> String {
    String::new()
}
fn default_resume_on_max_turns() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrency_cap: default_concurrency_cap(),
            session_timeout_min: default_session_timeout_min(),
            max_retries: default_max_retries(),
            budget_window_hours: default_budget_window_hours(),
            budget_max_cost_usd: default_budget_max_cost_usd(),
            scheduler_interval_sec: default_scheduler_interval_sec(),
            agent_path: default_agent_path(),
            default_max_turns: default_max_turns(),
            disallowed_tools: Vec::new(),
            implement_system_prompt: None,
            review_system_prompt: None,
            fix_system_prompt: None,
            review_max_turns: default_max_turns(),
            max_review_cycles: default_max_review_cycles(),
            deploy_strategy: DeployStrategy::default(),
            deploy_poll_interval_sec: default_deploy_poll_interval_sec(),
            deploy_timeout_min: default_deploy_timeout_min(),
            ci_timeout_min: default_ci_timeout_min(),
            db_path: default_db_path(),
            audit_log_path: default_audit_log_path(),
            port: default_port(),
            tracker_api_base: default_tracker_api_base(),
            tracker_api_key: None,
            tracker_webhook_secret: None,
            tracker_project_ids: Vec::new(),
            tracker_ready_state_type: default_tracker_ready_state_type(),
            project_repo_map: HashMap::new(),
            resume_on_max_turns: default_resume_on_max_turns(),
        }
    }
}
