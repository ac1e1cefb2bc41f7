//! Loads and validates Orca's [`Config`] from the environment (§6).
//!
//! Grounded in the teacher's `ConfigLoader`: same figment-layered-merge
//! shape and the same "extract, then validate" two-step, narrowed to a
//! single environment-variable layer since Orca has no project-local
//! YAML config file (an explicit DESIGN.md decision — Orca is meant to run
//! as a daemon configured by its process environment, not a checked-out
//! project directory).

use figment::providers::{Env, Serialized};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::config::Config;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to extract configuration: {0}")]
    ExtractionFailed(String),

    #[error("concurrency_cap must be at least 1")]
    InvalidConcurrencyCap,

    #[error("session_timeout_min must be at least 1")]
    InvalidSessionTimeout,

    #[error("budget_max_cost_usd must be positive")]
    InvalidBudgetMaxCost,

    #[error("tracker_api_base is required (set ORCA_TRACKER_API_BASE)")]
    MissingTrackerApiBase,

    #[error("tracker_project_ids is required and must name at least one project (set ORCA_TRACKER_PROJECT_IDS)")]
    MissingTrackerProjectIds,

    #[error("project_repo_map has no entry for project id '{0}'; every configured tracker project needs a local repo checkout path")]
    MissingRepoMapping(String),

    #[error("db_path cannot be empty")]
    EmptyDbPath,

    #[error("agent_path cannot be empty")]
    EmptyAgentPath,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from the process environment, falling back to
    /// `Config::default()` for anything unset. All `ORCA_*` variables are
    /// recognized; nested fields (`project_repo_map`) use `__` as the
    /// path separator per figment's `Env::split` convention.
    pub fn load() -> Result<Config, ConfigError> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Env::prefixed("ORCA_").split("__"))
            .extract()
            .map_err(|e| ConfigError::ExtractionFailed(e.to_string()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.concurrency_cap == 0 {
            return Err(ConfigError::InvalidConcurrencyCap);
        }
        if config.session_timeout_min == 0 {
            return Err(ConfigError::InvalidSessionTimeout);
        }
        if config.budget_max_cost_usd <= 0.0 {
            return Err(ConfigError::InvalidBudgetMaxCost);
        }
        if config.db_path.is_empty() {
            return Err(ConfigError::EmptyDbPath);
        }
        if config.agent_path.is_empty() {
            return Err(ConfigError::EmptyAgentPath);
        }
        if config.tracker_api_base.is_empty() {
            return Err(ConfigError::MissingTrackerApiBase);
        }
        if config.tracker_project_ids.is_empty() {
            return Err(ConfigError::MissingTrackerProjectIds);
        }
        for project_id in &config.tracker_project_ids {
            if !config.project_repo_map.contains_key(project_id) {
                return Err(ConfigError::MissingRepoMapping(project_id.clone()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.tracker_api_base = "https://api.example.com".to_string();
        config.tracker_project_ids = vec!["proj-1".to_string()];
        let mut map = HashMap::new();
        map.insert("proj-1".to_string(), "/repos/proj-1".to_string());
        config.project_repo_map = map;
        config
    }

    #[test]
    fn validate_accepts_a_well_formed_config() {
        assert!(ConfigLoader::validate(&valid_config()).is_ok());
    }

    #[test]
    fn validate_rejects_zero_concurrency_cap() {
        let mut config = valid_config();
        config.concurrency_cap = 0;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidConcurrencyCap)
        ));
    }

    #[test]
    fn validate_rejects_missing_tracker_api_base() {
        let mut config = valid_config();
        config.tracker_api_base = String::new();
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::MissingTrackerApiBase)
        ));
    }

    #[test]
    fn validate_rejects_project_with_no_repo_mapping() {
        let mut config = valid_config();
        config.tracker_project_ids.push("proj-2".to_string());
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::MissingRepoMapping(ref id)) if id == "proj-2"
        ));
    }

    #[test]
    fn load_reads_orca_prefixed_env_vars() {
        temp_env::with_vars(
            [
                ("ORCA_TRACKER_API_BASE", Some("https://tracker.example.com")),
                ("ORCA_TRACKER_PROJECT_IDS", Some(r#"["proj-1"]"#)),
                ("ORCA_PROJECT_REPO_MAP__proj-1", Some("/repos/proj-1")),
                ("ORCA_CONCURRENCY_CAP", Some("8")),
            ],
            || {
                let config = ConfigLoader::load().expect("env-driven config should load and validate");
                assert_eq!(config.tracker_api_base, "https://tracker.example.com");
                assert_eq!(config.concurrency_cap, 8);
                assert_eq!(config.tracker_project_ids, vec!["proj-1".to_string()]);
            },
        );
    }

    #[test]
    fn load_surfaces_validation_failure_as_config_error() {
        temp_env::with_vars(
            [
                ("ORCA_TRACKER_API_BASE", Some("")),
                ("ORCA_TRACKER_PROJECT_IDS", None::<&str>),
            ],
            || {
                assert!(matches!(
                    ConfigLoader::load(),
                    Err(ConfigError::MissingTrackerApiBase)
                ));
            },
        );
    }
}
