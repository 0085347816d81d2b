//! Layered configuration.
//!
//! Discovery order: an explicit path, then `./coder-agent.toml`, then
//! built-in defaults — the same order as `ConfigDiscoveryStrategy` /
//! `Config::load` elsewhere in this codebase. Nothing here is a process
//! singleton; callers construct a `Config` and pass it down explicitly, so
//! tests can inject their own.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CoderAgentError, CoderAgentResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub planning_iterations: u32,
    pub coding_iterations: u32,
    pub fixing_iterations: u32,
    /// Default `N` applied to a `CONTINUE` feedback with no explicit amount.
    pub continue_increment: u32,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            planning_iterations: 5,
            coding_iterations: 8,
            fixing_iterations: 8,
            continue_increment: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    pub project_root: PathBuf,
    pub mirror_dir: String,
    pub branch_pattern: String,
    /// Retry delays applied to network-classified git failures, in seconds.
    pub network_retry_delays_secs: Vec<u64>,
    /// How long SETUP sleeps before retrying after the network-retry
    /// schedule itself is exhausted and the handler suspends instead of
    /// failing the story outright.
    pub suspend_retry_secs: u64,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            project_root: PathBuf::from("."),
            mirror_dir: "mirrors".to_string(),
            branch_pattern: "coder-{AGENT_ID}-{STORY_ID}".to_string(),
            network_retry_delays_secs: vec![0, 5, 15, 30],
            suspend_retry_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    pub max_context_tokens: u32,
    pub compaction_buffer: u32,
    pub tokenizer_model: String,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: 150_000,
            compaction_buffer: 10_000,
            tokenizer_model: "cl100k_base".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolLoopConfig {
    pub phase_timeout_secs: u64,
    pub inactivity_timeout_secs: u64,
}

impl Default for ToolLoopConfig {
    fn default() -> Self {
        Self {
            phase_timeout_secs: 1800,
            inactivity_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectConfig {
    pub budget_review_timeout_secs: u64,
}

impl Default for EffectConfig {
    fn default() -> Self {
        Self {
            budget_review_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub docker_image_default: Option<String>,
    #[serde(default)]
    pub budgets: BudgetConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub tool_loop: ToolLoopConfig,
    #[serde(default)]
    pub effects: EffectConfig,
}

impl Config {
    /// Load from an explicit path, falling back to `./coder-agent.toml`,
    /// falling back to defaults. Never reads a process-wide global.
    pub fn load(explicit_path: Option<&Path>) -> CoderAgentResult<Self> {
        let candidate = explicit_path
            .map(PathBuf::from)
            .or_else(|| {
                let local = PathBuf::from("coder-agent.toml");
                local.exists().then_some(local)
            });

        match candidate {
            Some(path) => {
                let raw = std::fs::read_to_string(&path).map_err(|e| {
                    CoderAgentError::Config(format!(
                        "failed to read config {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                toml::from_str(&raw)
                    .map_err(|e| CoderAgentError::Config(format!("failed to parse config: {e}")))
            }
            None => Ok(Config::default()),
        }
    }

    pub fn budget_for(&self, phase: crate::budget::Phase) -> u32 {
        match phase {
            crate::budget::Phase::Planning => self.budgets.planning_iterations,
            crate::budget::Phase::Coding => self.budgets.coding_iterations,
            crate::budget::Phase::Fixing => self.budgets.fixing_iterations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_have_sane_budgets() {
        let cfg = Config::default();
        assert_eq!(cfg.budgets.coding_iterations, 8);
        assert_eq!(cfg.workspace.network_retry_delays_secs, vec![0, 5, 15, 30]);
    }

    #[test]
    fn load_with_missing_explicit_path_errors() {
        let result = Config::load(Some(Path::new("/nonexistent/coder-agent.toml")));
        assert!(result.is_err());
    }
}
