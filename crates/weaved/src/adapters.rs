//! Agent adapter registry (spec Section 4.8, support component).
//!
//! Generalizes the teacher's single hardcoded `claude -p ...` invocation
//! (`runner.rs` before this rewrite) into a table of adapters keyed by agent
//! type, grounded in the teacher's `Config` `model`/`claude_timeout_sec`/
//! `claude_retries` fields (`weave-core/src/config.rs`).

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use thiserror::Error;

use crate::process::{ProcessConfig, ProcessMode};

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("agent type not implemented: {0}")]
    NotImplemented(String),
    #[error("agent type not found: {0}")]
    NotFound(String),
    #[error("invalid agent config: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, AdapterError>;

/// Per-agent-type parameters used to build a `ProcessConfig`.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub agent_type: String,
    pub model: String,
    pub prompt: String,
    pub work_dir: PathBuf,
    pub timeout_sec: u32,
    pub retries: u32,
    pub retry_backoff_sec: u32,
}

/// Adapter metadata plus behavior required by the registry (spec Section 4.8).
pub trait AgentAdapter: Send + Sync {
    fn name(&self) -> &str;
    fn version(&self) -> &str;

    /// Whether this adapter's process can be resumed/reused across acquires.
    fn supports_session_resume(&self) -> bool {
        false
    }

    fn build_process_config(&self, cfg: &AgentConfig) -> Result<ProcessConfig>;

    /// Returns a list of validation error messages (empty = valid).
    fn validate_config(&self, cfg: &AgentConfig) -> Vec<String> {
        let mut errors = Vec::new();
        if cfg.prompt.trim().is_empty() {
            errors.push("prompt must not be empty".to_string());
        }
        errors
    }

    fn default_config(&self) -> Option<AgentConfig> {
        None
    }

    /// Check whether the adapter's executable is available on this host.
    fn check_availability(&self) -> bool;
}

/// Claude Code CLI adapter — the teacher's only supported agent, generalized
/// into a registry entry instead of a hardcoded invocation.
pub struct ClaudeAdapter;

impl AgentAdapter for ClaudeAdapter {
    fn name(&self) -> &str {
        "claude"
    }

    fn version(&self) -> &str {
        "cli"
    }

    fn build_process_config(&self, cfg: &AgentConfig) -> Result<ProcessConfig> {
        Ok(ProcessConfig {
            executable: "claude".to_string(),
            argv: vec![
                "-p".to_string(),
                "--dangerously-skip-permissions".to_string(),
                "--model".to_string(),
                cfg.model.clone(),
                cfg.prompt.clone(),
            ],
            env: Vec::new(),
            work_dir: cfg.work_dir.clone(),
            mode: ProcessMode::Line,
            terminal_dims: None,
        })
    }

    fn check_availability(&self) -> bool {
        std::process::Command::new("claude")
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }
}

/// Codex CLI adapter.
pub struct CodexAdapter;

impl AgentAdapter for CodexAdapter {
    fn name(&self) -> &str {
        "codex"
    }

    fn version(&self) -> &str {
        "cli"
    }

    fn build_process_config(&self, cfg: &AgentConfig) -> Result<ProcessConfig> {
        Ok(ProcessConfig {
            executable: "codex".to_string(),
            argv: vec!["exec".to_string(), cfg.prompt.clone()],
            env: Vec::new(),
            work_dir: cfg.work_dir.clone(),
            mode: ProcessMode::Line,
            terminal_dims: None,
        })
    }

    fn check_availability(&self) -> bool {
        std::process::Command::new("codex")
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }
}

/// Memoized availability result for one agent type. No built-in TTL
/// (Open Question, SPEC_FULL.md Section 9): cleared only via
/// `clear_verification_cache`.
struct CacheEntry {
    available: bool,
}

/// Table of adapters keyed by agent type, with a memoizing availability cache.
pub struct AdapterRegistry {
    adapters: HashMap<String, Box<dyn AgentAdapter>>,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        let mut registry = Self {
            adapters: HashMap::new(),
            cache: Mutex::new(HashMap::new()),
        };
        registry.register(Box::new(ClaudeAdapter));
        registry.register(Box::new(CodexAdapter));
        registry
    }
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&mut self, adapter: Box<dyn AgentAdapter>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    pub fn get(&self, agent_type: &str) -> Result<&dyn AgentAdapter> {
        self.adapters
            .get(agent_type)
            .map(|a| a.as_ref())
            .ok_or_else(|| AdapterError::NotFound(agent_type.to_string()))
    }

    /// Check (and memoize) availability for `agent_type`.
    pub fn check_availability(&self, agent_type: &str) -> Result<bool> {
        let adapter = self.get(agent_type)?;

        let mut cache = self.cache.lock().unwrap();
        if let Some(entry) = cache.get(agent_type) {
            return Ok(entry.available);
        }

        let available = adapter.check_availability();
        cache.insert(
            agent_type.to_string(),
            CacheEntry { available },
        );
        Ok(available)
    }

    /// Clear the memoized availability cache for one agent type, or all
    /// types when `agent_type` is `None` (spec Section 4.8).
    pub fn clear_verification_cache(&self, agent_type: Option<&str>) {
        let mut cache = self.cache.lock().unwrap();
        match agent_type {
            Some(t) => {
                cache.remove(t);
            }
            None => cache.clear(),
        }
    }

    pub fn validate_config(&self, cfg: &AgentConfig) -> Result<Vec<String>> {
        let adapter = self.get(&cfg.agent_type)?;
        Ok(adapter.validate_config(cfg))
    }

    pub fn build_process_config(&self, cfg: &AgentConfig) -> Result<ProcessConfig> {
        let adapter = self.get(&cfg.agent_type)?;
        adapter.build_process_config(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cfg(agent_type: &str) -> AgentConfig {
        AgentConfig {
            agent_type: agent_type.to_string(),
            model: "sonnet".to_string(),
            prompt: "do the thing".to_string(),
            work_dir: PathBuf::from("/tmp"),
            timeout_sec: 0,
            retries: 0,
            retry_backoff_sec: 5,
        }
    }

    #[test]
    fn default_registry_has_claude_and_codex() {
        let registry = AdapterRegistry::default();
        assert!(registry.get("claude").is_ok());
        assert!(registry.get("codex").is_ok());
    }

    #[test]
    fn get_unknown_agent_type_fails() {
        let registry = AdapterRegistry::default();
        assert!(matches!(
            registry.get("unknown"),
            Err(AdapterError::NotFound(_))
        ));
    }

    #[test]
    fn build_process_config_for_claude() {
        let registry = AdapterRegistry::default();
        let cfg = test_cfg("claude");
        let process_cfg = registry.build_process_config(&cfg).unwrap();
        assert_eq!(process_cfg.executable, "claude");
        assert!(process_cfg.argv.contains(&"sonnet".to_string()));
    }

    #[test]
    fn validate_config_rejects_empty_prompt() {
        let registry = AdapterRegistry::default();
        let mut cfg = test_cfg("claude");
        cfg.prompt = "".to_string();
        let errors = registry.validate_config(&cfg).unwrap();
        assert!(!errors.is_empty());
    }

    #[test]
    fn check_availability_memoizes_result() {
        let registry = AdapterRegistry::default();
        let first = registry.check_availability("claude").unwrap();
        let second = registry.check_availability("claude").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn clear_verification_cache_clears_one_type() {
        let registry = AdapterRegistry::default();
        registry.check_availability("claude").unwrap();
        registry.check_availability("codex").unwrap();
        registry.clear_verification_cache(Some("claude"));

        let cache = registry.cache.lock().unwrap();
        assert!(!cache.contains_key("claude"));
        assert!(cache.contains_key("codex"));
    }

    #[test]
    fn clear_verification_cache_clears_all_when_none() {
        let registry = AdapterRegistry::default();
        registry.check_availability("claude").unwrap();
        registry.check_availability("codex").unwrap();
        registry.clear_verification_cache(None);

        let cache = registry.cache.lock().unwrap();
        assert!(cache.is_empty());
    }
}
