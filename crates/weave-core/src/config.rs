//! Configuration parsing for the weaved daemon.
//!
//! Matches the key=value format used by the legacy CLI this daemon replaces.
//! Precedence: CLI flags > `--config` file > `.weave/config` > defaults.

use crate::types::{ArtifactMode, MergeStrategy, NameSource, QueuePolicy, TrustLevel, WorktreeProvider};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("unknown config key: {0}")]
    UnknownKey(String),
}

/// Daemon and execution configuration (Section 4.3, ambient stack).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    // Directories
    pub specs_dir: PathBuf,
    pub log_dir: PathBuf,
    pub global_log_dir: PathBuf,

    // Model and agent invocation
    pub model: String,
    pub default_agent_type: String,

    // Prompt customization
    pub prompt_file: Option<PathBuf>,
    pub context_files: Vec<PathBuf>,

    // Verification
    pub verify_cmds: Vec<String>,
    pub verify_timeout_sec: u32,

    // Agent CLI process settings (C1)
    pub agent_timeout_sec: u32,
    pub agent_retries: u32,
    pub agent_retry_backoff_sec: u32,

    // Artifacts
    pub artifact_mode: ArtifactMode,

    // Execution naming
    pub run_naming_mode: NameSource,
    pub run_naming_model: String,

    // Worktree and merge
    pub base_branch: Option<String>,
    pub run_branch_prefix: String,
    pub merge_target_branch: Option<String>,
    pub merge_strategy: MergeStrategy,
    pub worktree_path_template: String,

    // Local scaling (Section 4.3, 5.3)
    pub queue_policy: QueuePolicy,

    // Worktree provider
    pub worktree_provider: WorktreeProvider,
    pub worktrunk_bin: PathBuf,
    pub worktrunk_config_path: Option<PathBuf>,
    pub worktrunk_copy_ignored: bool,
    /// Remove worktree after execution completes. Default: false.
    pub worktree_cleanup: bool,

    // Workflow engine defaults (Section 4.5)
    pub workflow_max_concurrency: u32,
    pub workflow_auto_commit_after_step: bool,

    // Event bus (Section 4.3)
    pub event_buffer_max: usize,
    pub event_retention_sec: u32,

    // Federation (Section 4.6)
    pub federation_enabled: bool,
    pub federation_default_trust: TrustLevel,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            specs_dir: PathBuf::from("specs"),
            log_dir: PathBuf::from("logs/weave"),
            global_log_dir: dirs::data_local_dir()
                .map_or_else(|| PathBuf::from("~/.local/share/weaved"), |d| d.join("weaved")),
            model: "opus".to_string(),
            default_agent_type: "claude".to_string(),
            prompt_file: None,
            context_files: Vec::new(),
            verify_cmds: Vec::new(),
            verify_timeout_sec: 0,
            agent_timeout_sec: 600,
            agent_retries: 0,
            agent_retry_backoff_sec: 5,
            artifact_mode: ArtifactMode::Mirror,
            run_naming_mode: NameSource::Haiku,
            run_naming_model: "haiku".to_string(),
            base_branch: None,
            run_branch_prefix: "run/".to_string(),
            merge_target_branch: None,
            merge_strategy: MergeStrategy::Squash,
            worktree_path_template: "../{{ repo }}.{{ run_branch | sanitize }}".to_string(),
            queue_policy: QueuePolicy::Fifo,
            worktree_provider: WorktreeProvider::Auto,
            worktrunk_bin: PathBuf::from("wt"),
            worktrunk_config_path: None,
            worktrunk_copy_ignored: false,
            worktree_cleanup: true,
            workflow_max_concurrency: 1,
            workflow_auto_commit_after_step: true,
            event_buffer_max: 10_000,
            event_retention_sec: 86_400,
            federation_enabled: false,
            federation_default_trust: TrustLevel::Untrusted,
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content, path.display().to_string())
    }

    /// Parse config content (key=value format).
    fn parse_content(&mut self, content: &str, source: String) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value, &source)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    /// Apply a single config value.
    fn apply_value(&mut self, key: &str, value: &str, _source: &str) -> Result<(), ConfigError> {
        match key {
            "specs_dir" => self.specs_dir = PathBuf::from(value),
            "log_dir" => self.log_dir = PathBuf::from(value),
            "global_log_dir" => self.global_log_dir = PathBuf::from(value),
            "model" => self.model = value.to_string(),
            "default_agent_type" => self.default_agent_type = value.to_string(),
            "prompt_file" => {
                self.prompt_file = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                }
            }
            "context_files" => {
                self.context_files = value.split_whitespace().map(PathBuf::from).collect();
            }
            "verify_cmds" => {
                self.verify_cmds = value
                    .split('|')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            }
            "verify_timeout_sec" => {
                self.verify_timeout_sec = value.parse().map_err(|_| ConfigError::InvalidInt {
                    key: key.to_string(),
                    value: value.to_string(),
                })?;
            }
            "agent_timeout_sec" => {
                self.agent_timeout_sec = value.parse().map_err(|_| ConfigError::InvalidInt {
                    key: key.to_string(),
                    value: value.to_string(),
                })?;
            }
            "agent_retries" => {
                self.agent_retries = value.parse().map_err(|_| ConfigError::InvalidInt {
                    key: key.to_string(),
                    value: value.to_string(),
                })?;
            }
            "agent_retry_backoff_sec" => {
                self.agent_retry_backoff_sec =
                    value.parse().map_err(|_| ConfigError::InvalidInt {
                        key: key.to_string(),
                        value: value.to_string(),
                    })?;
            }
            "artifact_mode" => {
                self.artifact_mode = match value {
                    "workspace" => ArtifactMode::Workspace,
                    "global" => ArtifactMode::Global,
                    "mirror" => ArtifactMode::Mirror,
                    _ => {
                        return Err(ConfigError::InvalidLine(format!(
                            "artifact_mode must be 'workspace', 'global', or 'mirror', got '{value}'"
                        )))
                    }
                }
            }
            "run_naming_mode" => {
                self.run_naming_mode = match value {
                    "haiku" => NameSource::Haiku,
                    "spec_slug" => NameSource::SpecSlug,
                    _ => {
                        return Err(ConfigError::InvalidLine(format!(
                            "run_naming_mode must be 'haiku' or 'spec_slug', got '{value}'"
                        )))
                    }
                }
            }
            "run_naming_model" => self.run_naming_model = value.to_string(),
            "base_branch" => self.base_branch = Some(value.to_string()),
            "run_branch_prefix" => self.run_branch_prefix = value.to_string(),
            "merge_target_branch" => self.merge_target_branch = Some(value.to_string()),
            "merge_strategy" => {
                self.merge_strategy = match value {
                    "none" => MergeStrategy::None,
                    "merge" => MergeStrategy::Merge,
                    "squash" => MergeStrategy::Squash,
                    _ => {
                        return Err(ConfigError::InvalidLine(format!(
                            "merge_strategy must be 'none', 'merge', or 'squash', got '{value}'"
                        )))
                    }
                }
            }
            "worktree_path_template" => self.worktree_path_template = value.to_string(),
            "queue_policy" => {
                self.queue_policy = match value {
                    "fifo" => QueuePolicy::Fifo,
                    "newest_first" => QueuePolicy::NewestFirst,
                    _ => {
                        return Err(ConfigError::InvalidLine(format!(
                            "queue_policy must be 'fifo' or 'newest_first', got '{value}'"
                        )))
                    }
                }
            }
            "worktree_provider" => {
                self.worktree_provider = match value {
                    "auto" => WorktreeProvider::Auto,
                    "worktrunk" => WorktreeProvider::Worktrunk,
                    "git" => WorktreeProvider::Git,
                    _ => {
                        return Err(ConfigError::InvalidLine(format!(
                            "worktree_provider must be 'auto', 'worktrunk', or 'git', got '{value}'"
                        )))
                    }
                }
            }
            "worktrunk_bin" => self.worktrunk_bin = PathBuf::from(value),
            "worktrunk_config_path" => self.worktrunk_config_path = Some(PathBuf::from(value)),
            "worktrunk_copy_ignored" => self.worktrunk_copy_ignored = Self::parse_bool(key, value)?,
            "worktree_cleanup" => self.worktree_cleanup = Self::parse_bool(key, value)?,
            "workflow_max_concurrency" => {
                self.workflow_max_concurrency =
                    value.parse().map_err(|_| ConfigError::InvalidInt {
                        key: key.to_string(),
                        value: value.to_string(),
                    })?;
            }
            "workflow_auto_commit_after_step" => {
                self.workflow_auto_commit_after_step = Self::parse_bool(key, value)?;
            }
            "event_buffer_max" => {
                self.event_buffer_max = value.parse().map_err(|_| ConfigError::InvalidInt {
                    key: key.to_string(),
                    value: value.to_string(),
                })?;
            }
            "event_retention_sec" => {
                self.event_retention_sec = value.parse().map_err(|_| ConfigError::InvalidInt {
                    key: key.to_string(),
                    value: value.to_string(),
                })?;
            }
            "federation_enabled" => self.federation_enabled = Self::parse_bool(key, value)?,
            "federation_default_trust" => {
                self.federation_default_trust =
                    TrustLevel::from_str(value).ok_or_else(|| {
                        ConfigError::InvalidLine(format!(
                            "federation_default_trust must be 'trusted', 'verified', or 'untrusted', got '{value}'"
                        ))
                    })?;
            }
            // Ignored keys from the legacy CLI that don't apply to the daemon
            "mode" | "no_wait" | "no_gum" | "measure_cmd" | "measure_timeout_sec" => {}
            _ => {
                eprintln!("Warning: unknown config key: {key}");
            }
        }
        Ok(())
    }

    /// Parse a boolean value.
    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// Resolve relative paths against a workspace root.
    pub fn resolve_paths(&mut self, workspace_root: &Path) {
        if self.specs_dir.is_relative() {
            self.specs_dir = workspace_root.join(&self.specs_dir);
        }
        if self.log_dir.is_relative() {
            self.log_dir = workspace_root.join(&self.log_dir);
        }
        if let Some(ref prompt_file) = self.prompt_file {
            if prompt_file.is_relative() {
                self.prompt_file = Some(workspace_root.join(prompt_file));
            }
        }
        if !self.context_files.is_empty() {
            self.context_files = self
                .context_files
                .iter()
                .map(|path| {
                    if path.is_relative() {
                        workspace_root.join(path)
                    } else {
                        path.clone()
                    }
                })
                .collect();
        }
    }
}

/// Optional dependency for resolving user directories.
mod dirs {
    use std::path::PathBuf;

    pub fn data_local_dir() -> Option<PathBuf> {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local/share")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let config = Config::default();
        assert_eq!(config.model, "opus");
        assert_eq!(config.default_agent_type, "claude");
        assert!(config.prompt_file.is_none());
        assert!(config.context_files.is_empty());
        assert_eq!(config.run_naming_mode, NameSource::Haiku);
        assert_eq!(config.merge_strategy, MergeStrategy::Squash);
        assert!(!config.federation_enabled);
        assert_eq!(config.federation_default_trust, TrustLevel::Untrusted);
    }

    #[test]
    fn parse_simple_config() {
        let mut config = Config::default();
        let content = r#"
model="sonnet"
default_agent_type=codex
"#;
        config.parse_content(content, "test".into()).unwrap();
        assert_eq!(config.model, "sonnet");
        assert_eq!(config.default_agent_type, "codex");
    }

    #[test]
    fn parse_verify_cmds() {
        let mut config = Config::default();
        let content = r#"verify_cmds="cargo test | cargo clippy""#;
        config.parse_content(content, "test".into()).unwrap();
        assert_eq!(config.verify_cmds, vec!["cargo test", "cargo clippy"]);
    }

    #[test]
    fn unquote_removes_quotes() {
        assert_eq!(Config::unquote("\"hello\""), "hello");
        assert_eq!(Config::unquote("'world'"), "world");
        assert_eq!(Config::unquote("noquotes"), "noquotes");
    }

    #[test]
    fn parse_bool_accepts_variants() {
        assert!(Config::parse_bool("test", "true").unwrap());
        assert!(Config::parse_bool("test", "1").unwrap());
        assert!(Config::parse_bool("test", "yes").unwrap());
        assert!(Config::parse_bool("test", "on").unwrap());
        assert!(!Config::parse_bool("test", "false").unwrap());
        assert!(!Config::parse_bool("test", "0").unwrap());
        assert!(!Config::parse_bool("test", "no").unwrap());
        assert!(!Config::parse_bool("test", "off").unwrap());
    }

    #[test]
    fn default_config_has_expected_worktree_provider_values() {
        let config = Config::default();
        assert_eq!(config.worktree_provider, WorktreeProvider::Auto);
        assert_eq!(config.worktrunk_bin, PathBuf::from("wt"));
        assert!(config.worktrunk_config_path.is_none());
        assert!(!config.worktrunk_copy_ignored);
    }

    #[test]
    fn parse_worktree_provider_config() {
        let mut config = Config::default();
        let content = r#"
worktree_provider=worktrunk
worktrunk_bin=/usr/local/bin/wt
worktrunk_config_path=~/.config/worktrunk/config.toml
worktrunk_copy_ignored=true
"#;
        config.parse_content(content, "test".into()).unwrap();
        assert_eq!(config.worktree_provider, WorktreeProvider::Worktrunk);
        assert_eq!(config.worktrunk_bin, PathBuf::from("/usr/local/bin/wt"));
        assert_eq!(
            config.worktrunk_config_path,
            Some(PathBuf::from("~/.config/worktrunk/config.toml"))
        );
        assert!(config.worktrunk_copy_ignored);
    }

    #[test]
    fn parse_worktree_provider_git() {
        let mut config = Config::default();
        let content = "worktree_provider=git";
        config.parse_content(content, "test".into()).unwrap();
        assert_eq!(config.worktree_provider, WorktreeProvider::Git);
    }

    #[test]
    fn parse_worktree_provider_invalid() {
        let mut config = Config::default();
        let content = "worktree_provider=invalid";
        let result = config.parse_content(content, "test".into());
        assert!(result.is_err());
    }

    #[test]
    fn parse_federation_config() {
        let mut config = Config::default();
        let content = r#"
federation_enabled=true
federation_default_trust=verified
"#;
        config.parse_content(content, "test".into()).unwrap();
        assert!(config.federation_enabled);
        assert_eq!(config.federation_default_trust, TrustLevel::Verified);
    }

    #[test]
    fn parse_event_bus_config() {
        let mut config = Config::default();
        let content = r#"
event_buffer_max=500
event_retention_sec=3600
"#;
        config.parse_content(content, "test".into()).unwrap();
        assert_eq!(config.event_buffer_max, 500);
        assert_eq!(config.event_retention_sec, 3600);
    }

    #[test]
    fn parse_workflow_config() {
        let mut config = Config::default();
        let content = r#"
workflow_max_concurrency=4
workflow_auto_commit_after_step=false
"#;
        config.parse_content(content, "test".into()).unwrap();
        assert_eq!(config.workflow_max_concurrency, 4);
        assert!(!config.workflow_auto_commit_after_step);
    }
}
