//! Pipeline configuration
//!
//! Stores settings in ~/.config/nova/pipeline.json. Every knob has a
//! compiled default so the pipeline works without any config file; the file
//! exists so deployments can tighten timeouts, protected paths, and scope
//! caps without a rebuild.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Blast-radius limits applied when a plan runs in conservative scope mode.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScopeCaps {
    /// Maximum number of distinct files a conservative plan may touch.
    pub max_files: usize,
    /// Approximate maximum changed-line volume across all file edits.
    pub max_changed_lines: usize,
}

impl Default for ScopeCaps {
    fn default() -> Self {
        Self {
            max_files: 5,
            max_changed_lines: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Hard wall-clock budget for each verification phase (lint/tests/run).
    #[serde(default = "default_check_timeout_secs")]
    pub check_timeout_secs: u64,
    /// Captured check output is truncated to this many chars.
    #[serde(default = "default_output_limit_chars")]
    pub output_limit_chars: usize,
    /// When true, edits to protected paths require explicit confirmation.
    #[serde(default = "default_safe_edit_mode")]
    pub safe_edit_mode: bool,
    /// Protected-path patterns: exact path, `dir/**` prefix, or `*.ext`.
    #[serde(default = "default_protected_paths")]
    pub protected_paths: Vec<String>,
    #[serde(default)]
    pub scope_caps: ScopeCaps,
    /// Directory where agent-path `Command` steps run. None disables
    /// command execution for the agent path (steps are logged as skipped).
    #[serde(default)]
    pub exec_dir: Option<PathBuf>,
}

fn default_check_timeout_secs() -> u64 {
    300
}

fn default_output_limit_chars() -> usize {
    8_000
}

fn default_safe_edit_mode() -> bool {
    true
}

fn default_protected_paths() -> Vec<String> {
    [
        ".env",
        ".env.local",
        "*.pem",
        "*.key",
        ".github/**",
        "secrets/**",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            check_timeout_secs: default_check_timeout_secs(),
            output_limit_chars: default_output_limit_chars(),
            safe_edit_mode: default_safe_edit_mode(),
            protected_paths: default_protected_paths(),
            scope_caps: ScopeCaps::default(),
            exec_dir: None,
        }
    }
}

impl PipelineConfig {
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("nova"))
    }

    fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("pipeline.json"))
    }

    /// Load config from disk, falling back to defaults on any problem.
    pub fn load() -> Self {
        let Some(path) = Self::config_path() else {
            return Self::default();
        };
        match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self) -> Result<(), String> {
        let dir = Self::config_dir().ok_or("Could not determine config directory")?;
        fs::create_dir_all(&dir).map_err(|e| format!("Failed to create config dir: {}", e))?;
        let path = dir.join("pipeline.json");
        let raw = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;
        fs::write(&path, raw).map_err(|e| format!("Failed to write config: {}", e))
    }
}
