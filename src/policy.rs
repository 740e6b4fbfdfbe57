//! Protected-path gate and scope limiter
//!
//! Both run before any sandbox exists: the gate rejects cheaply so no
//! verification work is wasted on a plan the user has to confirm anyway,
//! and the limiter bounds blast radius for conservative runs.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::ScopeCaps;
use crate::plan::{Plan, Step};

/// Caller-selected policy bounding how much a plan may touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeMode {
    Conservative,
    Normal,
    Aggressive,
}

impl ScopeMode {
    pub fn label(&self) -> &'static str {
        match self {
            ScopeMode::Conservative => "conservative",
            ScopeMode::Normal => "normal",
            ScopeMode::Aggressive => "aggressive",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Proceed,
    /// The exact offending paths, so the UI can ask for confirmation.
    NeedsConfirmation(Vec<String>),
}

/// Matches plan paths against the externally configured protected-pattern
/// set. Pattern forms: exact path, `dir/**` prefix, `*.ext` suffix.
#[derive(Debug, Clone)]
pub struct ProtectedPathGate {
    patterns: Vec<String>,
}

impl ProtectedPathGate {
    pub fn new(patterns: Vec<String>) -> Self {
        Self { patterns }
    }

    pub fn is_protected(&self, path: &str) -> bool {
        self.patterns.iter().any(|pattern| {
            if let Some(prefix) = pattern.strip_suffix("/**") {
                path == prefix || path.starts_with(&format!("{}/", prefix))
            } else if let Some(suffix) = pattern.strip_prefix('*') {
                path.ends_with(suffix)
            } else {
                path == pattern
            }
        })
    }

    /// Zero side effects: either every protected path the plan touches was
    /// confirmed, or the full offending list comes back.
    pub fn check(
        &self,
        plan: &Plan,
        confirmed_paths: &[String],
        safe_edit_mode: bool,
    ) -> GateDecision {
        if !safe_edit_mode {
            return GateDecision::Proceed;
        }

        let mut blocked: Vec<String> = Vec::new();
        for step in &plan.steps {
            let Some(path) = step.edit_path() else { continue };
            if self.is_protected(path)
                && !confirmed_paths.iter().any(|c| c == path)
                && !blocked.iter().any(|b| b == path)
            {
                blocked.push(path.to_string());
            }
        }

        if blocked.is_empty() {
            GateDecision::Proceed
        } else {
            GateDecision::NeedsConfirmation(blocked)
        }
    }
}

/// Approximate changed-line volume of one step. Deliberately rough: the cap
/// is a blast-radius bound, not an accounting system.
fn changed_lines(step: &Step) -> usize {
    match step {
        Step::FileEdit {
            new_content,
            old_content,
            ..
        } => {
            let new_lines = new_content.lines().count();
            let old_lines = old_content.as_deref().map(|s| s.lines().count()).unwrap_or(0);
            new_lines.max(old_lines)
        }
        Step::Command { .. } => 0,
    }
}

/// Result of applying the scope limiter: the steps that run, and the steps
/// truncation dropped. Dropped steps stay visible so callers can report the
/// disposition of every requested edit instead of losing it to a log line.
#[derive(Debug, Clone, Default)]
pub struct CapOutcome {
    pub kept: Vec<Step>,
    pub dropped: Vec<Step>,
}

/// Cap the blast radius of a plan per the selected scope mode.
///
/// Normal and aggressive pass through untouched; the mode is recorded for
/// observability only. Conservative truncates to the first N steps by
/// original plan order once either cap is exceeded; it never rejects the
/// whole plan outright, and the truncated remainder comes back in
/// `dropped`.
pub fn cap_steps(steps: Vec<Step>, mode: ScopeMode, caps: &ScopeCaps) -> CapOutcome {
    info!(scope_mode = mode.label(), steps = steps.len(), "scope limiter");
    if !matches!(mode, ScopeMode::Conservative) {
        return CapOutcome {
            kept: steps,
            dropped: Vec::new(),
        };
    }

    let mut files: Vec<String> = Vec::new();
    let mut lines = 0usize;
    let mut kept = Vec::with_capacity(steps.len());
    let mut dropped = Vec::new();
    let mut capped = false;

    for step in steps {
        if capped {
            dropped.push(step);
            continue;
        }
        if let Some(path) = step.edit_path() {
            if !files.iter().any(|f| f == path) {
                files.push(path.to_string());
            }
        }
        lines += changed_lines(&step);
        if files.len() > caps.max_files || lines > caps.max_changed_lines {
            capped = true;
            dropped.push(step);
            continue;
        }
        kept.push(step);
    }

    if capped {
        warn!(
            kept = kept.len(),
            dropped = dropped.len(),
            "conservative scope cap exceeded; truncating plan"
        );
    }

    CapOutcome { kept, dropped }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edit(path: &str, new: &str) -> Step {
        Step::FileEdit {
            path: path.to_string(),
            new_content: new.to_string(),
            old_content: None,
            description: None,
            source: None,
        }
    }

    fn plan(steps: Vec<Step>) -> Plan {
        Plan {
            steps,
            summary: None,
        }
    }

    #[test]
    fn test_pattern_forms() {
        let gate = ProtectedPathGate::new(vec![
            ".env".to_string(),
            "secrets/**".to_string(),
            "*.pem".to_string(),
        ]);
        assert!(gate.is_protected(".env"));
        assert!(gate.is_protected("secrets/api/token.json"));
        assert!(gate.is_protected("certs/server.pem"));
        assert!(!gate.is_protected("src/env.rs"));
        assert!(!gate.is_protected("secretsandmore/file"));
    }

    #[test]
    fn test_gate_disabled_always_proceeds() {
        let gate = ProtectedPathGate::new(vec![".env".to_string()]);
        let p = plan(vec![edit(".env", "KEY=1")]);
        assert_eq!(gate.check(&p, &[], false), GateDecision::Proceed);
    }

    #[test]
    fn test_gate_returns_exact_blocking_paths() {
        let gate = ProtectedPathGate::new(vec![".env".to_string(), "*.pem".to_string()]);
        let p = plan(vec![
            edit(".env", "KEY=1"),
            edit("src/main.rs", "fn main() {}"),
            edit("a.pem", "----"),
        ]);
        match gate.check(&p, &[], true) {
            GateDecision::NeedsConfirmation(paths) => {
                assert_eq!(paths, vec![".env".to_string(), "a.pem".to_string()]);
            }
            GateDecision::Proceed => panic!("expected confirmation request"),
        }
    }

    #[test]
    fn test_gate_proceeds_when_all_confirmed() {
        let gate = ProtectedPathGate::new(vec![".env".to_string()]);
        let p = plan(vec![edit(".env", "KEY=1")]);
        let confirmed = vec![".env".to_string()];
        assert_eq!(gate.check(&p, &confirmed, true), GateDecision::Proceed);
    }

    #[test]
    fn test_normal_and_aggressive_do_not_truncate() {
        let caps = ScopeCaps {
            max_files: 1,
            max_changed_lines: 1,
        };
        let steps = vec![edit("a.rs", "1\n2\n3"), edit("b.rs", "x")];
        let normal = cap_steps(steps.clone(), ScopeMode::Normal, &caps);
        assert_eq!(normal.kept.len(), 2);
        assert!(normal.dropped.is_empty());
        assert_eq!(cap_steps(steps, ScopeMode::Aggressive, &caps).kept.len(), 2);
    }

    #[test]
    fn test_conservative_truncates_by_plan_order() {
        let caps = ScopeCaps {
            max_files: 2,
            max_changed_lines: 100,
        };
        let steps = vec![edit("a.rs", "x"), edit("b.rs", "y"), edit("c.rs", "z")];
        let outcome = cap_steps(steps, ScopeMode::Conservative, &caps);
        assert_eq!(outcome.kept.len(), 2);
        assert_eq!(outcome.kept[0].edit_path(), Some("a.rs"));
        assert_eq!(outcome.kept[1].edit_path(), Some("b.rs"));
        assert_eq!(outcome.dropped.len(), 1);
        assert_eq!(outcome.dropped[0].edit_path(), Some("c.rs"));
    }

    #[test]
    fn test_conservative_line_cap() {
        let caps = ScopeCaps {
            max_files: 10,
            max_changed_lines: 3,
        };
        let steps = vec![edit("a.rs", "1\n2\n3"), edit("b.rs", "1")];
        let outcome = cap_steps(steps, ScopeMode::Conservative, &caps);
        assert_eq!(outcome.kept.len(), 1);
        assert_eq!(outcome.dropped.len(), 1);
    }

    #[test]
    fn test_conservative_keeps_oversized_first_step_visible() {
        // A single step that alone busts the cap still shows up in the
        // outcome as dropped, never vanishes.
        let caps = ScopeCaps {
            max_files: 5,
            max_changed_lines: 2,
        };
        let steps = vec![edit("big.rs", "1\n2\n3\n4\n5")];
        let outcome = cap_steps(steps, ScopeMode::Conservative, &caps);
        assert!(outcome.kept.is_empty());
        assert_eq!(outcome.dropped.len(), 1);
        assert_eq!(outcome.dropped[0].edit_path(), Some("big.rs"));
    }

    #[test]
    fn test_conservative_never_rejects_outright() {
        let caps = ScopeCaps {
            max_files: 5,
            max_changed_lines: 100,
        };
        let steps = vec![edit("a.rs", "fine")];
        let outcome = cap_steps(steps, ScopeMode::Conservative, &caps);
        assert_eq!(outcome.kept.len(), 1);
        assert!(outcome.dropped.is_empty());
    }
}
