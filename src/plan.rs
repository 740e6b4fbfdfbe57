//! Plan model and validator
//!
//! A plan is the structured output of the external planning step: an ordered
//! list of file edits and commands, executed in declaration order. This
//! module normalizes or rejects raw plans before anything touches a file,
//! and computes the canonical content hash that binds an execute request to
//! the exact plan a user reviewed.

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::util::{hash_str, sanitize_rel_path};

/// One step of a plan. Closed set: adding a step kind is a compile-checked
/// change at every consumption site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    FileEdit {
        path: String,
        new_content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        old_content: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },
    Command {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
}

impl Step {
    pub fn is_file_edit(&self) -> bool {
        matches!(self, Step::FileEdit { .. })
    }

    /// The path this step edits, if it is a file edit.
    pub fn edit_path(&self) -> Option<&str> {
        match self {
            Step::FileEdit { path, .. } => Some(path),
            Step::Command { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl Plan {
    /// Parse and validate a raw JSON plan from the planning collaborator.
    pub fn from_raw(raw: &serde_json::Value) -> Result<Plan, PipelineError> {
        let mut plan: Plan = serde_json::from_value(raw.clone())
            .map_err(|e| PipelineError::PlanValidation(format!("malformed plan: {}", e)))?;
        plan.validate()?;
        Ok(plan)
    }

    /// Reject empty plans, empty commands, and policy-violating paths.
    ///
    /// Each surviving `FileEdit` path is rewritten to the sanitizer's
    /// canonical form, so the gate, diff engine, sandbox, and store all key
    /// on one spelling; `./.env` and `.env` must be the same file
    /// everywhere downstream.
    pub fn validate(&mut self) -> Result<(), PipelineError> {
        if self.steps.is_empty() {
            return Err(PipelineError::PlanValidation("plan has no steps".to_string()));
        }
        for (i, step) in self.steps.iter_mut().enumerate() {
            match step {
                Step::FileEdit { path, .. } => {
                    let clean = sanitize_rel_path(path)
                        .map_err(|reason| PipelineError::PathPolicy(format!("step {}: {}", i + 1, reason)))?;
                    *path = clean;
                }
                Step::Command { command, .. } => {
                    if command.trim().is_empty() {
                        return Err(PipelineError::PlanValidation(format!(
                            "step {}: command is empty",
                            i + 1
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Collapse repeated edits to the same path into one net edit: the
    /// first step's `old_content` and description (replace against the
    /// original), the last step's `new_content` (land the final intent).
    /// Command steps and first-occurrence order are preserved.
    pub fn merge_file_edits(self) -> Plan {
        let mut merged: Vec<Step> = Vec::with_capacity(self.steps.len());
        for step in self.steps {
            match step {
                Step::FileEdit {
                    path,
                    new_content,
                    old_content,
                    description,
                    source,
                } => {
                    let existing = merged.iter_mut().find(|s| s.edit_path() == Some(path.as_str()));
                    match existing {
                        Some(Step::FileEdit {
                            new_content: prev_new,
                            ..
                        }) => {
                            *prev_new = new_content;
                        }
                        _ => merged.push(Step::FileEdit {
                            path,
                            new_content,
                            old_content,
                            description,
                            source,
                        }),
                    }
                }
                other => merged.push(other),
            }
        }
        Plan {
            steps: merged,
            summary: self.summary,
        }
    }

    /// Canonicalization rule: a plan that implies a Python toolchain must
    /// create a virtual environment before running any command. Idempotent;
    /// running it twice never inserts a second venv step.
    pub fn ensure_python_venv(&mut self) {
        let implies_python = self.steps.iter().any(step_implies_python);
        if !implies_python {
            return;
        }
        let already = self.steps.iter().any(|s| match s {
            Step::Command { command, .. } => creates_venv(command),
            _ => false,
        });
        if already {
            return;
        }

        let venv_step = Step::Command {
            command: "python3 -m venv .venv".to_string(),
            description: Some("Create Python virtual environment".to_string()),
        };
        let first_command = self.steps.iter().position(|s| matches!(s, Step::Command { .. }));
        match first_command {
            Some(idx) => self.steps.insert(idx, venv_step),
            None => self.steps.push(venv_step),
        }
    }
}

fn step_implies_python(step: &Step) -> bool {
    match step {
        Step::FileEdit { path, .. } => {
            if path.ends_with(".py") {
                return true;
            }
            let file_name = path.rsplit('/').next().unwrap_or(path);
            file_name == "requirements.txt" || file_name == "pyproject.toml"
        }
        Step::Command { command, .. } => {
            let lower = command.to_lowercase();
            lower.contains("python") || lower.contains("pip") || lower.contains("venv")
        }
    }
}

fn creates_venv(command: &str) -> bool {
    let lower = command.to_lowercase();
    lower.contains("-m venv") || lower.contains("virtualenv")
}

/// Canonical content hash of a plan.
///
/// Serialization goes through our own structs, so field and step order are
/// deterministic; no incidental whitespace or key-order sensitivity. The
/// hash is computed when a plan is produced, re-verified at execute time,
/// and never persisted beyond the request.
pub fn plan_hash(plan: &Plan) -> String {
    let canonical = serde_json::to_string(plan).unwrap_or_default();
    hash_str(&canonical)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edit(path: &str, old: Option<&str>, new: &str) -> Step {
        Step::FileEdit {
            path: path.to_string(),
            new_content: new.to_string(),
            old_content: old.map(|s| s.to_string()),
            description: None,
            source: None,
        }
    }

    fn command(cmd: &str) -> Step {
        Step::Command {
            command: cmd.to_string(),
            description: None,
        }
    }

    #[test]
    fn test_rejects_empty_plan() {
        let mut plan = Plan {
            steps: vec![],
            summary: None,
        };
        assert!(matches!(
            plan.validate(),
            Err(PipelineError::PlanValidation(_))
        ));
    }

    #[test]
    fn test_rejects_traversal_path() {
        let mut plan = Plan {
            steps: vec![edit("../etc/passwd", None, "x")],
            summary: None,
        };
        assert!(matches!(plan.validate(), Err(PipelineError::PathPolicy(_))));
        let mut hidden = Plan {
            steps: vec![edit("src\\..\\.env", None, "x")],
            summary: None,
        };
        assert!(matches!(hidden.validate(), Err(PipelineError::PathPolicy(_))));
    }

    #[test]
    fn test_rejects_empty_command() {
        let mut plan = Plan {
            steps: vec![command("   ")],
            summary: None,
        };
        assert!(matches!(
            plan.validate(),
            Err(PipelineError::PlanValidation(_))
        ));
    }

    #[test]
    fn test_validate_canonicalizes_step_paths() {
        let mut plan = Plan {
            steps: vec![edit("./.env", None, "KEY=1"), edit("src\\lib.rs", None, "x")],
            summary: None,
        };
        plan.validate().unwrap();
        assert_eq!(plan.steps[0].edit_path(), Some(".env"));
        assert_eq!(plan.steps[1].edit_path(), Some("src/lib.rs"));
    }

    #[test]
    fn test_from_raw_parses_tagged_steps() {
        let raw = serde_json::json!({
            "steps": [
                {"type": "file_edit", "path": "a.ts", "new_content": "bar()", "old_content": "foo()"},
                {"type": "command", "command": "npm test"}
            ],
            "summary": "swap foo for bar"
        });
        let plan = Plan::from_raw(&raw).unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[0].edit_path(), Some("a.ts"));
    }

    #[test]
    fn test_merge_keeps_first_old_and_last_new() {
        let plan = Plan {
            steps: vec![
                edit("a.rs", Some("v0"), "v1"),
                command("cargo test"),
                edit("a.rs", Some("v1"), "v2"),
                edit("b.rs", None, "new"),
            ],
            summary: None,
        };
        let merged = plan.merge_file_edits();
        assert_eq!(merged.steps.len(), 3);
        match &merged.steps[0] {
            Step::FileEdit {
                path,
                old_content,
                new_content,
                ..
            } => {
                assert_eq!(path, "a.rs");
                assert_eq!(old_content.as_deref(), Some("v0"));
                assert_eq!(new_content, "v2");
            }
            _ => panic!("expected merged file edit first"),
        }
        assert!(matches!(&merged.steps[1], Step::Command { .. }));
    }

    #[test]
    fn test_venv_inserted_before_first_command() {
        let mut plan = Plan {
            steps: vec![
                edit("main.py", None, "print('hi')"),
                command("pytest -q"),
            ],
            summary: None,
        };
        plan.ensure_python_venv();
        assert_eq!(plan.steps.len(), 3);
        match &plan.steps[1] {
            Step::Command { command, .. } => assert!(command.contains("-m venv")),
            _ => panic!("expected venv command inserted before pytest"),
        }
    }

    #[test]
    fn test_venv_appended_when_no_command() {
        let mut plan = Plan {
            steps: vec![edit("requirements.txt", None, "requests\n")],
            summary: None,
        };
        plan.ensure_python_venv();
        assert_eq!(plan.steps.len(), 2);
        assert!(matches!(&plan.steps[1], Step::Command { command, .. } if command.contains("venv")));
    }

    #[test]
    fn test_venv_insertion_is_idempotent() {
        let mut plan = Plan {
            steps: vec![edit("main.py", None, "pass"), command("python main.py")],
            summary: None,
        };
        plan.ensure_python_venv();
        let after_first = plan.steps.len();
        plan.ensure_python_venv();
        assert_eq!(plan.steps.len(), after_first);
    }

    #[test]
    fn test_no_venv_for_non_python_plans() {
        let mut plan = Plan {
            steps: vec![edit("a.ts", None, "x"), command("npm test")],
            summary: None,
        };
        plan.ensure_python_venv();
        assert_eq!(plan.steps.len(), 2);
    }

    #[test]
    fn test_plan_hash_stable_and_order_sensitive() {
        let a = Plan {
            steps: vec![edit("a.rs", None, "1"), edit("b.rs", None, "2")],
            summary: None,
        };
        let b = Plan {
            steps: vec![edit("b.rs", None, "2"), edit("a.rs", None, "1")],
            summary: None,
        };
        assert_eq!(plan_hash(&a), plan_hash(&a.clone()));
        assert_ne!(plan_hash(&a), plan_hash(&b));
    }
}
