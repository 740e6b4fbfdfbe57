//! Execution coordinator
//!
//! Composes validator, gate, limiter, sandbox, and repair loop into one
//! request/response cycle. Enforces the plan-hash concurrency guard and
//! picks direct-apply vs. sandboxed execution by source: agent changes are
//! broad and reviewed live via the activity log, composer and
//! debug-from-log changes are narrow and earn a hold-out verification
//! stage before touching live files.

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

use crate::checks::{CheckResult, CommandRunner};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::plan::{plan_hash, Plan, Step};
use crate::planner::Planner;
use crate::policy::{cap_steps, GateDecision, ProtectedPathGate, ScopeMode};
use crate::repair::{self, AttemptReport};
use crate::sandbox::{Conflict, RunOrigin};
use crate::store::WorkspaceStore;
use crate::{diff, util};

/// Per-step outcome entry for the activity log.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub index: usize,
    pub detail: String,
    pub ok: bool,
}

#[derive(Debug, Clone)]
pub struct ExecuteResult {
    pub success: bool,
    /// Exact set of files whose live content this request changed.
    pub files_edited: Vec<String>,
    pub log: Vec<StepOutcome>,
    pub conflicts: Vec<Conflict>,
    pub sandbox_run_id: Option<String>,
    pub checks: Vec<CheckResult>,
    pub retried: bool,
    pub retry_reason: Option<String>,
    pub attempt1: Option<AttemptReport>,
    pub attempt2: Option<AttemptReport>,
    pub message: Option<String>,
}

/// Outcome of an execute call. Needing confirmation is not a failure; it is
/// a distinct response carrying the exact blocking paths.
#[derive(Debug)]
pub enum ExecuteOutcome {
    Completed(ExecuteResult),
    NeedsProtectedConfirmation { paths: Vec<String> },
}

fn describe_step(step: &Step) -> String {
    match step {
        Step::FileEdit { path, .. } => format!("edit {}", path),
        Step::Command { command, .. } => format!("run {}", command),
    }
}

pub struct Executor {
    store: Arc<dyn WorkspaceStore>,
    runner: Arc<dyn CommandRunner>,
    planner: Arc<dyn Planner>,
    config: PipelineConfig,
    gate: ProtectedPathGate,
}

impl Executor {
    pub fn new(
        store: Arc<dyn WorkspaceStore>,
        runner: Arc<dyn CommandRunner>,
        planner: Arc<dyn Planner>,
        config: PipelineConfig,
    ) -> Self {
        let gate = ProtectedPathGate::new(config.protected_paths.clone());
        Self {
            store,
            runner,
            planner,
            config,
            gate,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Execute one reviewed plan.
    ///
    /// `submitted_hash` must equal the canonical hash of `plan`; anything
    /// else means the user is not looking at this plan anymore (stale UI,
    /// replay, tampering) and the request is rejected before any work.
    pub async fn execute(
        &self,
        plan: Plan,
        submitted_hash: &str,
        confirmed_protected_paths: &[String],
        scope_mode: ScopeMode,
        source: RunOrigin,
    ) -> Result<ExecuteOutcome, PipelineError> {
        self.execute_inner(
            plan,
            submitted_hash,
            confirmed_protected_paths,
            scope_mode,
            source,
            None,
        )
        .await
    }

    /// Debug-from-log entry point: same pipeline, with the failure
    /// fingerprint from the triggering log carried into run provenance and
    /// repair prompts.
    pub async fn execute_from_log(
        &self,
        plan: Plan,
        submitted_hash: &str,
        confirmed_protected_paths: &[String],
        scope_mode: ScopeMode,
        fingerprint: Option<String>,
    ) -> Result<ExecuteOutcome, PipelineError> {
        self.execute_inner(
            plan,
            submitted_hash,
            confirmed_protected_paths,
            scope_mode,
            RunOrigin::DebugFromLog,
            fingerprint,
        )
        .await
    }

    #[instrument(skip_all, fields(source = source.label(), steps = plan.steps.len()))]
    async fn execute_inner(
        &self,
        mut plan: Plan,
        submitted_hash: &str,
        confirmed_protected_paths: &[String],
        scope_mode: ScopeMode,
        source: RunOrigin,
        fingerprint: Option<String>,
    ) -> Result<ExecuteOutcome, PipelineError> {
        let expected = plan_hash(&plan);
        if submitted_hash.is_empty() || submitted_hash != expected {
            return Err(PipelineError::PlanHashMismatch {
                expected,
                provided: submitted_hash.to_string(),
            });
        }

        plan.validate()?;

        match self
            .gate
            .check(&plan, confirmed_protected_paths, self.config.safe_edit_mode)
        {
            GateDecision::Proceed => {}
            GateDecision::NeedsConfirmation(paths) => {
                info!(blocked = paths.len(), "protected paths need confirmation");
                return Ok(ExecuteOutcome::NeedsProtectedConfirmation { paths });
            }
        }

        plan.ensure_python_venv();
        let summary = plan.summary.clone();
        let merged = plan.merge_file_edits();
        let capped = cap_steps(merged.steps, scope_mode, &self.config.scope_caps);

        let mut result = if source.is_sandboxed() {
            self.execute_sandboxed(&capped.kept, summary.as_deref(), source, fingerprint)
                .await?
        } else {
            self.execute_agent(&capped.kept).await?
        };

        // Truncation is an outcome, not a log line: every dropped step gets
        // an activity entry and the result says the plan was cut.
        if !capped.dropped.is_empty() {
            let base = capped.kept.len();
            for (i, step) in capped.dropped.iter().enumerate() {
                result.log.push(StepOutcome {
                    index: base + i,
                    detail: format!(
                        "dropped by conservative scope cap: {}",
                        describe_step(step)
                    ),
                    ok: false,
                });
            }
            let names: Vec<String> = capped.dropped.iter().map(describe_step).collect();
            let notice = format!(
                "Conservative scope cap exceeded; {} step(s) not executed: {}",
                capped.dropped.len(),
                names.join(", ")
            );
            result.message = Some(match result.message.take() {
                Some(existing) => format!("{}\n{}", notice, existing),
                None => notice,
            });
        }

        Ok(ExecuteOutcome::Completed(result))
    }

    async fn execute_sandboxed(
        &self,
        steps: &[Step],
        summary: Option<&str>,
        source: RunOrigin,
        fingerprint: Option<String>,
    ) -> Result<ExecuteResult, PipelineError> {
        let run = repair::execute_sandboxed(
            self.store.as_ref(),
            self.runner.as_ref(),
            self.planner.as_ref(),
            &self.config,
            steps,
            summary,
            source,
            fingerprint,
        )
        .await?;

        let mut log = Vec::new();
        for (i, step) in steps.iter().enumerate() {
            let (detail, ok) = match step {
                Step::FileEdit { path, .. } => {
                    if run.files_edited.iter().any(|p| p == path) {
                        (format!("edited {}", path), true)
                    } else if let Some(conflict) = run.conflicts.iter().find(|c| &c.path == path) {
                        (format!("conflict in {}: {}", path, conflict.reason), false)
                    } else {
                        (format!("{}: not promoted", path), run.success)
                    }
                }
                Step::Command { command, .. } => {
                    // Sandboxed sources verify via check phases, not per-step
                    // command execution.
                    (format!("command deferred to verification: {}", command), true)
                }
            };
            log.push(StepOutcome {
                index: i,
                detail,
                ok,
            });
        }

        Ok(ExecuteResult {
            success: run.success,
            files_edited: run.files_edited,
            log,
            conflicts: run.conflicts,
            sandbox_run_id: run.sandbox_run_id,
            checks: run.checks,
            retried: run.retried,
            retry_reason: run.retry_reason,
            attempt1: run.attempt1,
            attempt2: run.attempt2,
            message: run.message,
        })
    }

    /// Direct-apply path: file edits land on the live workspace as they are
    /// applied; failed test commands get the single-command autofix.
    async fn execute_agent(&self, steps: &[Step]) -> Result<ExecuteResult, PipelineError> {
        let mut files_edited: Vec<String> = Vec::new();
        let mut conflicts: Vec<Conflict> = Vec::new();
        let mut log: Vec<StepOutcome> = Vec::new();
        let mut command_failed = false;

        for (i, step) in steps.iter().enumerate() {
            match step {
                Step::FileEdit {
                    path,
                    new_content,
                    old_content,
                    ..
                } => {
                    let current = self
                        .store
                        .get(path)
                        .map_err(|e| PipelineError::infra(format!("store read failed: {}", e)))?;
                    match diff::apply(current.as_deref(), new_content, old_content.as_deref()) {
                        Ok(applied) => {
                            let write = if current.is_some() {
                                self.store.update(path, &applied.content)
                            } else {
                                self.store.insert(path, &applied.content)
                            };
                            write.map_err(|e| {
                                PipelineError::infra(format!("store write failed: {}", e))
                            })?;
                            if !files_edited.iter().any(|p| p == path) {
                                files_edited.push(path.clone());
                            }
                            log.push(StepOutcome {
                                index: i,
                                detail: format!("edited {}", path),
                                ok: true,
                            });
                        }
                        Err(conflict) => {
                            log.push(StepOutcome {
                                index: i,
                                detail: format!("conflict in {}: {}", path, conflict.reason),
                                ok: false,
                            });
                            conflicts.push(Conflict {
                                path: path.clone(),
                                reason: conflict.reason,
                            });
                        }
                    }
                }
                Step::Command { command, .. } => {
                    let Some(exec_dir) = self.config.exec_dir.clone() else {
                        log.push(StepOutcome {
                            index: i,
                            detail: format!("skipped (no execution directory): {}", command),
                            ok: true,
                        });
                        continue;
                    };

                    let timeout = Duration::from_secs(self.config.check_timeout_secs);
                    let outcome = match self.runner.run(command, &exec_dir, timeout) {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            command_failed = true;
                            log.push(StepOutcome {
                                index: i,
                                detail: format!("failed to run '{}': {}", command, e),
                                ok: false,
                            });
                            continue;
                        }
                    };

                    if outcome.success() {
                        log.push(StepOutcome {
                            index: i,
                            detail: format!("ran {}", command),
                            ok: true,
                        });
                        continue;
                    }

                    if !repair::is_test_command(command) {
                        command_failed = true;
                        log.push(StepOutcome {
                            index: i,
                            detail: format!(
                                "command failed: {}\n{}",
                                command,
                                util::truncate(
                                    &outcome.combined_output(),
                                    self.config.output_limit_chars
                                )
                            ),
                            ok: false,
                        });
                        continue;
                    }

                    // One autofix, one re-run, nothing more.
                    let fix = repair::auto_fix_failed_command(
                        self.store.as_ref(),
                        self.runner.as_ref(),
                        self.planner.as_ref(),
                        &self.config,
                        command,
                        &outcome,
                    )
                    .await;

                    match fix {
                        Ok(fix) => {
                            for path in &fix.edits_applied {
                                if !files_edited.iter().any(|p| p == path) {
                                    files_edited.push(path.clone());
                                }
                            }
                            conflicts.extend(fix.conflicts.clone());
                            let rerun_passed =
                                fix.rerun.as_ref().map(|r| r.success()).unwrap_or(false);
                            if !rerun_passed {
                                command_failed = true;
                            }
                            log.push(StepOutcome {
                                index: i,
                                detail: format!(
                                    "test command failed, auto-fix edited [{}], re-run {}",
                                    fix.edits_applied.join(", "),
                                    if rerun_passed { "passed" } else { "failed" }
                                ),
                                ok: rerun_passed,
                            });
                        }
                        Err(e) => {
                            command_failed = true;
                            log.push(StepOutcome {
                                index: i,
                                detail: format!("auto-fix unavailable for '{}': {}", command, e),
                                ok: false,
                            });
                        }
                    }
                }
            }
        }

        Ok(ExecuteResult {
            success: conflicts.is_empty() && !command_failed,
            files_edited,
            log,
            conflicts,
            sandbox_run_id: None,
            checks: Vec::new(),
            retried: false,
            retry_reason: None,
            attempt1: None,
            attempt2: None,
            message: None,
        })
    }
}
