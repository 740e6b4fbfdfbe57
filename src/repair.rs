//! Bounded self-repair
//!
//! Two distinct mechanisms, both with hard budgets:
//!
//! * The sandboxed loop: when verification fails with usable logs, the
//!   planning collaborator is invoked once more under forced conservative
//!   scope, and the new edits get a brand-new sandbox run. Two attempts
//!   total, never a third.
//! * The agent-path autofix: a failed test command gets minimal corrective
//!   edits applied directly to the live workspace and one re-run of the
//!   same command. Single-command correction, not a re-plan.

use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{info, warn};

use crate::checks::{checks_passed, CheckResult, CheckStatus, CommandOutcome, CommandRunner};
use crate::config::PipelineConfig;
use crate::diff;
use crate::error::PipelineError;
use crate::plan::Step;
use crate::planner::{CommandFixRequest, Planner, PlannedEdit, RepairRequest};
use crate::policy::{cap_steps, ScopeMode};
use crate::sandbox::{Conflict, RunOrigin, SandboxRun};
use crate::store::WorkspaceStore;
use crate::util::output_tail;

/// Telemetry for one sandboxed attempt, retained whatever the outcome.
#[derive(Debug, Clone)]
pub struct AttemptReport {
    pub run_id: String,
    pub passed: bool,
    pub checks: Vec<CheckResult>,
    pub log_summary: String,
}

/// Outcome of the sandboxed path, repair loop included.
#[derive(Debug, Clone)]
pub struct SandboxedExecution {
    pub success: bool,
    pub files_edited: Vec<String>,
    pub conflicts: Vec<Conflict>,
    /// Check results of the attempt that decided the outcome.
    pub checks: Vec<CheckResult>,
    pub sandbox_run_id: Option<String>,
    pub retried: bool,
    pub retry_reason: Option<String>,
    pub attempt1: Option<AttemptReport>,
    pub attempt2: Option<AttemptReport>,
    pub message: Option<String>,
}

/// Concatenate the failing phases' output for the repair prompt and the
/// user-facing report.
pub fn failure_summary(checks: &[CheckResult], limit: usize) -> String {
    let mut summary = String::new();
    for check in checks {
        if check.status != CheckStatus::Failed || check.output.trim().is_empty() {
            continue;
        }
        if !summary.is_empty() {
            summary.push('\n');
        }
        summary.push_str(&format!("=== {} ===\n{}", check.phase.label(), check.output));
    }
    output_tail(&summary, limit)
}

/// Retry reason derived from the first failing phase, e.g.
/// `sandbox_tests_failed`.
pub fn retry_reason(checks: &[CheckResult]) -> Option<String> {
    checks
        .iter()
        .find(|c| c.status == CheckStatus::Failed)
        .map(|c| format!("sandbox_{}_failed", c.phase.label()))
}

struct Attempt {
    run: SandboxRun,
    files_edited: Vec<String>,
    apply_conflicts: Vec<Conflict>,
    checks: Vec<CheckResult>,
}

fn run_attempt(
    store: &dyn WorkspaceStore,
    runner: &dyn CommandRunner,
    config: &PipelineConfig,
    steps: &[Step],
    origin: RunOrigin,
    fingerprint: Option<String>,
) -> Result<Attempt, PipelineError> {
    let mut run = SandboxRun::create(store, origin, fingerprint)?;
    let apply = run.apply_edits(steps)?;
    let checks = run.run_checks(runner, config)?;
    Ok(Attempt {
        run,
        files_edited: apply.files_edited.into_iter().collect(),
        apply_conflicts: apply.conflicts,
        checks,
    })
}

fn report(attempt: &Attempt, config: &PipelineConfig) -> AttemptReport {
    AttemptReport {
        run_id: attempt.run.id().to_string(),
        passed: checks_passed(&attempt.checks),
        checks: attempt.checks.clone(),
        log_summary: failure_summary(&attempt.checks, config.output_limit_chars),
    }
}

fn promote_attempt(
    mut attempt: Attempt,
    store: &dyn WorkspaceStore,
) -> Result<(Vec<String>, Vec<Conflict>, Vec<CheckResult>, String), PipelineError> {
    let promote = attempt.run.promote(store)?;
    let mut conflicts = attempt.apply_conflicts;
    conflicts.extend(promote.conflicts);
    Ok((
        promote.promoted,
        conflicts,
        attempt.checks,
        attempt.run.id().to_string(),
    ))
}

/// Run the sandboxed path for a plan: stage, verify, promote on success,
/// and on verification failure drive the bounded repair loop.
pub(crate) async fn execute_sandboxed(
    store: &dyn WorkspaceStore,
    runner: &dyn CommandRunner,
    planner: &dyn Planner,
    config: &PipelineConfig,
    steps: &[Step],
    plan_summary: Option<&str>,
    origin: RunOrigin,
    fingerprint: Option<String>,
) -> Result<SandboxedExecution, PipelineError> {
    let attempt1 = run_attempt(store, runner, config, steps, origin, fingerprint.clone())?;
    let attempt1_report = report(&attempt1, config);

    if attempt1_report.passed {
        let (files, conflicts, checks, run_id) = promote_attempt(attempt1, store)?;
        return Ok(SandboxedExecution {
            success: conflicts.is_empty(),
            files_edited: files,
            conflicts,
            checks,
            sandbox_run_id: Some(run_id),
            retried: false,
            retry_reason: None,
            attempt1: Some(attempt1_report),
            attempt2: None,
            message: None,
        });
    }

    let reason = retry_reason(&attempt1.checks);
    let failure_log = failure_summary(&attempt1.checks, config.output_limit_chars);

    // Retry only buys anything when the failure produced diagnostics the
    // planner can read.
    if failure_log.trim().is_empty() {
        let mut attempt1 = attempt1;
        attempt1.run.discard();
        return Ok(SandboxedExecution {
            success: false,
            files_edited: Vec::new(),
            conflicts: attempt1.apply_conflicts,
            checks: attempt1.checks.clone(),
            sandbox_run_id: Some(attempt1.run.id().to_string()),
            retried: false,
            retry_reason: reason,
            attempt1: Some(attempt1_report),
            attempt2: None,
            message: Some(
                "Verification failed without diagnostic output; review the change manually."
                    .to_string(),
            ),
        });
    }

    info!(reason = reason.as_deref().unwrap_or("unknown"), "starting self-repair attempt");
    let request = RepairRequest {
        plan_summary: plan_summary.map(|s| s.to_string()),
        failure_log: failure_log.clone(),
        scope_mode: ScopeMode::Conservative,
        fingerprint: fingerprint.clone(),
    };
    let repair_edits = match planner.repair(&request).await {
        Ok(edits) if !edits.is_empty() => edits,
        Ok(_) | Err(_) => {
            warn!("planner produced no usable repair; surfacing original failure");
            let mut attempt1 = attempt1;
            attempt1.run.discard();
            return Ok(SandboxedExecution {
                success: false,
                files_edited: Vec::new(),
                conflicts: attempt1.apply_conflicts,
                checks: attempt1.checks.clone(),
                sandbox_run_id: Some(attempt1.run.id().to_string()),
                retried: false,
                retry_reason: reason,
                attempt1: Some(attempt1_report),
                attempt2: None,
                message: Some(format!(
                    "Verification failed and no automatic repair was available; \
                     review manually.\n{}",
                    failure_log
                )),
            });
        }
    };

    // Attempt 1's sandbox is done; the retry always gets a fresh run.
    {
        let mut attempt1 = attempt1;
        attempt1.run.discard();
    }

    let repair_steps: Vec<Step> = repair_edits.into_iter().map(planned_edit_to_step).collect();
    let repair_steps = cap_steps(repair_steps, ScopeMode::Conservative, &config.scope_caps).kept;

    let attempt2 = run_attempt(store, runner, config, &repair_steps, origin, fingerprint)?;
    let attempt2_report = report(&attempt2, config);

    if attempt2_report.passed {
        let (files, conflicts, checks, run_id) = promote_attempt(attempt2, store)?;
        return Ok(SandboxedExecution {
            success: conflicts.is_empty(),
            files_edited: files,
            conflicts,
            checks,
            sandbox_run_id: Some(run_id),
            retried: true,
            retry_reason: reason,
            attempt1: Some(attempt1_report),
            attempt2: Some(attempt2_report),
            message: None,
        });
    }

    // Budget exhausted: two attempts, both logs, explicit manual-review
    // instruction. No third attempt, ever.
    let mut attempt2 = attempt2;
    attempt2.run.discard();
    let attempt2_log = failure_summary(&attempt2.checks, config.output_limit_chars);
    Ok(SandboxedExecution {
        success: false,
        files_edited: Vec::new(),
        conflicts: attempt2.apply_conflicts.clone(),
        checks: attempt2.checks.clone(),
        sandbox_run_id: Some(attempt2.run.id().to_string()),
        retried: true,
        retry_reason: reason,
        attempt1: Some(attempt1_report),
        attempt2: Some(attempt2_report),
        message: Some(format!(
            "Automatic repair failed after 2 attempts; review manually.\n\
             --- attempt 1 ---\n{}\n--- attempt 2 ---\n{}",
            failure_log, attempt2_log
        )),
    })
}

fn planned_edit_to_step(edit: PlannedEdit) -> Step {
    Step::FileEdit {
        path: edit.path,
        new_content: edit.new_content,
        old_content: edit.old_content,
        description: Some("self-repair".to_string()),
        source: None,
    }
}

/// Classify a command as a test run for the agent-path autofix.
pub fn is_test_command(command: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(cargo\s+test|pytest|go\s+test|npm\s+test|npm\s+run\s+test|yarn\s+test|pnpm\s+test|jest|vitest)\b",
        )
        .expect("valid regex")
    });
    re.is_match(command)
}

/// What the agent-path autofix did for one failed command.
#[derive(Debug, Clone, Default)]
pub struct CommandFixOutcome {
    pub edits_applied: Vec<String>,
    pub conflicts: Vec<Conflict>,
    /// Output of the single re-run, when one happened.
    pub rerun: Option<CommandOutcome>,
}

/// Propose minimal edits for one failed test command, apply them directly
/// to the live workspace, and re-run the same command exactly once.
pub(crate) async fn auto_fix_failed_command(
    store: &dyn WorkspaceStore,
    runner: &dyn CommandRunner,
    planner: &dyn Planner,
    config: &PipelineConfig,
    command: &str,
    failed: &CommandOutcome,
) -> anyhow::Result<CommandFixOutcome> {
    let request = CommandFixRequest {
        command: command.to_string(),
        output_tail: output_tail(&failed.combined_output(), config.output_limit_chars),
    };
    let edits = planner.propose_command_fix(&request).await?;

    let mut outcome = CommandFixOutcome::default();
    for edit in edits {
        let current = store.get(&edit.path)?;
        match diff::apply(current.as_deref(), &edit.new_content, edit.old_content.as_deref()) {
            Ok(applied) => {
                if current.is_some() {
                    store.update(&edit.path, &applied.content)?;
                } else {
                    store.insert(&edit.path, &applied.content)?;
                }
                outcome.edits_applied.push(edit.path);
            }
            Err(conflict) => outcome.conflicts.push(Conflict {
                path: edit.path,
                reason: conflict.reason,
            }),
        }
    }

    if let Some(exec_dir) = &config.exec_dir {
        let rerun = runner.run(
            command,
            exec_dir,
            Duration::from_secs(config.check_timeout_secs),
        )?;
        outcome.rerun = Some(rerun);
    }

    Ok(outcome)
}
