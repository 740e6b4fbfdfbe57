//! Verification checks
//!
//! Detects which lint/tests/run commands the staged workspace's toolchain
//! supports, then executes the phases sequentially under a wall-clock
//! timeout. Later phases run regardless of earlier outcomes so one sandbox
//! instantiation yields maximum diagnostics. A phase with no configured
//! command is skipped, not failed.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;
use std::time::Duration;
use tracing::debug;

use crate::error::PipelineError;
use crate::util::{run_command_with_timeout, truncate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckPhase {
    Lint,
    Tests,
    Run,
}

impl CheckPhase {
    pub fn label(&self) -> &'static str {
        match self {
            CheckPhase::Lint => "lint",
            CheckPhase::Tests => "tests",
            CheckPhase::Run => "run",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Passed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub phase: CheckPhase,
    pub status: CheckStatus,
    /// Combined stdout/stderr (truncated).
    pub output: String,
}

/// True iff no phase failed. Skipped phases do not count against a run.
pub fn checks_passed(results: &[CheckResult]) -> bool {
    results.iter().all(|r| r.status != CheckStatus::Failed)
}

/// The verification commands configured for a detected project stack.
/// None means the phase has nothing to run and is marked skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackCommands {
    pub lint: Option<String>,
    pub tests: Option<String>,
    pub run: Option<String>,
}

/// Detect verification commands from the staged file set.
///
/// Stacks are probed in a fixed order and each phase slot is filled by the
/// first stack that provides it, so a polyglot workspace still gets one
/// command per phase.
pub fn detect_stack(files: &BTreeMap<String, String>) -> StackCommands {
    let mut commands = StackCommands::default();

    if files.contains_key("Cargo.toml") {
        commands.lint = Some("cargo fmt -- --check".to_string());
        commands.tests = Some("cargo test -q".to_string());
        commands.run = Some("cargo build -q".to_string());
    }

    if files.contains_key("go.mod") {
        fill(&mut commands.lint, "gofmt -l .");
        fill(&mut commands.tests, "go test ./...");
        fill(&mut commands.run, "go build ./...");
    }

    if let Some(pkg) = files.get("package.json") {
        if let Ok(json) = serde_json::from_str::<serde_json::Value>(pkg) {
            let scripts = json.get("scripts");
            let has_script = |name: &str| {
                scripts
                    .and_then(|s| s.get(name))
                    .and_then(|v| v.as_str())
                    .is_some()
            };
            if has_script("lint") {
                fill(&mut commands.lint, "npm run lint");
            }
            if has_script("test") {
                fill(&mut commands.tests, "npm test");
            }
            if has_script("build") {
                fill(&mut commands.run, "npm run build");
            }
        }
    }

    let has_pyproject = files.contains_key("pyproject.toml");
    if has_pyproject || files.contains_key("requirements.txt") {
        let ruff_configured = files
            .get("pyproject.toml")
            .and_then(|raw| raw.parse::<toml::Table>().ok())
            .and_then(|table| table.get("tool").cloned())
            .map(|tool| tool.get("ruff").is_some())
            .unwrap_or(false);
        if ruff_configured {
            fill(&mut commands.lint, "ruff check .");
        } else {
            fill(&mut commands.lint, "python -m compileall -q .");
        }
        let has_tests = files
            .keys()
            .any(|p| p.starts_with("tests/") || p.rsplit('/').next().is_some_and(|f| f.starts_with("test_") && f.ends_with(".py")));
        if has_tests {
            fill(&mut commands.tests, "pytest -q");
        }
    }

    commands
}

fn fill(slot: &mut Option<String>, command: &str) {
    if slot.is_none() {
        *slot = Some(command.to_string());
    }
}

#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    pub fn combined_output(&self) -> String {
        let mut combined = String::new();
        if !self.stdout.trim().is_empty() {
            combined.push_str(self.stdout.trim());
        }
        if !self.stderr.trim().is_empty() {
            if !combined.is_empty() {
                combined.push('\n');
            }
            combined.push_str(self.stderr.trim());
        }
        combined
    }
}

/// External command runner collaborator. Tests substitute scripted runners;
/// production uses [`SystemRunner`].
pub trait CommandRunner: Send + Sync {
    fn run(&self, command: &str, cwd: &Path, timeout: Duration) -> anyhow::Result<CommandOutcome>;
}

/// Runs commands as real subprocesses with a kill-on-deadline timeout.
#[derive(Debug, Default, Clone)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, command: &str, cwd: &Path, timeout: Duration) -> anyhow::Result<CommandOutcome> {
        let mut parts = command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| anyhow::anyhow!("Empty command"))?;
        let args: Vec<&str> = parts.collect();

        let mut cmd = Command::new(program);
        cmd.current_dir(cwd).args(&args);

        let result = run_command_with_timeout(&mut cmd, timeout).map_err(anyhow::Error::msg)?;
        Ok(CommandOutcome {
            exit_code: result.status.and_then(|s| s.code()),
            stdout: result.stdout,
            stderr: result.stderr,
            timed_out: result.timed_out,
        })
    }
}

/// Execute the three verification phases sequentially.
///
/// A missing command skips its phase. A timeout records the phase as failed
/// with a timeout message. A command that cannot be found on this machine is
/// skipped (the stack is configured, the tool is not installed); any other
/// spawn failure is sandbox infrastructure and aborts the request.
pub fn run_checks(
    runner: &dyn CommandRunner,
    dir: &Path,
    stack: &StackCommands,
    timeout: Duration,
    output_limit: usize,
) -> Result<Vec<CheckResult>, PipelineError> {
    let phases = [
        (CheckPhase::Lint, stack.lint.as_deref()),
        (CheckPhase::Tests, stack.tests.as_deref()),
        (CheckPhase::Run, stack.run.as_deref()),
    ];

    let mut results = Vec::with_capacity(phases.len());
    for (phase, command) in phases {
        let Some(command) = command else {
            results.push(CheckResult {
                phase,
                status: CheckStatus::Skipped,
                output: "No command configured for this stack".to_string(),
            });
            continue;
        };

        debug!(phase = phase.label(), command, "running verification phase");
        match runner.run(command, dir, timeout) {
            Ok(outcome) => {
                let status = if outcome.timed_out {
                    CheckStatus::Failed
                } else if outcome.success() {
                    CheckStatus::Passed
                } else {
                    CheckStatus::Failed
                };
                let output = if outcome.timed_out {
                    format!(
                        "Timed out after {}s: {}",
                        timeout.as_secs(),
                        truncate(&outcome.combined_output(), output_limit)
                    )
                } else {
                    truncate(&outcome.combined_output(), output_limit)
                };
                results.push(CheckResult {
                    phase,
                    status,
                    output,
                });
            }
            Err(e) => {
                // A tool the stack wants but the machine lacks is a skip;
                // anything else failing to spawn is infrastructure.
                let text = e.to_string().to_lowercase();
                let not_installed = e
                    .downcast_ref::<std::io::Error>()
                    .map(|io| io.kind() == std::io::ErrorKind::NotFound)
                    .unwrap_or(false)
                    || text.contains("no such file")
                    || text.contains("not found");
                if not_installed {
                    results.push(CheckResult {
                        phase,
                        status: CheckStatus::Skipped,
                        output: format!("Skipped: {}", e),
                    });
                } else {
                    return Err(PipelineError::infra(format!(
                        "failed to spawn '{}': {}",
                        command, e
                    )));
                }
            }
        }
    }

    Ok(results)
}
