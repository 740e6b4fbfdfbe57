//! Sandbox runs
//!
//! A `SandboxRun` is one isolated, disposable attempt at a plan: it
//! snapshots the workspace's file set, stages edits against the copy, runs
//! verification in a materialized temp directory, and either promotes the
//! verified edits back into the live workspace or is discarded. Live files
//! are untouched until promote; that structural isolation, not locking, is
//! what makes concurrent requests safe.
//!
//! State machine: CREATED -> EDITS_APPLIED -> CHECKS_RUN -> {PROMOTED |
//! DISCARDED}. Retries never transition an existing run; a retry is always
//! a fresh run.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::checks::{self, CheckResult, CommandRunner};
use crate::config::PipelineConfig;
use crate::diff;
use crate::error::PipelineError;
use crate::plan::Step;
use crate::store::WorkspaceStore;
use crate::util::hash_str;

const SANDBOX_ROOT_DIR: &str = "nova-sandbox";

/// Where a run came from. Agent edits apply directly and never build one of
/// these; the origin is still recorded for the direct path's telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOrigin {
    Agent,
    Composer,
    DebugFromLog,
}

impl RunOrigin {
    pub fn label(&self) -> &'static str {
        match self {
            RunOrigin::Agent => "agent",
            RunOrigin::Composer => "composer",
            RunOrigin::DebugFromLog => "debug_from_log",
        }
    }

    /// Composer and debug-from-log edits are narrow and high-confidence;
    /// they earn a hold-out verification stage before touching live files.
    pub fn is_sandboxed(&self) -> bool {
        !matches!(self, RunOrigin::Agent)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Created,
    EditsApplied,
    ChecksRun,
    Promoted,
    Discarded,
}

/// A planned edit that could not be applied because the target drifted from
/// the state the plan assumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub path: String,
    pub reason: String,
}

/// Per-run application outcome.
#[derive(Debug, Clone, Default)]
pub struct ApplyOutcome {
    pub files_edited: BTreeSet<String>,
    pub conflicts: Vec<Conflict>,
}

#[derive(Debug, Clone, Default)]
pub struct PromoteOutcome {
    pub promoted: Vec<String>,
    pub conflicts: Vec<Conflict>,
}

/// One isolated attempt. Owns a snapshot of workspace files plus provenance
/// metadata; torn down on every exit path.
#[derive(Debug)]
pub struct SandboxRun {
    id: String,
    origin: RunOrigin,
    fingerprint: Option<String>,
    created_at: DateTime<Utc>,
    state: RunState,
    /// Staged copy of the workspace, mutated by edits.
    files: BTreeMap<String, String>,
    /// Content hash of each file at snapshot time; promote uses this to
    /// detect out-of-band live edits.
    baseline: BTreeMap<String, String>,
    edited: BTreeSet<String>,
    run_dir: PathBuf,
}

impl SandboxRun {
    /// Snapshot the workspace's current file set into an isolated copy.
    pub fn create(
        store: &dyn WorkspaceStore,
        origin: RunOrigin,
        fingerprint: Option<String>,
    ) -> Result<Self, PipelineError> {
        let id = Uuid::new_v4().to_string();
        let mut files = BTreeMap::new();
        let mut baseline = BTreeMap::new();

        let paths = store
            .list()
            .map_err(|e| PipelineError::infra(format!("workspace snapshot failed: {}", e)))?;
        for path in paths {
            let Some(content) = store
                .get(&path)
                .map_err(|e| PipelineError::infra(format!("workspace snapshot failed: {}", e)))?
            else {
                continue;
            };
            baseline.insert(path.clone(), hash_str(&content));
            files.insert(path, content);
        }

        let run_dir = std::env::temp_dir().join(SANDBOX_ROOT_DIR).join(&id);
        info!(
            run_id = %id,
            origin = origin.label(),
            files = files.len(),
            "sandbox run created"
        );

        Ok(Self {
            id,
            origin,
            fingerprint,
            created_at: Utc::now(),
            state: RunState::Created,
            files,
            baseline,
            edited: BTreeSet::new(),
            run_dir,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn origin(&self) -> RunOrigin {
        self.origin
    }

    pub fn fingerprint(&self) -> Option<&str> {
        self.fingerprint.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Staged content of a path, for result assembly and tests.
    pub fn staged(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(String::as_str)
    }

    /// Run each file edit through the diff engine against the sandbox copy
    /// only. A conflict on one path does not abort the remaining steps.
    pub fn apply_edits(&mut self, steps: &[Step]) -> Result<ApplyOutcome, PipelineError> {
        self.expect_state(RunState::Created, "apply_edits")?;

        let mut outcome = ApplyOutcome::default();
        for step in steps {
            let Step::FileEdit {
                path,
                new_content,
                old_content,
                ..
            } = step
            else {
                continue;
            };

            let current = self.files.get(path).map(String::as_str);
            match diff::apply(current, new_content, old_content.as_deref()) {
                Ok(applied) => {
                    if applied.normalized_rewrite {
                        debug!(path, "edit applied via normalized rewrite");
                    }
                    self.files.insert(path.clone(), applied.content);
                    self.edited.insert(path.clone());
                    outcome.files_edited.insert(path.clone());
                }
                Err(conflict) => {
                    warn!(path, reason = %conflict.reason, "edit conflict in sandbox");
                    outcome.conflicts.push(Conflict {
                        path: path.clone(),
                        reason: conflict.reason,
                    });
                }
            }
        }

        self.state = RunState::EditsApplied;
        Ok(outcome)
    }

    /// Materialize the staged copy to a real directory and run the
    /// verification phases there.
    pub fn run_checks(
        &mut self,
        runner: &dyn CommandRunner,
        config: &PipelineConfig,
    ) -> Result<Vec<CheckResult>, PipelineError> {
        self.expect_state(RunState::EditsApplied, "run_checks")?;

        let worktree = self.materialize()?;
        let stack = checks::detect_stack(&self.files);
        let results = checks::run_checks(
            runner,
            &worktree,
            &stack,
            Duration::from_secs(config.check_timeout_secs),
            config.output_limit_chars,
        )?;

        self.state = RunState::ChecksRun;
        Ok(results)
    }

    fn materialize(&self) -> Result<PathBuf, PipelineError> {
        let worktree = self.run_dir.join("worktree");
        if worktree.exists() {
            std::fs::remove_dir_all(&worktree)
                .map_err(|e| PipelineError::infra(format!("failed to clear worktree: {}", e)))?;
        }
        std::fs::create_dir_all(&worktree)
            .map_err(|e| PipelineError::infra(format!("failed to create worktree: {}", e)))?;

        for (path, content) in &self.files {
            let full = worktree.join(path);
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    PipelineError::infra(format!("failed to materialize '{}': {}", path, e))
                })?;
            }
            std::fs::write(&full, content).map_err(|e| {
                PipelineError::infra(format!("failed to materialize '{}': {}", path, e))
            })?;
        }

        Ok(worktree)
    }

    /// Copy each sandbox-edited file back into the live workspace. The sole
    /// path by which sandboxed sources mutate live state.
    ///
    /// A file that changed in the live workspace after sandbox creation is
    /// reported as a promote-time conflict, never silently overwritten.
    pub fn promote(&mut self, store: &dyn WorkspaceStore) -> Result<PromoteOutcome, PipelineError> {
        self.expect_state(RunState::ChecksRun, "promote")?;

        let mut outcome = PromoteOutcome::default();
        for path in &self.edited {
            let live = store
                .get(path)
                .map_err(|e| PipelineError::infra(format!("promote read failed: {}", e)))?;
            let live_hash = live.as_deref().map(hash_str);
            let snapshot_hash = self.baseline.get(path).cloned();

            if live_hash != snapshot_hash {
                outcome.conflicts.push(Conflict {
                    path: path.clone(),
                    reason: "file changed in the workspace since sandbox creation".to_string(),
                });
                continue;
            }

            let content = self
                .files
                .get(path)
                .ok_or_else(|| PipelineError::infra(format!("edited path missing: {}", path)))?;
            let write = if live.is_some() {
                store.update(path, content)
            } else {
                store.insert(path, content)
            };
            write.map_err(|e| PipelineError::infra(format!("promote write failed: {}", e)))?;
            outcome.promoted.push(path.clone());
        }

        info!(
            run_id = %self.id,
            promoted = outcome.promoted.len(),
            conflicts = outcome.conflicts.len(),
            "sandbox run promoted"
        );
        self.state = RunState::Promoted;
        self.cleanup();
        Ok(outcome)
    }

    /// Abandon the run. Terminal; the live workspace is left untouched and
    /// resources are reclaimed unconditionally.
    pub fn discard(&mut self) {
        if matches!(self.state, RunState::Promoted | RunState::Discarded) {
            return;
        }
        info!(run_id = %self.id, "sandbox run discarded");
        self.state = RunState::Discarded;
        self.cleanup();
    }

    fn cleanup(&self) {
        if self.run_dir.exists() {
            let _ = std::fs::remove_dir_all(&self.run_dir);
        }
    }

    fn expect_state(&self, expected: RunState, op: &str) -> Result<(), PipelineError> {
        if self.state != expected {
            return Err(PipelineError::infra(format!(
                "{} called in state {:?} (expected {:?})",
                op, self.state, expected
            )));
        }
        Ok(())
    }
}

impl Drop for SandboxRun {
    // Abandoned requests still reclaim sandbox resources.
    fn drop(&mut self) {
        if !matches!(self.state, RunState::Promoted | RunState::Discarded) {
            self.cleanup();
        }
    }
}
