//! Pipeline error taxonomy
//!
//! One variant per failure class so embedders can branch on what went wrong
//! instead of string-matching. Per-step apply conflicts are deliberately not
//! here: they are recovered locally and reported in the result's conflict
//! list rather than aborting the request.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed plan or step (empty plan, missing fields, empty command).
    #[error("invalid plan: {0}")]
    PlanValidation(String),

    /// Absolute path or parent traversal in a step path.
    #[error("path rejected: {0}")]
    PathPolicy(String),

    /// The submitted hash does not match the plan content. The plan the UI
    /// shows is no longer the plan being executed; reject without touching
    /// anything.
    #[error("plan hash mismatch: expected {expected}, got {provided}")]
    PlanHashMismatch { expected: String, provided: String },

    /// Snapshot, materialization, or process-spawn failure inside the
    /// sandbox. Fatal for the request; never retried.
    ///
    /// Verification timeouts are not here: a command killed at its
    /// wall-clock deadline is a failed check phase, reported through
    /// `CheckResult` so the run can still finish its remaining phases.
    #[error("sandbox failure: {0}")]
    SandboxInfra(String),
}

impl PipelineError {
    pub fn infra(msg: impl Into<String>) -> Self {
        PipelineError::SandboxInfra(msg.into())
    }
}
