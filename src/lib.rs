//! Nova pipeline library crate
//!
//! The edit-apply-verify-promote pipeline behind Nova's assistant surfaces:
//! plan validation and hashing, containment-splice diffs, the protected-path
//! gate and scope limiter, sandboxed verification runs, the bounded
//! self-repair loop, and the execution coordinator that ties them together.

pub mod checks;
pub mod config;
pub mod diff;
pub mod error;
pub mod executor;
pub mod llm;
pub mod plan;
pub mod planner;
pub mod policy;
pub mod repair;
pub mod sandbox;
pub mod store;
pub mod util;

pub use error::PipelineError;
pub use executor::{ExecuteOutcome, ExecuteResult, Executor};
