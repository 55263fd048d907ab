//! Ripple library crate
//!
//! Autonomous test repair: run a repository's tests in a sandbox, localize
//! the failure, request and apply a patch, verify, commit, repeat.

pub mod analyzer;
pub mod batch;
pub mod config;
pub mod error;
pub mod git_ops;
pub mod github;
pub mod llm;
pub mod orchestrator;
pub mod patch;
pub mod report;
pub mod sandbox;
pub mod score;
pub mod util;
pub mod vcs;
pub mod workflow;
pub mod workspace;

#[cfg(test)]
pub(crate) mod test_support;
