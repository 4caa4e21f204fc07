//! Error taxonomy: run-level configuration errors and per-item failures.

use kairn_core::{AdapterError, AdapterErrorKind, ObjectError};
use serde::Serialize;

/// Detected before planning; fatal to the whole run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("duplicate object {reference} (from {first} and {second})")]
    DuplicateReference { reference: String, first: String, second: String },
    #[error("dependency cycle: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),
    #[error("invalid ignore rule '{rule}': {reason}")]
    InvalidIgnoreRule { rule: String, reason: String },
    #[error("invalid deploy-after hint '{hint}' on {object}")]
    InvalidHint { object: String, hint: String },
    #[error("invalid object in {source_path}: {reason}")]
    InvalidObject { source_path: String, reason: String },
}

/// Conditions that abort a run outright.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("cluster discovery failed: {0}")]
    Discovery(AdapterError),
    #[error("run cancelled before any object was processed")]
    Cancelled,
}

/// Failure of a single object; recorded, never aborts the run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum ItemError {
    #[error("diff failed: {message}")]
    Diff { message: String },
    #[error("{kind}: {message}")]
    Adapter { kind: AdapterErrorKind, message: String },
    #[error("kind {kind} is not served by the cluster")]
    UnknownKind { kind: String },
    #[error("prune failed: {kind}: {message}")]
    Prune { kind: AdapterErrorKind, message: String },
}

impl ItemError {
    pub fn prune(e: AdapterError) -> Self { ItemError::Prune { kind: e.kind, message: e.message } }
}

impl From<AdapterError> for ItemError {
    fn from(e: AdapterError) -> Self { ItemError::Adapter { kind: e.kind, message: e.message } }
}

impl From<ObjectError> for ItemError {
    fn from(e: ObjectError) -> Self { ItemError::Diff { message: e.to_string() } }
}
