//! Cluster adapter contract: the only way the engine reads or mutates a cluster.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::object::GenericObject;
use crate::reference::{KindInfo, ObjectRef};

/// Label selector as exact key/value matches.
pub type Labels = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterErrorKind {
    NotFound,
    /// Optimistic-lock failure or an object that already exists.
    Conflict,
    Forbidden,
    /// Payload rejected by the server (schema, immutable fields).
    Invalid,
    ServerUnavailable,
    Other,
}

impl fmt::Display for AdapterErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AdapterErrorKind::NotFound => "not_found",
            AdapterErrorKind::Conflict => "conflict",
            AdapterErrorKind::Forbidden => "forbidden",
            AdapterErrorKind::Invalid => "invalid",
            AdapterErrorKind::ServerUnavailable => "server_unavailable",
            AdapterErrorKind::Other => "other",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct AdapterError {
    pub kind: AdapterErrorKind,
    pub message: String,
}

impl AdapterError {
    pub fn new(kind: AdapterErrorKind, message: impl Into<String>) -> Self { Self { kind, message: message.into() } }
    pub fn not_found(message: impl Into<String>) -> Self { Self::new(AdapterErrorKind::NotFound, message) }
    pub fn conflict(message: impl Into<String>) -> Self { Self::new(AdapterErrorKind::Conflict, message) }
    pub fn forbidden(message: impl Into<String>) -> Self { Self::new(AdapterErrorKind::Forbidden, message) }
    pub fn invalid(message: impl Into<String>) -> Self { Self::new(AdapterErrorKind::Invalid, message) }
    pub fn unavailable(message: impl Into<String>) -> Self { Self::new(AdapterErrorKind::ServerUnavailable, message) }
    pub fn other(message: impl Into<String>) -> Self { Self::new(AdapterErrorKind::Other, message) }
}

/// Every call is independently retryable by the caller; implementations never retry internally.
#[async_trait::async_trait]
pub trait ClusterAdapter: Send + Sync {
    /// Kinds served by the cluster, with their scope.
    async fn discover_kinds(&self) -> Result<Vec<KindInfo>, AdapterError>;

    /// Live object for `reference`, `None` if it does not exist.
    async fn get(&self, reference: &ObjectRef) -> Result<Option<GenericObject>, AdapterError>;

    /// Live objects of `kind` carrying every label in `selector`. `None` lists all namespaces.
    async fn list_by_labels(&self, kind: &KindInfo, namespace: Option<&str>, selector: &Labels) -> Result<Vec<GenericObject>, AdapterError>;

    async fn create(&self, reference: &ObjectRef, object: &GenericObject) -> Result<GenericObject, AdapterError>;

    /// Optimistic update: fails with `Conflict` when the payload's
    /// `metadata.resourceVersion` no longer matches the live object.
    async fn update(&self, reference: &ObjectRef, object: &GenericObject) -> Result<GenericObject, AdapterError>;

    /// Unconditional overwrite (creates the object if missing).
    async fn replace(&self, reference: &ObjectRef, object: &GenericObject) -> Result<GenericObject, AdapterError>;

    async fn delete(&self, reference: &ObjectRef) -> Result<(), AdapterError>;
}
