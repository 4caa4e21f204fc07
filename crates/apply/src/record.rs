//! Per-object change records and the aggregated result of one run.

use chrono::{DateTime, Utc};
use kairn_core::{FieldPath, ObjectRef};
use serde::Serialize;
use serde_json::Value as Json;
use uuid::Uuid;

use crate::error::ItemError;
use crate::ordering::Rank;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Create,
    Update,
    /// Delete followed by create.
    Replace,
    Delete,
    NoOp,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Replace => "replace",
            Action::Delete => "delete",
            Action::NoOp => "no-op",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Computed but not executed (dry-run).
    Planned,
    /// Executed successfully (a no-op counts as applied).
    Applied,
    Failed,
    /// Never started because the run was cancelled.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Removed,
    Changed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldChange {
    pub path: FieldPath,
    pub kind: ChangeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old: Option<Json>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new: Option<Json>,
}

/// Outcome for one object. A record carrying an error is always `Failed`.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeRecord {
    pub reference: ObjectRef,
    #[serde(skip)]
    pub rank: Rank,
    pub action: Action,
    outcome: Outcome,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<FieldChange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ItemError>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unified_diff: Option<String>,
}

impl ChangeRecord {
    pub fn planned(reference: ObjectRef, rank: Rank, action: Action) -> Self {
        Self {
            reference,
            rank,
            action,
            outcome: Outcome::Planned,
            changes: Vec::new(),
            error: None,
            warnings: Vec::new(),
            unified_diff: None,
        }
    }

    pub fn with_changes(mut self, changes: Vec<FieldChange>, unified_diff: Option<String>) -> Self {
        self.changes = changes;
        self.unified_diff = unified_diff;
        self
    }

    pub fn applied(mut self, action: Action) -> Self {
        self.action = action;
        self.outcome = Outcome::Applied;
        self.error = None;
        self
    }

    pub fn failed(mut self, error: ItemError) -> Self {
        self.outcome = Outcome::Failed;
        self.error = Some(error);
        self
    }

    pub fn skipped(mut self) -> Self {
        self.outcome = Outcome::Skipped;
        self
    }

    pub fn warn(mut self, msg: impl Into<String>) -> Self {
        self.warnings.push(msg.into());
        self
    }

    pub fn outcome(&self) -> Outcome { self.outcome }
    pub fn error(&self) -> Option<&ItemError> { self.error.as_ref() }
    pub fn is_failed(&self) -> bool { self.outcome == Outcome::Failed }

    /// Presentation order: rank, then kind, namespace, name.
    pub(crate) fn sort_key(&self) -> (Rank, String, String, String, Action) {
        (
            self.rank,
            self.reference.kind().to_string(),
            self.reference.namespace().unwrap_or_default().to_string(),
            self.reference.name().to_string(),
            self.action,
        )
    }
}

/// Run-level error or warning, optionally tied to an object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<ObjectRef>,
    pub message: String,
}

impl RunMessage {
    pub fn new(message: impl Into<String>) -> Self { Self { reference: None, message: message.into() } }
    pub fn about(reference: ObjectRef, message: impl Into<String>) -> Self { Self { reference: Some(reference), message: message.into() } }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub created: usize,
    pub updated: usize,
    pub replaced: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Everything one run produced. Records are sorted in presentation order.
#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub records: Vec<ChangeRecord>,
    pub prune_candidates: Vec<ObjectRef>,
    pub errors: Vec<RunMessage>,
    pub warnings: Vec<RunMessage>,
}

impl CommandResult {
    /// True when any object or the run itself failed.
    pub fn failed(&self) -> bool { !self.errors.is_empty() || self.records.iter().any(ChangeRecord::is_failed) }

    pub fn record(&self, reference: &ObjectRef) -> Option<&ChangeRecord> {
        self.records.iter().find(|r| r.reference.key() == reference.key())
    }

    pub fn summary(&self) -> Summary {
        let mut s = Summary::default();
        for r in &self.records {
            match r.outcome {
                Outcome::Failed => s.failed += 1,
                Outcome::Skipped => s.skipped += 1,
                Outcome::Planned | Outcome::Applied => match r.action {
                    Action::Create => s.created += 1,
                    Action::Update => s.updated += 1,
                    Action::Replace => s.replaced += 1,
                    Action::Delete => s.deleted += 1,
                    Action::NoOp => s.unchanged += 1,
                },
            }
        }
        s
    }
}
