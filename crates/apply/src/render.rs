//! Result renderings: a human table with unified diffs, and a versioned document for tooling.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use kairn_core::ObjectRef;
use serde::Serialize;
use uuid::Uuid;

use crate::record::{ChangeRecord, CommandResult, Outcome, RunMessage, Summary};

/// Bumped on incompatible changes to [`ResultDocument`].
pub const DOCUMENT_VERSION: u32 = 1;

#[derive(Debug, Serialize)]
pub struct ResultDocument<'a> {
    pub version: u32,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub failed: bool,
    pub summary: Summary,
    pub records: &'a [ChangeRecord],
    pub prune_candidates: &'a [ObjectRef],
    pub errors: &'a [RunMessage],
    pub warnings: &'a [RunMessage],
}

pub fn document(result: &CommandResult) -> ResultDocument<'_> {
    ResultDocument {
        version: DOCUMENT_VERSION,
        run_id: result.run_id,
        started_at: result.started_at,
        finished_at: result.finished_at,
        dry_run: result.dry_run,
        failed: result.failed(),
        summary: result.summary(),
        records: &result.records,
        prune_candidates: &result.prune_candidates,
        errors: &result.errors,
        warnings: &result.warnings,
    }
}

pub fn to_json(result: &CommandResult) -> Result<String, serde_json::Error> { serde_json::to_string_pretty(&document(result)) }

pub fn to_yaml(result: &CommandResult) -> Result<String, serde_yaml::Error> { serde_yaml::to_string(&document(result)) }

fn outcome_str(o: Outcome) -> &'static str {
    match o {
        Outcome::Planned => "planned",
        Outcome::Applied => "applied",
        Outcome::Failed => "failed",
        Outcome::Skipped => "skipped",
    }
}

/// Table of records, then unified diffs of changed objects, then run-level messages.
pub fn human(result: &CommandResult) -> String {
    let mut out = String::new();
    let rows: Vec<[String; 5]> = result
        .records
        .iter()
        .map(|r| {
            let detail = match r.error() {
                Some(e) => e.to_string(),
                None if r.changes.is_empty() => String::new(),
                None => format!("{} field(s)", r.changes.len()),
            };
            [
                r.action.as_str().to_string(),
                outcome_str(r.outcome()).to_string(),
                r.reference.group_kind().to_string(),
                format!("{}/{}", r.reference.namespace().unwrap_or("-"), r.reference.name()),
                detail,
            ]
        })
        .collect();
    let header = ["ACTION", "OUTCOME", "KIND", "NAMESPACE/NAME", "DETAIL"];
    let mut widths = header.map(str::len);
    for row in &rows {
        for (w, cell) in widths.iter_mut().zip(row.iter()) {
            *w = (*w).max(cell.len());
        }
    }
    let line = |cells: [&str; 5]| -> String {
        format!("{:<w0$}  {:<w1$}  {:<w2$}  {:<w3$}  {}", cells[0], cells[1], cells[2], cells[3], cells[4], w0 = widths[0], w1 = widths[1], w2 = widths[2], w3 = widths[3])
            .trim_end()
            .to_string()
    };
    let _ = writeln!(out, "{}", line(header));
    for row in &rows {
        let _ = writeln!(out, "{}", line([&row[0], &row[1], &row[2], &row[3], &row[4]]));
    }

    for r in result.records.iter().filter(|r| r.unified_diff.is_some()) {
        if let Some(diff) = &r.unified_diff {
            let _ = writeln!(out, "\n=== {} ({})", r.reference, r.action.as_str());
            out.push_str(diff);
        }
    }

    if !result.prune_candidates.is_empty() {
        let _ = writeln!(out, "\nprune candidates:");
        for c in &result.prune_candidates {
            let _ = writeln!(out, "  {}", c);
        }
    }
    for (label, msgs) in [("warning", &result.warnings), ("error", &result.errors)] {
        for m in msgs {
            match &m.reference {
                Some(r) => { let _ = writeln!(out, "{}: {}: {}", label, r, m.message); }
                None => { let _ = writeln!(out, "{}: {}", label, m.message); }
            }
        }
    }

    let s = result.summary();
    let _ = writeln!(
        out,
        "\n{}{} created, {} updated, {} replaced, {} deleted, {} unchanged, {} failed, {} skipped",
        if result.dry_run { "(dry-run) " } else { "" },
        s.created,
        s.updated,
        s.replaced,
        s.deleted,
        s.unchanged,
        s.failed,
        s.skipped
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ordering::Rank;
    use crate::record::Action;
    use kairn_core::AdapterError;

    fn sample() -> CommandResult {
        let now = Utc::now();
        let cm = ObjectRef::new("v1", "ConfigMap", Some("ns1"), "cm");
        let dep = ObjectRef::new("apps/v1", "Deployment", Some("ns1"), "web");
        CommandResult {
            run_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            dry_run: false,
            records: vec![
                ChangeRecord::planned(cm.clone(), Rank::bucket(1), Action::Update)
                    .with_changes(Vec::new(), Some("--- live\n+++ desired\n-a\n+b\n".into()))
                    .applied(Action::Update),
                ChangeRecord::planned(dep, Rank::bucket(2), Action::Create).failed(AdapterError::forbidden("denied").into()),
            ],
            prune_candidates: vec![ObjectRef::new("v1", "ConfigMap", Some("ns1"), "old")],
            errors: Vec::new(),
            warnings: vec![RunMessage::about(cm, "heads up")],
        }
    }

    #[test]
    fn human_table_lists_records_diffs_and_messages() {
        let text = human(&sample());
        assert!(text.starts_with("ACTION"));
        assert!(text.contains("Deployment.apps"));
        assert!(text.contains("forbidden: denied"));
        assert!(text.contains("=== ConfigMap/ns1/cm (update)"));
        assert!(text.contains("prune candidates:\n  ConfigMap/ns1/old"));
        assert!(text.contains("warning: ConfigMap/ns1/cm: heads up"));
        assert!(text.contains("1 updated"));
        assert!(text.contains("1 failed"));
    }

    #[test]
    fn document_is_versioned() {
        let v: serde_json::Value = serde_json::from_str(&to_json(&sample()).unwrap()).unwrap();
        assert_eq!(v["version"], 1);
        assert_eq!(v["failed"], true);
        assert_eq!(v["summary"]["updated"], 1);
        assert_eq!(v["records"][1]["error"]["kind"], "forbidden");
        assert_eq!(v["records"][0]["action"], "update");
        let y = to_yaml(&sample()).unwrap();
        assert!(y.contains("version: 1"));
    }
}
