//! Result aggregation. Workers push records through a channel; `finalize` drains it
//! and sorts into presentation order, so output is independent of completion order.

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use kairn_core::ObjectRef;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::record::{ChangeRecord, CommandResult, RunMessage};

enum Event {
    Record(ChangeRecord),
    Error(RunMessage),
    Warning(RunMessage),
    PruneCandidate(ObjectRef),
}

pub struct ResultCollector {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    dry_run: bool,
    tx: mpsc::UnboundedSender<Event>,
    rx: Mutex<mpsc::UnboundedReceiver<Event>>,
}

impl ResultCollector {
    pub fn new(dry_run: bool) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { run_id: Uuid::new_v4(), started_at: Utc::now(), dry_run, tx, rx: Mutex::new(rx) }
    }

    pub fn run_id(&self) -> Uuid { self.run_id }

    pub fn record(&self, record: ChangeRecord) { self.send(Event::Record(record)); }
    pub fn error(&self, msg: RunMessage) { self.send(Event::Error(msg)); }
    pub fn warning(&self, msg: RunMessage) { self.send(Event::Warning(msg)); }
    pub fn prune_candidate(&self, reference: ObjectRef) { self.send(Event::PruneCandidate(reference)); }

    // the receiver lives in `self`, so the channel cannot be closed here
    fn send(&self, ev: Event) { let _ = self.tx.send(ev); }

    pub fn finalize(self) -> CommandResult {
        let Self { run_id, started_at, dry_run, tx, rx } = self;
        drop(tx);
        let mut rx = rx.into_inner().unwrap_or_else(PoisonError::into_inner);
        let mut out = CommandResult {
            run_id,
            started_at,
            finished_at: Utc::now(),
            dry_run,
            records: Vec::new(),
            prune_candidates: Vec::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
        };
        while let Ok(ev) = rx.try_recv() {
            match ev {
                Event::Record(r) => out.records.push(r),
                Event::Error(m) => out.errors.push(m),
                Event::Warning(m) => out.warnings.push(m),
                Event::PruneCandidate(r) => out.prune_candidates.push(r),
            }
        }
        out.records.sort_by_cached_key(ChangeRecord::sort_key);
        out.prune_candidates.sort_by_cached_key(ObjectRef::key);
        out.prune_candidates.dedup();
        let msg_key = |m: &RunMessage| (m.reference.as_ref().map(ObjectRef::key), m.message.clone());
        out.errors.sort_by_cached_key(msg_key);
        out.warnings.sort_by_cached_key(msg_key);
        out
    }
}
