//! Apply/prune orchestrator.
//!
//! A run moves through `Planning -> Executing -> Pruning -> Done`. Planning reads live
//! state concurrently and diffs every item. Executing processes rank batches in order;
//! a batch starts only after every item of the previous batch reached a terminal state.
//! Pruning deletes owned objects that are no longer desired, in reverse rank order.
//! Item failures are recorded and never abort the run.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use kairn_core::{AdapterError, AdapterErrorKind, ClusterAdapter, FieldPath, GenericObject, KindInfo, ObjectError, ObjectRef};
use metrics::{counter, histogram};
use rustc_hash::FxHashSet;
use serde_json::Value as Json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregate::ResultCollector;
use crate::collection::{annotation_is_true, live_ranks, DeploymentCollection, InclusionFilter, Prepared, PreparedItem, ANNOTATION_SKIP_DELETE};
use crate::diff::{self, IgnoreRules};
use crate::error::{EngineError, ItemError};
use crate::kinds::KindRegistry;
use crate::ordering::{batches, reverse_batches, Rank};
use crate::record::{Action, ChangeRecord, CommandResult, RunMessage};

const MAX_BACKOFF: Duration = Duration::from_secs(10);

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct DeployOptions {
    /// Overwrite live objects unconditionally instead of optimistic updates.
    pub force_apply: bool,
    /// Fall back to delete+create when the server rejects an update as invalid.
    pub replace_on_error: bool,
    /// Like `replace_on_error`, and also replace on update conflicts.
    pub force_replace_on_error: bool,
    pub dry_run: bool,
    pub prune: bool,
    pub concurrency: usize,
    pub conflict_retries: u32,
    pub unavailable_retries: u32,
    /// Initial backoff for unavailable retries; doubles per attempt up to 10s.
    pub backoff: Duration,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self {
            force_apply: false,
            replace_on_error: false,
            force_replace_on_error: false,
            dry_run: false,
            prune: false,
            concurrency: 8,
            conflict_retries: 5,
            unavailable_retries: 5,
            backoff: Duration::from_millis(250),
        }
    }
}

impl DeployOptions {
    /// Defaults overridden by `KAIRN_CONCURRENCY`, `KAIRN_CONFLICT_RETRIES`,
    /// `KAIRN_UNAVAILABLE_RETRIES` and `KAIRN_RETRY_BACKOFF_MS`.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            concurrency: env_or("KAIRN_CONCURRENCY", d.concurrency).max(1),
            conflict_retries: env_or("KAIRN_CONFLICT_RETRIES", d.conflict_retries),
            unavailable_retries: env_or("KAIRN_UNAVAILABLE_RETRIES", d.unavailable_retries),
            backoff: Duration::from_millis(env_or("KAIRN_RETRY_BACKOFF_MS", d.backoff.as_millis() as u64)),
            ..d
        }
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.backoff.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Diff,
    Deploy,
    Prune,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Planning,
    Executing,
    Pruning,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Planning => "planning",
            Phase::Executing => "executing",
            Phase::Pruning => "pruning",
            Phase::Done => "done",
        })
    }
}

/// Per-item plan: the planned record plus the live object it was diffed against.
struct Plan {
    item: PreparedItem,
    record: ChangeRecord,
    live: Option<GenericObject>,
}

pub struct Deployer {
    cluster: Arc<dyn ClusterAdapter>,
    options: DeployOptions,
    ignore: IgnoreRules,
    filter: InclusionFilter,
    cancel: CancellationToken,
}

impl Deployer {
    pub fn new(cluster: Arc<dyn ClusterAdapter>) -> Self {
        Self {
            cluster,
            options: DeployOptions::default(),
            ignore: IgnoreRules::default(),
            filter: InclusionFilter::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_options(mut self, options: DeployOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_ignore_rules(mut self, rules: IgnoreRules) -> Self {
        self.ignore = rules;
        self
    }

    pub fn with_filter(mut self, filter: InclusionFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn options(&self) -> &DeployOptions { &self.options }

    /// Token that stops the run after in-flight operations finish.
    pub fn cancel_token(&self) -> CancellationToken { self.cancel.clone() }

    /// Plan only: report per-object changes and prune candidates without mutating.
    pub async fn diff(&self, collection: &DeploymentCollection) -> Result<CommandResult, EngineError> {
        self.run(collection, Mode::Diff).await
    }

    /// Apply the collection; prunes when `options.prune` is set.
    pub async fn deploy(&self, collection: &DeploymentCollection) -> Result<CommandResult, EngineError> {
        self.run(collection, Mode::Deploy).await
    }

    /// Delete owned objects the collection no longer contains.
    pub async fn prune(&self, collection: &DeploymentCollection) -> Result<CommandResult, EngineError> {
        self.run(collection, Mode::Prune).await
    }

    /// Delete every object owned by the collection's project/target, across all served kinds.
    pub async fn delete(&self, collection: &DeploymentCollection) -> Result<CommandResult, EngineError> {
        self.run(collection, Mode::Delete).await
    }

    async fn run(&self, collection: &DeploymentCollection, mode: Mode) -> Result<CommandResult, EngineError> {
        let t0 = Instant::now();
        counter!("deploy_runs_total", 1u64);
        self.ignore.validate()?;
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let kinds = self.retry_unavailable("discover", || self.cluster.discover_kinds()).await.map_err(EngineError::Discovery)?;
        let mut registry = KindRegistry::from_discovery(kinds);
        registry.add_crds(collection.items.iter().map(|i| &i.object));
        let prepared = if mode == Mode::Delete {
            Prepared::default()
        } else {
            collection.prepare(&registry, &self.filter)?
        };

        let dry_run = mode == Mode::Diff || self.options.dry_run;
        let collector = ResultCollector::new(dry_run);
        let run_id = collector.run_id();
        info!(%run_id, project = %collection.project, target = %collection.target, items = prepared.items.len(), excluded = prepared.excluded.len(), dry_run, "run started");
        for w in &prepared.warnings {
            warn!(%run_id, message = %w.message, "preparation warning");
            collector.warning(w.clone());
        }

        if matches!(mode, Mode::Diff | Mode::Deploy) {
            self.enter(run_id, Phase::Planning);
            let plans = self.plan(prepared.items.clone()).await;
            if mode == Mode::Deploy && !dry_run {
                self.enter(run_id, Phase::Executing);
                self.execute(plans, &collector).await;
            } else {
                for p in plans {
                    collector.record(p.record);
                }
            }
        }

        let list_owned = match mode {
            Mode::Diff | Mode::Prune | Mode::Delete => true,
            Mode::Deploy => self.options.prune,
        };
        if list_owned || !collection.delete_objects.is_empty() {
            self.enter(run_id, Phase::Pruning);
            self.prune_phase(collection, &prepared, &registry, mode, list_owned, dry_run, &collector).await;
        }

        if self.cancel.is_cancelled() {
            warn!(%run_id, "run cancelled; remaining objects skipped");
            collector.error(RunMessage::new("run cancelled"));
        }
        self.enter(run_id, Phase::Done);
        let result = collector.finalize();
        let summary = result.summary();
        histogram!("deploy_run_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(
            %run_id,
            created = summary.created,
            updated = summary.updated,
            replaced = summary.replaced,
            deleted = summary.deleted,
            unchanged = summary.unchanged,
            failed = summary.failed,
            skipped = summary.skipped,
            "run finished"
        );
        Ok(result)
    }

    fn enter(&self, run_id: uuid::Uuid, phase: Phase) { info!(%run_id, %phase, "phase"); }

    // ---- planning ----

    async fn plan(&self, items: Vec<PreparedItem>) -> Vec<Plan> {
        let t0 = Instant::now();
        let plans: Vec<Plan> = stream::iter(items).map(|item| self.plan_item(item)).buffer_unordered(self.concurrency()).collect().await;
        histogram!("diff_plan_ms", t0.elapsed().as_secs_f64() * 1000.0);
        plans
    }

    async fn plan_item(&self, item: PreparedItem) -> Plan {
        let record = ChangeRecord::planned(item.reference.clone(), item.rank, Action::NoOp);
        if let Some(e) = item.error.clone() {
            return Plan { item, record: record.failed(e), live: None };
        }
        if self.cancel.is_cancelled() {
            return Plan { item, record: record.skipped(), live: None };
        }
        // kinds declared by a CRD in this run cannot have live objects yet
        let live = if item.served {
            match self.retry_unavailable("get", || self.cluster.get(&item.reference)).await {
                Ok(live) => live,
                Err(e) => return Plan { item, record: record.failed(e.into()), live: None },
            }
        } else {
            None
        };
        match diff::diff(&item.object, live.as_ref(), &self.ignore, &item.tags) {
            Ok(d) => {
                debug!(object = %item.reference, action = d.action.as_str(), changes = d.changes.len(), rank = %item.rank, "planned");
                let mut record = record.with_changes(d.changes, d.unified_diff);
                record.action = d.action;
                Plan { item, record, live }
            }
            Err(e) => Plan { item, record: record.failed(e.into()), live },
        }
    }

    // ---- executing ----

    async fn execute(&self, plans: Vec<Plan>, collector: &ResultCollector) {
        for (rank, batch) in batches(plans, |p| p.record.rank) {
            if self.cancel.is_cancelled() {
                for p in batch {
                    collector.record(if p.record.is_failed() { p.record } else { p.record.skipped() });
                }
                continue;
            }
            debug!(%rank, size = batch.len(), "batch started");
            let mut done = stream::iter(batch).map(|p| self.apply_item(p)).buffer_unordered(self.concurrency());
            while let Some(record) = done.next().await {
                collector.record(record);
            }
        }
    }

    async fn apply_item(&self, plan: Plan) -> ChangeRecord {
        let Plan { item, mut record, mut live } = plan;
        if record.is_failed() {
            return record;
        }
        if self.cancel.is_cancelled() {
            return record.skipped();
        }
        if record.action == Action::NoOp {
            return record.applied(Action::NoOp);
        }

        let force = self.options.force_apply || item.force_apply;
        let mut action = record.action;
        let (mut conflicts, mut unavailable) = (0u32, 0u32);
        let (mut vanished, mut replaced) = (false, false);
        loop {
            let res = match action {
                Action::Create => self.cluster.create(&item.reference, &item.object).await.map(drop),
                Action::Update if force => self.cluster.replace(&item.reference, &item.object).await.map(drop),
                Action::Update => match with_resource_version(&item.object, live.as_ref()) {
                    Ok(payload) => self.cluster.update(&item.reference, &payload).await.map(drop),
                    Err(e) => return record.failed(e.into()),
                },
                Action::Replace => self.recreate(&item).await,
                Action::Delete | Action::NoOp => Ok(()),
            };
            let e = match res {
                Ok(()) => {
                    counter!("deploy_objects_applied_total", 1u64);
                    info!(object = %item.reference, action = action.as_str(), rank = %item.rank, "applied");
                    return record.applied(action);
                }
                Err(e) => e,
            };

            match (e.kind, action) {
                (AdapterErrorKind::ServerUnavailable, _) if unavailable < self.options.unavailable_retries => {
                    unavailable += 1;
                    counter!("deploy_unavailable_retries_total", 1u64);
                    let wait = self.options.backoff_for(unavailable);
                    warn!(object = %item.reference, attempt = unavailable, wait_ms = wait.as_millis() as u64, error = %e, "server unavailable; retrying");
                    tokio::time::sleep(wait).await;
                }
                (AdapterErrorKind::Conflict, Action::Update) if self.options.force_replace_on_error && !replaced => {
                    warn!(object = %item.reference, error = %e, "update conflict; replacing");
                    replaced = true;
                    action = Action::Replace;
                }
                (AdapterErrorKind::Conflict, Action::Update | Action::Create) if conflicts < self.options.conflict_retries => {
                    conflicts += 1;
                    counter!("deploy_conflict_retries_total", 1u64);
                    warn!(object = %item.reference, attempt = conflicts, error = %e, "conflict; re-reading live state");
                    let fresh = match self.retry_unavailable("get", || self.cluster.get(&item.reference)).await {
                        Ok(fresh) => fresh,
                        Err(e) => return self.fail(record, &item, e),
                    };
                    let d = match diff::diff(&item.object, fresh.as_ref(), &self.ignore, &item.tags) {
                        Ok(d) => d,
                        Err(e) => return record.failed(e.into()),
                    };
                    live = fresh;
                    action = d.action;
                    record = record.with_changes(d.changes, d.unified_diff);
                    record.action = d.action;
                    if action == Action::NoOp {
                        return record.applied(Action::NoOp);
                    }
                }
                (AdapterErrorKind::NotFound, Action::Update) if !vanished => {
                    debug!(object = %item.reference, "object vanished; creating");
                    vanished = true;
                    live = None;
                    action = Action::Create;
                }
                (AdapterErrorKind::Invalid, Action::Update)
                    if (self.options.replace_on_error || self.options.force_replace_on_error) && !replaced =>
                {
                    warn!(object = %item.reference, error = %e, "update rejected; replacing");
                    replaced = true;
                    action = Action::Replace;
                }
                _ => {
                    record.action = action;
                    return self.fail(record, &item, e);
                }
            }
        }
    }

    fn fail(&self, record: ChangeRecord, item: &PreparedItem, e: AdapterError) -> ChangeRecord {
        counter!("deploy_objects_failed_total", 1u64);
        warn!(object = %item.reference, error = %e, "apply failed");
        record.failed(e.into())
    }

    async fn recreate(&self, item: &PreparedItem) -> Result<(), AdapterError> {
        match self.cluster.delete(&item.reference).await {
            Ok(()) => {}
            Err(e) if e.kind == AdapterErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        self.cluster.create(&item.reference, &item.object).await.map(drop)
    }

    // ---- pruning ----

    #[allow(clippy::too_many_arguments)]
    async fn prune_phase(
        &self,
        collection: &DeploymentCollection,
        prepared: &Prepared,
        registry: &KindRegistry,
        mode: Mode,
        list_owned: bool,
        dry_run: bool,
        collector: &ResultCollector,
    ) {
        let desired = prepared.desired_keys();
        let excluded: FxHashSet<_> = prepared.excluded.iter().map(ObjectRef::key).collect();
        let mut seen = FxHashSet::default();
        let mut doomed: Vec<(ObjectRef, GenericObject)> = Vec::new();

        let mut consider = |reference: ObjectRef, obj: GenericObject, explicit: bool| {
            let key = reference.key();
            if !explicit && desired.contains(&key) {
                return;
            }
            if !seen.insert(key.clone()) {
                return;
            }
            if annotation_is_true(&obj, ANNOTATION_SKIP_DELETE) {
                collector.warning(RunMessage::about(reference, "not deleted: marked skip-delete"));
                return;
            }
            if excluded.contains(&key) {
                collector.warning(RunMessage::about(reference.clone(), "excluded by inclusion filters; treated as a prune candidate"));
            }
            collector.prune_candidate(reference.clone());
            doomed.push((reference, obj));
        };

        if list_owned {
            let kinds: Vec<KindInfo> = if mode == Mode::Delete { registry.served() } else { prepared.kinds.clone() };
            let selector = collection.ownership_labels();
            for kind in kinds {
                match self.retry_unavailable("list", || self.cluster.list_by_labels(&kind, None, &selector)).await {
                    Ok(objects) => {
                        for obj in objects {
                            let Some(name) = obj.name().map(str::to_string) else { continue };
                            consider(ObjectRef::for_kind(&kind, obj.namespace(), &name), obj, false);
                        }
                    }
                    // kinds whose CRD has not been applied yet
                    Err(e) if e.kind == AdapterErrorKind::NotFound => debug!(kind = %kind.gvk_key(), "kind not served; nothing to prune"),
                    Err(e) => {
                        warn!(kind = %kind.gvk_key(), error = %e, "listing owned objects failed");
                        collector.error(RunMessage::new(format!("listing {} failed: {}", kind.gvk_key(), e)));
                    }
                }
            }
        }
        let mut explicit = FxHashSet::default();
        for deletion in collection.deletions(registry) {
            let reference = match deletion {
                Ok(r) => r,
                Err((raw, e)) => {
                    warn!(object = %raw, error = %e, "explicit deletion of an unknown kind");
                    collector.record(ChangeRecord::planned(raw, Rank::default(), Action::Delete).failed(e));
                    continue;
                }
            };
            explicit.insert(reference.key());
            match self.retry_unavailable("get", || self.cluster.get(&reference)).await {
                Ok(Some(obj)) => consider(reference, obj, true),
                Ok(None) => info!(object = %reference, "explicit deletion: already absent"),
                Err(e) if e.kind == AdapterErrorKind::NotFound => info!(object = %reference, "explicit deletion: already absent"),
                Err(e) => collector.record(ChangeRecord::planned(reference, Rank::default(), Action::Delete).failed(ItemError::prune(e))),
            }
        }

        // a plain diff reports owned candidates without planning their deletion
        if mode == Mode::Diff && !self.options.prune {
            doomed.retain(|(r, _)| explicit.contains(&r.key()));
        }

        let (index, cycle) = live_ranks(&doomed, registry);
        if let Some(e) = cycle {
            warn!(error = %e, "deploy-after cycle among prune candidates; using kind order");
            collector.warning(RunMessage::new(format!("prune order falls back to kind priority: {}", e)));
        }
        let refs: Vec<(ObjectRef, Rank)> = doomed
            .into_iter()
            .map(|(r, _)| {
                let rank = index.rank_of(&r.key());
                (r, rank)
            })
            .collect();

        for (rank, batch) in reverse_batches(refs, |(_, rank)| *rank) {
            if dry_run {
                for (r, rank) in batch {
                    collector.record(ChangeRecord::planned(r, rank, Action::Delete));
                }
                continue;
            }
            if self.cancel.is_cancelled() {
                for (r, rank) in batch {
                    collector.record(ChangeRecord::planned(r, rank, Action::Delete).skipped());
                }
                continue;
            }
            debug!(%rank, size = batch.len(), "delete batch started");
            let mut done = stream::iter(batch).map(|(r, rank)| self.delete_item(r, rank)).buffer_unordered(self.concurrency());
            while let Some(record) = done.next().await {
                collector.record(record);
            }
        }
    }

    async fn delete_item(&self, reference: ObjectRef, rank: Rank) -> ChangeRecord {
        let record = ChangeRecord::planned(reference.clone(), rank, Action::Delete);
        if self.cancel.is_cancelled() {
            return record.skipped();
        }
        match self.retry_unavailable("delete", || self.cluster.delete(&reference)).await {
            Ok(()) => {}
            Err(e) if e.kind == AdapterErrorKind::NotFound => debug!(object = %reference, "already deleted"),
            Err(e) => {
                counter!("deploy_objects_failed_total", 1u64);
                warn!(object = %reference, error = %e, "delete failed");
                return record.failed(ItemError::prune(e));
            }
        }
        counter!("prune_deleted_total", 1u64);
        info!(object = %reference, rank = %rank, "deleted");
        record.applied(Action::Delete)
    }

    // ---- helpers ----

    fn concurrency(&self) -> usize { self.options.concurrency.max(1) }

    /// Run `op`, retrying `ServerUnavailable` with exponential backoff.
    async fn retry_unavailable<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, AdapterError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, AdapterError>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Err(e) if e.kind == AdapterErrorKind::ServerUnavailable && attempt < self.options.unavailable_retries => {
                    attempt += 1;
                    counter!("deploy_unavailable_retries_total", 1u64);
                    let wait = self.options.backoff_for(attempt);
                    warn!(op = what, attempt, wait_ms = wait.as_millis() as u64, error = %e, "server unavailable; retrying");
                    tokio::time::sleep(wait).await;
                }
                other => return other,
            }
        }
    }
}

/// Desired payload carrying the live resourceVersion, for optimistic updates.
fn with_resource_version(desired: &GenericObject, live: Option<&GenericObject>) -> Result<GenericObject, ObjectError> {
    let mut payload = desired.deep_copy();
    if let Some(rv) = live.and_then(GenericObject::resource_version) {
        payload.set(&FieldPath::from_keys(["metadata", "resourceVersion"]), Json::String(rv.to_string()))?;
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let o = DeployOptions { backoff: Duration::from_millis(250), ..Default::default() };
        assert_eq!(o.backoff_for(1), Duration::from_millis(250));
        assert_eq!(o.backoff_for(3), Duration::from_millis(1000));
        assert_eq!(o.backoff_for(40), MAX_BACKOFF);
    }

    #[test]
    fn resource_version_is_carried_from_live() {
        let desired = GenericObject::from(serde_json::json!({"metadata": {"name": "a"}}));
        let live = GenericObject::from(serde_json::json!({"metadata": {"name": "a", "resourceVersion": "7"}}));
        let p = with_resource_version(&desired, Some(&live)).unwrap();
        assert_eq!(p.resource_version(), Some("7"));
        assert_eq!(with_resource_version(&desired, None).unwrap().resource_version(), None);
    }
}
