//! Desired state for one run: items, target identity, inclusion filters and preparation.
//!
//! Preparation resolves every item against the kind registry, normalises its namespace,
//! stamps ownership and tag labels, rejects duplicate references and ranks the result.

use std::collections::{BTreeMap, BTreeSet};

use kairn_core::{GenericObject, GroupKind, KindInfo, Labels, ObjectKey, ObjectRef};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::{ConfigError, ItemError};
use crate::kinds::KindRegistry;
use crate::ordering::{OrderNode, OrderingIndex, Rank};
use crate::record::RunMessage;

pub const LABEL_PROJECT: &str = "kairn.io/project";
pub const LABEL_TARGET: &str = "kairn.io/target";
pub const TAG_LABEL_PREFIX: &str = "kairn.io/tag-";

pub const ANNOTATION_DEPLOY_AFTER: &str = "kairn.io/deploy-after";
pub const ANNOTATION_FORCE_APPLY: &str = "kairn.io/force-apply";
pub const ANNOTATION_IGNORE_DIFF: &str = "kairn.io/ignore-diff";
pub const ANNOTATION_IGNORE_DIFF_FIELD: &str = "kairn.io/ignore-diff-field";
pub const ANNOTATION_SKIP_DELETE: &str = "kairn.io/skip-delete";

pub const DEFAULT_NAMESPACE: &str = "default";

pub(crate) fn annotation_is_true(obj: &GenericObject, key: &str) -> bool { obj.annotation(key) == Some("true") }

/// One desired object with its metadata.
#[derive(Debug, Clone)]
pub struct DeploymentItem {
    pub object: GenericObject,
    pub tags: BTreeSet<String>,
    /// Originating path in the source tree.
    pub source: Option<String>,
    /// `Kind/name` or `Kind/namespace/name` references this item deploys after,
    /// in addition to its `kairn.io/deploy-after` annotation.
    pub after: Vec<String>,
}

impl DeploymentItem {
    pub fn new(object: GenericObject) -> Self { Self { object, tags: BTreeSet::new(), source: None, after: Vec::new() } }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn after(mut self, hint: impl Into<String>) -> Self {
        self.after.push(hint.into());
        self
    }

    fn hints(&self) -> Vec<String> { item_hints(&self.object, &self.after) }

    fn origin(&self, index: usize) -> String { self.source.clone().unwrap_or_else(|| format!("item #{}", index)) }
}

fn item_hints(object: &GenericObject, extra: &[String]) -> Vec<String> {
    let annotated = object.annotation(ANNOTATION_DEPLOY_AFTER).unwrap_or_default();
    annotated
        .split(',')
        .map(str::to_string)
        .chain(extra.iter().cloned())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Items plus the deployment's identity and explicit deletions.
#[derive(Debug, Clone, Default)]
pub struct DeploymentCollection {
    pub project: String,
    pub target: String,
    pub override_namespace: Option<String>,
    pub items: Vec<DeploymentItem>,
    /// Objects to remove during the run, independent of pruning.
    pub delete_objects: Vec<ObjectRef>,
}

impl DeploymentCollection {
    pub fn new(project: impl Into<String>, target: impl Into<String>) -> Self {
        Self { project: project.into(), target: target.into(), ..Default::default() }
    }

    pub fn push(&mut self, item: DeploymentItem) { self.items.push(item); }

    /// Labels stamped on every applied object and used to select prune candidates.
    pub fn ownership_labels(&self) -> Labels {
        let mut labels = Labels::new();
        labels.insert(LABEL_PROJECT.to_string(), self.project.clone());
        if !self.target.is_empty() {
            labels.insert(LABEL_TARGET.to_string(), self.target.clone());
        }
        labels
    }

    /// Resolve, normalise and rank the collection. Fails on duplicate references,
    /// malformed objects, malformed hints and hint cycles.
    pub fn prepare(&self, registry: &KindRegistry, filter: &InclusionFilter) -> Result<Prepared, ConfigError> {
        let mut seen: FxHashMap<ObjectKey, String> = FxHashMap::default();
        let mut included = Vec::new();
        let mut excluded = Vec::new();
        let mut kinds: BTreeMap<GroupKind, KindInfo> = BTreeMap::new();

        for (i, item) in self.items.iter().enumerate() {
            let origin = item.origin(i);
            let raw = ObjectRef::from_object(&item.object)
                .map_err(|e| ConfigError::InvalidObject { source_path: origin.clone(), reason: e.to_string() })?;
            let kind = registry.get(&raw.group_kind()).cloned();
            let reference = match &kind {
                Some(k) => self.scope_reference(&raw, k),
                None => raw,
            };
            if let Some(first) = seen.insert(reference.key(), origin.clone()) {
                return Err(ConfigError::DuplicateReference { reference: reference.to_string(), first, second: origin });
            }
            if let Some(k) = &kind {
                kinds.entry(k.group_kind()).or_insert_with(|| k.clone());
            }
            if !filter.includes(item) {
                excluded.push(reference);
                continue;
            }
            included.push((item, reference, kind));
        }

        let mut items = Vec::with_capacity(included.len());
        let mut nodes = Vec::with_capacity(included.len());
        let mut warnings = Vec::new();
        for (item, reference, kind) in included {
            let mut after = Vec::new();
            for hint in item.hints() {
                let parsed = Hint::parse(&hint).ok_or_else(|| ConfigError::InvalidHint { object: reference.to_string(), hint: hint.clone() })?;
                after.push((hint, parsed.resolve(registry, reference.namespace())));
            }
            for (hint, key) in &after {
                if !seen.contains_key(key) {
                    warnings.push(RunMessage::about(reference.clone(), format!("deploy-after hint '{}' matches no object in the collection; ignored", hint)));
                }
            }
            nodes.push(OrderNode { key: reference.key(), after: after.into_iter().map(|(_, k)| k).collect() });

            let (object, error) = match &kind {
                Some(_) => match self.desired_object(item, &reference) {
                    Ok(obj) => (obj, None),
                    Err(e) => (item.object.deep_copy(), Some(e)),
                },
                None => (item.object.deep_copy(), Some(ItemError::UnknownKind { kind: reference.group_kind().to_string() })),
            };
            let served = registry.is_served(&reference.group_kind());
            let force_apply = annotation_is_true(&item.object, ANNOTATION_FORCE_APPLY);
            items.push(PreparedItem {
                reference,
                object,
                tags: item.tags.clone(),
                source: item.source.clone(),
                rank: Rank::default(),
                served,
                force_apply,
                error,
            });
        }

        let index = OrderingIndex::build(&nodes)?;
        for it in &mut items {
            it.rank = index.rank_of(&it.reference.key());
        }
        Ok(Prepared { items, excluded, kinds: kinds.into_values().collect(), warnings })
    }

    /// Namespaced kinds get the explicit, override or default namespace; cluster-scoped
    /// kinds lose theirs.
    fn scope_reference(&self, raw: &ObjectRef, kind: &KindInfo) -> ObjectRef {
        if !kind.namespaced {
            return raw.with_namespace(None);
        }
        let ns = raw.namespace().or(self.override_namespace.as_deref()).unwrap_or(DEFAULT_NAMESPACE);
        raw.with_namespace(Some(ns))
    }

    /// Explicit deletions resolved against the registry like desired items.
    pub fn deletions(&self, registry: &KindRegistry) -> Vec<Result<ObjectRef, (ObjectRef, ItemError)>> {
        self.delete_objects
            .iter()
            .map(|raw| match registry.get(&raw.group_kind()) {
                Some(k) => Ok(self.scope_reference(raw, k)),
                None => Err((raw.clone(), ItemError::UnknownKind { kind: raw.group_kind().to_string() })),
            })
            .collect()
    }

    fn desired_object(&self, item: &DeploymentItem, reference: &ObjectRef) -> Result<GenericObject, ItemError> {
        let mut obj = item.object.deep_copy();
        obj.set_namespace(reference.namespace())?;
        for (k, v) in self.ownership_labels() {
            obj.set_label(&k, &v)?;
        }
        for (i, tag) in item.tags.iter().enumerate() {
            obj.set_label(&format!("{}{}", TAG_LABEL_PREFIX, i), tag)?;
        }
        Ok(obj)
    }
}

/// An item ready for planning.
#[derive(Debug, Clone)]
pub struct PreparedItem {
    pub reference: ObjectRef,
    /// Desired object with namespace and labels applied.
    pub object: GenericObject,
    pub tags: BTreeSet<String>,
    pub source: Option<String>,
    pub rank: Rank,
    /// False for kinds declared only by a CRD in the collection.
    pub served: bool,
    pub force_apply: bool,
    /// Set when the item cannot be processed at all.
    pub error: Option<ItemError>,
}

#[derive(Debug, Clone, Default)]
pub struct Prepared {
    pub items: Vec<PreparedItem>,
    /// References of items removed by inclusion filters.
    pub excluded: Vec<ObjectRef>,
    /// Every known kind the collection touches, included or not.
    pub kinds: Vec<KindInfo>,
    /// Problems that do not stop the run, e.g. hints naming objects outside the collection.
    pub warnings: Vec<RunMessage>,
}

impl Prepared {
    pub fn desired_keys(&self) -> FxHashSet<ObjectKey> { self.items.iter().map(|i| i.reference.key()).collect() }
}

/// Narrows the working set before planning. Empty include lists admit everything.
#[derive(Debug, Clone, Default)]
pub struct InclusionFilter {
    pub include_tags: BTreeSet<String>,
    pub exclude_tags: BTreeSet<String>,
    /// Source path prefixes.
    pub include_paths: Vec<String>,
    pub exclude_paths: Vec<String>,
}

impl InclusionFilter {
    pub fn is_empty(&self) -> bool {
        self.include_tags.is_empty() && self.exclude_tags.is_empty() && self.include_paths.is_empty() && self.exclude_paths.is_empty()
    }

    pub fn includes(&self, item: &DeploymentItem) -> bool {
        if !self.include_tags.is_empty() && item.tags.is_disjoint(&self.include_tags) { return false; }
        if !item.tags.is_disjoint(&self.exclude_tags) { return false; }
        let source = item.source.as_deref().unwrap_or_default();
        if !self.include_paths.is_empty() && !self.include_paths.iter().any(|p| source.starts_with(p.as_str())) { return false; }
        !self.exclude_paths.iter().any(|p| source.starts_with(p.as_str()))
    }
}

/// A parsed "deploy after" reference: `Kind[.group]/name` or `Kind[.group]/namespace/name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hint {
    pub group_kind: GroupKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl Hint {
    pub fn parse(s: &str) -> Option<Self> {
        let parts: Vec<&str> = s.trim().split('/').collect();
        let (kind, namespace, name) = match parts.as_slice() {
            [k, n] => (*k, None, *n),
            [k, ns, n] => (*k, Some(ns.to_string()), *n),
            _ => return None,
        };
        if kind.is_empty() || name.is_empty() || namespace.as_deref() == Some("") { return None; }
        let (kind, group) = kind.split_once('.').unwrap_or((kind, ""));
        Some(Self { group_kind: GroupKind { group: group.to_string(), kind: kind.to_string() }, namespace, name: name.to_string() })
    }

    /// Key of the referenced object. A kind written without a group takes the group the
    /// registry serves it under; a namespaced target without an explicit namespace shares
    /// the hinting object's namespace.
    pub fn resolve(&self, registry: &KindRegistry, own_namespace: Option<&str>) -> ObjectKey {
        let kind = if self.group_kind.group.is_empty() { registry.find_kind(&self.group_kind.kind) } else { registry.get(&self.group_kind) };
        let group = kind.map(|k| k.group.clone()).unwrap_or_else(|| self.group_kind.group.clone());
        let namespaced = kind.map(|k| k.namespaced).unwrap_or(true);
        let namespace = match (&self.namespace, namespaced) {
            (_, false) => String::new(),
            (Some(ns), true) => ns.clone(),
            (None, true) => own_namespace.unwrap_or_default().to_string(),
        };
        ObjectKey { group, kind: self.group_kind.kind.clone(), namespace, name: self.name.clone() }
    }
}

/// Ranks for live objects about to be deleted, from their own deploy-after annotations.
/// A hint cycle among live objects falls back to bucket order.
pub(crate) fn live_ranks(objects: &[(ObjectRef, GenericObject)], registry: &KindRegistry) -> (OrderingIndex, Option<ConfigError>) {
    let nodes: Vec<OrderNode> = objects
        .iter()
        .map(|(r, o)| OrderNode {
            key: r.key(),
            after: item_hints(o, &[]).iter().filter_map(|h| Hint::parse(h)).map(|h| h.resolve(registry, r.namespace())).collect(),
        })
        .collect();
    match OrderingIndex::build(&nodes) {
        Ok(index) => (index, None),
        Err(e) => (OrderingIndex::default(), Some(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kairn_core::mem::builtin_kinds;
    use serde_json::json;

    fn registry() -> KindRegistry { KindRegistry::from_discovery(builtin_kinds()) }

    fn cm(ns: Option<&str>, name: &str) -> GenericObject {
        let mut v = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": name}, "data": {"a": "1"}});
        if let Some(ns) = ns { v["metadata"]["namespace"] = json!(ns); }
        GenericObject::from(v)
    }

    fn collection(items: Vec<DeploymentItem>) -> DeploymentCollection {
        let mut c = DeploymentCollection::new("shop", "prod");
        c.items = items;
        c
    }

    #[test]
    fn namespaces_are_normalised_and_labels_stamped() {
        let ns = GenericObject::from(json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "ns1", "namespace": "bogus"}}));
        let mut c = collection(vec![
            DeploymentItem::new(cm(None, "a")).with_tags(["base"]),
            DeploymentItem::new(cm(Some("ns1"), "b")),
            DeploymentItem::new(ns),
        ]);
        c.override_namespace = Some("ns1".into());
        let p = c.prepare(&registry(), &InclusionFilter::default()).unwrap();
        assert_eq!(p.items[0].reference.namespace(), Some("ns1"));
        assert_eq!(p.items[2].reference.namespace(), None);
        assert_eq!(p.items[2].object.namespace(), None);
        let labels = p.items[0].object.labels();
        assert_eq!(labels.get(LABEL_PROJECT).map(String::as_str), Some("shop"));
        assert_eq!(labels.get(LABEL_TARGET).map(String::as_str), Some("prod"));
        assert_eq!(labels.get("kairn.io/tag-0").map(String::as_str), Some("base"));
        assert!(p.items[2].rank < p.items[0].rank);

        c.override_namespace = None;
        let p = c.prepare(&registry(), &InclusionFilter::default()).unwrap();
        assert_eq!(p.items[0].reference.namespace(), Some(DEFAULT_NAMESPACE));
    }

    #[test]
    fn duplicate_references_are_rejected() {
        let c = collection(vec![
            DeploymentItem::new(cm(Some("x"), "a")).with_source("one.yaml"),
            DeploymentItem::new(cm(Some("x"), "a")).with_source("two.yaml"),
        ]);
        match c.prepare(&registry(), &InclusionFilter::default()) {
            Err(ConfigError::DuplicateReference { first, second, .. }) => {
                assert_eq!(first, "one.yaml");
                assert_eq!(second, "two.yaml");
            }
            other => panic!("expected duplicate error, got {:?}", other.map(|p| p.items.len())),
        }
    }

    #[test]
    fn unknown_kind_is_an_item_error() {
        let w = GenericObject::from(json!({"apiVersion": "example.com/v1", "kind": "Widget", "metadata": {"name": "w"}}));
        let p = collection(vec![DeploymentItem::new(w)]).prepare(&registry(), &InclusionFilter::default()).unwrap();
        assert!(matches!(p.items[0].error, Some(ItemError::UnknownKind { .. })));
    }

    #[test]
    fn filters_drop_items_but_keep_their_kinds() {
        let c = collection(vec![
            DeploymentItem::new(cm(Some("x"), "a")).with_tags(["web"]).with_source("web/a.yaml"),
            DeploymentItem::new(cm(Some("x"), "b")).with_tags(["db"]).with_source("db/b.yaml"),
            DeploymentItem::new(cm(Some("x"), "c")).with_tags(["web", "slow"]).with_source("web/c.yaml"),
        ]);
        let f = InclusionFilter {
            include_tags: ["web".to_string()].into(),
            exclude_tags: ["slow".to_string()].into(),
            ..Default::default()
        };
        let p = c.prepare(&registry(), &f).unwrap();
        assert_eq!(p.items.len(), 1);
        assert_eq!(p.items[0].reference.name(), "a");
        assert_eq!(p.excluded.len(), 2);
        assert_eq!(p.kinds.len(), 1);

        let f = InclusionFilter { exclude_paths: vec!["web/".into()], ..Default::default() };
        let p = c.prepare(&registry(), &f).unwrap();
        assert_eq!(p.items.len(), 1);
        assert_eq!(p.items[0].reference.name(), "b");
    }

    #[test]
    fn hints_from_annotation_and_item() {
        let first = cm(Some("x"), "first");
        let mut second = cm(Some("x"), "second");
        second
            .set(&kairn_core::FieldPath::from_keys(["metadata", "annotations", ANNOTATION_DEPLOY_AFTER]), json!("ConfigMap/first"))
            .unwrap();
        let third = cm(Some("x"), "third");
        let c = collection(vec![
            DeploymentItem::new(third).after("ConfigMap/x/second"),
            DeploymentItem::new(second),
            DeploymentItem::new(first),
        ]);
        let p = c.prepare(&registry(), &InclusionFilter::default()).unwrap();
        let rank = |n: &str| p.items.iter().find(|i| i.reference.name() == n).unwrap().rank;
        assert!(rank("first") < rank("second"));
        assert!(rank("second") < rank("third"));
    }

    #[test]
    fn malformed_hint_and_cycle_are_config_errors() {
        let c = collection(vec![DeploymentItem::new(cm(Some("x"), "a")).after("nonsense")]);
        assert!(matches!(c.prepare(&registry(), &InclusionFilter::default()), Err(ConfigError::InvalidHint { .. })));

        let c = collection(vec![
            DeploymentItem::new(cm(Some("x"), "a")).after("ConfigMap/b"),
            DeploymentItem::new(cm(Some("x"), "b")).after("ConfigMap/a"),
        ]);
        assert!(matches!(c.prepare(&registry(), &InclusionFilter::default()), Err(ConfigError::DependencyCycle(_))));
    }

    fn deployment(name: &str) -> GenericObject {
        GenericObject::from(json!({"apiVersion": "apps/v1", "kind": "Deployment", "metadata": {"name": name, "namespace": "x"}}))
    }

    #[test]
    fn hints_without_group_resolve_through_the_registry() {
        let c = collection(vec![DeploymentItem::new(deployment("web")).after("Deployment/db"), DeploymentItem::new(deployment("db"))]);
        let p = c.prepare(&registry(), &InclusionFilter::default()).unwrap();
        let rank = |n: &str| p.items.iter().find(|i| i.reference.name() == n).unwrap().rank;
        assert!(rank("db") < rank("web"));
        assert!(p.warnings.is_empty(), "{:?}", p.warnings);
    }

    #[test]
    fn hints_naming_missing_objects_are_warned_about() {
        let c = collection(vec![
            DeploymentItem::new(deployment("web")).after("Deployment.apps/dbb"),
            DeploymentItem::new(deployment("db")),
        ]);
        let p = c.prepare(&registry(), &InclusionFilter::default()).unwrap();
        assert_eq!(p.warnings.len(), 1);
        assert_eq!(p.warnings[0].reference.as_ref().map(|r| r.name()), Some("web"));
        assert!(p.warnings[0].message.contains("Deployment.apps/dbb"));
    }

    #[test]
    fn deletions_take_the_scope_of_their_kind() {
        let mut c = collection(Vec::new());
        c.override_namespace = Some("ns1".into());
        c.delete_objects = vec![
            ObjectRef::new("v1", "ConfigMap", None, "legacy"),
            ObjectRef::new("v1", "ConfigMap", Some("other"), "kept-ns"),
            ObjectRef::new("v1", "Namespace", Some("bogus"), "old"),
            ObjectRef::new("example.com/v1", "Gadget", None, "g"),
        ];
        let d = c.deletions(&registry());
        assert_eq!(d[0].as_ref().unwrap().namespace(), Some("ns1"));
        assert_eq!(d[1].as_ref().unwrap().namespace(), Some("other"));
        assert_eq!(d[2].as_ref().unwrap().namespace(), None);
        assert!(matches!(&d[3], Err((r, ItemError::UnknownKind { .. })) if r.name() == "g"));

        c.override_namespace = None;
        assert_eq!(c.deletions(&registry())[0].as_ref().unwrap().namespace(), Some(DEFAULT_NAMESPACE));
    }

    #[test]
    fn hint_parsing() {
        let h = Hint::parse("Deployment.apps/ns1/web").unwrap();
        assert_eq!(h.group_kind.group, "apps");
        assert_eq!(h.namespace.as_deref(), Some("ns1"));
        assert!(Hint::parse("a/b/c/d").is_none());
        assert!(Hint::parse("/x").is_none());
        let ns = Hint::parse("Namespace/ns1").unwrap().resolve(&registry(), Some("other"));
        assert_eq!(ns.namespace, "");
        let dep = Hint::parse("Deployment/db").unwrap().resolve(&registry(), Some("x"));
        assert_eq!((dep.group.as_str(), dep.namespace.as_str()), ("apps", "x"));
    }
}
