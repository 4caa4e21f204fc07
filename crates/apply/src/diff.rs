//! Diff engine: compares a desired object against its live counterpart.
//!
//! Maps are walked over the union of keys, lists positionally. Ignored paths contribute
//! nothing. Server-managed fields the desired object does not set are never compared.
//! Numbers compare by value, also against numeric strings. Suffixed quantities
//! (`500m` == `0.5`, `1Gi` == `1073741824`) are only normalised under resource-style
//! fields, so arbitrary strings such as ConfigMap data keep literal comparison.

use std::collections::{BTreeMap, BTreeSet};

use kairn_core::{FieldPath, GenericObject, ObjectError, PathSegment};
use serde_json::Value as Json;

use crate::collection::{ANNOTATION_IGNORE_DIFF, ANNOTATION_IGNORE_DIFF_FIELD, TAG_LABEL_PREFIX};
use crate::error::ConfigError;
use crate::quantity;
use crate::record::{Action, ChangeKind, FieldChange};

/// Fields populated by the server; stripped from live objects unless the desired object sets them.
const SERVER_MANAGED: &[&[&str]] = &[
    &["status"],
    &["metadata", "managedFields"],
    &["metadata", "resourceVersion"],
    &["metadata", "generation"],
    &["metadata", "creationTimestamp"],
    &["metadata", "uid"],
    &["metadata", "selfLink"],
    &["metadata", "annotations", "kubectl.kubernetes.io/last-applied-configuration"],
    &["metadata", "annotations", "deployment.kubernetes.io/revision"],
];

/// Keys whose subtrees hold quantities: container resources, PV/PVC capacity,
/// quotas, limit ranges, node allocatable, emptyDir size limits.
const QUANTITY_KEYS: &[&str] = &[
    "resources",
    "limits",
    "requests",
    "capacity",
    "allocatable",
    "hard",
    "used",
    "overhead",
    "sizeLimit",
    "default",
    "defaultRequest",
    "max",
    "min",
    "maxLimitRequestRatio",
];

/// Top-level fields that hold free-form strings.
const FREE_FORM_ROOTS: &[&str] = &["metadata", "data", "stringData", "binaryData"];

fn holds_quantity(path: &FieldPath) -> bool {
    let keys = || path.segments().iter().filter_map(|s| match s { PathSegment::Key(k) => Some(k.as_str()), _ => None });
    let free_form = matches!(path.segments().first(), Some(PathSegment::Key(k)) if FREE_FORM_ROOTS.contains(&k.as_str()));
    !free_form && keys().any(|k| QUANTITY_KEYS.contains(&k))
}

/// A path ignored only for items carrying `tag`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedRule {
    pub tag: String,
    pub path: FieldPath,
}

#[derive(Debug, Clone, Default)]
pub struct IgnoreRules {
    /// Ignore the `kairn.io/tag-*` labels.
    pub ignore_tags: bool,
    pub ignore_labels: bool,
    pub ignore_annotations: bool,
    pub paths: Vec<FieldPath>,
    pub label_keys: Vec<String>,
    pub annotation_keys: Vec<String>,
    pub tagged: Vec<TaggedRule>,
}

impl IgnoreRules {
    pub fn parse_path(rule: &str) -> Result<FieldPath, ConfigError> {
        let path = FieldPath::parse(rule).map_err(|e| ConfigError::InvalidIgnoreRule { rule: rule.to_string(), reason: e.to_string() })?;
        if path.is_empty() {
            return Err(ConfigError::InvalidIgnoreRule { rule: rule.to_string(), reason: "empty path".into() });
        }
        Ok(path)
    }

    /// `tag:path`
    pub fn parse_tagged(rule: &str) -> Result<TaggedRule, ConfigError> {
        let (tag, path) = rule
            .split_once(':')
            .ok_or_else(|| ConfigError::InvalidIgnoreRule { rule: rule.to_string(), reason: "expected <tag>:<path>".into() })?;
        let tagged = TaggedRule { tag: tag.trim().to_string(), path: Self::parse_path(path.trim())? };
        if tagged.tag.is_empty() {
            return Err(ConfigError::InvalidIgnoreRule { rule: rule.to_string(), reason: "empty tag".into() });
        }
        Ok(tagged)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let bad = |rule: String, reason: &str| Err(ConfigError::InvalidIgnoreRule { rule, reason: reason.to_string() });
        if self.paths.iter().any(FieldPath::is_empty) { return bad(String::new(), "empty path"); }
        if let Some(k) = self.label_keys.iter().chain(&self.annotation_keys).find(|k| k.trim().is_empty()) {
            return bad(k.clone(), "empty key");
        }
        for t in &self.tagged {
            if t.tag.is_empty() { return bad(t.path.to_string(), "empty tag"); }
            if t.path.is_empty() { return bad(t.tag.clone(), "empty path"); }
        }
        Ok(())
    }

    fn resolve(&self, desired: &GenericObject, live: &GenericObject, tags: &BTreeSet<String>) -> Result<Resolved, ObjectError> {
        let labels = |k: &str| FieldPath::from_keys(["metadata", "labels", k]);
        let annos = |k: &str| FieldPath::from_keys(["metadata", "annotations", k]);
        let mut patterns = self.paths.clone();
        if self.ignore_labels { patterns.push(FieldPath::from_keys(["metadata", "labels"])); }
        if self.ignore_annotations { patterns.push(FieldPath::from_keys(["metadata", "annotations"])); }
        patterns.extend(self.label_keys.iter().map(|k| labels(k)));
        patterns.extend(self.annotation_keys.iter().map(|k| annos(k)));
        if self.ignore_tags {
            let keys: BTreeSet<String> = desired.labels().into_keys().chain(live.labels().into_keys()).collect();
            patterns.extend(keys.iter().filter(|k| k.starts_with(TAG_LABEL_PREFIX)).map(|k| labels(k)));
        }
        patterns.extend(self.tagged.iter().filter(|t| tags.contains(&t.tag)).map(|t| t.path.clone()));

        let own: BTreeMap<String, String> = desired.annotations();
        for (k, v) in &own {
            let is_field_rule = k == ANNOTATION_IGNORE_DIFF_FIELD
                || k.strip_prefix(ANNOTATION_IGNORE_DIFF_FIELD).map(|rest| rest.starts_with('-')).unwrap_or(false);
            if is_field_rule { patterns.push(FieldPath::parse(v)?); }
        }
        let whole_object = own.get(ANNOTATION_IGNORE_DIFF).map(|v| v == "true").unwrap_or(false);
        Ok(Resolved { patterns, whole_object })
    }
}

struct Resolved {
    patterns: Vec<FieldPath>,
    whole_object: bool,
}

impl Resolved {
    fn covers(&self, path: &FieldPath) -> bool { self.whole_object || self.patterns.iter().any(|p| p.covers(path)) }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectDiff {
    pub action: Action,
    pub changes: Vec<FieldChange>,
    pub unified_diff: Option<String>,
}

/// Copy of `live` without the server-managed fields `desired` does not set.
pub fn normalize_live(desired: &GenericObject, live: &GenericObject) -> GenericObject {
    let mut out = live.deep_copy();
    for path in SERVER_MANAGED {
        let path = FieldPath::from_keys(path.iter().copied());
        if desired.get(&path).is_none() { out.delete(&path); }
    }
    let annos = FieldPath::from_keys(["metadata", "annotations"]);
    let empty = out.get(&annos).and_then(Json::as_object).map(|m| m.is_empty()).unwrap_or(false);
    if empty && desired.get(&annos).is_none() { out.delete(&annos); }
    out
}

/// Compare `desired` with `live`. Deterministic: the same inputs always yield the same diff.
pub fn diff(
    desired: &GenericObject,
    live: Option<&GenericObject>,
    rules: &IgnoreRules,
    tags: &BTreeSet<String>,
) -> Result<ObjectDiff, ObjectError> {
    let mut changes = Vec::new();
    let Some(live) = live else {
        leaves(&mut FieldPath::root(), desired.as_value(), ChangeKind::Added, None, &mut changes);
        let unified = Some(unified_diff("", &desired.to_yaml()));
        return Ok(ObjectDiff { action: Action::Create, changes, unified_diff: unified });
    };
    let live = normalize_live(desired, live);
    let resolved = rules.resolve(desired, &live, tags)?;
    walk(&mut FieldPath::root(), Some(desired.as_value()), Some(live.as_value()), &resolved, &mut changes);
    if changes.is_empty() {
        return Ok(ObjectDiff { action: Action::NoOp, changes, unified_diff: None });
    }
    let unified = Some(unified_diff(&live.to_yaml(), &desired.to_yaml()));
    Ok(ObjectDiff { action: Action::Update, changes, unified_diff: unified })
}

pub fn unified_diff(old: &str, new: &str) -> String {
    similar::TextDiff::from_lines(old, new).unified_diff().context_radius(3).header("live", "desired").to_string()
}

fn walk(path: &mut FieldPath, desired: Option<&Json>, live: Option<&Json>, rules: &Resolved, out: &mut Vec<FieldChange>) {
    if rules.covers(path) { return; }
    match (desired, live) {
        (Some(Json::Object(d)), Some(Json::Object(l))) => {
            let keys: BTreeSet<&String> = d.keys().chain(l.keys()).collect();
            for k in keys {
                path.push(PathSegment::Key(k.clone()));
                walk(path, d.get(k), l.get(k), rules, out);
                path.pop();
            }
        }
        (Some(Json::Array(d)), Some(Json::Array(l))) => {
            for i in 0..d.len().max(l.len()) {
                path.push(PathSegment::Index(i));
                walk(path, d.get(i), l.get(i), rules, out);
                path.pop();
            }
        }
        (Some(d), Some(l)) => {
            if !scalars_equal(path, d, l) {
                out.push(FieldChange { path: path.clone(), kind: ChangeKind::Changed, old: Some(l.clone()), new: Some(d.clone()) });
            }
        }
        (Some(d), None) => leaves(path, d, ChangeKind::Added, Some(rules), out),
        (None, Some(l)) => leaves(path, l, ChangeKind::Removed, Some(rules), out),
        (None, None) => {}
    }
}

/// One change per leaf under `path`; empty maps and lists are leaves.
fn leaves(path: &mut FieldPath, v: &Json, kind: ChangeKind, rules: Option<&Resolved>, out: &mut Vec<FieldChange>) {
    if rules.map(|r| r.covers(path)).unwrap_or(false) { return; }
    match v {
        Json::Object(m) if !m.is_empty() => {
            for (k, child) in m {
                path.push(PathSegment::Key(k.clone()));
                leaves(path, child, kind, rules, out);
                path.pop();
            }
        }
        Json::Array(items) if !items.is_empty() => {
            for (i, child) in items.iter().enumerate() {
                path.push(PathSegment::Index(i));
                leaves(path, child, kind, rules, out);
                path.pop();
            }
        }
        _ => {
            let (old, new) = match kind {
                ChangeKind::Removed => (Some(v.clone()), None),
                _ => (None, Some(v.clone())),
            };
            out.push(FieldChange { path: path.clone(), kind, old, new });
        }
    }
}

fn scalars_equal(path: &FieldPath, a: &Json, b: &Json) -> bool {
    if a == b { return true; }
    let text = |v: &Json| match v {
        Json::Number(n) => Some((n.to_string(), true)),
        Json::String(s) => Some((s.clone(), false)),
        _ => None,
    };
    let (Some((ta, a_num)), Some((tb, b_num))) = (text(a), text(b)) else { return false };
    match (quantity::parse(&ta), quantity::parse(&tb)) {
        (Some(qa), Some(qb)) if qa.nanos == qb.nanos => {
            if holds_quantity(path) {
                a_num || b_num || qa.has_suffix || qb.has_suffix
            } else {
                (a_num || b_num) && !qa.has_suffix && !qb.has_suffix
            }
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Json) -> GenericObject { GenericObject::from(v) }
    fn no_tags() -> BTreeSet<String> { BTreeSet::new() }

    fn cm(data: Json) -> GenericObject {
        obj(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "cm", "namespace": "ns1"}, "data": data}))
    }

    #[test]
    fn missing_live_is_create_with_every_leaf_added() {
        let d = cm(json!({"a": "1", "b": "2"}));
        let out = diff(&d, None, &IgnoreRules::default(), &no_tags()).unwrap();
        assert_eq!(out.action, Action::Create);
        let paths: Vec<String> = out.changes.iter().map(|c| c.path.to_string()).collect();
        assert_eq!(paths, vec!["apiVersion", "data.a", "data.b", "kind", "metadata.name", "metadata.namespace"]);
        assert!(out.changes.iter().all(|c| c.kind == ChangeKind::Added));
    }

    #[test]
    fn changed_data_value_is_single_change() {
        let d = cm(json!({"a": "2"}));
        let mut l = cm(json!({"a": "1"}));
        l.set(&FieldPath::parse("metadata.resourceVersion").unwrap(), json!("42")).unwrap();
        l.set(&FieldPath::parse("status.phase").unwrap(), json!("Active")).unwrap();
        let out = diff(&d, Some(&l), &IgnoreRules::default(), &no_tags()).unwrap();
        assert_eq!(out.action, Action::Update);
        assert_eq!(out.changes.len(), 1);
        let c = &out.changes[0];
        assert_eq!(c.path.to_string(), "data.a");
        assert_eq!(c.kind, ChangeKind::Changed);
        assert_eq!(c.old, Some(json!("1")));
        assert_eq!(c.new, Some(json!("2")));
        assert!(out.unified_diff.as_deref().unwrap().contains("-  a: '1'"));
    }

    #[test]
    fn server_fields_are_compared_when_desired_sets_them() {
        let mut d = cm(json!({}));
        d.set(&FieldPath::parse("status.x").unwrap(), json!(1)).unwrap();
        let l = cm(json!({}));
        let out = diff(&d, Some(&l), &IgnoreRules::default(), &no_tags()).unwrap();
        assert_eq!(out.changes.len(), 1);
        assert_eq!(out.changes[0].path.to_string(), "status.x");
    }

    #[test]
    fn ignored_paths_do_not_block_noop() {
        let d = cm(json!({"a": "1", "b": "new"}));
        let l = cm(json!({"a": "1", "b": "old", "extra": "x"}));
        let rules = IgnoreRules {
            paths: vec![FieldPath::parse("data.b").unwrap(), FieldPath::parse("data.extra").unwrap()],
            ..Default::default()
        };
        let out = diff(&d, Some(&l), &rules, &no_tags()).unwrap();
        assert_eq!(out.action, Action::NoOp);
        assert!(out.changes.is_empty());
        assert!(out.unified_diff.is_none());
    }

    #[test]
    fn label_annotation_and_tag_rules() {
        let mut d = cm(json!({}));
        d.set_label("kairn.io/tag-0", "new").unwrap();
        d.set_label("team", "a").unwrap();
        let mut l = cm(json!({}));
        l.set_label("kairn.io/tag-0", "old").unwrap();
        l.set_label("team", "b").unwrap();
        l.set(&FieldPath::from_keys(["metadata", "annotations", "note"]), json!("x")).unwrap();

        let rules = IgnoreRules { ignore_tags: true, label_keys: vec!["team".into()], annotation_keys: vec!["note".into()], ..Default::default() };
        assert_eq!(diff(&d, Some(&l), &rules, &no_tags()).unwrap().action, Action::NoOp);

        let rules = IgnoreRules { ignore_labels: true, ignore_annotations: true, ..Default::default() };
        assert_eq!(diff(&d, Some(&l), &rules, &no_tags()).unwrap().action, Action::NoOp);

        let out = diff(&d, Some(&l), &IgnoreRules::default(), &no_tags()).unwrap();
        assert_eq!(out.changes.len(), 3);
    }

    #[test]
    fn tag_scoped_rule_applies_only_to_tagged_items() {
        let d = cm(json!({"a": "2"}));
        let l = cm(json!({"a": "1"}));
        let rules = IgnoreRules { tagged: vec![IgnoreRules::parse_tagged("canary:data.a").unwrap()], ..Default::default() };
        let tags: BTreeSet<String> = ["canary".to_string()].into();
        assert_eq!(diff(&d, Some(&l), &rules, &tags).unwrap().action, Action::NoOp);
        assert_eq!(diff(&d, Some(&l), &rules, &no_tags()).unwrap().action, Action::Update);
    }

    #[test]
    fn object_annotations_can_ignore_fields_or_everything() {
        let mut d = cm(json!({"a": "2", "b": "2"}));
        let l0 = cm(json!({"a": "1", "b": "1"}));
        d.set(&FieldPath::from_keys(["metadata", "annotations", ANNOTATION_IGNORE_DIFF_FIELD]), json!("data.a")).unwrap();
        d.set(&FieldPath::from_keys(["metadata", "annotations", "kairn.io/ignore-diff-field-2"]), json!("data.b")).unwrap();
        let mut l = l0.deep_copy();
        l.set(&FieldPath::from_keys(["metadata", "annotations"]), d.get(&FieldPath::from_keys(["metadata", "annotations"])).cloned().unwrap()).unwrap();
        assert_eq!(diff(&d, Some(&l), &IgnoreRules::default(), &no_tags()).unwrap().action, Action::NoOp);

        let mut d = cm(json!({"a": "2"}));
        d.set(&FieldPath::from_keys(["metadata", "annotations", ANNOTATION_IGNORE_DIFF]), json!("true")).unwrap();
        assert_eq!(diff(&d, Some(&l0), &IgnoreRules::default(), &no_tags()).unwrap().action, Action::NoOp);
    }

    #[test]
    fn quantities_and_numbers_normalise() {
        let d = obj(json!({"spec": {"resources": {"limits": {"cpu": "500m", "memory": "1Gi"}}, "replicas": 1, "n": "1"}}));
        let l = obj(json!({"spec": {"resources": {"limits": {"cpu": "0.5", "memory": "1073741824"}}, "replicas": 1.0, "n": 1}}));
        assert_eq!(diff(&d, Some(&l), &IgnoreRules::default(), &no_tags()).unwrap().action, Action::NoOp);
        // plain strings keep literal comparison
        let d = obj(json!({"data": {"v": "1.0"}}));
        let l = obj(json!({"data": {"v": "1"}}));
        assert_eq!(diff(&d, Some(&l), &IgnoreRules::default(), &no_tags()).unwrap().action, Action::Update);
    }

    #[test]
    fn suffixes_only_normalise_under_resource_fields() {
        let changed = |d: Json, l: Json| diff(&obj(d), Some(&obj(l)), &IgnoreRules::default(), &no_tags()).unwrap().changes.len();
        assert_eq!(changed(json!({"data": {"a": "1k", "b": "1e3"}}), json!({"data": {"a": "1000", "b": "1000"}})), 2);
        assert_eq!(changed(json!({"spec": {"size": "1k"}}), json!({"spec": {"size": "1000"}})), 1);
        assert_eq!(changed(json!({"data": {"resources": "1k"}}), json!({"data": {"resources": "1000"}})), 1);
        assert_eq!(changed(json!({"spec": {"capacity": {"storage": "1Ki"}}}), json!({"spec": {"capacity": {"storage": "1024"}}})), 0);
        assert_eq!(
            changed(
                json!({"spec": {"containers": [{"resources": {"requests": {"cpu": "100m"}}}]}}),
                json!({"spec": {"containers": [{"resources": {"requests": {"cpu": "0.1"}}}]}})
            ),
            0
        );
    }

    #[test]
    fn lists_compare_positionally() {
        let d = obj(json!({"l": ["a", "b"]}));
        let l = obj(json!({"l": ["b", "a", "c"]}));
        let out = diff(&d, Some(&l), &IgnoreRules::default(), &no_tags()).unwrap();
        let kinds: Vec<(String, ChangeKind)> = out.changes.iter().map(|c| (c.path.to_string(), c.kind)).collect();
        assert_eq!(
            kinds,
            vec![("l[0]".into(), ChangeKind::Changed), ("l[1]".into(), ChangeKind::Changed), ("l[2]".into(), ChangeKind::Removed)]
        );
    }

    #[test]
    fn invalid_rules_are_rejected() {
        assert!(IgnoreRules::parse_path("").is_err());
        assert!(IgnoreRules::parse_path("a..b").is_err());
        assert!(IgnoreRules::parse_tagged("no-colon").is_err());
        assert!(IgnoreRules::parse_tagged(":data.a").is_err());
        let rules = IgnoreRules { label_keys: vec![" ".into()], ..Default::default() };
        assert!(rules.validate().is_err());
    }
}
