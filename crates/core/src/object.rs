//! Schema-less object model: a strict tree of maps, lists and scalars.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::path::{FieldPath, PathSegment};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ObjectError {
    #[error("type mismatch at '{path}': expected {expected}, found {found}")]
    TypeMismatch { path: String, expected: &'static str, found: &'static str },
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("index {index} out of range at '{path}'")]
    IndexOutOfRange { path: String, index: usize },
    #[error("invalid object: {0}")]
    Invalid(String),
}

/// How `merge` combines two trees.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MergeStrategy {
    /// Top-level values of the other object win wholesale.
    Replace,
    /// Maps merge key-wise recursively; lists and scalars are replaced.
    #[default]
    DeepMerge,
    /// Like `DeepMerge`, but lists of maps are merged element-wise by the given key.
    MergeListsByKey(String),
}

pub(crate) fn type_name(v: &Json) -> &'static str {
    match v {
        Json::Null => "null",
        Json::Bool(_) => "bool",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "list",
        Json::Object(_) => "map",
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GenericObject(Json);

impl GenericObject {
    /// An empty map.
    pub fn new() -> Self { Self(Json::Object(Map::new())) }

    pub fn from_value(v: Json) -> Self { Self(v) }

    pub fn from_yaml(yaml: &str) -> Result<Self, ObjectError> {
        let v: serde_yaml::Value = serde_yaml::from_str(yaml).map_err(|e| ObjectError::Invalid(e.to_string()))?;
        let json = serde_json::to_value(v).map_err(|e| ObjectError::Invalid(e.to_string()))?;
        Ok(Self(json))
    }

    pub fn to_yaml(&self) -> String { serde_yaml::to_string(&self.0).unwrap_or_default() }

    pub fn as_value(&self) -> &Json { &self.0 }
    pub fn into_value(self) -> Json { self.0 }

    /// Returns `None` when any segment along the path is missing or not traversable.
    pub fn get(&self, path: &FieldPath) -> Option<&Json> {
        path.segments().iter().try_fold(&self.0, |node, seg| match (seg, node) {
            (PathSegment::Key(k), Json::Object(m)) => m.get(k),
            (PathSegment::Index(i), Json::Array(a)) => a.get(*i),
            _ => None,
        })
    }

    pub fn get_str(&self, path: &FieldPath) -> Option<&str> { self.get(path).and_then(Json::as_str) }

    /// Set `value` at `path`, creating intermediate maps and lists as needed.
    /// An index may address an existing element or append at the end of a list.
    pub fn set(&mut self, path: &FieldPath, value: Json) -> Result<(), ObjectError> {
        let mut node = &mut self.0;
        for (depth, seg) in path.segments().iter().enumerate() {
            node = child_mut(node, seg, path, depth)?;
        }
        *node = value;
        Ok(())
    }

    /// Remove and return the value at `path`, if present.
    pub fn delete(&mut self, path: &FieldPath) -> Option<Json> {
        let (last, parents) = path.segments().split_last()?;
        let mut node = &mut self.0;
        for seg in parents {
            node = match (seg, node) {
                (PathSegment::Key(k), Json::Object(m)) => m.get_mut(k)?,
                (PathSegment::Index(i), Json::Array(a)) => a.get_mut(*i)?,
                _ => return None,
            };
        }
        match (last, node) {
            (PathSegment::Key(k), Json::Object(m)) => m.remove(k),
            (PathSegment::Index(i), Json::Array(a)) if *i < a.len() => Some(a.remove(*i)),
            _ => None,
        }
    }

    pub fn merge(&mut self, other: &GenericObject, strategy: &MergeStrategy) -> Result<(), ObjectError> {
        match strategy {
            MergeStrategy::Replace => {
                match (&mut self.0, &other.0) {
                    (Json::Object(dst), Json::Object(src)) => {
                        for (k, v) in src { dst.insert(k.clone(), v.clone()); }
                    }
                    (dst, src) => *dst = src.clone(),
                }
                Ok(())
            }
            MergeStrategy::DeepMerge => merge_values(&mut self.0, &other.0, None, &mut FieldPath::root()),
            MergeStrategy::MergeListsByKey(key) => merge_values(&mut self.0, &other.0, Some(key), &mut FieldPath::root()),
        }
    }

    /// Copies are always deep; the tree never shares nodes.
    pub fn deep_copy(&self) -> Self { self.clone() }

    /// Children of the list or map at `path` (map children in key order).
    /// A missing path yields an empty sequence.
    pub fn list_at_path(&self, path: &FieldPath) -> Result<Vec<GenericObject>, ObjectError> {
        match self.get(path) {
            None | Some(Json::Null) => Ok(Vec::new()),
            Some(Json::Array(items)) => Ok(items.iter().cloned().map(GenericObject).collect()),
            Some(Json::Object(m)) => Ok(m.values().cloned().map(GenericObject).collect()),
            Some(other) => Err(ObjectError::TypeMismatch {
                path: path.to_string(),
                expected: "list or map",
                found: type_name(other),
            }),
        }
    }

    // ---- metadata projections ----

    pub fn api_version(&self) -> Option<&str> { self.0.get("apiVersion").and_then(Json::as_str) }
    pub fn kind(&self) -> Option<&str> { self.0.get("kind").and_then(Json::as_str) }
    pub fn name(&self) -> Option<&str> { self.meta_str("name") }
    pub fn namespace(&self) -> Option<&str> { self.meta_str("namespace").filter(|s| !s.is_empty()) }
    pub fn resource_version(&self) -> Option<&str> { self.meta_str("resourceVersion") }

    pub fn labels(&self) -> BTreeMap<String, String> { self.string_map("labels") }
    pub fn annotations(&self) -> BTreeMap<String, String> { self.string_map("annotations") }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.0.get("metadata")?.get("annotations")?.get(key)?.as_str()
    }

    pub fn set_label(&mut self, key: &str, value: &str) -> Result<(), ObjectError> {
        self.set(&FieldPath::from_keys(["metadata", "labels", key]), Json::String(value.to_string()))
    }

    pub fn set_namespace(&mut self, ns: Option<&str>) -> Result<(), ObjectError> {
        let path = FieldPath::from_keys(["metadata", "namespace"]);
        match ns {
            Some(ns) => self.set(&path, Json::String(ns.to_string())),
            None => { self.delete(&path); Ok(()) }
        }
    }

    fn meta_str(&self, key: &str) -> Option<&str> { self.0.get("metadata")?.get(key)?.as_str() }

    fn string_map(&self, key: &str) -> BTreeMap<String, String> {
        self.0
            .get("metadata")
            .and_then(|m| m.get(key))
            .and_then(Json::as_object)
            .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
            .unwrap_or_default()
    }
}

impl From<Json> for GenericObject {
    fn from(v: Json) -> Self { Self(v) }
}

fn child_mut<'a>(node: &'a mut Json, seg: &PathSegment, path: &FieldPath, depth: usize) -> Result<&'a mut Json, ObjectError> {
    if node.is_null() {
        *node = match seg {
            PathSegment::Key(_) => Json::Object(Map::new()),
            PathSegment::Index(_) => Json::Array(Vec::new()),
            PathSegment::Any => return Err(ObjectError::InvalidPath(path.to_string())),
        };
    }
    match (seg, node) {
        (PathSegment::Key(k), Json::Object(m)) => Ok(m.entry(k.clone()).or_insert(Json::Null)),
        (PathSegment::Index(i), Json::Array(items)) => {
            if *i > items.len() {
                return Err(ObjectError::IndexOutOfRange { path: path.prefix(depth).to_string(), index: *i });
            }
            if *i == items.len() { items.push(Json::Null); }
            Ok(&mut items[*i])
        }
        (PathSegment::Any, _) => Err(ObjectError::InvalidPath(path.to_string())),
        (seg, other) => Err(ObjectError::TypeMismatch {
            path: path.prefix(depth).to_string(),
            expected: if matches!(seg, PathSegment::Key(_)) { "map" } else { "list" },
            found: type_name(other),
        }),
    }
}

fn merge_values(dst: &mut Json, src: &Json, list_key: Option<&String>, at: &mut FieldPath) -> Result<(), ObjectError> {
    match (dst, src) {
        (Json::Object(d), Json::Object(s)) => {
            for (k, sv) in s {
                at.push(PathSegment::Key(k.clone()));
                match d.get_mut(k) {
                    Some(dv) => merge_values(dv, sv, list_key, at)?,
                    None => { d.insert(k.clone(), sv.clone()); }
                }
                at.pop();
            }
            Ok(())
        }
        (Json::Array(d), Json::Array(s)) => {
            match list_key {
                Some(key) if keyed(d, key) && keyed(s, key) => {
                    for sv in s {
                        let id = &sv[key.as_str()];
                        match d.iter().position(|dv| &dv[key.as_str()] == id) {
                            Some(pos) => {
                                at.push(PathSegment::Index(pos));
                                merge_values(&mut d[pos], sv, list_key, at)?;
                                at.pop();
                            }
                            None => d.push(sv.clone()),
                        }
                    }
                }
                _ => *d = s.clone(),
            }
            Ok(())
        }
        (d, s) => {
            let structural = |v: &Json| v.is_object() || v.is_array();
            if !d.is_null() && !s.is_null() && (structural(d) || structural(s)) {
                return Err(ObjectError::TypeMismatch { path: at.to_string(), expected: type_name(d), found: type_name(s) });
            }
            *d = s.clone();
            Ok(())
        }
    }
}

fn keyed(items: &[Json], key: &str) -> bool {
    items.iter().all(|v| v.get(key).is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn p(s: &str) -> FieldPath { FieldPath::parse(s).unwrap() }

    #[test]
    fn get_missing_intermediate_is_not_found() {
        let o = GenericObject::from(json!({"a": {"b": 1}, "l": [1, 2]}));
        assert_eq!(o.get(&p("a.b")), Some(&json!(1)));
        assert_eq!(o.get(&p("a.x.y")), None);
        assert_eq!(o.get(&p("l[1]")), Some(&json!(2)));
        assert_eq!(o.get(&p("l[5]")), None);
        assert_eq!(o.get(&p("a.b.c")), None);
    }

    #[test]
    fn set_creates_intermediate_maps_and_lists() {
        let mut o = GenericObject::new();
        o.set(&p("spec.template.containers[0].name"), json!("web")).unwrap();
        o.set(&p("spec.template.containers[1]"), json!({"name": "sidecar"})).unwrap();
        assert_eq!(
            o.as_value(),
            &json!({"spec": {"template": {"containers": [{"name": "web"}, {"name": "sidecar"}]}}})
        );
    }

    #[test]
    fn set_through_scalar_is_type_mismatch() {
        let mut o = GenericObject::from(json!({"metadata": {"labels": "oops"}}));
        let err = o.set_label("app", "x").unwrap_err();
        assert_eq!(
            err,
            ObjectError::TypeMismatch { path: "metadata.labels".into(), expected: "map", found: "string" }
        );
        let err = o.set(&p("metadata.labels[0]"), json!(1)).unwrap_err();
        assert!(matches!(err, ObjectError::TypeMismatch { expected: "list", .. }));
    }

    #[test]
    fn set_index_past_end_fails() {
        let mut o = GenericObject::from(json!({"l": []}));
        assert!(matches!(o.set(&p("l[2]"), json!(1)), Err(ObjectError::IndexOutOfRange { index: 2, .. })));
    }

    #[test]
    fn delete_removes_keys_and_elements() {
        let mut o = GenericObject::from(json!({"a": {"b": 1, "c": 2}, "l": [1, 2, 3]}));
        assert_eq!(o.delete(&p("a.b")), Some(json!(1)));
        assert_eq!(o.delete(&p("l[0]")), Some(json!(1)));
        assert_eq!(o.delete(&p("nope.x")), None);
        assert_eq!(o.as_value(), &json!({"a": {"c": 2}, "l": [2, 3]}));
    }

    #[test]
    fn deep_merge_merges_maps_and_replaces_lists() {
        let mut o = GenericObject::from(json!({"a": {"x": 1, "y": 2}, "l": [1, 2], "s": "old"}));
        let other = GenericObject::from(json!({"a": {"y": 3, "z": 4}, "l": [9], "s": "new"}));
        o.merge(&other, &MergeStrategy::DeepMerge).unwrap();
        assert_eq!(o.as_value(), &json!({"a": {"x": 1, "y": 3, "z": 4}, "l": [9], "s": "new"}));
    }

    #[test]
    fn replace_merge_swaps_top_level_values() {
        let mut o = GenericObject::from(json!({"a": {"x": 1}, "b": 1}));
        o.merge(&GenericObject::from(json!({"a": {"y": 2}})), &MergeStrategy::Replace).unwrap();
        assert_eq!(o.as_value(), &json!({"a": {"y": 2}, "b": 1}));
    }

    #[test]
    fn merge_lists_by_key() {
        let mut o = GenericObject::from(json!({"c": [{"name": "a", "img": "1"}, {"name": "b", "img": "1"}]}));
        let other = GenericObject::from(json!({"c": [{"name": "b", "img": "2"}, {"name": "c", "img": "3"}]}));
        o.merge(&other, &MergeStrategy::MergeListsByKey("name".into())).unwrap();
        assert_eq!(
            o.as_value(),
            &json!({"c": [{"name": "a", "img": "1"}, {"name": "b", "img": "2"}, {"name": "c", "img": "3"}]})
        );
    }

    #[test]
    fn merge_map_into_scalar_is_type_mismatch() {
        let mut o = GenericObject::from(json!({"a": "scalar"}));
        let err = o.merge(&GenericObject::from(json!({"a": {"b": 1}})), &MergeStrategy::DeepMerge).unwrap_err();
        assert!(matches!(err, ObjectError::TypeMismatch { ref path, .. } if path == "a"));
    }

    #[test]
    fn deep_copy_does_not_alias() {
        let o = GenericObject::from(json!({"a": {"b": [1, {"c": 2}]}}));
        let mut copy = o.deep_copy();
        copy.set(&p("a.b[1].c"), json!(3)).unwrap();
        assert_eq!(o.get(&p("a.b[1].c")), Some(&json!(2)));
        assert_eq!(copy.get(&p("a.b[1].c")), Some(&json!(3)));
    }

    #[test]
    fn list_at_path_handles_lists_maps_and_scalars() {
        let o = GenericObject::from(json!({"l": [{"n": 1}, {"n": 2}], "m": {"b": 2, "a": 1}, "s": 1}));
        assert_eq!(o.list_at_path(&p("l")).unwrap().len(), 2);
        let m = o.list_at_path(&p("m")).unwrap();
        assert_eq!(m[0].as_value(), &json!(1));
        assert!(o.list_at_path(&p("missing")).unwrap().is_empty());
        assert!(o.list_at_path(&p("s")).is_err());
    }

    #[test]
    fn metadata_projections() {
        let o = GenericObject::from_yaml(
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\n  namespace: ns1\n  labels:\n    a: b\n",
        )
        .unwrap();
        assert_eq!(o.kind(), Some("ConfigMap"));
        assert_eq!(o.name(), Some("cm"));
        assert_eq!(o.namespace(), Some("ns1"));
        assert_eq!(o.labels().get("a").map(String::as_str), Some("b"));
        assert!(o.annotations().is_empty());
    }
}
