//! Kind registry: server discovery plus CustomResourceDefinitions carried by the collection.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kairn_core::{GenericObject, GroupKind, KindInfo};
use rustc_hash::FxHashMap;
use tracing::debug;

#[derive(Debug, Clone)]
struct Entry {
    info: KindInfo,
    /// Known to the server (vs. only declared by a CRD about to be applied).
    served: bool,
}

#[derive(Debug, Clone, Default)]
pub struct KindRegistry {
    kinds: FxHashMap<GroupKind, Entry>,
}

impl KindRegistry {
    pub fn from_discovery(kinds: impl IntoIterator<Item = KindInfo>) -> Self {
        let kinds = kinds.into_iter().map(|info| (info.group_kind(), Entry { info, served: true })).collect();
        Self { kinds }
    }

    /// Register kinds declared by CRD objects that the server does not serve yet.
    pub fn add_crds<'a>(&mut self, objects: impl IntoIterator<Item = &'a GenericObject>) {
        for obj in objects {
            if obj.kind() != Some("CustomResourceDefinition") { continue; }
            let Some(info) = crd_kind(obj) else {
                debug!(name = obj.name().unwrap_or("-"), "unparseable CustomResourceDefinition; kinds not registered");
                continue;
            };
            self.kinds.entry(info.group_kind()).or_insert(Entry { info, served: false });
        }
    }

    pub fn get(&self, gk: &GroupKind) -> Option<&KindInfo> { self.kinds.get(gk).map(|e| &e.info) }

    /// Kind named without a group: the core group wins, otherwise the single group serving it.
    /// `None` when unknown or ambiguous.
    pub fn find_kind(&self, kind: &str) -> Option<&KindInfo> {
        if let Some(core) = self.get(&GroupKind { group: String::new(), kind: kind.to_string() }) {
            return Some(core);
        }
        let mut hits = self.kinds.values().filter(|e| e.info.kind == kind);
        match (hits.next(), hits.next()) {
            (Some(e), None) => Some(&e.info),
            _ => None,
        }
    }

    pub fn is_served(&self, gk: &GroupKind) -> bool { self.kinds.get(gk).map(|e| e.served).unwrap_or(false) }

    /// Served kinds in a stable order.
    pub fn served(&self) -> Vec<KindInfo> {
        let mut v: Vec<KindInfo> = self.kinds.values().filter(|e| e.served).map(|e| e.info.clone()).collect();
        v.sort_by(|a, b| a.group_kind().cmp(&b.group_kind()));
        v
    }

    pub fn len(&self) -> usize { self.kinds.len() }
    pub fn is_empty(&self) -> bool { self.kinds.is_empty() }
}

fn crd_kind(obj: &GenericObject) -> Option<KindInfo> {
    let crd: CustomResourceDefinition = serde_json::from_value(obj.as_value().clone()).ok()?;
    let spec = crd.spec;
    let version = spec
        .versions
        .iter()
        .find(|v| v.served && v.storage)
        .or_else(|| spec.versions.iter().find(|v| v.served))?
        .name
        .clone();
    Some(KindInfo { group: spec.group, version, kind: spec.names.kind, namespaced: spec.scope != "Cluster" })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn crd(scope: &str) -> GenericObject {
        GenericObject::from(json!({
            "apiVersion": "apiextensions.k8s.io/v1",
            "kind": "CustomResourceDefinition",
            "metadata": {"name": "widgets.example.com"},
            "spec": {
                "group": "example.com",
                "scope": scope,
                "names": {"kind": "Widget", "plural": "widgets"},
                "versions": [
                    {"name": "v1alpha1", "served": true, "storage": false},
                    {"name": "v1", "served": true, "storage": true}
                ]
            }
        }))
    }

    fn gk(group: &str, kind: &str) -> GroupKind { GroupKind { group: group.into(), kind: kind.into() } }

    #[test]
    fn crd_in_collection_declares_unserved_kind() {
        let mut reg = KindRegistry::from_discovery(vec![KindInfo::new("", "v1", "ConfigMap", true)]);
        reg.add_crds([&crd("Cluster")]);
        let w = reg.get(&gk("example.com", "Widget")).unwrap();
        assert_eq!(w.version, "v1");
        assert!(!w.namespaced);
        assert!(!reg.is_served(&gk("example.com", "Widget")));
        assert!(reg.is_served(&gk("", "ConfigMap")));
        assert_eq!(reg.served().len(), 1);
    }

    #[test]
    fn bare_kind_names_resolve_to_their_group() {
        let mut reg = KindRegistry::from_discovery(vec![
            KindInfo::new("", "v1", "Service", true),
            KindInfo::new("apps", "v1", "Deployment", true),
            KindInfo::new("serving.knative.dev", "v1", "Service", true),
            KindInfo::new("a.example.com", "v1", "Gizmo", true),
            KindInfo::new("b.example.com", "v1", "Gizmo", true),
        ]);
        reg.add_crds([&crd("Namespaced")]);
        assert_eq!(reg.find_kind("Deployment").unwrap().group, "apps");
        assert_eq!(reg.find_kind("Service").unwrap().group, "");
        assert_eq!(reg.find_kind("Widget").unwrap().group, "example.com");
        assert!(reg.find_kind("Gizmo").is_none());
        assert!(reg.find_kind("Nope").is_none());
    }

    #[test]
    fn discovery_wins_over_declared_crd() {
        let mut reg = KindRegistry::from_discovery(vec![KindInfo::new("example.com", "v1", "Widget", true)]);
        reg.add_crds([&crd("Cluster")]);
        assert!(reg.get(&gk("example.com", "Widget")).unwrap().namespaced);
        assert!(reg.is_served(&gk("example.com", "Widget")));
    }
}
