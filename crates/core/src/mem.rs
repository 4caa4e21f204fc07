//! In-memory cluster: a conforming `ClusterAdapter` for tests and offline runs.
//!
//! Objects are stamped with `metadata.resourceVersion` and `metadata.uid` on every write,
//! namespaced objects require their Namespace to exist, and created CRDs register their kind.
//! Faults can be injected per verb/object and every call is recorded in an operation log.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value as Json;

use crate::adapter::{AdapterError, AdapterErrorKind, ClusterAdapter, Labels};
use crate::object::{GenericObject, ObjectError};
use crate::path::FieldPath;
use crate::reference::{GroupKind, KindInfo, ObjectKey, ObjectRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Discover,
    Get,
    List,
    Create,
    Update,
    Replace,
    Delete,
}

impl Verb {
    pub fn is_mutation(self) -> bool {
        matches!(self, Verb::Create | Verb::Update | Verb::Replace | Verb::Delete)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemOp {
    pub verb: Verb,
    /// `None` for discovery and list calls.
    pub key: Option<ObjectKey>,
}

struct Fault {
    verb: Verb,
    key: Option<ObjectKey>,
    kind: AdapterErrorKind,
    remaining: usize,
}

type Observer = Arc<dyn Fn(&MemOp) + Send + Sync>;

#[derive(Default)]
struct MemState {
    kinds: BTreeMap<GroupKind, KindInfo>,
    objects: BTreeMap<ObjectKey, GenericObject>,
    faults: Vec<Fault>,
    log: Vec<MemOp>,
    next_rv: u64,
    observer: Option<Observer>,
}

pub struct MemCluster {
    state: Mutex<MemState>,
}

pub fn builtin_kinds() -> Vec<KindInfo> {
    let cluster = |g: &str, v: &str, k: &str| KindInfo::new(g, v, k, false);
    let ns = |g: &str, v: &str, k: &str| KindInfo::new(g, v, k, true);
    vec![
        cluster("", "v1", "Namespace"),
        cluster("apiextensions.k8s.io", "v1", "CustomResourceDefinition"),
        cluster("rbac.authorization.k8s.io", "v1", "ClusterRole"),
        cluster("rbac.authorization.k8s.io", "v1", "ClusterRoleBinding"),
        cluster("", "v1", "PersistentVolume"),
        cluster("storage.k8s.io", "v1", "StorageClass"),
        ns("", "v1", "ConfigMap"),
        ns("", "v1", "Secret"),
        ns("", "v1", "ServiceAccount"),
        ns("", "v1", "Service"),
        ns("", "v1", "PersistentVolumeClaim"),
        ns("", "v1", "Pod"),
        ns("rbac.authorization.k8s.io", "v1", "Role"),
        ns("rbac.authorization.k8s.io", "v1", "RoleBinding"),
        ns("apps", "v1", "Deployment"),
        ns("apps", "v1", "StatefulSet"),
        ns("apps", "v1", "DaemonSet"),
        ns("batch", "v1", "Job"),
        ns("batch", "v1", "CronJob"),
        ns("networking.k8s.io", "v1", "Ingress"),
        ns("autoscaling", "v2", "HorizontalPodAutoscaler"),
    ]
}

impl MemCluster {
    pub fn new(kinds: impl IntoIterator<Item = KindInfo>) -> Self {
        let state = MemState { kinds: kinds.into_iter().map(|k| (k.group_kind(), k)).collect(), ..Default::default() };
        Self { state: Mutex::new(state) }
    }

    /// Builtin kinds plus the `default` namespace.
    pub fn with_builtin_kinds() -> Self {
        let me = Self::new(builtin_kinds());
        let default_ns = GenericObject::from(serde_json::json!({
            "apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "default"}
        }));
        let mut st = me.lock();
        let rv = st.bump();
        let key = ObjectRef::new("v1", "Namespace", None, "default").key();
        st.objects.insert(key, stamp(default_ns, rv, None));
        drop(st);
        me
    }

    /// Insert live state directly, bypassing the operation log and fault injection.
    pub fn seed(&self, object: GenericObject) -> Result<ObjectRef, ObjectError> {
        let reference = ObjectRef::from_object(&object)?;
        let mut st = self.lock();
        let rv = st.bump();
        st.objects.insert(reference.key(), stamp(object, rv, None));
        Ok(reference)
    }

    pub fn object(&self, reference: &ObjectRef) -> Option<GenericObject> { self.lock().objects.get(&reference.key()).cloned() }
    pub fn contains(&self, reference: &ObjectRef) -> bool { self.lock().objects.contains_key(&reference.key()) }
    pub fn len(&self) -> usize { self.lock().objects.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Fail the next `times` calls of `verb` (on `reference`, or on any object) with `kind`.
    pub fn inject_fault(&self, verb: Verb, reference: Option<&ObjectRef>, kind: AdapterErrorKind, times: usize) {
        self.lock().faults.push(Fault { verb, key: reference.map(ObjectRef::key), kind, remaining: times });
    }

    /// Called (outside the state lock) after every recorded operation.
    pub fn on_operation(&self, f: impl Fn(&MemOp) + Send + Sync + 'static) { self.lock().observer = Some(Arc::new(f)); }

    pub fn operations(&self) -> Vec<MemOp> { self.lock().log.clone() }

    pub fn mutations(&self) -> Vec<MemOp> { self.lock().log.iter().filter(|op| op.verb.is_mutation()).cloned().collect() }

    pub fn clear_log(&self) { self.lock().log.clear(); }

    fn lock(&self) -> MutexGuard<'_, MemState> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }

    /// Log the call, then fail it if a matching fault is armed.
    fn enter(&self, verb: Verb, key: Option<&ObjectKey>) -> Result<(), AdapterError> {
        let op = MemOp { verb, key: key.cloned() };
        let (observer, fault) = {
            let mut st = self.lock();
            st.log.push(op.clone());
            let fault = st
                .faults
                .iter_mut()
                .find(|f| f.verb == verb && f.remaining > 0 && (f.key.is_none() || f.key.as_ref() == key))
                .map(|f| {
                    f.remaining -= 1;
                    f.kind
                });
            st.faults.retain(|f| f.remaining > 0);
            (st.observer.clone(), fault)
        };
        if let Some(cb) = observer { cb(&op); }
        match fault {
            Some(kind) => Err(AdapterError::new(kind, format!("injected {} on {:?}", kind, verb))),
            None => Ok(()),
        }
    }
}

impl MemState {
    fn bump(&mut self) -> u64 {
        self.next_rv += 1;
        self.next_rv
    }

    fn kind_of(&self, reference: &ObjectRef) -> Result<&KindInfo, AdapterError> {
        self.kinds
            .get(&reference.group_kind())
            .ok_or_else(|| AdapterError::not_found(format!("no matches for kind {}", reference.group_kind())))
    }

    fn check_scope(&self, reference: &ObjectRef) -> Result<(), AdapterError> {
        let kind = self.kind_of(reference)?;
        match (kind.namespaced, reference.namespace()) {
            (true, None) => Err(AdapterError::invalid(format!("{} requires a namespace", reference))),
            (true, Some(ns)) => {
                let ns_key = ObjectRef::new("v1", "Namespace", None, ns).key();
                let has_ns_kind = self.kinds.contains_key(&GroupKind { group: String::new(), kind: "Namespace".into() });
                if has_ns_kind && !self.objects.contains_key(&ns_key) {
                    return Err(AdapterError::not_found(format!("namespaces \"{}\" not found", ns)));
                }
                Ok(())
            }
            (false, _) => Ok(()),
        }
    }

    fn register_crd(&mut self, object: &GenericObject) {
        let s = |p: &str| FieldPath::parse(p).ok().and_then(|p| object.get_str(&p).map(str::to_string));
        let (Some(group), Some(kind)) = (s("spec.group"), s("spec.names.kind")) else { return };
        let namespaced = s("spec.scope").as_deref() != Some("Cluster");
        let version = object
            .list_at_path(&FieldPath::from_keys(["spec", "versions"]))
            .unwrap_or_default()
            .into_iter()
            .find(|v| v.as_value().get("served").and_then(Json::as_bool).unwrap_or(true))
            .and_then(|v| v.as_value().get("name").and_then(Json::as_str).map(str::to_string));
        if let Some(version) = version {
            let info = KindInfo { group, version, kind, namespaced };
            self.kinds.insert(info.group_kind(), info);
        }
    }

    fn store(&mut self, reference: &ObjectRef, object: &GenericObject, uid: Option<String>) -> GenericObject {
        let rv = self.bump();
        let stored = stamp(object.deep_copy(), rv, uid);
        if reference.kind() == "CustomResourceDefinition" {
            self.register_crd(&stored);
        }
        self.objects.insert(reference.key(), stored.clone());
        stored
    }
}

fn stamp(mut object: GenericObject, rv: u64, uid: Option<String>) -> GenericObject {
    let uid = uid.unwrap_or_else(|| format!("00000000-0000-0000-0000-{:012}", rv));
    // metadata is a map for anything that got a reference; ignore odd shapes
    let _ = object.set(&FieldPath::from_keys(["metadata", "resourceVersion"]), Json::String(rv.to_string()));
    let _ = object.set(&FieldPath::from_keys(["metadata", "uid"]), Json::String(uid));
    object
}

fn labels_match(object: &GenericObject, selector: &Labels) -> bool {
    let labels = object.labels();
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

#[async_trait::async_trait]
impl ClusterAdapter for MemCluster {
    async fn discover_kinds(&self) -> Result<Vec<KindInfo>, AdapterError> {
        self.enter(Verb::Discover, None)?;
        Ok(self.lock().kinds.values().cloned().collect())
    }

    async fn get(&self, reference: &ObjectRef) -> Result<Option<GenericObject>, AdapterError> {
        self.enter(Verb::Get, Some(&reference.key()))?;
        let st = self.lock();
        st.kind_of(reference)?;
        Ok(st.objects.get(&reference.key()).cloned())
    }

    async fn list_by_labels(&self, kind: &KindInfo, namespace: Option<&str>, selector: &Labels) -> Result<Vec<GenericObject>, AdapterError> {
        self.enter(Verb::List, None)?;
        let st = self.lock();
        let gk = kind.group_kind();
        Ok(st
            .objects
            .iter()
            .filter(|(k, _)| k.group == gk.group && k.kind == gk.kind)
            .filter(|(k, _)| namespace.map(|ns| k.namespace == ns).unwrap_or(true))
            .filter(|(_, o)| labels_match(o, selector))
            .map(|(_, o)| o.clone())
            .collect())
    }

    async fn create(&self, reference: &ObjectRef, object: &GenericObject) -> Result<GenericObject, AdapterError> {
        self.enter(Verb::Create, Some(&reference.key()))?;
        let mut st = self.lock();
        st.check_scope(reference)?;
        if st.objects.contains_key(&reference.key()) {
            return Err(AdapterError::conflict(format!("{} already exists", reference)));
        }
        let mut payload = object.deep_copy();
        payload.delete(&FieldPath::from_keys(["metadata", "resourceVersion"]));
        Ok(st.store(reference, &payload, None))
    }

    async fn update(&self, reference: &ObjectRef, object: &GenericObject) -> Result<GenericObject, AdapterError> {
        self.enter(Verb::Update, Some(&reference.key()))?;
        let mut st = self.lock();
        st.check_scope(reference)?;
        let live = st.objects.get(&reference.key()).ok_or_else(|| AdapterError::not_found(format!("{} not found", reference)))?;
        if let Some(rv) = object.resource_version() {
            if live.resource_version() != Some(rv) {
                return Err(AdapterError::conflict(format!(
                    "{}: resourceVersion {} is stale (live {})",
                    reference,
                    rv,
                    live.resource_version().unwrap_or("-")
                )));
            }
        }
        let uid = live.get_str(&FieldPath::from_keys(["metadata", "uid"])).map(str::to_string);
        Ok(st.store(reference, object, uid))
    }

    async fn replace(&self, reference: &ObjectRef, object: &GenericObject) -> Result<GenericObject, AdapterError> {
        self.enter(Verb::Replace, Some(&reference.key()))?;
        let mut st = self.lock();
        st.check_scope(reference)?;
        let uid = st
            .objects
            .get(&reference.key())
            .and_then(|o| o.get_str(&FieldPath::from_keys(["metadata", "uid"])).map(str::to_string));
        let mut payload = object.deep_copy();
        payload.delete(&FieldPath::from_keys(["metadata", "resourceVersion"]));
        Ok(st.store(reference, &payload, uid))
    }

    async fn delete(&self, reference: &ObjectRef) -> Result<(), AdapterError> {
        self.enter(Verb::Delete, Some(&reference.key()))?;
        let mut st = self.lock();
        st.kind_of(reference)?;
        if st.objects.remove(&reference.key()).is_none() {
            return Err(AdapterError::not_found(format!("{} not found", reference)));
        }
        if reference.kind() == "Namespace" && reference.group().is_empty() {
            st.objects.retain(|k, _| k.namespace != reference.name());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cm(ns: &str, name: &str) -> GenericObject {
        GenericObject::from(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": name, "namespace": ns}}))
    }

    #[tokio::test]
    async fn create_requires_namespace_and_rejects_duplicates() {
        let c = MemCluster::with_builtin_kinds();
        let o = cm("ns1", "a");
        let r = ObjectRef::from_object(&o).unwrap();
        let e = c.create(&r, &o).await.unwrap_err();
        assert_eq!(e.kind, AdapterErrorKind::NotFound);

        let ns = GenericObject::from(json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "ns1"}}));
        c.create(&ObjectRef::from_object(&ns).unwrap(), &ns).await.unwrap();
        let stored = c.create(&r, &o).await.unwrap();
        assert!(stored.resource_version().is_some());
        assert_eq!(c.create(&r, &o).await.unwrap_err().kind, AdapterErrorKind::Conflict);
    }

    #[tokio::test]
    async fn update_checks_resource_version() {
        let c = MemCluster::with_builtin_kinds();
        let r = c.seed(cm("default", "a")).unwrap();
        let live = c.get(&r).await.unwrap().unwrap();
        let mut next = live.deep_copy();
        next.set(&FieldPath::parse("data.k").unwrap(), json!("v")).unwrap();
        c.update(&r, &next).await.unwrap();
        // same (now stale) resourceVersion again
        assert_eq!(c.update(&r, &next).await.unwrap_err().kind, AdapterErrorKind::Conflict);
        // replace ignores it
        c.replace(&r, &next).await.unwrap();
    }

    #[tokio::test]
    async fn faults_fire_the_requested_number_of_times() {
        let c = MemCluster::with_builtin_kinds();
        let r = c.seed(cm("default", "a")).unwrap();
        c.inject_fault(Verb::Get, Some(&r), AdapterErrorKind::ServerUnavailable, 2);
        assert!(c.get(&r).await.is_err());
        assert!(c.get(&r).await.is_err());
        assert!(c.get(&r).await.unwrap().is_some());
        assert_eq!(c.operations().len(), 3);
    }

    #[tokio::test]
    async fn created_crd_registers_kind_and_list_filters_labels() {
        let c = MemCluster::with_builtin_kinds();
        let crd = GenericObject::from(json!({
            "apiVersion": "apiextensions.k8s.io/v1",
            "kind": "CustomResourceDefinition",
            "metadata": {"name": "widgets.example.com"},
            "spec": {"group": "example.com", "scope": "Namespaced", "names": {"kind": "Widget"}, "versions": [{"name": "v1", "served": true}]}
        }));
        c.create(&ObjectRef::from_object(&crd).unwrap(), &crd).await.unwrap();
        let kinds = c.discover_kinds().await.unwrap();
        let widget = kinds.iter().find(|k| k.kind == "Widget").unwrap();
        assert!(widget.namespaced);

        let mut a = cm("default", "a");
        a.set_label("team", "x").unwrap();
        c.seed(a).unwrap();
        c.seed(cm("default", "b")).unwrap();
        let sel: Labels = [("team".to_string(), "x".to_string())].into_iter().collect();
        let cm_kind = KindInfo::new("", "v1", "ConfigMap", true);
        let hits = c.list_by_labels(&cm_kind, None, &sel).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name(), Some("a"));
    }
}
