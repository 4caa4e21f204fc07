//! Kairn kubehub: the cluster adapter over kube dynamic objects and discovery.

#![forbid(unsafe_code)]

use std::time::Instant;

use anyhow::{Context, Result};
use kairn_core::{AdapterError, AdapterErrorKind, ClusterAdapter, FieldPath, GenericObject, GroupKind, KindInfo, Labels, ObjectRef};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Served resource plus scope, keyed by group/kind.
#[derive(Debug, Clone)]
struct Served {
    resource: ApiResource,
    namespaced: bool,
}

pub struct KubeCluster {
    client: Client,
    field_manager: String,
    resources: RwLock<Option<FxHashMap<GroupKind, Served>>>,
}

impl KubeCluster {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self { client, field_manager: field_manager.into(), resources: RwLock::new(None) }
    }

    /// Client from kubeconfig or in-cluster config; field manager from `KAIRN_FIELD_MANAGER`.
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await.context("building kube client")?;
        let fm = std::env::var("KAIRN_FIELD_MANAGER").unwrap_or_else(|_| "kairn".to_string());
        Ok(Self::new(client, fm))
    }

    async fn run_discovery(&self) -> Result<FxHashMap<GroupKind, Served>, AdapterError> {
        let t0 = Instant::now();
        let discovery = Discovery::new(self.client.clone()).run().await.map_err(classify)?;
        let mut out = FxHashMap::default();
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                let gk = GroupKind { group: ar.group.clone(), kind: ar.kind.clone() };
                out.insert(gk, Served { resource: ar, namespaced: matches!(caps.scope, Scope::Namespaced) });
            }
        }
        histogram!("kube_discovery_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(kinds = out.len(), "discovery complete");
        Ok(out)
    }

    /// Cached lookup; a miss re-runs discovery once so kinds from freshly created CRDs resolve.
    async fn served(&self, gk: &GroupKind) -> Result<Served, AdapterError> {
        if let Some(s) = self.resources.read().await.as_ref().and_then(|m| m.get(gk)) {
            return Ok(s.clone());
        }
        let fresh = self.run_discovery().await?;
        let hit = fresh.get(gk).cloned();
        *self.resources.write().await = Some(fresh);
        hit.ok_or_else(|| AdapterError::not_found(format!("no matches for kind {}", gk)))
    }

    async fn api_for(&self, reference: &ObjectRef) -> Result<Api<DynamicObject>, AdapterError> {
        let served = self.served(&reference.group_kind()).await?;
        let gvk = GroupVersionKind::gvk(reference.group(), reference.version(), reference.kind());
        let ar = ApiResource::from_gvk_with_plural(&gvk, &served.resource.plural);
        Ok(match (served.namespaced, reference.namespace()) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        })
    }

    fn post_params(&self) -> PostParams { PostParams { field_manager: Some(self.field_manager.clone()), ..Default::default() } }
}

fn to_dynamic(obj: &GenericObject) -> Result<DynamicObject, AdapterError> {
    serde_json::from_value(obj.as_value().clone()).map_err(|e| AdapterError::invalid(format!("not a kubernetes object: {}", e)))
}

fn from_dynamic(obj: DynamicObject) -> Result<GenericObject, AdapterError> {
    let mut v = serde_json::to_value(obj).map_err(|e| AdapterError::other(format!("serializing object: {}", e)))?;
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
    Ok(GenericObject::from_value(v))
}

/// Kubernetes label selector syntax: `k1=v1,k2=v2`.
pub fn selector_string(selector: &Labels) -> String {
    selector.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(",")
}

/// Adapter error kind for an API status code.
pub fn kind_for_status(code: u16) -> AdapterErrorKind {
    match code {
        404 | 410 => AdapterErrorKind::NotFound,
        409 => AdapterErrorKind::Conflict,
        401 | 403 => AdapterErrorKind::Forbidden,
        400 | 422 => AdapterErrorKind::Invalid,
        429 | 500..=599 => AdapterErrorKind::ServerUnavailable,
        _ => AdapterErrorKind::Other,
    }
}

pub fn classify(e: kube::Error) -> AdapterError {
    let err = match e {
        kube::Error::Api(resp) => AdapterError::new(kind_for_status(resp.code), format!("{} ({})", resp.message, resp.reason)),
        kube::Error::Service(e) => AdapterError::unavailable(e.to_string()),
        other => AdapterError::other(other.to_string()),
    };
    counter!("kube_errors_total", 1u64);
    err
}

#[async_trait::async_trait]
impl ClusterAdapter for KubeCluster {
    async fn discover_kinds(&self) -> Result<Vec<KindInfo>, AdapterError> {
        let fresh = self.run_discovery().await?;
        let mut kinds: Vec<KindInfo> = fresh
            .values()
            .map(|s| KindInfo::new(&s.resource.group, &s.resource.version, &s.resource.kind, s.namespaced))
            .collect();
        kinds.sort();
        *self.resources.write().await = Some(fresh);
        Ok(kinds)
    }

    async fn get(&self, reference: &ObjectRef) -> Result<Option<GenericObject>, AdapterError> {
        let api = self.api_for(reference).await?;
        match api.get_opt(reference.name()).await.map_err(classify)? {
            Some(obj) => Ok(Some(from_dynamic(obj)?)),
            None => Ok(None),
        }
    }

    async fn list_by_labels(&self, kind: &KindInfo, namespace: Option<&str>, selector: &Labels) -> Result<Vec<GenericObject>, AdapterError> {
        let reference = ObjectRef::for_kind(kind, namespace, "");
        let api = self.api_for(&reference).await?;
        let lp = ListParams::default().labels(&selector_string(selector));
        let list = api.list(&lp).await.map_err(classify)?;
        debug!(kind = %kind.gvk_key(), count = list.items.len(), "listed");
        list.items.into_iter().map(from_dynamic).collect()
    }

    async fn create(&self, reference: &ObjectRef, object: &GenericObject) -> Result<GenericObject, AdapterError> {
        let api = self.api_for(reference).await?;
        let created = api.create(&self.post_params(), &to_dynamic(object)?).await.map_err(classify)?;
        from_dynamic(created)
    }

    async fn update(&self, reference: &ObjectRef, object: &GenericObject) -> Result<GenericObject, AdapterError> {
        let api = self.api_for(reference).await?;
        let updated = api.replace(reference.name(), &self.post_params(), &to_dynamic(object)?).await.map_err(classify)?;
        from_dynamic(updated)
    }

    /// Server-side apply with forced ownership: creates or overwrites regardless of resourceVersion.
    async fn replace(&self, reference: &ObjectRef, object: &GenericObject) -> Result<GenericObject, AdapterError> {
        let api = self.api_for(reference).await?;
        let mut payload = object.deep_copy();
        payload.delete(&FieldPath::from_keys(["metadata", "resourceVersion"]));
        let pp = PatchParams::apply(&self.field_manager).force();
        let applied = api.patch(reference.name(), &pp, &Patch::Apply(payload.as_value())).await.map_err(classify)?;
        from_dynamic(applied)
    }

    async fn delete(&self, reference: &ObjectRef) -> Result<(), AdapterError> {
        let api = self.api_for(reference).await?;
        api.delete(reference.name(), &DeleteParams::background()).await.map_err(classify)?;
        Ok(())
    }
}
