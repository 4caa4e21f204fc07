//! Object identity: kinds, references and version-independent keys.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::object::{GenericObject, ObjectError};

/// A served kind as reported by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KindInfo {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespaced: bool,
}

impl KindInfo {
    pub fn new(group: &str, version: &str, kind: &str, namespaced: bool) -> Self {
        Self { group: group.to_string(), version: version.to_string(), kind: kind.to_string(), namespaced }
    }

    pub fn api_version(&self) -> String { join_api_version(&self.group, &self.version) }

    pub fn group_kind(&self) -> GroupKind { GroupKind { group: self.group.clone(), kind: self.kind.clone() } }

    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() { format!("{}/{}", self.version, self.kind) } else { format!("{}/{}/{}", self.group, self.version, self.kind) }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKind {
    pub group: String,
    pub kind: String,
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() { f.write_str(&self.kind) } else { write!(f, "{}.{}", self.kind, self.group) }
    }
}

/// Version-independent identity used to match desired and live objects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub group: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let gk = GroupKind { group: self.group.clone(), kind: self.kind.clone() };
        if self.namespace.is_empty() { write!(f, "{}/{}", gk, self.name) } else { write!(f, "{}/{}/{}", gk, self.namespace, self.name) }
    }
}

/// (apiGroup, apiVersion, kind, namespace, name). The namespace is empty for cluster-scoped kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    group: String,
    version: String,
    kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    namespace: String,
    name: String,
}

impl ObjectRef {
    pub fn new(api_version: &str, kind: &str, namespace: Option<&str>, name: &str) -> Self {
        let (group, version) = split_api_version(api_version);
        Self {
            group,
            version,
            kind: kind.to_string(),
            namespace: namespace.unwrap_or_default().to_string(),
            name: name.to_string(),
        }
    }

    pub fn for_kind(kind: &KindInfo, namespace: Option<&str>, name: &str) -> Self {
        Self::new(&kind.api_version(), &kind.kind, namespace.filter(|_| kind.namespaced), name)
    }

    pub fn from_object(obj: &GenericObject) -> Result<Self, ObjectError> {
        let api_version = obj.api_version().ok_or_else(|| ObjectError::Invalid("object missing apiVersion".into()))?;
        let kind = obj.kind().ok_or_else(|| ObjectError::Invalid("object missing kind".into()))?;
        let name = obj.name().ok_or_else(|| ObjectError::Invalid("object missing metadata.name".into()))?;
        Ok(Self::new(api_version, kind, obj.namespace(), name))
    }

    pub fn group(&self) -> &str { &self.group }
    pub fn version(&self) -> &str { &self.version }
    pub fn kind(&self) -> &str { &self.kind }
    pub fn name(&self) -> &str { &self.name }
    pub fn namespace(&self) -> Option<&str> { Some(self.namespace.as_str()).filter(|s| !s.is_empty()) }

    pub fn api_version(&self) -> String { join_api_version(&self.group, &self.version) }

    pub fn group_kind(&self) -> GroupKind { GroupKind { group: self.group.clone(), kind: self.kind.clone() } }

    pub fn key(&self) -> ObjectKey {
        ObjectKey { group: self.group.clone(), kind: self.kind.clone(), namespace: self.namespace.clone(), name: self.name.clone() }
    }

    /// Copy of this reference with a different namespace (`None` clears it).
    pub fn with_namespace(&self, namespace: Option<&str>) -> Self {
        Self { namespace: namespace.unwrap_or_default().to_string(), ..self.clone() }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { self.key().fmt(f) }
}

pub fn split_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

fn join_api_version(group: &str, version: &str) -> String {
    if group.is_empty() { version.to_string() } else { format!("{}/{}", group, version) }
}
