//! Manifest loading: every `*.yaml`/`*.yml` under a root directory, multi-document.
//! An item's tags are the directory components between the root and its file.

use std::path::{Component, Path};

use anyhow::{anyhow, bail, Context, Result};
use kairn_apply::DeploymentItem;
use kairn_core::{GenericObject, ObjectRef};
use serde::Deserialize;
use serde_json::Value as Json;
use tracing::debug;
use walkdir::WalkDir;

pub fn load_dir(root: &Path, extra_tags: &[String]) -> Result<Vec<DeploymentItem>> {
    if !root.is_dir() {
        bail!("manifest root {} is not a directory", root.display());
    }
    let mut items = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walking {}", root.display()))?;
        let path = entry.path();
        let is_yaml = path.extension().and_then(|e| e.to_str()).map(|e| e == "yaml" || e == "yml").unwrap_or(false);
        if !entry.file_type().is_file() || !is_yaml {
            continue;
        }
        let rel = path.strip_prefix(root).unwrap_or(path);
        let source = rel.components().filter_map(|c| c.as_os_str().to_str()).collect::<Vec<_>>().join("/");
        let tags: Vec<String> = rel
            .parent()
            .map(|p| p.components().filter_map(|c| match c { Component::Normal(s) => s.to_str().map(str::to_string), _ => None }).collect())
            .unwrap_or_default();
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let objects = parse_documents(&text).with_context(|| format!("parsing {}", source))?;
        debug!(file = %source, objects = objects.len(), "loaded manifests");
        for obj in objects {
            items.push(DeploymentItem::new(obj).with_tags(tags.iter().cloned()).with_tags(extra_tags.iter().cloned()).with_source(source.clone()));
        }
    }
    Ok(items)
}

/// All objects in a multi-document YAML stream; `kind: List` documents are expanded.
pub fn parse_documents(text: &str) -> Result<Vec<GenericObject>> {
    let mut out = Vec::new();
    for (i, doc) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let value = Json::deserialize(doc).with_context(|| format!("document {}", i))?;
        match value {
            Json::Null => continue,
            Json::Object(ref m) if m.get("kind").and_then(Json::as_str) == Some("List") => {
                let items = m.get("items").and_then(Json::as_array).cloned().unwrap_or_default();
                out.extend(items.into_iter().map(GenericObject::from_value));
            }
            Json::Object(_) => out.push(GenericObject::from_value(value)),
            _ => bail!("document {} is not a mapping", i),
        }
    }
    Ok(out)
}

/// `v1/ConfigMap/ns/name`, `apps/v1/Deployment/ns/name` or `v1/Namespace/name`.
pub fn parse_object_ref(s: &str) -> Result<ObjectRef> {
    let parts: Vec<&str> = s.split('/').collect();
    let looks_like_version = |p: &str| p.starts_with('v') && p[1..].starts_with(|c: char| c.is_ascii_digit());
    let (api_version, rest) = match parts.as_slice() {
        [g, v, rest @ ..] if looks_like_version(v) => (format!("{}/{}", g, v), rest),
        [v, rest @ ..] => (v.to_string(), rest),
        [] => return Err(anyhow!("empty object reference")),
    };
    match rest {
        [kind, name] if !kind.is_empty() && !name.is_empty() => Ok(ObjectRef::new(&api_version, kind, None, name)),
        [kind, ns, name] if !kind.is_empty() && !ns.is_empty() && !name.is_empty() => Ok(ObjectRef::new(&api_version, kind, Some(ns), name)),
        _ => Err(anyhow!("invalid object reference '{}': expected <apiVersion>/<Kind>/[<namespace>/]<name>", s)),
    }
}
