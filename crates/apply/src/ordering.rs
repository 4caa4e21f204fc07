//! Deployment ordering: kind priority buckets layered with explicit "deploy after" hints.
//!
//! Lower ranks complete before higher ranks begin; equal ranks may run concurrently.
//! Deletion uses the same ranks in reverse.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use kairn_core::ObjectKey;
use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Rank {
    pub bucket: u32,
    pub level: u32,
}

impl Rank {
    pub fn bucket(bucket: u32) -> Self { Self { bucket, level: 0 } }

    /// The smallest rank strictly after `self`.
    pub fn after(self) -> Self { Self { bucket: self.bucket, level: self.level + 1 } }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}.{}", self.bucket, self.level) }
}

/// Bucket for kinds missing from the table (custom resources, unusual builtins).
pub const DEFAULT_BUCKET: u32 = 2;

static KIND_BUCKETS: Lazy<FxHashMap<&'static str, u32>> = Lazy::new(|| {
    let table: &[(u32, &[&str])] = &[
        (0, &["Namespace", "CustomResourceDefinition"]),
        (
            1,
            &[
                "PriorityClass",
                "StorageClass",
                "PodSecurityPolicy",
                "ResourceQuota",
                "LimitRange",
                "NetworkPolicy",
                "ServiceAccount",
                "ClusterRole",
                "ClusterRoleBinding",
                "Role",
                "RoleBinding",
                "Secret",
                "ConfigMap",
                "PersistentVolume",
                "PersistentVolumeClaim",
            ],
        ),
        (
            2,
            &[
                "Service",
                "Pod",
                "ReplicaSet",
                "ReplicationController",
                "Deployment",
                "StatefulSet",
                "DaemonSet",
                "Job",
                "CronJob",
                "PodDisruptionBudget",
            ],
        ),
        (
            3,
            &[
                "HorizontalPodAutoscaler",
                "Ingress",
                "IngressClass",
                "APIService",
                "MutatingWebhookConfiguration",
                "ValidatingWebhookConfiguration",
            ],
        ),
    ];
    table.iter().flat_map(|(b, kinds)| kinds.iter().map(move |k| (*k, *b))).collect()
});

pub fn kind_bucket(kind: &str) -> u32 { KIND_BUCKETS.get(kind).copied().unwrap_or(DEFAULT_BUCKET) }

/// One object and the objects it must be deployed after.
#[derive(Debug, Clone)]
pub struct OrderNode {
    pub key: ObjectKey,
    pub after: Vec<ObjectKey>,
}

#[derive(Debug, Clone, Default)]
pub struct OrderingIndex {
    ranks: FxHashMap<ObjectKey, Rank>,
}

impl OrderingIndex {
    /// Topologically order `nodes`. Hints naming objects outside `nodes` are ignored;
    /// a cycle among hints is a configuration error.
    pub fn build(nodes: &[OrderNode]) -> Result<Self, ConfigError> {
        let pos: FxHashMap<&ObjectKey, usize> = nodes.iter().enumerate().map(|(i, n)| (&n.key, i)).collect();
        let deps: Vec<Vec<usize>> = nodes
            .iter()
            .map(|n| {
                let mut d: Vec<usize> = n.after.iter().filter_map(|k| pos.get(k).copied()).collect();
                d.sort_unstable();
                d.dedup();
                d
            })
            .collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
        let mut indegree: Vec<usize> = vec![0; nodes.len()];
        for (i, d) in deps.iter().enumerate() {
            indegree[i] = d.len();
            for &j in d { dependents[j].push(i); }
        }

        let mut ranks: Vec<Rank> = nodes.iter().map(|n| Rank::bucket(kind_bucket(&n.key.kind))).collect();
        let mut ready: Vec<usize> = (0..nodes.len()).filter(|&i| indegree[i] == 0).collect();
        ready.sort_by(|a, b| nodes[*a].key.cmp(&nodes[*b].key));
        let mut queue: VecDeque<usize> = ready.into();
        let mut done = 0usize;
        while let Some(i) = queue.pop_front() {
            done += 1;
            for &j in &dependents[i] {
                ranks[j] = ranks[j].max(ranks[i].after());
                indegree[j] -= 1;
                if indegree[j] == 0 { queue.push_back(j); }
            }
        }
        if done < nodes.len() {
            return Err(ConfigError::DependencyCycle(find_cycle(nodes, &deps, &indegree)));
        }

        Ok(Self { ranks: nodes.iter().zip(ranks).map(|(n, r)| (n.key.clone(), r)).collect() })
    }

    /// Rank of a known object, or the bare kind bucket for anything else.
    pub fn rank_of(&self, key: &ObjectKey) -> Rank {
        self.ranks.get(key).copied().unwrap_or_else(|| Rank::bucket(kind_bucket(&key.kind)))
    }

    pub fn len(&self) -> usize { self.ranks.len() }
    pub fn is_empty(&self) -> bool { self.ranks.is_empty() }
}

/// Group `items` into batches of equal rank, lowest rank first.
pub fn batches<T>(items: Vec<T>, rank: impl Fn(&T) -> Rank) -> Vec<(Rank, Vec<T>)> {
    let mut grouped: BTreeMap<Rank, Vec<T>> = BTreeMap::new();
    for item in items {
        grouped.entry(rank(&item)).or_default().push(item);
    }
    grouped.into_iter().collect()
}

/// Batches for deletion: dependents first.
pub fn reverse_batches<T>(items: Vec<T>, rank: impl Fn(&T) -> Rank) -> Vec<(Rank, Vec<T>)> {
    let mut b = batches(items, rank);
    b.reverse();
    b
}

fn find_cycle(nodes: &[OrderNode], deps: &[Vec<usize>], indegree: &[usize]) -> Vec<String> {
    let stuck = |i: usize| indegree[i] > 0;
    let Some(start) = (0..nodes.len()).filter(|&i| stuck(i)).min_by(|a, b| nodes[*a].key.cmp(&nodes[*b].key)) else {
        return Vec::new();
    };
    let mut path: Vec<usize> = Vec::new();
    let mut cur = start;
    loop {
        if let Some(p) = path.iter().position(|&x| x == cur) {
            let mut cycle: Vec<String> = path[p..].iter().map(|&i| nodes[i].key.to_string()).collect();
            cycle.push(nodes[cur].key.to_string());
            return cycle;
        }
        path.push(cur);
        match deps[cur].iter().copied().find(|&d| stuck(d)) {
            Some(next) => cur = next,
            None => return path.iter().map(|&i| nodes[i].key.to_string()).collect(),
        }
    }
}
