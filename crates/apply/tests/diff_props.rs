#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashSet};

use kairn_apply::{diff, Action, ChangeKind, IgnoreRules};
use kairn_core::GenericObject;
use proptest::prelude::*;
use serde_json::{Map, Value as Json};

fn tree() -> impl Strategy<Value = Json> {
    let leaf = prop_oneof![
        Just(Json::Null),
        any::<bool>().prop_map(Json::from),
        (-1000i64..1000).prop_map(Json::from),
        "[a-z]{0,6}".prop_map(Json::from),
    ];
    leaf.prop_recursive(4, 32, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Json::Array),
            prop::collection::btree_map("[a-e]", inner, 0..4).prop_map(|m| Json::Object(m.into_iter().collect::<Map<_, _>>())),
        ]
    })
}

fn object() -> impl Strategy<Value = Json> {
    prop::collection::btree_map("[a-e]", tree(), 1..5).prop_map(|m| Json::Object(m.into_iter().collect::<Map<_, _>>()))
}

fn leaf_count(v: &Json) -> usize {
    match v {
        Json::Object(m) if !m.is_empty() => m.values().map(leaf_count).sum(),
        Json::Array(a) if !a.is_empty() => a.iter().map(leaf_count).sum(),
        _ => 1,
    }
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 128, .. ProptestConfig::default() })]

    #[test]
    fn identical_objects_are_noop(v in object()) {
        let o = GenericObject::from(v);
        let out = diff(&o, Some(&o), &IgnoreRules::default(), &BTreeSet::new()).unwrap();
        prop_assert_eq!(out.action, Action::NoOp);
        prop_assert!(out.changes.is_empty());
        prop_assert!(out.unified_diff.is_none());
    }

    #[test]
    fn differences_under_ignored_paths_are_noop(v in object(), ours in tree(), theirs in tree()) {
        let mut desired = v.clone();
        desired["x"] = ours;
        let mut live = v;
        live["x"] = theirs;
        let rules = IgnoreRules { paths: vec![IgnoreRules::parse_path("x").unwrap()], ..Default::default() };
        let out = diff(&GenericObject::from(desired), Some(&GenericObject::from(live)), &rules, &BTreeSet::new()).unwrap();
        prop_assert_eq!(out.action, Action::NoOp);
        prop_assert!(out.changes.is_empty());
    }

    #[test]
    fn create_covers_exactly_the_desired_leaves(v in object()) {
        let expected = leaf_count(&v);
        let out = diff(&GenericObject::from(v), None, &IgnoreRules::default(), &BTreeSet::new()).unwrap();
        prop_assert_eq!(out.action, Action::Create);
        prop_assert_eq!(out.changes.len(), expected);
        prop_assert!(out.changes.iter().all(|c| c.kind == ChangeKind::Added && c.old.is_none()));
        let distinct: HashSet<String> = out.changes.iter().map(|c| c.path.to_string()).collect();
        prop_assert_eq!(distinct.len(), expected);
    }
}
