//! Field paths into generic objects.
//!
//! Syntax: dot-separated keys with bracketed indices, e.g. `spec.containers[0].image`.
//! Keys containing dots or brackets are quoted: `metadata.labels["app.kubernetes.io/name"]`.
//! `*` (or `[*]`) matches any single key or index and is only valid for matching.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use smallvec::SmallVec;

use crate::object::ObjectError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PathSegment {
    Key(String),
    Index(usize),
    Any,
}

impl PathSegment {
    fn matches(&self, concrete: &PathSegment) -> bool {
        match (self, concrete) {
            (PathSegment::Any, _) => true,
            (a, b) => a == b,
        }
    }

    fn is_plain_key(k: &str) -> bool {
        !k.is_empty() && k != "*" && !k.contains(['.', '[', ']', '"', '\''])
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldPath(SmallVec<[PathSegment; 8]>);

impl FieldPath {
    pub fn root() -> Self { Self::default() }

    pub fn parse(s: &str) -> Result<Self, ObjectError> { s.parse() }

    /// Build a path from plain keys (no parsing).
    pub fn from_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(keys.into_iter().map(|k| PathSegment::Key(k.into())).collect())
    }

    pub fn segments(&self) -> &[PathSegment] { &self.0 }
    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
    pub fn has_wildcard(&self) -> bool { self.0.iter().any(|s| matches!(s, PathSegment::Any)) }

    pub fn push(&mut self, seg: PathSegment) { self.0.push(seg); }
    pub fn pop(&mut self) -> Option<PathSegment> { self.0.pop() }

    pub fn child_key(&self, key: impl Into<String>) -> Self {
        let mut p = self.clone();
        p.push(PathSegment::Key(key.into()));
        p
    }

    pub fn child_index(&self, idx: usize) -> Self {
        let mut p = self.clone();
        p.push(PathSegment::Index(idx));
        p
    }

    /// The first `n` segments.
    pub fn prefix(&self, n: usize) -> Self { Self(self.0.iter().take(n).cloned().collect()) }

    /// True if `concrete` equals this pattern or lies underneath it.
    pub fn covers(&self, concrete: &FieldPath) -> bool {
        self.0.len() <= concrete.0.len() && self.0.iter().zip(concrete.0.iter()).all(|(p, c)| p.matches(c))
    }
}

impl FromStr for FieldPath {
    type Err = ObjectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ObjectError::InvalidPath(s.to_string());
        let body = s.strip_prefix('.').unwrap_or(s);
        let mut segs: SmallVec<[PathSegment; 8]> = SmallVec::new();
        let mut key = String::new();
        // set right after a `]`; only `.`, `[` or the end may follow
        let mut closed = false;
        let mut chars = body.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '.' => {
                    if !closed {
                        if key.is_empty() { return Err(err()); }
                        segs.push(key_segment(std::mem::take(&mut key)));
                    }
                    closed = false;
                    if chars.peek().is_none() { return Err(err()); }
                }
                '[' => {
                    if !key.is_empty() { segs.push(key_segment(std::mem::take(&mut key))); }
                    let mut inner = String::new();
                    let mut quote: Option<char> = None;
                    let mut quoted = false;
                    let mut done = false;
                    for c in chars.by_ref() {
                        match quote {
                            Some(q) if c == q => quote = None,
                            Some(_) => inner.push(c),
                            None if c == ']' => { done = true; break; }
                            None if quoted => return Err(err()),
                            None if (c == '"' || c == '\'') && inner.is_empty() => { quote = Some(c); quoted = true; }
                            None => inner.push(c),
                        }
                    }
                    if !done { return Err(err()); }
                    let seg = match (quoted, inner.as_str()) {
                        (true, _) => PathSegment::Key(inner),
                        (false, "*") => PathSegment::Any,
                        (false, digits) => PathSegment::Index(digits.parse().map_err(|_| err())?),
                    };
                    segs.push(seg);
                    closed = true;
                }
                _ => {
                    if closed { return Err(err()); }
                    key.push(c);
                }
            }
        }
        if !key.is_empty() { segs.push(key_segment(key)); }
        Ok(Self(segs))
    }
}

fn key_segment(k: String) -> PathSegment {
    if k == "*" { PathSegment::Any } else { PathSegment::Key(k) }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, seg) in self.0.iter().enumerate() {
            match seg {
                PathSegment::Key(k) if PathSegment::is_plain_key(k) => {
                    if i > 0 { f.write_str(".")?; }
                    f.write_str(k)?;
                }
                PathSegment::Key(k) => write!(f, "[{:?}]", k)?,
                PathSegment::Index(n) => write!(f, "[{}]", n)?,
                PathSegment::Any => f.write_str("[*]")?,
            }
        }
        Ok(())
    }
}

impl Serialize for FieldPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FieldPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_keys_indices_and_quoted_keys() {
        let p = FieldPath::parse(r#"metadata.labels["app.kubernetes.io/name"]"#).unwrap();
        assert_eq!(
            p.segments(),
            &[
                PathSegment::Key("metadata".into()),
                PathSegment::Key("labels".into()),
                PathSegment::Key("app.kubernetes.io/name".into()),
            ]
        );
        let p = FieldPath::parse(".spec.containers[1].image").unwrap();
        assert_eq!(p.segments()[2], PathSegment::Index(1));
        assert_eq!(p.to_string(), "spec.containers[1].image");
        let p = FieldPath::parse("data['0']").unwrap();
        assert_eq!(p.segments()[1], PathSegment::Key("0".into()));
    }

    #[test]
    fn rejects_malformed_paths() {
        for bad in ["a..b", "a.", "a[0", "a[x]", "a[0]b", r#"a["k"x]"#] {
            assert!(FieldPath::parse(bad).is_err(), "{bad} should not parse");
        }
        assert!(FieldPath::parse("").unwrap().is_empty());
    }

    #[test]
    fn display_round_trips_odd_keys() {
        let p = FieldPath::root().child_key("metadata").child_key("annotations").child_key("a.b/c");
        let s = p.to_string();
        assert_eq!(s, r#"metadata.annotations["a.b/c"]"#);
        assert_eq!(FieldPath::parse(&s).unwrap(), p);
    }

    #[test]
    fn wildcard_covers_any_segment_and_subtree() {
        let pat = FieldPath::parse("spec.containers[*].image").unwrap();
        assert!(pat.has_wildcard());
        assert!(pat.covers(&FieldPath::parse("spec.containers[3].image").unwrap()));
        assert!(pat.covers(&FieldPath::parse("spec.containers[0].image.tag").unwrap()));
        assert!(!pat.covers(&FieldPath::parse("spec.containers[0].name").unwrap()));
        assert!(!pat.covers(&FieldPath::parse("spec.containers").unwrap()));
    }
}
