//! Object selectors: composable predicates with a canonical string form for transport.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use smallvec::SmallVec;

use crate::{CoreError, Object, ObjectMeta};

/// One label requirement. Set values are kept sorted so rendering is canonical.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    In(String, Vec<String>),
    NotIn(String, Vec<String>),
    Exists(String),
    DoesNotExist(String),
}

impl Requirement {
    pub fn key(&self) -> &str {
        match self {
            Requirement::Equals(k, _)
            | Requirement::NotEquals(k, _)
            | Requirement::In(k, _)
            | Requirement::NotIn(k, _)
            | Requirement::Exists(k)
            | Requirement::DoesNotExist(k) => k,
        }
    }

    fn op_rank(&self) -> u8 {
        match self {
            Requirement::Equals(..) => 0,
            Requirement::NotEquals(..) => 1,
            Requirement::In(..) => 2,
            Requirement::NotIn(..) => 3,
            Requirement::Exists(_) => 4,
            Requirement::DoesNotExist(_) => 5,
        }
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Requirement::Equals(k, v) => labels.get(k) == Some(v),
            Requirement::NotEquals(k, v) => labels.get(k) != Some(v),
            Requirement::In(k, vs) => labels.get(k).map(|x| vs.contains(x)).unwrap_or(false),
            Requirement::NotIn(k, vs) => labels.get(k).map(|x| !vs.contains(x)).unwrap_or(true),
            Requirement::Exists(k) => labels.contains_key(k),
            Requirement::DoesNotExist(k) => !labels.contains_key(k),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Requirement::Equals(k, v) => write!(f, "{}={}", k, v),
            Requirement::NotEquals(k, v) => write!(f, "{}!={}", k, v),
            Requirement::In(k, vs) => write!(f, "{} in ({})", k, vs.join(",")),
            Requirement::NotIn(k, vs) => write!(f, "{} notin ({})", k, vs.join(",")),
            Requirement::Exists(k) => write!(f, "{}", k),
            Requirement::DoesNotExist(k) => write!(f, "!{}", k),
        }
    }
}

/// Conjunction of label requirements. Empty selects everything.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LabelSelector {
    reqs: SmallVec<[Requirement; 4]>,
}

impl LabelSelector {
    pub fn new() -> Self { Self::default() }

    pub fn is_empty(&self) -> bool { self.reqs.is_empty() }

    pub fn requirements(&self) -> &[Requirement] { &self.reqs }

    pub fn with(mut self, req: Requirement) -> Self {
        let req = match req {
            Requirement::In(k, mut vs) => { vs.sort(); vs.dedup(); Requirement::In(k, vs) }
            Requirement::NotIn(k, mut vs) => { vs.sort(); vs.dedup(); Requirement::NotIn(k, vs) }
            other => other,
        };
        if !self.reqs.contains(&req) {
            self.reqs.push(req);
            self.reqs.sort_by(|a, b| a.key().cmp(b.key()).then(a.op_rank().cmp(&b.op_rank())));
        }
        self
    }

    pub fn equals(self, key: &str, value: &str) -> Self { self.with(Requirement::Equals(key.into(), value.into())) }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.reqs.iter().all(|r| r.matches(labels))
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, r) in self.reqs.iter().enumerate() {
            if i > 0 { f.write_str(",")?; }
            write!(f, "{}", r)?;
        }
        Ok(())
    }
}

fn split_top_level(s: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => { out.push(&s[start..i]); start = i + 1; }
            _ => {}
        }
    }
    out.push(&s[start..]);
    out
}

fn valid_label_token(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
}

fn parse_set(key: &str, rest: &str, raw: &str) -> Result<Vec<String>, CoreError> {
    let rest = rest.trim();
    let inner = rest
        .strip_prefix('(')
        .and_then(|r| r.strip_suffix(')'))
        .ok_or_else(|| CoreError::InvalidSelector(format!("expected (a,b) after {}: {}", key, raw)))?;
    let vals: Vec<String> = inner.split(',').map(|v| v.trim().to_string()).filter(|v| !v.is_empty()).collect();
    if vals.is_empty() || !vals.iter().all(|v| valid_label_token(v)) {
        return Err(CoreError::InvalidSelector(raw.to_string()));
    }
    Ok(vals)
}

fn parse_requirement(raw: &str) -> Result<Requirement, CoreError> {
    let term = raw.trim();
    let bad = || CoreError::InvalidSelector(raw.to_string());
    if let Some(k) = term.strip_prefix('!') {
        let k = k.trim();
        return if valid_label_token(k) { Ok(Requirement::DoesNotExist(k.to_string())) } else { Err(bad()) };
    }
    if let Some((k, v)) = term.split_once("!=") {
        let (k, v) = (k.trim(), v.trim());
        if !valid_label_token(k) || !(v.is_empty() || valid_label_token(v)) { return Err(bad()); }
        return Ok(Requirement::NotEquals(k.to_string(), v.to_string()));
    }
    if let Some((k, v)) = term.split_once("==").or_else(|| term.split_once('=')) {
        let (k, v) = (k.trim(), v.trim());
        if !valid_label_token(k) || !(v.is_empty() || valid_label_token(v)) { return Err(bad()); }
        return Ok(Requirement::Equals(k.to_string(), v.to_string()));
    }
    if let Some((k, rest)) = term.split_once(" notin ") {
        let k = k.trim();
        if !valid_label_token(k) { return Err(bad()); }
        return Ok(Requirement::NotIn(k.to_string(), parse_set(k, rest, raw)?));
    }
    if let Some((k, rest)) = term.split_once(" in ") {
        let k = k.trim();
        if !valid_label_token(k) { return Err(bad()); }
        return Ok(Requirement::In(k.to_string(), parse_set(k, rest, raw)?));
    }
    if valid_label_token(term) {
        return Ok(Requirement::Exists(term.to_string()));
    }
    Err(bad())
}

impl FromStr for LabelSelector {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut sel = LabelSelector::new();
        if s.trim().is_empty() { return Ok(sel); }
        for term in split_top_level(s) {
            sel = sel.with(parse_requirement(term)?);
        }
        Ok(sel)
    }
}

/// Predicate over objects. Cheap to clone, safe to hold for the lifetime of a watch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Selector {
    #[default]
    Everything,
    Labels(LabelSelector),
    Namespace(String),
    And(Vec<Selector>),
}

impl Selector {
    pub fn everything() -> Self { Selector::Everything }

    pub fn labels(sel: LabelSelector) -> Self {
        if sel.is_empty() { Selector::Everything } else { Selector::Labels(sel) }
    }

    pub fn namespace(ns: &str) -> Self { Selector::Namespace(ns.to_string()) }

    /// AND-composition; nested conjunctions are flattened and `Everything` terms dropped.
    pub fn and(parts: impl IntoIterator<Item = Selector>) -> Self {
        let mut flat = Vec::new();
        for p in parts {
            match p {
                Selector::Everything => {}
                Selector::And(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => Selector::Everything,
            1 => flat.remove(0),
            _ => Selector::And(flat),
        }
    }

    pub fn is_everything(&self) -> bool { matches!(self, Selector::Everything) }

    pub fn matches(&self, meta: &ObjectMeta) -> bool {
        match self {
            Selector::Everything => true,
            Selector::Labels(ls) => ls.matches(&meta.labels),
            Selector::Namespace(ns) => meta.namespace.as_deref() == Some(ns.as_str()),
            Selector::And(parts) => parts.iter().all(|p| p.matches(meta)),
        }
    }

    pub fn matches_object<T: Object>(&self, obj: &T) -> bool { self.matches(obj.meta()) }

    /// Whether only the namespace part of the selector should be evaluated (objects rebuilt without labels).
    pub fn matches_identity(&self, meta: &ObjectMeta) -> bool {
        match self {
            Selector::Namespace(ns) => meta.namespace.as_deref() == Some(ns.as_str()),
            Selector::And(parts) => parts.iter().all(|p| p.matches_identity(meta)),
            _ => true,
        }
    }

    fn merged_labels(&self) -> LabelSelector {
        match self {
            Selector::Labels(ls) => ls.clone(),
            Selector::And(parts) => parts.iter().fold(LabelSelector::new(), |acc, p| {
                p.merged_labels().reqs.into_iter().fold(acc, |a, r| a.with(r))
            }),
            _ => LabelSelector::new(),
        }
    }

    fn first_namespace(&self) -> Option<&str> {
        match self {
            Selector::Namespace(ns) => Some(ns),
            Selector::And(parts) => parts.iter().find_map(|p| p.first_namespace()),
            _ => None,
        }
    }

    /// Transport query pairs (`labelSelector`, `namespace`) in canonical order.
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut out = Vec::new();
        let ls = self.merged_labels();
        if !ls.is_empty() { out.push(("labelSelector", ls.to_string())); }
        if let Some(ns) = self.first_namespace() { out.push(("namespace", ns.to_string())); }
        out
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pairs = self.query_pairs();
        for (i, (k, v)) in pairs.iter().enumerate() {
            if i > 0 { f.write_str("&")?; }
            write!(f, "{}={}", k, v)?;
        }
        Ok(())
    }
}
