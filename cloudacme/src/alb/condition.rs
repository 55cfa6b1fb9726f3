use std::collections::HashMap;
use std::fmt;

/// Match criteria of a listener rule
///
/// Only host-header and path-pattern conditions are modelled. Any other
/// dimension an existing rule carries is recorded by name in `unsupported`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleCondition {
    pub host_headers: Option<Vec<String>>,
    pub path_patterns: Option<Vec<String>>,
    pub unsupported: Vec<String>,
}

impl RuleCondition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.host_headers = Some(hosts.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.path_patterns = Some(paths.into_iter().map(Into::into).collect());
        self
    }

    pub fn extend_hosts(&mut self, hosts: impl IntoIterator<Item = String>) {
        self.host_headers.get_or_insert_with(Vec::new).extend(hosts);
    }

    pub fn extend_paths(&mut self, paths: impl IntoIterator<Item = String>) {
        self.path_patterns.get_or_insert_with(Vec::new).extend(paths);
    }

    pub fn mark_unsupported(&mut self, field: impl Into<String>) {
        self.unsupported.push(field.into());
    }

    pub fn is_supported(&self) -> bool {
        self.unsupported.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.host_headers.is_none() && self.path_patterns.is_none() && self.unsupported.is_empty()
    }
}

impl fmt::Display for RuleCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(hosts) = &self.host_headers {
            parts.push(format!("host={}", hosts.join(",")));
        }
        if let Some(paths) = &self.path_patterns {
            parts.push(format!("path={}", paths.join(",")));
        }
        for field in &self.unsupported {
            parts.push(format!("{field}=*"));
        }
        if parts.is_empty() {
            f.write_str("(none)")
        } else {
            f.write_str(&parts.join(" "))
        }
    }
}

/// Whether `existing` satisfies every dimension `target` specifies.
///
/// Each dimension present in `target` must be present in `existing` with the
/// same values as a multiset. Dimensions absent from `target` are ignored.
/// Rules carrying unsupported dimensions never match.
pub fn matches(existing: &RuleCondition, target: &RuleCondition) -> bool {
    if !existing.is_supported() || !target.is_supported() {
        return false;
    }

    dimension_matches(
        existing.path_patterns.as_deref(),
        target.path_patterns.as_deref(),
    ) && dimension_matches(
        existing.host_headers.as_deref(),
        target.host_headers.as_deref(),
    )
}

fn dimension_matches(existing: Option<&[String]>, target: Option<&[String]>) -> bool {
    match (existing, target) {
        (_, None) => true,
        (None, Some(_)) => false,
        (Some(existing), Some(target)) => same_multiset(existing, target),
    }
}

fn same_multiset(a: &[String], b: &[String]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut counts: HashMap<&str, isize> = HashMap::new();
    for value in a {
        *counts.entry(value.as_str()).or_default() += 1;
    }
    for value in b {
        *counts.entry(value.as_str()).or_default() -= 1;
    }
    counts.values().all(|&n| n == 0)
}
