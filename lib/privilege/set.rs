use std::cmp::Ordering;
use std::ops::Bound;
use std::sync::Arc;

use tracing::trace;

use super::{Patterns, PrivilegeId, PrivilegeTable};

/// Best match of one rule kind across an inheritance chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RuleMatch {
    len: usize,
    /// Distance from the queried set, 0 for the set itself.
    level: usize,
    seq: u64,
}

impl RuleMatch {
    /// Recency between two matches of equal length: the nearer set wins, then the later rule.
    fn more_recent_than(&self, other: &Self) -> bool {
        match self.level.cmp(&other.level) {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => self.seq > other.seq,
        }
    }

    fn better_than(&self, other: &Self) -> bool {
        match self.len.cmp(&other.len) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => self.more_recent_than(other),
        }
    }
}

/// Longest pattern that prefixes `path`.
///
/// Prefixes of `path` sort below it, and a longer prefix sorts above a shorter one, so the first
/// prefix met walking down from `path` is the longest.
fn longest_prefix(patterns: &Patterns, path: &str) -> Option<(usize, u64)> {
    patterns
        .range::<str, _>((Bound::Unbounded, Bound::Included(path)))
        .rev()
        .find(|(pattern, _)| path.starts_with(pattern.as_str()))
        .map(|(pattern, seq)| (pattern.len(), *seq))
}

/// A privilege set together with the arena it lives in. Cheap to clone.
#[derive(Debug, Clone)]
pub struct PrivilegeSet {
    table: Arc<PrivilegeTable>,
    id: PrivilegeId,
}

impl PrivilegeSet {
    pub(crate) fn new(table: Arc<PrivilegeTable>, id: PrivilegeId) -> Self {
        Self { table, id }
    }

    /// Name of the set as configured.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.table.node(self.id).name
    }

    /// The set this one inherits from.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        self.table
            .node(self.id)
            .parent
            .map(|id| Self::new(Arc::clone(&self.table), id))
    }

    fn best_match(&self, path: &str, pick: fn(&super::Node) -> &Patterns) -> Option<RuleMatch> {
        let mut best: Option<RuleMatch> = None;
        for (level, node) in self.table.chain(self.id).enumerate() {
            if let Some((len, seq)) = longest_prefix(pick(node), path) {
                let candidate = RuleMatch { len, level, seq };
                if best.is_none_or(|b| candidate.better_than(&b)) {
                    best = Some(candidate);
                }
            }
        }
        best
    }

    /// Whether `path` may be accessed.
    ///
    /// The longest allow and the longest deny pattern across the chain decide. Without a deny
    /// the path is allowed; with a deny but no allow it is denied; otherwise the longer match
    /// wins, and the more recent rule breaks a tie.
    #[must_use]
    pub fn allows(&self, path: &str) -> bool {
        let Some(deny) = self.best_match(path, |n| &n.deny) else {
            return true;
        };
        let Some(allow) = self.best_match(path, |n| &n.allow) else {
            trace!(set = self.name(), path, "Denied, no allow rule.");
            return false;
        };
        allow.better_than(&deny)
    }

    /// Whether `path` or anything below it may be accessed.
    #[must_use]
    pub fn ever_allows(&self, path: &str) -> bool {
        if self.allows(path) {
            return true;
        }
        self.table.chain(self.id).any(|node| {
            node.allow
                .range::<str, _>((Bound::Included(path), Bound::Unbounded))
                .take_while(|(pattern, _)| pattern.starts_with(path))
                .any(|(pattern, _)| pattern.len() > path.len())
        })
    }

    /// The attribute as set here or by the nearest ancestor.
    #[must_use]
    pub fn lookup_attribute(&self, name: &str) -> Option<&str> {
        self.table
            .chain(self.id)
            .find_map(|node| node.attributes.get(name))
            .map(String::as_str)
    }

    /// Value of attribute `name` rendered as text, looked up along the inheritance chain.
    #[must_use]
    pub fn attribute(&self, name: &str, default: &str) -> String {
        self.lookup_attribute(name).unwrap_or(default).to_owned()
    }

    /// Numeric attribute. Values that do not parse as an integer yield `default`.
    #[must_use]
    pub fn num_attribute(&self, name: &str, default: i64) -> i64 {
        self.lookup_attribute(name)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    /// Boolean attribute. Accepts `true/false`, `yes/no`, `on/off` and `1/0`.
    #[must_use]
    pub fn flag(&self, name: &str, default: bool) -> bool {
        match self
            .lookup_attribute(name)
            .map(|v| v.trim().to_ascii_lowercase())
            .as_deref()
        {
            Some("true" | "yes" | "on" | "1") => true,
            Some("false" | "no" | "off" | "0") => false,
            _ => default,
        }
    }
}
