//! Path-based access control.
//!
//! A [`PrivilegeSet`] bundles allow/deny path patterns and attribute overrides, and may inherit
//! from one parent set. A [`PrivilegeResolver`] maps client addresses to sets through a
//! longest-prefix table. All sets of one configuration live in a shared arena
//! ([`PrivilegeTable`]) and refer to their parent by index.

mod resolver;
mod set;

use std::collections::BTreeMap;
use std::fmt;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use resolver::PrivilegeResolver;
pub use set::PrivilegeSet;

/// Rejected privilege configuration. The live resolver is never touched when this is returned.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    /// A set without a `name` key.
    #[error("Privilege set without a name")]
    UnnamedSet,

    /// Two sets with the same name.
    #[error("Privilege set '{0}' is defined more than once")]
    DuplicateSet(String),

    /// `inherit` names a set that does not exist.
    #[error("Privilege set '{set}' inherits from unknown set '{parent}'")]
    UnknownParent {
        /// Set declaring the parent.
        set: String,
        /// Missing parent name.
        parent: String,
    },

    /// Following `inherit` leads back to the named set.
    #[error("Inheritance of privilege set '{0}' forms a cycle")]
    Cycle(String),

    /// `default` names a set that does not exist.
    #[error("Default privilege set '{0}' is not defined")]
    UnknownDefault(String),
}

/// One access rule. Written `{ allow = "/path" }` or `{ deny = "/path" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleConfig {
    /// Grants access to everything under the prefix.
    Allow(String),
    /// Refuses access to everything under the prefix.
    Deny(String),
}

/// Scalar attribute value as written in the configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    /// `true` or `false`.
    Bool(bool),
    /// Whole number.
    Integer(i64),
    /// Floating-point number.
    Float(f64),
    /// Anything else.
    Text(String),
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// A named privilege set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PrivilegeSetConfig {
    /// Unique name, referenced by `inherit`, `default` and address ranges.
    #[serde(default)]
    pub name: String,

    /// Set whose rules and attributes apply where this one is silent.
    #[serde(default)]
    pub inherit: Option<String>,

    /// Rules in declaration order. On equal match length a later rule beats an earlier one.
    #[serde(default)]
    pub rules: Vec<RuleConfig>,

    /// Named values consulted by request handlers, e.g. `max-response-mb`.
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeValue>,
}

/// Assignment of an address prefix to a privilege set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct IpRangeConfig {
    /// Dotted address prefix such as `10.1`.
    #[serde(default)]
    pub mask: String,
    /// Name of the set granted to matching clients.
    #[serde(default)]
    pub privilege: String,
}

/// Complete access-control configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PrivilegeConfig {
    /// All privilege sets, in any order.
    #[serde(default)]
    pub sets: Vec<PrivilegeSetConfig>,

    /// Address prefixes mapped to sets. The longest matching prefix wins.
    #[serde(default)]
    pub ip_ranges: Vec<IpRangeConfig>,

    /// Set for clients no range matches. An empty set named `default` if absent.
    #[serde(default)]
    pub default: Option<String>,
}

/// Index of a set in its [`PrivilegeTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PrivilegeId(usize);

/// Pattern → declaration sequence number. Iterated in descending key order when matching.
pub(crate) type Patterns = BTreeMap<String, u64>;

#[derive(Debug, Default)]
pub(crate) struct Node {
    pub(crate) name: String,
    pub(crate) parent: Option<PrivilegeId>,
    pub(crate) allow: Patterns,
    pub(crate) deny: Patterns,
    pub(crate) attributes: FxHashMap<String, String>,
}

/// Arena of privilege sets.
#[derive(Debug, Default)]
pub struct PrivilegeTable {
    nodes: Vec<Node>,
    by_name: FxHashMap<String, PrivilegeId>,
    next_seq: u64,
}

/// Rule patterns are absolute paths.
fn normalize_pattern(pattern: &str) -> String {
    if pattern.starts_with('/') {
        pattern.to_owned()
    } else {
        format!("/{pattern}")
    }
}

impl PrivilegeTable {
    /// Adds an empty set. Parents are linked separately with [`set_parent`](Self::set_parent).
    pub fn add_set(&mut self, name: &str) -> Result<PrivilegeId, ConfigurationError> {
        if name.is_empty() {
            return Err(ConfigurationError::UnnamedSet);
        }
        if self.by_name.contains_key(name) {
            return Err(ConfigurationError::DuplicateSet(name.to_owned()));
        }
        Ok(self.push(name))
    }

    fn push(&mut self, name: &str) -> PrivilegeId {
        let id = PrivilegeId(self.nodes.len());
        self.nodes.push(Node {
            name: name.to_owned(),
            ..Node::default()
        });
        self.by_name.insert(name.to_owned(), id);
        id
    }

    /// Appends a rule to `id`. Later rules carry higher sequence numbers.
    pub fn add_rule(&mut self, id: PrivilegeId, rule: &RuleConfig) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let node = &mut self.nodes[id.0];
        match rule {
            RuleConfig::Allow(p) => node.allow.insert(normalize_pattern(p), seq),
            RuleConfig::Deny(p) => node.deny.insert(normalize_pattern(p), seq),
        };
    }

    /// Sets attribute `name` on set `id`, replacing an earlier value.
    pub fn set_attribute(&mut self, id: PrivilegeId, name: &str, value: impl Into<String>) {
        self.nodes[id.0]
            .attributes
            .insert(name.to_owned(), value.into());
    }

    /// Makes `parent` the parent of `child`, unless that would close an inheritance cycle.
    pub fn set_parent(
        &mut self,
        child: PrivilegeId,
        parent: PrivilegeId,
    ) -> Result<(), ConfigurationError> {
        let mut cursor = Some(parent);
        while let Some(id) = cursor {
            if id == child {
                return Err(ConfigurationError::Cycle(self.nodes[child.0].name.clone()));
            }
            cursor = self.nodes[id.0].parent;
        }
        self.nodes[child.0].parent = Some(parent);
        Ok(())
    }

    /// Arena index of the set named `name`.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<PrivilegeId> {
        self.by_name.get(name).copied()
    }

    /// Number of sets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether no set was defined.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub(crate) fn node(&self, id: PrivilegeId) -> &Node {
        &self.nodes[id.0]
    }

    /// `id` followed by its ancestors, nearest first.
    pub(crate) fn chain(&self, id: PrivilegeId) -> impl Iterator<Item = &Node> {
        std::iter::successors(Some(id), |id| self.nodes[id.0].parent).map(|id| &self.nodes[id.0])
    }

    /// Builds every set of `config` and links inheritance.
    pub fn from_config(sets: &[PrivilegeSetConfig]) -> Result<Self, ConfigurationError> {
        let mut table = Self::default();
        for set in sets {
            let id = table.add_set(&set.name)?;
            for rule in &set.rules {
                table.add_rule(id, rule);
            }
            for (name, value) in &set.attributes {
                table.set_attribute(id, name, value.to_string());
            }
        }
        for set in sets {
            let Some(parent_name) = &set.inherit else {
                continue;
            };
            let child = table
                .find(&set.name)
                .ok_or(ConfigurationError::UnnamedSet)?;
            let parent = table
                .find(parent_name)
                .ok_or_else(|| ConfigurationError::UnknownParent {
                    set: set.name.clone(),
                    parent: parent_name.clone(),
                })?;
            table.set_parent(child, parent)?;
        }
        Ok(table)
    }
}
