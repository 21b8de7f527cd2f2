use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use tracing::{debug, warn};

use super::{ConfigurationError, PrivilegeConfig, PrivilegeId, PrivilegeSet, PrivilegeTable};

const DEFAULT_SET: &str = "default";

/// Dotted masks with fewer than four components get a trailing `.`, so `10.1` only matches
/// addresses in `10.1.x.x` and not `10.15.x.x`.
fn normalize_mask(mask: &str) -> String {
    if mask.contains(':') || mask.ends_with('.') || mask.split('.').count() >= 4 {
        mask.to_owned()
    } else {
        format!("{mask}.")
    }
}

/// Maps client addresses to privilege sets.
#[derive(Debug)]
pub struct PrivilegeResolver {
    table: Arc<PrivilegeTable>,
    ranges: BTreeMap<String, PrivilegeId>,
    default: PrivilegeId,
}

impl PrivilegeResolver {
    /// Builds sets, inheritance, the address table and the default set from `config`.
    ///
    /// Address ranges with an empty mask, an empty privilege or an unknown privilege are skipped
    /// and logged. Everything else that is wrong fails the whole build.
    pub fn from_config(config: &PrivilegeConfig) -> Result<Self, ConfigurationError> {
        let mut table = PrivilegeTable::from_config(&config.sets)?;

        let mut ranges = BTreeMap::new();
        for range in &config.ip_ranges {
            if range.mask.is_empty() || range.privilege.is_empty() {
                warn!(
                    mask = %range.mask,
                    privilege = %range.privilege,
                    "Skipping incomplete address range."
                );
                continue;
            }
            let Some(id) = table.find(&range.privilege) else {
                warn!(
                    mask = %range.mask,
                    privilege = %range.privilege,
                    "Skipping address range with unknown privilege set."
                );
                continue;
            };
            ranges.insert(normalize_mask(&range.mask), id);
        }

        let default = match &config.default {
            Some(name) => table
                .find(name)
                .ok_or_else(|| ConfigurationError::UnknownDefault(name.clone()))?,
            None => match table.find(DEFAULT_SET) {
                Some(id) => id,
                None => table.add_set(DEFAULT_SET)?,
            },
        };

        debug!(
            sets = table.len(),
            ranges = ranges.len(),
            "Built privilege resolver."
        );
        Ok(Self {
            table: Arc::new(table),
            ranges,
            default,
        })
    }

    /// The set for `address`: the longest configured prefix of it, else the default set.
    #[must_use]
    pub fn resolve(&self, address: &str) -> PrivilegeSet {
        let id = self
            .ranges
            .range::<str, _>((Bound::Unbounded, Bound::Included(address)))
            .rev()
            .find(|(mask, _)| address.starts_with(mask.as_str()))
            .map_or(self.default, |(_, id)| *id);
        PrivilegeSet::new(Arc::clone(&self.table), id)
    }

    /// A set by name.
    #[must_use]
    pub fn set(&self, name: &str) -> Option<PrivilegeSet> {
        self.table
            .find(name)
            .map(|id| PrivilegeSet::new(Arc::clone(&self.table), id))
    }

    /// Set granted to clients no address range matches.
    #[must_use]
    pub fn default_set(&self) -> PrivilegeSet {
        PrivilegeSet::new(Arc::clone(&self.table), self.default)
    }
}

impl Default for PrivilegeResolver {
    /// Everyone gets an empty set, which allows everything.
    fn default() -> Self {
        let mut table = PrivilegeTable::default();
        let default = table.push(DEFAULT_SET);
        Self {
            table: Arc::new(table),
            ranges: BTreeMap::new(),
            default,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_masks_get_a_trailing_dot() {
        assert_eq!(normalize_mask("10.1"), "10.1.");
        assert_eq!(normalize_mask("10.1."), "10.1.");
        assert_eq!(normalize_mask("10.1.2.3"), "10.1.2.3");
        assert_eq!(normalize_mask("fe80:"), "fe80:");
    }
}
