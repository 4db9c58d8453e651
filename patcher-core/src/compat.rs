use std::collections::{BTreeMap, HashMap};
use tracing::{info, warn};

use crate::{PatcherError, Result};

/// Validated race compatibility table: group -> ordered, de-duplicated list of
/// groups whose templates may be used for it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompatibilityGraph {
    entries: BTreeMap<String, Vec<String>>,
}

impl CompatibilityGraph {
    /// Validate a raw mapping against the groups that exist in the load order.
    ///
    /// Unknown keys drop their whole entry, unknown values are dropped
    /// individually and an entry left with no values is dropped. Names are
    /// matched case-insensitively and stored in the load order's spelling.
    /// Later entries for the same key replace earlier ones.
    pub fn resolve(raw: &[(String, Vec<String>)], known_groups: &[String]) -> Result<Self> {
        let known: HashMap<String, &str> = known_groups
            .iter()
            .map(|g| (g.to_ascii_lowercase(), g.as_str()))
            .collect();
        let canonical = |name: &str| known.get(&name.trim().to_ascii_lowercase()).copied();

        let mut entries = BTreeMap::new();
        for (key, values) in raw {
            let Some(group) = canonical(key) else {
                warn!("race '{key}' in compatibility map does not exist in the load order; skipping entry");
                continue;
            };

            let mut compatible: Vec<String> = Vec::with_capacity(values.len());
            for value in values {
                match canonical(value) {
                    Some(other) => {
                        if !compatible.iter().any(|c| c == other) {
                            compatible.push(other.to_string());
                        }
                    }
                    None => warn!(
                        "compatible race '{value}' for '{group}' does not exist in the load order; dropping it"
                    ),
                }
            }

            if compatible.is_empty() {
                warn!("no valid compatible races remain for '{group}'; skipping entry");
                continue;
            }
            entries.insert(group.to_string(), compatible);
        }

        if entries.is_empty() {
            return Err(PatcherError::Config(
                "race compatibility map has no valid entries for this load order".to_string(),
            ));
        }

        info!("race compatibility map validated: {} entries", entries.len());
        Ok(Self { entries })
    }

    /// Groups whose templates may serve `group`; `[group]` when it has no
    /// entry of its own.
    pub fn compatible_groups<'a>(&'a self, group: &'a str) -> Vec<&'a str> {
        match self.entries.get(group) {
            Some(list) => list.iter().map(String::as_str).collect(),
            None => vec![group],
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
