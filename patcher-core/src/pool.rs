use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use tracing::{debug, info};

use crate::assets::AssetIndex;
use crate::record::{FormKey, LoadOrder, Npc};

/// A `(race, source)` pair whose templates are admitted without loose facegen
/// on disk: the game ships those payloads itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedSource {
    pub group: String,
    pub source: String,
}

impl TrustedSource {
    pub fn new(group: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            source: source.into(),
        }
    }

    /// Afflicted NPCs in the base game have no loose facegen but are safe.
    pub fn defaults() -> Vec<TrustedSource> {
        vec![TrustedSource::new("DA13AfflictedRace", "Skyrim.esm")]
    }
}

/// Template-source blacklist and trusted pairs, compared case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct SourceFilter {
    blacklist: HashSet<String>,
    trusted: HashSet<(String, String)>,
}

impl SourceFilter {
    pub fn new(blacklist: &[String], trusted: &[TrustedSource]) -> Self {
        Self {
            blacklist: blacklist.iter().map(|s| s.trim().to_lowercase()).collect(),
            trusted: trusted
                .iter()
                .map(|t| (t.group.to_lowercase(), t.source.to_lowercase()))
                .collect(),
        }
    }

    pub fn is_blacklisted(&self, source: &str) -> bool {
        self.blacklist.contains(&source.to_lowercase())
    }

    pub fn is_trusted(&self, group: &str, source: &str) -> bool {
        self.trusted
            .contains(&(group.to_lowercase(), source.to_lowercase()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateCandidate {
    pub key: FormKey,
    pub group: String,
    pub geometry_exists: bool,
    pub texture_exists: bool,
    pub trusted: bool,
}

impl TemplateCandidate {
    pub fn inspect(
        key: &FormKey,
        group: &str,
        filter: &SourceFilter,
        assets: &dyn AssetIndex,
    ) -> Self {
        Self {
            key: key.clone(),
            group: group.to_string(),
            geometry_exists: assets.geometry_exists(key),
            texture_exists: assets.texture_exists(key),
            trusted: filter.is_trusted(group, &key.source),
        }
    }

    pub fn source(&self) -> &str {
        &self.key.source
    }

    pub fn assets_ok(&self) -> bool {
        self.geometry_exists && self.texture_exists
    }

    /// Usable as a donor: trusted, or both facegen payloads on disk.
    pub fn usable(&self) -> bool {
        self.trusted || self.assets_ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Blacklisted,
    MissingAsset { geometry: bool, texture: bool },
    /// Admitted through a trusted pair despite the checks above.
    Trusted,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Blacklisted => write!(f, "source is blacklisted"),
            SkipReason::MissingAsset { geometry, texture } => write!(
                f,
                "missing facegen files (.nif: {}, .dds: {})",
                geometry, texture
            ),
            SkipReason::Trusted => write!(f, "assets assumed present (trusted source)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedTemplate {
    pub key: FormKey,
    pub name: String,
    pub reason: SkipReason,
}

/// Template candidates bucketed by race, plus diagnostics for templates that
/// were turned away.
#[derive(Debug, Clone, Default)]
pub struct CandidatePools {
    by_group: BTreeMap<String, Vec<TemplateCandidate>>,
    skipped: Vec<SkippedTemplate>,
}

impl CandidatePools {
    /// Scan the load order once. A record is template-eligible when its race
    /// is in `groups`, it carries the female flag, and it has not already been
    /// patched (`marker`).
    pub fn build(
        load_order: &LoadOrder,
        groups: &BTreeSet<String>,
        filter: &SourceFilter,
        assets: &dyn AssetIndex,
        marker: &FormKey,
    ) -> Self {
        let mut pools = Self::default();

        for npc in load_order.npcs() {
            let Some(race) = eligible_template_race(npc, groups, marker) else {
                continue;
            };

            let candidate = TemplateCandidate::inspect(&npc.key, race, filter, assets);
            let not_blacklisted = !filter.is_blacklisted(candidate.source());
            let admitted = (not_blacklisted && candidate.assets_ok()) || candidate.trusted;

            if !not_blacklisted || !candidate.assets_ok() {
                let reason = if candidate.trusted {
                    SkipReason::Trusted
                } else if !not_blacklisted {
                    SkipReason::Blacklisted
                } else {
                    SkipReason::MissingAsset {
                        geometry: candidate.geometry_exists,
                        texture: candidate.texture_exists,
                    }
                };
                debug!(
                    template = %npc.key,
                    "template {}: {}",
                    npc.display_name(),
                    reason
                );
                pools.skipped.push(SkippedTemplate {
                    key: npc.key.clone(),
                    name: npc.display_name().to_string(),
                    reason,
                });
            }

            if admitted {
                pools
                    .by_group
                    .entry(race.to_string())
                    .or_default()
                    .push(candidate);
            }
        }

        info!("collected templates for {} races", pools.by_group.len());
        for (group, list) in &pools.by_group {
            info!("found {} templates for race {}", list.len(), group);
        }
        pools
    }

    pub fn get(&self, group: &str) -> &[TemplateCandidate] {
        self.by_group.get(group).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Concatenate the pools of `groups` in order.
    pub fn gather(&self, groups: &[&str]) -> Vec<TemplateCandidate> {
        groups
            .iter()
            .flat_map(|g| self.get(g).iter().cloned())
            .collect()
    }

    pub fn find(&self, key: &FormKey) -> Option<&TemplateCandidate> {
        self.by_group
            .values()
            .flat_map(|list| list.iter())
            .find(|c| &c.key == key)
    }

    pub fn group_sizes(&self) -> BTreeMap<String, usize> {
        self.by_group
            .iter()
            .map(|(g, list)| (g.clone(), list.len()))
            .collect()
    }

    pub fn skipped(&self) -> &[SkippedTemplate] {
        &self.skipped
    }

    pub fn is_empty(&self) -> bool {
        self.by_group.values().all(Vec::is_empty)
    }
}

fn eligible_template_race<'a>(
    npc: &'a Npc,
    groups: &BTreeSet<String>,
    marker: &FormKey,
) -> Option<&'a str> {
    let race = npc.race.as_deref()?;
    if !groups.contains(race) || !npc.female || npc.has_keyword(marker) {
        return None;
    }
    Some(race)
}
