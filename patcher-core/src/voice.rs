use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

use crate::record::LoadOrder;

/// Voice remapping tables: a direct voice -> voices mapping and per-race
/// fallback lists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VoiceTables {
    pub voice_map: BTreeMap<String, Vec<String>>,
    pub race_fallbacks: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoiceRemap {
    /// Already a target voice; left as is.
    AlreadyTarget,
    Mapped(String),
    Fallback(String),
    /// Neither table covers this voice / race.
    NoMapping,
    /// A mapping exists but the chosen voice is not in the load order.
    Unavailable(String),
}

pub struct VoiceRemapper<'a> {
    tables: &'a VoiceTables,
    load_order: &'a LoadOrder,
    targets: HashSet<&'a str>,
}

impl<'a> VoiceRemapper<'a> {
    pub fn new(tables: &'a VoiceTables, load_order: &'a LoadOrder) -> Self {
        let targets = tables
            .voice_map
            .values()
            .chain(tables.race_fallbacks.values())
            .flatten()
            .map(String::as_str)
            .collect();
        Self {
            tables,
            load_order,
            targets,
        }
    }

    pub fn is_target(&self, voice: &str) -> bool {
        voice.to_ascii_lowercase().contains("female") || self.targets.contains(voice)
    }

    pub fn remap<R: Rng + ?Sized>(&self, voice: &str, race: &str, rng: &mut R) -> VoiceRemap {
        if self.is_target(voice) {
            return VoiceRemap::AlreadyTarget;
        }

        let (chosen, direct) = if let Some(choice) = self
            .tables
            .voice_map
            .get(voice)
            .and_then(|list| list.choose(rng))
        {
            (choice, true)
        } else if let Some(choice) = self
            .tables
            .race_fallbacks
            .get(race)
            .and_then(|list| list.choose(rng))
        {
            (choice, false)
        } else {
            debug!("no voice mapping for {voice} (race {race})");
            return VoiceRemap::NoMapping;
        };

        if !self.load_order.has_voice_type(chosen) {
            debug!("voice {chosen} for {voice} is not in the load order");
            return VoiceRemap::Unavailable(chosen.clone());
        }

        if direct {
            VoiceRemap::Mapped(chosen.clone())
        } else {
            VoiceRemap::Fallback(chosen.clone())
        }
    }
}
