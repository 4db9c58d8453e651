//! Shared builders for unit tests.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use crate::assets::{facegeom_path, facetint_path, AssetIndex};
use crate::record::{FormKey, Npc};

pub(crate) fn npc(id: u32, source: &str, race: &str, female: bool) -> Npc {
    let mut npc = Npc::new(FormKey::new(id, source));
    npc.editor_id = Some(format!("Npc{:X}", id));
    npc.race = Some(race.to_string());
    npc.female = female;
    npc
}

pub(crate) fn female(id: u32, source: &str, race: &str) -> Npc {
    npc(id, source, race, true)
}

pub(crate) fn male(id: u32, source: &str, race: &str) -> Npc {
    npc(id, source, race, false)
}

pub(crate) fn groups(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|n| n.to_string()).collect()
}

#[derive(Debug, Default)]
pub(crate) struct StaticAssets {
    pub geometry: HashSet<FormKey>,
    pub textures: HashSet<FormKey>,
    pub archives: HashSet<String>,
}

impl StaticAssets {
    pub fn all_present(npcs: &[Npc]) -> Self {
        Self {
            geometry: npcs.iter().map(|n| n.key.clone()).collect(),
            textures: npcs.iter().map(|n| n.key.clone()).collect(),
            archives: HashSet::new(),
        }
    }
}

impl AssetIndex for StaticAssets {
    fn geometry_path(&self, key: &FormKey) -> Option<PathBuf> {
        self.geometry
            .contains(key)
            .then(|| facegeom_path(Path::new("Data"), key))
    }

    fn texture_path(&self, key: &FormKey) -> Option<PathBuf> {
        self.textures
            .contains(key)
            .then(|| facetint_path(Path::new("Data"), key))
    }

    fn archive_exists(&self, source: &str) -> bool {
        self.archives.contains(source)
    }
}
