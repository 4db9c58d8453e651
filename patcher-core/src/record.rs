use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::fs;
use std::num::ParseIntError;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

use crate::Result;

/// Errors produced when parsing the textual `XXXXXX:Source.esp` form of a
/// record identity.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FormKeyError {
    #[error("form key '{0}' is missing the ':' separator")]
    MissingSeparator(String),

    #[error("form key '{text}' has an invalid id")]
    InvalidId {
        text: String,
        #[source]
        source: ParseIntError,
    },

    #[error("form key '{0}' has an id larger than 0xFFFFFF")]
    IdOutOfRange(String),

    #[error("form key '{0}' has an empty source name")]
    EmptySource(String),
}

/// Stable identity of a record: a 24-bit local id plus the plugin that
/// introduced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FormKey {
    pub id: u32,
    pub source: String,
}

impl FormKey {
    pub fn new(id: u32, source: impl Into<String>) -> Self {
        Self {
            id: id & 0x00FF_FFFF,
            source: source.into(),
        }
    }

    /// Six upper-case hex digits, as used in facegen file names.
    pub fn id_string(&self) -> String {
        format!("{:06X}", self.id)
    }

    pub fn is_from(&self, source: &str) -> bool {
        self.source.eq_ignore_ascii_case(source)
    }
}

impl fmt::Display for FormKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06X}:{}", self.id, self.source)
    }
}

impl FromStr for FormKey {
    type Err = FormKeyError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let text = s.trim();
        let (id_part, source) = text
            .split_once(':')
            .ok_or_else(|| FormKeyError::MissingSeparator(text.to_string()))?;

        let source = source.trim();
        if source.is_empty() {
            return Err(FormKeyError::EmptySource(text.to_string()));
        }

        let id = u32::from_str_radix(id_part.trim(), 16).map_err(|e| FormKeyError::InvalidId {
            text: text.to_string(),
            source: e,
        })?;
        if id > 0x00FF_FFFF {
            return Err(FormKeyError::IdOutOfRange(text.to_string()));
        }

        Ok(Self {
            id,
            source: source.to_string(),
        })
    }
}

impl TryFrom<String> for FormKey {
    type Error = FormKeyError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FormKey> for String {
    fn from(key: FormKey) -> Self {
        key.to_string()
    }
}

/// Strip the plugin extension (`.esm`, `.esp`, `.esl`) from a source name.
pub fn source_stem(source: &str) -> &str {
    let lower = source.to_ascii_lowercase();
    for ext in [".esm", ".esp", ".esl"] {
        if lower.ends_with(ext) {
            return &source[..source.len() - ext.len()];
        }
    }
    source
}

/// Copyable attribute groups, named after the record sub-fields they cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AppearancePart {
    HeadParts,
    WornArmor,
    TextureLighting,
    FaceMorph,
    FaceParts,
    TintLayers,
    HeadTexture,
    HairColor,
}

impl AppearancePart {
    pub const ALL: [AppearancePart; 8] = [
        AppearancePart::HeadParts,
        AppearancePart::WornArmor,
        AppearancePart::TextureLighting,
        AppearancePart::FaceMorph,
        AppearancePart::FaceParts,
        AppearancePart::TintLayers,
        AppearancePart::HeadTexture,
        AppearancePart::HairColor,
    ];

    pub fn name(self) -> &'static str {
        match self {
            AppearancePart::HeadParts => "PNAM",
            AppearancePart::WornArmor => "WNAM",
            AppearancePart::TextureLighting => "QNAM",
            AppearancePart::FaceMorph => "NAM9",
            AppearancePart::FaceParts => "NAMA",
            AppearancePart::TintLayers => "Tint Layers",
            AppearancePart::HeadTexture => "FTST",
            AppearancePart::HairColor => "HCLF",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL
            .into_iter()
            .find(|part| part.name().eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TintLayer {
    pub index: u16,
    pub color: [u8; 4],
    pub interpolation: f32,
    #[serde(default)]
    pub preset: Option<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Appearance {
    pub head_parts: Vec<FormKey>,
    pub worn_armor: Option<FormKey>,
    pub texture_lighting: Option<[u8; 4]>,
    pub face_morph: Option<Vec<f32>>,
    pub face_parts: Option<Vec<u16>>,
    pub tint_layers: Vec<TintLayer>,
    pub head_texture: Option<FormKey>,
    pub hair_color: Option<FormKey>,
}

impl Appearance {
    /// Overwrite the selected attribute groups with the donor's values.
    /// Optional links are only copied when the donor actually has them.
    pub fn apply_from(&mut self, donor: &Appearance, parts: &BTreeSet<AppearancePart>) {
        for part in parts {
            match part {
                AppearancePart::HeadParts => self.head_parts = donor.head_parts.clone(),
                AppearancePart::WornArmor => {
                    if donor.worn_armor.is_some() {
                        self.worn_armor = donor.worn_armor.clone();
                    }
                }
                AppearancePart::TextureLighting => self.texture_lighting = donor.texture_lighting,
                AppearancePart::FaceMorph => {
                    if donor.face_morph.is_some() {
                        self.face_morph = donor.face_morph.clone();
                    }
                }
                AppearancePart::FaceParts => {
                    if donor.face_parts.is_some() {
                        self.face_parts = donor.face_parts.clone();
                    }
                }
                AppearancePart::TintLayers => self.tint_layers = donor.tint_layers.clone(),
                AppearancePart::HeadTexture => {
                    if donor.head_texture.is_some() {
                        self.head_texture = donor.head_texture.clone();
                    }
                }
                AppearancePart::HairColor => {
                    if donor.hair_color.is_some() {
                        self.hair_color = donor.hair_color.clone();
                    }
                }
            }
        }
    }

    fn links(&self) -> impl Iterator<Item = &FormKey> {
        self.head_parts
            .iter()
            .chain(self.worn_armor.iter())
            .chain(self.head_texture.iter())
            .chain(self.hair_color.iter())
    }
}

/// An NPC record as seen by the patcher: the winning override from the load
/// order, with its race already resolved to an editor id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Npc {
    pub key: FormKey,
    #[serde(default)]
    pub editor_id: Option<String>,
    #[serde(default)]
    pub race: Option<String>,
    #[serde(default)]
    pub female: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default)]
    pub keywords: Vec<FormKey>,
    #[serde(default)]
    pub appearance: Appearance,
    #[serde(default)]
    pub height: f32,
    #[serde(default)]
    pub weight: f32,
}

impl Npc {
    pub fn new(key: FormKey) -> Self {
        Self {
            key,
            editor_id: None,
            race: None,
            female: false,
            unique: false,
            voice: None,
            keywords: Vec::new(),
            appearance: Appearance::default(),
            height: 1.0,
            weight: 50.0,
        }
    }

    pub fn display_name(&self) -> &str {
        self.editor_id.as_deref().unwrap_or("Unnamed")
    }

    pub fn has_keyword(&self, keyword: &FormKey) -> bool {
        self.keywords.iter().any(|k| k == keyword)
    }

    /// Every plugin this record needs as a master: its own source plus the
    /// sources of all links it carries.
    pub fn referenced_sources(&self) -> BTreeSet<&str> {
        std::iter::once(&self.key)
            .chain(self.keywords.iter())
            .chain(self.appearance.links())
            .map(|k| k.source.as_str())
            .collect()
    }
}

/// Read-only view of the load order: known races, known voice types and the
/// winning NPC overrides in priority order.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct LoadOrder {
    #[serde(default)]
    races: Vec<String>,
    #[serde(default)]
    voice_types: Vec<String>,
    #[serde(default)]
    npcs: Vec<Npc>,
    #[serde(skip)]
    index: HashMap<FormKey, usize>,
    #[serde(skip)]
    race_index: HashMap<String, usize>,
}

impl LoadOrder {
    pub fn new(races: Vec<String>, voice_types: Vec<String>, npcs: Vec<Npc>) -> Self {
        let mut load_order = Self {
            races,
            voice_types,
            npcs,
            index: HashMap::new(),
            race_index: HashMap::new(),
        };
        load_order.rebuild_index();
        load_order
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        let mut load_order: LoadOrder = serde_json::from_str(&data)?;
        load_order.rebuild_index();
        Ok(load_order)
    }

    fn rebuild_index(&mut self) {
        self.index = self
            .npcs
            .iter()
            .enumerate()
            .map(|(i, npc)| (npc.key.clone(), i))
            .collect();
        self.race_index = self
            .races
            .iter()
            .enumerate()
            .map(|(i, race)| (race.to_ascii_lowercase(), i))
            .collect();
    }

    pub fn npcs(&self) -> &[Npc] {
        &self.npcs
    }

    pub fn races(&self) -> &[String] {
        &self.races
    }

    pub fn voice_types(&self) -> &[String] {
        &self.voice_types
    }

    pub fn npc(&self, key: &FormKey) -> Option<&Npc> {
        self.index.get(key).map(|&i| &self.npcs[i])
    }

    /// Canonical spelling of a race editor id, matched case-insensitively.
    pub fn race(&self, name: &str) -> Option<&str> {
        self.race_index
            .get(&name.trim().to_ascii_lowercase())
            .map(|&i| self.races[i].as_str())
    }

    pub fn has_voice_type(&self, name: &str) -> bool {
        self.voice_types.iter().any(|v| v == name)
    }
}

/// The output plugin: overrides produced by this run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchMod {
    pub name: String,
    pub records: Vec<Npc>,
}

impl PatchMod {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            records: Vec::new(),
        }
    }

    /// Add or replace the override for `npc.key`.
    pub fn set_override(&mut self, npc: Npc) {
        if let Some(existing) = self.records.iter_mut().find(|r| r.key == npc.key) {
            *existing = npc;
        } else {
            self.records.push(npc);
        }
    }

    /// Distinct master plugins in first-reference order, excluding this
    /// plugin itself.
    pub fn masters(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut masters = Vec::new();
        for record in &self.records {
            for source in record.referenced_sources() {
                if source.eq_ignore_ascii_case(&self.name) {
                    continue;
                }
                if seen.insert(source.to_ascii_lowercase()) {
                    masters.push(source.to_string());
                }
            }
        }
        masters
    }
}
