//! Text configuration files and their built-in defaults.
//!
//! All files share the same line rules: surrounding whitespace is trimmed,
//! blank lines and lines starting with `#` are ignored.

use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::record::AppearancePart;
use crate::voice::VoiceTables;
use crate::{PatcherError, Result};

pub const GROUPS_FILE: &str = "races.txt";
pub const COMPATIBILITY_FILE: &str = "race_compatibility.txt";
pub const VOICE_MAPPING_FILE: &str = "voice_mapping.txt";
pub const PARTS_FILE: &str = "parts_to_copy.txt";

pub const VOICE_MAP_SECTION: &str = "[VoiceMap]";
pub const RACE_FALLBACK_SECTION: &str = "[RaceVoiceFallbacks]";

pub const DEFAULT_GROUPS: &str = "\
# Races whose NPCs take part in patching, one per line.
NordRace
NordRaceVampire
ImperialRace
ImperialRaceVampire
BretonRace
BretonRaceVampire
RedguardRace
RedguardRaceVampire
DarkElfRace
DarkElfRaceVampire
HighElfRace
HighElfRaceVampire
WoodElfRace
WoodElfRaceVampire
OrcRace
OrcRaceVampire
ArgonianRace
ArgonianRaceVampire
KhajiitRace
KhajiitRaceVampire
ElderRace
ElderRaceVampire
SnowElfRace
DremoraRace
DA13AfflictedRace
";

pub const DEFAULT_COMPATIBILITY: &str = "\
# Race: CompatibleRace1, CompatibleRace2, ...
# A race only draws templates from the races listed for it. List the race
# itself if it should use its own templates.
NordRace: NordRace, NordRaceVampire, HothRace, ImperialRace, ImperialRaceVampire
NordRaceVampire: NordRace, NordRaceVampire, HothRace, ImperialRace, ImperialRaceVampire
HothRace: NordRace, NordRaceVampire, HothRace, ImperialRace, ImperialRaceVampire
ImperialRace: ImperialRace, ImperialRaceVampire, NordRace, NordRaceVampire, HothRace
ImperialRaceVampire: ImperialRace, ImperialRaceVampire, NordRace, NordRaceVampire, HothRace
DarkElfRace: DarkElfRace, DarkElfRaceVampire, _00DwemerRace, MASNerevarineRace
DarkElfRaceVampire: DarkElfRace, DarkElfRaceVampire, _00DwemerRace, MASNerevarineRace
_00DwemerRace: DarkElfRace, DarkElfRaceVampire, _00DwemerRace, MASNerevarineRace
MASNerevarineRace: DarkElfRace, DarkElfRaceVampire, _00DwemerRace, MASNerevarineRace
ArgonianRace: ArgonianRace, ArgonianRaceVampire
ArgonianRaceVampire: ArgonianRace, ArgonianRaceVampire
KhajiitRace: KhajiitRace, KhajiitRaceVampire
KhajiitRaceVampire: KhajiitRace, KhajiitRaceVampire
HighElfRace: HighElfRace, HighElfRaceVampire, SnowElfRace, WB_ConjureCraftlord_Race
HighElfRaceVampire: HighElfRace, HighElfRaceVampire, SnowElfRace, WB_ConjureCraftlord_Race
SnowElfRace: HighElfRace, HighElfRaceVampire, SnowElfRace, WB_ConjureCraftlord_Race
WB_ConjureCraftlord_Race: HighElfRace, HighElfRaceVampire, SnowElfRace, WB_ConjureCraftlord_Race
WoodElfRace: WoodElfRace, WoodElfRaceVampire
WoodElfRaceVampire: WoodElfRace, WoodElfRaceVampire
BretonRace: BretonRace, BretonRaceVampire
BretonRaceVampire: BretonRace, BretonRaceVampire
RedguardRace: RedguardRace, RedguardRaceVampire
RedguardRaceVampire: RedguardRace, RedguardRaceVampire
OrcRace: OrcRace, OrcRaceVampire
OrcRaceVampire: OrcRace, OrcRaceVampire
ElderRace: ElderRace, ElderRaceVampire
ElderRaceVampire: ElderRace, ElderRaceVampire
DremoraRace: DremoraRace
DA13AfflictedRace: DA13AfflictedRace
";

pub const DEFAULT_VOICE_MAPPING: &str = "\
# Voice: TargetVoice1, TargetVoice2, ...
[VoiceMap]
MaleArgonian: FemaleArgonian
MaleBandit: FemaleCommoner
MaleBrute: FemaleCommander
MaleChild: FemaleChild
MaleCommander: FemaleCommander
MaleCommoner: FemaleCommoner
MaleCommonerAccented: FemaleCommoner
MaleCondescending: FemaleCondescending
MaleCoward: FemaleCoward
MaleDarkElf: FemaleDarkElf
MaleDrunk: FemaleSultry
MaleElfHaughty: FemaleElfHaughty
MaleEvenToned: FemaleEvenToned
MaleEvenTonedAccented: FemaleEvenToned
MaleGuard: FemaleCommander
MaleKhajiit: FemaleKhajiit
MaleNord: FemaleNord
MaleNordCommander: FemaleCommander
MaleOldGrumpy: FemaleOldGrumpy
MaleOldKindly: FemaleOldKindly
MaleOrc: FemaleOrc
MaleSlyCynical: FemaleSultry
MaleSoldier: FemaleCommander
MaleUniqueGhost: FemaleUniqueGhost
MaleWarlock: FemaleCondescending
MaleYoungEager: FemaleYoungEager
DLC1MaleVampire: DLC1FemaleVampire
DLC2MaleDarkElfCommoner: DLC2FemaleDarkElfCommoner
DLC2MaleDarkElfCynical: FemaleDarkElf

# Race: FallbackVoice1, FallbackVoice2, ...
[RaceVoiceFallbacks]
NordRace: FemaleNord, FemaleEvenToned, FemaleCommander
NordRaceVampire: FemaleNord, FemaleEvenToned, FemaleCommander
DarkElfRace: FemaleDarkElf, DLC2FemaleDarkElfCommoner, FemaleCondescending
DarkElfRaceVampire: FemaleDarkElf, DLC2FemaleDarkElfCommoner, FemaleCondescending
ArgonianRace: FemaleArgonian, FemaleSultry
ArgonianRaceVampire: FemaleArgonian, FemaleSultry
KhajiitRace: FemaleKhajiit, FemaleSultry
KhajiitRaceVampire: FemaleKhajiit, FemaleSultry
HighElfRace: FemaleElfHaughty, FemaleEvenToned
HighElfRaceVampire: FemaleElfHaughty, FemaleEvenToned
WoodElfRace: FemaleEvenToned, FemaleYoungEager
WoodElfRaceVampire: FemaleEvenToned, FemaleYoungEager
BretonRace: FemaleEvenToned, FemaleYoungEager
BretonRaceVampire: FemaleEvenToned, FemaleYoungEager
ImperialRace: FemaleEvenToned, FemaleCommander
ImperialRaceVampire: FemaleEvenToned, FemaleCommander
RedguardRace: FemaleEvenToned, FemaleSultry
RedguardRaceVampire: FemaleEvenToned, FemaleSultry
OrcRace: FemaleOrc, FemaleCommander
OrcRaceVampire: FemaleOrc, FemaleCommander
";

pub const DEFAULT_PARTS: &str = "\
PNAM
WNAM
QNAM
NAM9
NAMA
Tint Layers
FTST
HCLF
";

/// Everything read from the configuration folder, validated and typed.
#[derive(Debug, Clone)]
pub struct PatcherConfig {
    pub groups: BTreeSet<String>,
    pub compatibility: Vec<(String, Vec<String>)>,
    pub voices: VoiceTables,
    pub parts: BTreeSet<AppearancePart>,
}

impl PatcherConfig {
    /// The configuration produced by the built-in default files.
    pub fn defaults() -> Self {
        Self {
            groups: parse_group_list(DEFAULT_GROUPS),
            compatibility: parse_mapping(DEFAULT_COMPATIBILITY, COMPATIBILITY_FILE),
            voices: parse_voice_mapping(DEFAULT_VOICE_MAPPING),
            parts: parse_parts_list(DEFAULT_PARTS),
        }
    }
}

fn content_lines(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
}

/// One group per line; only the first whitespace-delimited token counts.
pub fn parse_group_list(text: &str) -> BTreeSet<String> {
    content_lines(text)
        .filter_map(|(_, line)| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

/// `Key: Value1, Value2, ...` lines. Lines without exactly one `:` and lines
/// with no values are skipped with a warning.
pub fn parse_mapping(text: &str, label: &str) -> Vec<(String, Vec<String>)> {
    content_lines(text)
        .filter_map(|(line_no, line)| parse_mapping_line(line_no, line, label))
        .collect()
}

fn parse_mapping_line(line_no: usize, line: &str, label: &str) -> Option<(String, Vec<String>)> {
    let parts: Vec<&str> = line.split(':').collect();
    if parts.len() != 2 {
        warn!(
            "{label} line {line_no}: invalid entry '{line}'. Expected format: Key: Value1, Value2, ..."
        );
        return None;
    }

    let key = parts[0].trim();
    if key.is_empty() {
        warn!("{label} line {line_no}: entry has no key; skipping");
        return None;
    }

    let values: Vec<String> = parts[1]
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect();
    if values.is_empty() {
        warn!("{label} line {line_no}: no values defined for {key}; skipping entry");
        return None;
    }

    Some((key.to_string(), values))
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum VoiceSection {
    None,
    VoiceMap,
    RaceFallbacks,
}

/// Two sections introduced by `[VoiceMap]` and `[RaceVoiceFallbacks]`.
/// Lines before the first marker are ignored with a warning.
pub fn parse_voice_mapping(text: &str) -> VoiceTables {
    let mut tables = VoiceTables::default();
    let mut section = VoiceSection::None;

    for (line_no, line) in content_lines(text) {
        if line.eq_ignore_ascii_case(VOICE_MAP_SECTION) {
            section = VoiceSection::VoiceMap;
            continue;
        }
        if line.eq_ignore_ascii_case(RACE_FALLBACK_SECTION) {
            section = VoiceSection::RaceFallbacks;
            continue;
        }

        let target = match section {
            VoiceSection::VoiceMap => &mut tables.voice_map,
            VoiceSection::RaceFallbacks => &mut tables.race_fallbacks,
            VoiceSection::None => {
                warn!("{VOICE_MAPPING_FILE} line {line_no}: entry outside of any section; skipping");
                continue;
            }
        };
        if let Some((key, values)) = parse_mapping_line(line_no, line, VOICE_MAPPING_FILE) {
            target.insert(key, values);
        }
    }

    tables
}

pub fn parse_parts_list(text: &str) -> BTreeSet<AppearancePart> {
    content_lines(text)
        .filter_map(|(line_no, line)| {
            let part = AppearancePart::from_name(line);
            if part.is_none() {
                warn!("{PARTS_FILE} line {line_no}: unknown attribute group '{line}'");
            }
            part
        })
        .collect()
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(PatcherError::Io(err)),
    }
}

fn read_required(path: &Path) -> Result<String> {
    read_optional(path)?.ok_or_else(|| {
        PatcherError::Config(format!("required file not found: {}", path.display()))
    })
}

/// Read the configuration folder. The race list and parts list are required;
/// the compatibility and voice files fall back to the built-in tables when
/// absent.
pub fn load_config(dir: &Path) -> Result<PatcherConfig> {
    let groups = parse_group_list(&read_required(&dir.join(GROUPS_FILE))?);
    if groups.is_empty() {
        return Err(PatcherError::Config(format!(
            "{} lists no races",
            dir.join(GROUPS_FILE).display()
        )));
    }

    let parts = parse_parts_list(&read_required(&dir.join(PARTS_FILE))?);
    if parts.is_empty() {
        warn!("{PARTS_FILE} selects no attribute groups; templates will only change flags, voice and body size");
    }

    let compatibility = match read_optional(&dir.join(COMPATIBILITY_FILE))? {
        Some(text) => parse_mapping(&text, COMPATIBILITY_FILE),
        None => {
            info!("{COMPATIBILITY_FILE} not found; using default race compatibility map");
            parse_mapping(DEFAULT_COMPATIBILITY, COMPATIBILITY_FILE)
        }
    };

    let voices = match read_optional(&dir.join(VOICE_MAPPING_FILE))? {
        Some(text) => parse_voice_mapping(&text),
        None => {
            info!("{VOICE_MAPPING_FILE} not found; using default voice tables");
            parse_voice_mapping(DEFAULT_VOICE_MAPPING)
        }
    };

    Ok(PatcherConfig {
        groups,
        compatibility,
        voices,
        parts,
    })
}

/// Write any missing configuration file with its default contents. Existing
/// files are left untouched. Returns the files created.
pub fn write_default_config(dir: &Path) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir)?;
    let mut created = Vec::new();
    for (name, text) in [
        (GROUPS_FILE, DEFAULT_GROUPS),
        (COMPATIBILITY_FILE, DEFAULT_COMPATIBILITY),
        (VOICE_MAPPING_FILE, DEFAULT_VOICE_MAPPING),
        (PARTS_FILE, DEFAULT_PARTS),
    ] {
        let path = dir.join(name);
        if path.exists() {
            continue;
        }
        fs::write(&path, text)?;
        info!("wrote default {}", path.display());
        created.push(path);
    }
    Ok(created)
}
