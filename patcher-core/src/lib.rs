use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{info, warn};

pub mod assets;
pub mod compat;
pub mod config;
pub mod engine;
pub mod pool;
pub mod record;
pub mod report;
pub mod split;
pub mod store;
pub mod voice;

#[cfg(test)]
mod fixtures;

use assets::FacegenIndex;
use compat::CompatibilityGraph;
use engine::{AssignmentEngine, EngineOutput};
use pool::{CandidatePools, SourceFilter, TrustedSource};
use record::{source_stem, FormKey, FormKeyError, LoadOrder, PatchMod};
use split::{SplitOptions, DEFAULT_COMPACT_LIMIT, DEFAULT_MASTER_CAP};
use store::{AssignmentStore, JsonFileStore, LockSpec};

pub use report::{RunOutcome, RunSummary};

pub const DEFAULT_OUTPUT_NAME: &str = "Appearance Patcher.esp";
pub const STORE_FILE: &str = "assignments.json";
pub const PATCH_LOG_FILE: &str = "patch_log.txt";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatcherSettings {
    pub seed: u64,
    /// Game data folder holding loose facegen and archives.
    pub data_path: PathBuf,
    /// JSON dump of races, voice types and winning NPC overrides.
    pub load_order_path: PathBuf,
    pub config_dir: PathBuf,
    pub output_path: PathBuf,
    /// Defaults to `assignments.json` in the output folder.
    pub store_path: Option<PathBuf>,
    pub output_name: String,
    pub output_suffix: Option<String>,
    pub preserve_assignments: bool,
    pub use_default_group_fallback: bool,
    pub default_fallback_groups: Vec<String>,
    pub patch_selected_only: bool,
    pub selected_npcs: Vec<FormKey>,
    pub locked: Vec<LockSpec>,
    pub template_source_blacklist: Vec<String>,
    pub trusted_templates: Vec<TrustedSource>,
    /// When non-empty, only NPCs from these plugins are patched.
    pub target_sources: Vec<String>,
    pub excluded_sources: Vec<String>,
    pub excluded_npcs: Vec<FormKey>,
    pub flag_compact: bool,
    pub master_cap: usize,
    pub compact_record_limit: usize,
    /// Keyword added to every patched NPC; NPCs already carrying it are skipped.
    pub patched_marker: FormKey,
    pub debug: bool,
}

impl Default for PatcherSettings {
    fn default() -> Self {
        Self {
            seed: 0,
            data_path: PathBuf::from("Data"),
            load_order_path: PathBuf::from("load_order.json"),
            config_dir: PathBuf::from("config"),
            output_path: PathBuf::from("output"),
            store_path: None,
            output_name: DEFAULT_OUTPUT_NAME.to_string(),
            output_suffix: None,
            preserve_assignments: false,
            use_default_group_fallback: true,
            default_fallback_groups: vec!["NordRace".to_string(), "ImperialRace".to_string()],
            patch_selected_only: false,
            selected_npcs: Vec::new(),
            locked: Vec::new(),
            template_source_blacklist: Vec::new(),
            trusted_templates: TrustedSource::defaults(),
            target_sources: Vec::new(),
            excluded_sources: Vec::new(),
            excluded_npcs: Vec::new(),
            flag_compact: false,
            master_cap: DEFAULT_MASTER_CAP,
            compact_record_limit: DEFAULT_COMPACT_LIMIT,
            patched_marker: FormKey::new(0x800, "PatcherKeywords.esp"),
            debug: false,
        }
    }
}

impl PatcherSettings {
    /// Output plugin name with the optional suffix inserted before the
    /// extension.
    pub fn output_file_name(&self) -> String {
        match self.output_suffix.as_deref().map(str::trim) {
            Some(suffix) if !suffix.is_empty() => {
                let stem = source_stem(&self.output_name);
                let ext = &self.output_name[stem.len()..];
                format!("{}_{}{}", stem, suffix, ext)
            }
            _ => self.output_name.clone(),
        }
    }

    pub fn store_file(&self) -> PathBuf {
        self.store_path
            .clone()
            .unwrap_or_else(|| self.output_path.join(STORE_FILE))
    }

    pub fn split_options(&self) -> SplitOptions {
        SplitOptions {
            cap: self.master_cap,
            compact_limit: self.compact_record_limit,
            flag_compact: self.flag_compact,
        }
    }
}

#[derive(Debug, Error)]
pub enum PatcherError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    FormKey(#[from] FormKeyError),
}

pub type Result<T> = std::result::Result<T, PatcherError>;

/// Map configured race names onto the load order's spelling, dropping the
/// ones the load order does not define.
fn canonical_groups<'a>(
    names: impl IntoIterator<Item = &'a String>,
    load_order: &LoadOrder,
    origin: &str,
) -> Vec<String> {
    names
        .into_iter()
        .filter_map(|name| match load_order.race(name) {
            Some(race) => Some(race.to_string()),
            None => {
                warn!("race {} from {} not found in the load order", name, origin);
                None
            }
        })
        .collect()
}

pub fn run(settings: &PatcherSettings) -> Result<RunOutcome> {
    if !settings.load_order_path.is_file() {
        return Err(PatcherError::Config(format!(
            "Load order file does not exist: {}",
            settings.load_order_path.display()
        )));
    }
    if !settings.data_path.is_dir() {
        return Err(PatcherError::Config(format!(
            "Data folder does not exist: {}",
            settings.data_path.display()
        )));
    }
    fs::create_dir_all(&settings.output_path)?;

    let config = config::load_config(&settings.config_dir)?;
    let load_order = LoadOrder::from_json_file(&settings.load_order_path)?;
    info!(
        "loaded {} NPCs, {} races, {} voice types",
        load_order.npcs().len(),
        load_order.races().len(),
        load_order.voice_types().len()
    );

    let groups: BTreeSet<String> =
        canonical_groups(&config.groups, &load_order, config::GROUPS_FILE)
            .into_iter()
            .collect();
    if groups.is_empty() {
        return Err(PatcherError::Config(format!(
            "none of the races in {} exist in the load order",
            config::GROUPS_FILE
        )));
    }
    let graph = CompatibilityGraph::resolve(&config.compatibility, load_order.races())?;

    let mut settings = settings.clone();
    settings.default_fallback_groups =
        canonical_groups(&settings.default_fallback_groups, &load_order, "the fallback races");

    let filter = SourceFilter::new(
        &settings.template_source_blacklist,
        &settings.trusted_templates,
    );
    let assets = FacegenIndex::scan(&settings.data_path);
    let pools = CandidatePools::build(
        &load_order,
        &groups,
        &filter,
        &assets,
        &settings.patched_marker,
    );
    if pools.is_empty() {
        warn!("no usable templates found; every eligible NPC will be left unpatched");
    }

    let store = JsonFileStore::new(settings.store_file());
    let previous = store.load();

    let mut patch = PatchMod::new(settings.output_file_name());
    let mut rng = StdRng::seed_from_u64(settings.seed);
    let engine = AssignmentEngine {
        settings: &settings,
        load_order: &load_order,
        groups: &groups,
        graph: &graph,
        pools: &pools,
        filter: &filter,
        assets: &assets,
        voices: &config.voices,
        parts: &config.parts,
        previous: &previous,
    };
    let EngineOutput {
        assignments,
        copies,
        mut summary,
        ..
    } = engine.run(&mut rng, &mut patch);

    summary.copies = copies.execute();
    if summary.copies.failed > 0 {
        warn!("{} facegen file operations failed", summary.copies.failed);
    }

    let merged = store::merge(&previous, &assignments);
    if assignments.is_empty() {
        info!("no new assignments; {} left unchanged", store.path().display());
    } else {
        match store.save(&merged) {
            Ok(()) => summary.assignments_saved = Some(merged.len()),
            Err(err) => {
                warn!(
                    "failed to save assignments to {}: {err}",
                    store.path().display()
                );
                summary.store_error = Some(err.to_string());
            }
        }
    }

    let partition = split::partition(&patch, &settings.split_options());
    split::write_groups(&partition, &settings.output_path)?;

    let outcome = RunOutcome {
        summary,
        partition,
        locks: store::resolve_locks(&settings.locked, &merged),
    };

    if settings.debug {
        let log_path = settings.output_path.join(PATCH_LOG_FILE);
        fs::write(log_path, outcome.report())?;
    }

    Ok(outcome)
}
