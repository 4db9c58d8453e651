use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::record::FormKey;
use crate::{PatcherError, Result};

/// Subject -> last template applied to it.
pub type Assignments = BTreeMap<FormKey, FormKey>;

/// Durable assignment cache. `load` never fails; a missing or corrupt store
/// reads as empty.
pub trait AssignmentStore {
    fn load(&self) -> Assignments;
    fn save(&self, assignments: &Assignments) -> Result<()>;
}

/// Store backed by a pretty-printed JSON object of form-key strings.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

fn parse_document(data: &str) -> std::result::Result<Assignments, serde_json::Error> {
    let raw: BTreeMap<String, String> = serde_json::from_str(data)?;
    let mut assignments = Assignments::new();
    for (npc, template) in raw {
        match (npc.parse::<FormKey>(), template.parse::<FormKey>()) {
            (Ok(npc), Ok(template)) => {
                assignments.insert(npc, template);
            }
            (Err(err), _) | (_, Err(err)) => {
                warn!("dropping unreadable assignment '{npc}' -> '{template}': {err}");
            }
        }
    }
    Ok(assignments)
}

impl AssignmentStore for JsonFileStore {
    fn load(&self) -> Assignments {
        let data = match fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Assignments::new(),
            Err(err) => {
                warn!(
                    "error reading {}: {err}. Starting with an empty assignment cache.",
                    self.path.display()
                );
                return Assignments::new();
            }
        };

        match parse_document(&data) {
            Ok(assignments) => {
                info!(
                    "loaded {} cached assignments from {}",
                    assignments.len(),
                    self.path.display()
                );
                assignments
            }
            Err(err) => {
                warn!(
                    "error parsing {}: {err}. Starting with an empty assignment cache.",
                    self.path.display()
                );
                Assignments::new()
            }
        }
    }

    /// Write to a sibling temp file, then rename over the store so a failed
    /// write leaves the previous store intact.
    fn save(&self, assignments: &Assignments) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let document: BTreeMap<String, String> = assignments
            .iter()
            .map(|(npc, template)| (npc.to_string(), template.to_string()))
            .collect();
        let json = serde_json::to_string_pretty(&document)?;

        let tmp = self.temp_path();
        let written = fs::File::create(&tmp).and_then(|mut file| {
            file.write_all(json.as_bytes())?;
            file.sync_all()
        });
        if let Err(err) = written {
            let _ = fs::remove_file(&tmp);
            return Err(PatcherError::Io(err));
        }
        if let Err(err) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(PatcherError::Io(err));
        }

        info!(
            "saved {} assignments to {}",
            assignments.len(),
            self.path.display()
        );
        Ok(())
    }
}

/// A subject whose template must not change once one has been recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockSpec {
    pub npc: FormKey,
    #[serde(default)]
    pub template: Option<FormKey>,
}

impl LockSpec {
    pub fn new(npc: FormKey) -> Self {
        Self {
            npc,
            template: None,
        }
    }
}

/// Fill unpinned locks from the store so the operator can see which template
/// each locked subject is held to.
pub fn resolve_locks(locks: &[LockSpec], assignments: &Assignments) -> Vec<LockSpec> {
    locks
        .iter()
        .map(|lock| LockSpec {
            npc: lock.npc.clone(),
            template: lock
                .template
                .clone()
                .or_else(|| assignments.get(&lock.npc).cloned()),
        })
        .collect()
}

/// Previous store contents overlaid with this run's assignments.
pub fn merge(previous: &Assignments, current: &Assignments) -> Assignments {
    let mut merged = previous.clone();
    merged.extend(current.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}
