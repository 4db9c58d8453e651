use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::record::{source_stem, FormKey};

const FACEGEOM_DIR: [&str; 5] = ["meshes", "actors", "character", "facegendata", "facegeom"];
const FACETINT_DIR: [&str; 5] = ["textures", "actors", "character", "facegendata", "facetint"];

fn join_all(base: &Path, parts: &[&str]) -> PathBuf {
    let mut path = base.to_path_buf();
    for part in parts {
        path.push(part);
    }
    path
}

/// Facegen mesh for `key` under `root`.
pub fn facegeom_path(root: &Path, key: &FormKey) -> PathBuf {
    join_all(root, &FACEGEOM_DIR)
        .join(&key.source)
        .join(format!("00{}.nif", key.id_string()))
}

/// Facegen tint texture for `key` under `root`.
pub fn facetint_path(root: &Path, key: &FormKey) -> PathBuf {
    join_all(root, &FACETINT_DIR)
        .join(&key.source)
        .join(format!("00{}.dds", key.id_string()))
}

/// Locates the loose asset payloads backing a template.
pub trait AssetIndex {
    /// Where the facegen mesh for `key` actually lives, if anywhere.
    fn geometry_path(&self, key: &FormKey) -> Option<PathBuf>;
    fn texture_path(&self, key: &FormKey) -> Option<PathBuf>;

    fn geometry_exists(&self, key: &FormKey) -> bool {
        self.geometry_path(key).is_some()
    }

    fn texture_exists(&self, key: &FormKey) -> bool {
        self.texture_path(key).is_some()
    }

    /// True when `source` ships a packed archive; its loose facegen cannot be
    /// read by the patcher.
    fn archive_exists(&self, source: &str) -> bool;
}

/// Facegen cache for a game data folder, built with a single walk over the
/// facegeom / facetint trees. Lookups ignore case; the stored paths keep the
/// spelling found on disk.
#[derive(Debug, Default)]
pub struct FacegenIndex {
    geometry: HashMap<String, PathBuf>,
    textures: HashMap<String, PathBuf>,
    archives: HashSet<String>,
}

fn index_key(source: &str, file_name: &str) -> String {
    format!("{}/{}", source.to_lowercase(), file_name.to_lowercase())
}

fn scan_tree(dir: &Path, into: &mut HashMap<String, PathBuf>) {
    if !dir.is_dir() {
        debug!(path = %dir.display(), "facegen directory not present");
        return;
    }

    for entry in WalkDir::new(dir).min_depth(2).max_depth(2) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!("skipping unreadable facegen entry: {err}");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        // Zero-length payloads are as good as missing.
        if entry.metadata().map(|m| m.len() == 0).unwrap_or(true) {
            continue;
        }
        let source = entry
            .path()
            .parent()
            .and_then(Path::file_name)
            .map(|s| s.to_string_lossy().into_owned());
        if let Some(source) = source {
            into.insert(
                index_key(&source, &entry.file_name().to_string_lossy()),
                entry.path().to_path_buf(),
            );
        }
    }
}

impl FacegenIndex {
    pub fn scan(data_folder: &Path) -> Self {
        let mut index = Self::default();

        scan_tree(&join_all(data_folder, &FACEGEOM_DIR), &mut index.geometry);
        scan_tree(&join_all(data_folder, &FACETINT_DIR), &mut index.textures);

        match fs::read_dir(data_folder) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let name = entry.file_name().to_string_lossy().to_lowercase();
                    if name.ends_with(".bsa") {
                        index.archives.insert(name);
                    }
                }
            }
            Err(err) => warn!(
                path = %data_folder.display(),
                "cannot list data folder for archives: {err}"
            ),
        }

        info!(
            geometry = index.geometry.len(),
            textures = index.textures.len(),
            archives = index.archives.len(),
            "cached facegen existence"
        );
        index
    }
}

impl AssetIndex for FacegenIndex {
    fn geometry_path(&self, key: &FormKey) -> Option<PathBuf> {
        self.geometry
            .get(&index_key(&key.source, &format!("00{}.nif", key.id_string())))
            .cloned()
    }

    fn texture_path(&self, key: &FormKey) -> Option<PathBuf> {
        self.textures
            .get(&index_key(&key.source, &format!("00{}.dds", key.id_string())))
            .cloned()
    }

    fn archive_exists(&self, source: &str) -> bool {
        self.archives
            .contains(&format!("{}.bsa", source_stem(source).to_lowercase()))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyStats {
    pub removed: usize,
    pub directories: usize,
    pub copied: usize,
    pub failed: usize,
}

/// File operations collected during assignment and executed once at the end
/// of the run.
#[derive(Debug, Default)]
pub struct CopyQueue {
    removals: Vec<PathBuf>,
    directories: Vec<PathBuf>,
    copies: Vec<(PathBuf, PathBuf)>,
}

impl CopyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue deletion of a stale file. Missing files are ignored.
    pub fn remove(&mut self, path: PathBuf) {
        self.removals.push(path);
    }

    pub fn ensure_dir(&mut self, dir: PathBuf) {
        self.directories.push(dir);
    }

    pub fn copy(&mut self, src: PathBuf, dest: PathBuf) {
        self.copies.push((src, dest));
    }

    pub fn copies(&self) -> &[(PathBuf, PathBuf)] {
        &self.copies
    }

    /// Removals run first, then every distinct destination directory is
    /// created once, then the copies. A failed operation is logged and
    /// counted; the rest of the queue still runs.
    pub fn execute(self) -> CopyStats {
        let mut stats = CopyStats::default();

        for path in &self.removals {
            if !path.is_file() {
                continue;
            }
            match fs::remove_file(path) {
                Ok(()) => {
                    debug!(path = %path.display(), "removed stale facegen");
                    stats.removed += 1;
                }
                Err(err) => {
                    warn!(path = %path.display(), "could not remove stale facegen: {err}");
                    stats.failed += 1;
                }
            }
        }

        let directories: BTreeSet<&Path> = self
            .directories
            .iter()
            .map(PathBuf::as_path)
            .chain(self.copies.iter().filter_map(|(_, dest)| dest.parent()))
            .collect();
        for dir in directories {
            match fs::create_dir_all(dir) {
                Ok(()) => stats.directories += 1,
                Err(err) => {
                    warn!(dir = %dir.display(), "could not create directory: {err}");
                    stats.failed += 1;
                }
            }
        }

        if !self.copies.is_empty() {
            info!("performing batch copy of {} files", self.copies.len());
        }
        for (src, dest) in &self.copies {
            match fs::copy(src, dest) {
                Ok(_) => {
                    debug!(dest = %dest.display(), "copied facegen");
                    stats.copied += 1;
                }
                Err(err) => {
                    warn!(
                        src = %src.display(),
                        dest = %dest.display(),
                        "facegen copy failed: {err}"
                    );
                    stats.failed += 1;
                }
            }
        }

        stats
    }
}
