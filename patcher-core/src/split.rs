use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::record::{source_stem, Npc, PatchMod};
use crate::Result;

pub const DEFAULT_MASTER_CAP: usize = 250;
pub const DEFAULT_COMPACT_LIMIT: usize = 2048;
pub const COMPACT_ID_RANGE: RangeInclusive<u32> = 0x800..=0xFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitOptions {
    pub cap: usize,
    pub compact_limit: usize,
    pub flag_compact: bool,
}

impl Default for SplitOptions {
    fn default() -> Self {
        Self {
            cap: DEFAULT_MASTER_CAP,
            compact_limit: DEFAULT_COMPACT_LIMIT,
            flag_compact: false,
        }
    }
}

/// One output plugin. `masters` are the sources its own records reference;
/// `all_masters` is the full list of the unsplit output, carried by every
/// group so each one loads on its own.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputGroup {
    pub name: String,
    pub masters: Vec<String>,
    pub all_masters: Vec<String>,
    pub compact: bool,
    pub records: Vec<Npc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PartitionReport {
    /// Name of the unsplit output; group names derive from it.
    pub base_name: String,
    pub distinct_sources: usize,
    pub cap: usize,
    pub split: bool,
    pub groups: Vec<OutputGroup>,
}

impl fmt::Display for PartitionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "== Output ==")?;
        if self.split {
            writeln!(
                f,
                "  Output referenced {} masters (cap {}); split into {} plugins:",
                self.distinct_sources,
                self.cap,
                self.groups.len()
            )?;
        } else {
            writeln!(
                f,
                "  No splitting needed ({} masters, cap {})",
                self.distinct_sources, self.cap
            )?;
        }
        for group in &self.groups {
            writeln!(
                f,
                "  {}: masters {}, records {}{}",
                group.name,
                group.masters.len(),
                group.records.len(),
                if group.compact { ", compact" } else { "" }
            )?;
        }
        if self.split {
            writeln!(
                f,
                "  The patch was split to stay under the master limit. Enable every plugin listed above."
            )?;
        }
        Ok(())
    }
}

/// `base`, `base_2`, `base_3`, ... with the plugin extension kept.
pub fn group_name(base: &str, index: usize) -> String {
    if index == 0 {
        return base.to_string();
    }
    let stem = source_stem(base);
    let ext = &base[stem.len()..];
    format!("{}_{}{}", stem, index + 1, ext)
}

/// Plugin names compare without case; the set holds lowercased names.
fn record_masters(record: &Npc, own: &str) -> BTreeSet<String> {
    record
        .referenced_sources()
        .into_iter()
        .filter(|s| !s.eq_ignore_ascii_case(own))
        .map(str::to_ascii_lowercase)
        .collect()
}

/// Records that share a source travel together; they almost always share
/// most of their masters too.
fn buckets<'a>(patch: &'a PatchMod) -> Vec<Vec<&'a Npc>> {
    let mut order: Vec<&str> = Vec::new();
    let mut buckets: Vec<Vec<&Npc>> = Vec::new();
    for record in &patch.records {
        let source = record.key.source.as_str();
        match order.iter().position(|s| s.eq_ignore_ascii_case(source)) {
            Some(i) => buckets[i].push(record),
            None => {
                order.push(source);
                buckets.push(vec![record]);
            }
        }
    }
    buckets
}

struct Pending<'a> {
    masters: BTreeSet<String>,
    records: Vec<&'a Npc>,
}

impl<'a> Pending<'a> {
    fn new() -> Self {
        Self {
            masters: BTreeSet::new(),
            records: Vec::new(),
        }
    }

    fn fits(&self, extra: &BTreeSet<String>, cap: usize) -> bool {
        self.masters.union(extra).count() <= cap
    }

    fn add(&mut self, records: &[&'a Npc], masters: BTreeSet<String>) {
        self.masters.extend(masters);
        self.records.extend_from_slice(records);
    }
}

fn pack<'a>(patch: &'a PatchMod, cap: usize) -> Vec<Pending<'a>> {
    let own = patch.name.as_str();
    let mut groups = vec![Pending::new()];

    for bucket in buckets(patch) {
        let bucket_masters: BTreeSet<String> = bucket
            .iter()
            .flat_map(|r| record_masters(r, own))
            .collect();

        if bucket_masters.len() <= cap {
            if !groups.last().is_some_and(|g| g.fits(&bucket_masters, cap)) {
                groups.push(Pending::new());
            }
            if let Some(current) = groups.last_mut() {
                current.add(&bucket, bucket_masters);
            }
            continue;
        }

        for record in bucket {
            let masters = record_masters(record, own);
            if masters.len() > cap {
                warn!(
                    "record {} alone references {} masters (cap {})",
                    record.key,
                    masters.len(),
                    cap
                );
            }
            if !groups.last().is_some_and(|g| g.fits(&masters, cap)) {
                groups.push(Pending::new());
            }
            if let Some(current) = groups.last_mut() {
                current.add(&[record], masters);
            }
        }
    }

    groups.retain(|g| !g.records.is_empty());
    groups
}

/// Why a group may not be flagged compact, if it may not.
fn compact_blocker(base: &str, records: &[Npc], limit: usize) -> Option<String> {
    let new_records: Vec<&Npc> = records.iter().filter(|r| r.key.is_from(base)).collect();
    if let Some(outside) = new_records
        .iter()
        .find(|r| !COMPACT_ID_RANGE.contains(&r.key.id))
    {
        return Some(format!(
            "new record {} has an id outside the compact range (0x800 to 0xFFF)",
            outside.key
        ));
    }
    if new_records.len() > limit {
        return Some(format!(
            "exceeds {} new records (found {})",
            limit,
            new_records.len()
        ));
    }
    None
}

/// Split the output so no group references more than `options.cap` masters.
/// Output under the cap comes back as a single group with `split == false`.
pub fn partition(patch: &PatchMod, options: &SplitOptions) -> PartitionReport {
    let all_masters = patch.masters();
    let distinct_sources = all_masters.len();
    let split = distinct_sources > options.cap;

    let pending = if split {
        info!(
            "output references {} masters; splitting at {}",
            distinct_sources, options.cap
        );
        pack(patch, options.cap)
    } else {
        info!(
            "no splitting needed (master count {} within {})",
            distinct_sources, options.cap
        );
        let own = patch.name.as_str();
        vec![Pending {
            masters: patch
                .records
                .iter()
                .flat_map(|r| record_masters(r, own))
                .collect(),
            records: patch.records.iter().collect(),
        }]
    };

    let groups = pending
        .into_iter()
        .enumerate()
        .map(|(i, pending)| {
            let name = group_name(&patch.name, i);
            let records: Vec<Npc> = pending.records.into_iter().cloned().collect();
            let masters: Vec<String> = all_masters
                .iter()
                .filter(|m| pending.masters.contains(&m.to_ascii_lowercase()))
                .cloned()
                .collect();

            let compact = options.flag_compact
                && match compact_blocker(&patch.name, &records, options.compact_limit) {
                    Some(reason) => {
                        info!("cannot flag {} as compact: {}", name, reason);
                        false
                    }
                    None => {
                        info!("flagged {} as compact", name);
                        true
                    }
                };

            OutputGroup {
                name,
                masters,
                all_masters: all_masters.clone(),
                compact,
                records,
            }
        })
        .collect();

    PartitionReport {
        base_name: patch.name.clone(),
        distinct_sources,
        cap: options.cap,
        split,
        groups,
    }
}

/// Write each group as `<name>.json` into `dir`, then drop the higher
/// numbered groups an earlier, wider split left behind.
pub fn write_groups(report: &PartitionReport, dir: &Path) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir)?;
    let mut written = Vec::with_capacity(report.groups.len());
    for group in &report.groups {
        let path = dir.join(format!("{}.json", group.name));
        fs::write(&path, serde_json::to_string_pretty(group)?)?;
        info!(
            "wrote {} (masters {}, records {})",
            path.display(),
            group.masters.len(),
            group.records.len()
        );
        written.push(path);
    }

    // Stale groups are numbered contiguously after the current ones.
    let mut index = report.groups.len().max(1);
    loop {
        let stale = dir.join(format!("{}.json", group_name(&report.base_name, index)));
        if !stale.is_file() {
            break;
        }
        fs::remove_file(&stale)?;
        info!("removed stale output {}", stale.display());
        index += 1;
    }
    Ok(written)
}
