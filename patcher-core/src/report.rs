use std::collections::BTreeMap;
use std::fmt;

use crate::assets::CopyStats;
use crate::engine::{FilterReason, PatchRoute, UnpatchedReason};
use crate::pool::SkippedTemplate;
use crate::record::Npc;
use crate::split::PartitionReport;
use crate::store::LockSpec;

/// Counters and lists gathered while a run progresses; rendered as the
/// patch log.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub seed: u64,
    /// Subjects that passed every filter.
    pub eligible: usize,
    pub filtered: BTreeMap<FilterReason, usize>,
    /// Player and preset records, listed by name.
    pub player_or_preset: Vec<String>,
    pub excluded_by_source: BTreeMap<String, usize>,
    pub patched: BTreeMap<PatchRoute, usize>,
    pub unpatched: Vec<(String, UnpatchedReason)>,
    pub voices_changed: usize,
    pub skipped_templates: Vec<SkippedTemplate>,
    pub pool_sizes: BTreeMap<String, usize>,
    pub copies: CopyStats,
    pub assignments_saved: Option<usize>,
    pub store_error: Option<String>,
}

impl RunSummary {
    pub fn record_filtered(&mut self, npc: &Npc, reason: FilterReason) {
        *self.filtered.entry(reason).or_default() += 1;
        match reason {
            FilterReason::PlayerOrPreset => self
                .player_or_preset
                .push(format!("{} ({})", npc.display_name(), npc.key)),
            FilterReason::ExcludedSource | FilterReason::ExcludedNpc => {
                *self
                    .excluded_by_source
                    .entry(npc.key.source.clone())
                    .or_default() += 1;
            }
            _ => {}
        }
    }

    pub fn record_patched(&mut self, route: PatchRoute) {
        *self.patched.entry(route).or_default() += 1;
    }

    pub fn patched_total(&self) -> usize {
        self.patched.values().sum()
    }

    pub fn filtered_total(&self) -> usize {
        self.filtered.values().sum()
    }

    /// Templates actually turned away, not counting trusted admissions.
    pub fn rejected_templates(&self) -> impl Iterator<Item = &SkippedTemplate> {
        self.skipped_templates
            .iter()
            .filter(|s| s.reason != crate::pool::SkipReason::Trusted)
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Seed: {}", self.seed)?;
        writeln!(f)?;

        writeln!(f, "== Templates ==")?;
        for (group, size) in &self.pool_sizes {
            writeln!(f, "  {:<28} {}", group, size)?;
        }
        let rejected: Vec<_> = self.rejected_templates().collect();
        if !rejected.is_empty() {
            writeln!(f, "  Skipped {} templates:", rejected.len())?;
            for skipped in rejected {
                writeln!(f, "    {} ({}): {}", skipped.name, skipped.key, skipped.reason)?;
            }
        }
        writeln!(f)?;

        writeln!(f, "== NPCs ==")?;
        writeln!(f, "  Eligible: {}", self.eligible)?;
        writeln!(f, "  Patched:  {}", self.patched_total())?;
        for (route, count) in &self.patched {
            writeln!(f, "    {:<14} {}", route.to_string(), count)?;
        }
        writeln!(f, "  Unpatched: {}", self.unpatched.len())?;
        for (name, reason) in &self.unpatched {
            writeln!(f, "    {}: {}", name, reason)?;
        }
        writeln!(f, "  Voices changed: {}", self.voices_changed)?;
        writeln!(f, "  Filtered: {}", self.filtered_total())?;
        for (reason, count) in &self.filtered {
            writeln!(f, "    {:<32} {}", reason.to_string(), count)?;
        }
        if !self.player_or_preset.is_empty() {
            writeln!(f, "  Skipped Player/Preset NPCs:")?;
            for name in &self.player_or_preset {
                writeln!(f, "    {}", name)?;
            }
        }
        if !self.excluded_by_source.is_empty() {
            writeln!(f, "  Excluded NPCs by source:")?;
            for (source, count) in &self.excluded_by_source {
                writeln!(f, "    {}: {}", source, count)?;
            }
        }
        writeln!(f)?;

        writeln!(f, "== Facegen ==")?;
        writeln!(
            f,
            "  Removed {}, created {} directories, copied {}",
            self.copies.removed, self.copies.directories, self.copies.copied
        )?;
        if self.copies.failed > 0 {
            writeln!(f, "  FAILED {} file operations (see log)", self.copies.failed)?;
        }

        match (&self.store_error, self.assignments_saved) {
            (Some(err), _) => writeln!(f, "  Assignment store NOT saved: {}", err)?,
            (None, Some(count)) => writeln!(f, "  Saved {} assignments", count)?,
            (None, None) => {}
        }
        Ok(())
    }
}

/// Everything a caller needs after a run: the summary, how the output was
/// split, and the locks as they now stand.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub summary: RunSummary,
    pub partition: PartitionReport,
    pub locks: Vec<LockSpec>,
}

impl RunOutcome {
    pub fn report(&self) -> String {
        let mut text = self.summary.to_string();
        text.push('\n');
        text.push_str(&self.partition.to_string());
        if !self.locks.is_empty() {
            text.push_str("\n== Locks ==\n");
            for lock in &self.locks {
                match &lock.template {
                    Some(template) => text.push_str(&format!("  {} -> {}\n", lock.npc, template)),
                    None => text.push_str(&format!("  {} -> (none yet)\n", lock.npc)),
                }
            }
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::male;
    use crate::record::FormKey;

    #[test]
    fn counts_by_reason_and_source() {
        let mut summary = RunSummary::default();
        summary.record_filtered(&male(1, "A.esp", "NordRace"), FilterReason::ExcludedSource);
        summary.record_filtered(&male(2, "A.esp", "NordRace"), FilterReason::ExcludedNpc);
        summary.record_filtered(&male(3, "B.esp", "NordRace"), FilterReason::Template);
        summary.record_patched(PatchRoute::FreshSelection);
        summary.record_patched(PatchRoute::FreshSelection);
        summary.record_patched(PatchRoute::LockedReuse);

        assert_eq!(summary.filtered_total(), 3);
        assert_eq!(summary.excluded_by_source["A.esp"], 2);
        assert_eq!(summary.patched_total(), 3);
        assert_eq!(summary.patched[&PatchRoute::FreshSelection], 2);
    }

    #[test]
    fn display_lists_unpatched_and_store_failure() {
        let mut summary = RunSummary {
            seed: 42,
            store_error: Some("disk full".into()),
            copies: CopyStats {
                copied: 4,
                failed: 1,
                ..CopyStats::default()
            },
            ..RunSummary::default()
        };
        summary.unpatched.push((
            "Guard (000010:A.esp)".into(),
            UnpatchedReason::LockedTemplateUnavailable {
                template: FormKey::new(0x20, "B.esp"),
            },
        ));
        let text = summary.to_string();
        assert!(text.contains("Seed: 42"));
        assert!(text.contains("Guard (000010:A.esp)"));
        assert!(text.contains("000020:B.esp"));
        assert!(text.contains("NOT saved: disk full"));
        assert!(text.contains("FAILED 1 file operations"));
    }
}
