use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use tracing::{debug, info, warn};

use crate::assets::{facegeom_path, facetint_path, AssetIndex, CopyQueue};
use crate::compat::CompatibilityGraph;
use crate::pool::{CandidatePools, SourceFilter, TemplateCandidate};
use crate::record::{AppearancePart, FormKey, LoadOrder, Npc, PatchMod};
use crate::report::RunSummary;
use crate::store::Assignments;
use crate::voice::{VoiceRemap, VoiceRemapper, VoiceTables};
use crate::PatcherSettings;

pub const DEFAULT_HEIGHT: f32 = 1.0;
pub const DEFAULT_WEIGHT: f32 = 50.0;

/// Why a record never reached template selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FilterReason {
    AlreadyCommitted,
    AlreadyPatched,
    NoRace,
    UnknownGroup,
    Template,
    PlayerOrPreset,
    NotTargeted,
    ExcludedSource,
    ExcludedNpc,
}

impl fmt::Display for FilterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FilterReason::AlreadyCommitted => "already patched this run",
            FilterReason::AlreadyPatched => "already patched",
            FilterReason::NoRace => "race unresolved",
            FilterReason::UnknownGroup => "race not in race list",
            FilterReason::Template => "template (female)",
            FilterReason::PlayerOrPreset => "Player/Preset",
            FilterReason::NotTargeted => "not targeted",
            FilterReason::ExcludedSource => "source excluded from patching",
            FilterReason::ExcludedNpc => "NPC excluded from patching",
        };
        f.write_str(text)
    }
}

/// How a patched subject obtained its template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PatchRoute {
    LockedReuse,
    PreservedReuse,
    FreshSelection,
    RunFallback,
}

impl fmt::Display for PatchRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            PatchRoute::LockedReuse => "locked",
            PatchRoute::PreservedReuse => "preserved",
            PatchRoute::FreshSelection => "random",
            PatchRoute::RunFallback => "run fallback",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnpatchedReason {
    NoCandidateAvailable { race: String },
    LockedTemplateUnavailable { template: FormKey },
}

impl fmt::Display for UnpatchedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnpatchedReason::NoCandidateAvailable { race } => write!(
                f,
                "no valid templates or successful fallbacks available for race {}",
                race
            ),
            UnpatchedReason::LockedTemplateUnavailable { template } => write!(
                f,
                "locked template {} has no usable facegen",
                template
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubjectOutcome {
    Filtered(FilterReason),
    Patched { template: FormKey, route: PatchRoute },
    Unpatched(UnpatchedReason),
}

/// Result of one pass over the load order.
#[derive(Debug)]
pub struct EngineOutput {
    /// Assignments made this run.
    pub assignments: Assignments,
    pub copies: CopyQueue,
    pub summary: RunSummary,
    pub outcomes: Vec<(FormKey, SubjectOutcome)>,
}

struct RunContext {
    committed: HashSet<FormKey>,
    successful_by_group: HashMap<String, Vec<TemplateCandidate>>,
    assignments: Assignments,
    copies: CopyQueue,
    summary: RunSummary,
}

/// Candidate-independent reasons to turn a template down at selection time.
fn rejection(
    candidate: &TemplateCandidate,
    filter: &SourceFilter,
    assets: &dyn AssetIndex,
) -> Option<&'static str> {
    if candidate.trusted {
        return None;
    }
    if filter.is_blacklisted(candidate.source()) {
        Some("blacklisted")
    } else if assets.archive_exists(candidate.source()) {
        Some("source uses a packed archive")
    } else if !candidate.assets_ok() {
        Some("missing facegen")
    } else {
        None
    }
}

/// Shuffle the candidates (Fisher-Yates) and return the first one that passes
/// the selection checks, giving a uniform pick among the valid ones.
pub fn select_fresh<'c, R: Rng + ?Sized>(
    candidates: &'c [TemplateCandidate],
    filter: &SourceFilter,
    assets: &dyn AssetIndex,
    rng: &mut R,
) -> Option<&'c TemplateCandidate> {
    let mut order: Vec<&TemplateCandidate> = candidates.iter().collect();
    let mut i = order.len();
    while i > 1 {
        i -= 1;
        let j = rng.gen_range(0..=i);
        order.swap(i, j);
    }

    order.into_iter().find(|candidate| match rejection(candidate, filter, assets) {
        Some(reason) => {
            debug!(template = %candidate.key, "skipping template ({reason})");
            false
        }
        None => true,
    })
}

/// FNV-1a over both keys, case-folded.
fn voice_seed(npc: &FormKey, template: &FormKey) -> u64 {
    let text = format!("{npc}|{template}").to_ascii_lowercase();
    text.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(0x0000_0100_0000_01b3)
    })
}

fn is_player_or_preset(npc: &Npc) -> bool {
    npc.editor_id.as_deref().is_some_and(|id| {
        id.eq_ignore_ascii_case("player") || id.to_ascii_lowercase().contains("preset")
    })
}

fn contains_source(list: &[String], source: &str) -> bool {
    list.iter().any(|s| s.eq_ignore_ascii_case(source))
}

/// Assigns templates to every patchable NPC in a single pass.
pub struct AssignmentEngine<'a> {
    pub settings: &'a PatcherSettings,
    pub load_order: &'a LoadOrder,
    pub groups: &'a BTreeSet<String>,
    pub graph: &'a CompatibilityGraph,
    pub pools: &'a CandidatePools,
    pub filter: &'a SourceFilter,
    pub assets: &'a dyn AssetIndex,
    pub voices: &'a VoiceTables,
    pub parts: &'a BTreeSet<AppearancePart>,
    /// Assignments loaded from the store at the start of the run.
    pub previous: &'a Assignments,
}

impl<'a> AssignmentEngine<'a> {
    pub fn run<R: Rng + ?Sized>(&self, rng: &mut R, patch: &mut PatchMod) -> EngineOutput {
        let locks: HashMap<&FormKey, Option<&FormKey>> = self
            .settings
            .locked
            .iter()
            .map(|lock| (&lock.npc, lock.template.as_ref()))
            .collect();
        let remapper = VoiceRemapper::new(self.voices, self.load_order);

        let mut ctx = RunContext {
            committed: HashSet::new(),
            successful_by_group: HashMap::new(),
            assignments: Assignments::new(),
            copies: CopyQueue::new(),
            summary: RunSummary {
                seed: self.settings.seed,
                pool_sizes: self.pools.group_sizes(),
                skipped_templates: self.pools.skipped().to_vec(),
                ..RunSummary::default()
            },
        };
        let mut outcomes = Vec::with_capacity(self.load_order.npcs().len());

        for npc in self.load_order.npcs() {
            let outcome = match self.classify(npc, &ctx) {
                Err(reason) => {
                    ctx.summary.record_filtered(npc, reason);
                    SubjectOutcome::Filtered(reason)
                }
                Ok(race) => {
                    let lock = locks.get(&npc.key).copied();
                    self.process(npc, race, lock, &remapper, &mut ctx, rng, patch)
                }
            };
            outcomes.push((npc.key.clone(), outcome));
        }

        info!(
            "patched {} out of {} eligible NPCs",
            ctx.summary.patched_total(),
            ctx.summary.eligible
        );

        EngineOutput {
            assignments: ctx.assignments,
            copies: ctx.copies,
            summary: ctx.summary,
            outcomes,
        }
    }

    fn classify<'n>(&self, npc: &'n Npc, ctx: &RunContext) -> Result<&'n str, FilterReason> {
        let settings = self.settings;

        if ctx.committed.contains(&npc.key) {
            return Err(FilterReason::AlreadyCommitted);
        }
        if npc.has_keyword(&settings.patched_marker) {
            return Err(FilterReason::AlreadyPatched);
        }
        let race = npc.race.as_deref().ok_or(FilterReason::NoRace)?;
        if !self.groups.contains(race) {
            return Err(FilterReason::UnknownGroup);
        }
        if npc.female {
            return Err(FilterReason::Template);
        }
        if is_player_or_preset(npc) {
            return Err(FilterReason::PlayerOrPreset);
        }

        let targeted = if settings.patch_selected_only {
            settings.selected_npcs.contains(&npc.key)
        } else {
            settings.target_sources.is_empty()
                || contains_source(&settings.target_sources, &npc.key.source)
        };
        if !targeted {
            return Err(FilterReason::NotTargeted);
        }

        if contains_source(&settings.excluded_sources, &npc.key.source) {
            return Err(FilterReason::ExcludedSource);
        }
        if settings.excluded_npcs.contains(&npc.key) {
            return Err(FilterReason::ExcludedNpc);
        }
        Ok(race)
    }

    #[allow(clippy::too_many_arguments)]
    fn process<R: Rng + ?Sized>(
        &self,
        npc: &Npc,
        race: &str,
        lock: Option<Option<&FormKey>>,
        remapper: &VoiceRemapper<'_>,
        ctx: &mut RunContext,
        rng: &mut R,
        patch: &mut PatchMod,
    ) -> SubjectOutcome {
        ctx.summary.eligible += 1;
        debug!("processing {} ({}) race {}", npc.display_name(), npc.key, race);

        let mut groups = self.graph.compatible_groups(race);
        let mut candidates = self.pools.gather(&groups);
        if candidates.is_empty() && self.settings.use_default_group_fallback {
            info!(
                "no templates found for race {} for {} ({}); using default race fallback ({})",
                race,
                npc.display_name(),
                npc.key,
                self.settings.default_fallback_groups.join(", ")
            );
            groups = self
                .settings
                .default_fallback_groups
                .iter()
                .map(String::as_str)
                .collect();
            candidates = self.pools.gather(&groups);
        }

        // Whatever happens below, facegen from an earlier run must not
        // outlive this decision.
        ctx.copies
            .remove(facegeom_path(&self.settings.output_path, &npc.key));
        ctx.copies
            .remove(facetint_path(&self.settings.output_path, &npc.key));

        let locked = lock.is_some();
        if locked || self.settings.preserve_assignments {
            let remembered = lock.flatten().or_else(|| self.previous.get(&npc.key));
            let route = if locked {
                PatchRoute::LockedReuse
            } else {
                PatchRoute::PreservedReuse
            };

            match remembered {
                Some(template_key) => match self.reusable(template_key, &groups) {
                    Ok(candidate) if candidate.usable() => {
                        info!(
                            "[{}] reusing template {} for {}",
                            route,
                            template_key,
                            npc.display_name()
                        );
                        return self.commit(npc, race, &candidate, route, remapper, ctx, patch);
                    }
                    Ok(_) if locked => {
                        warn!(
                            "[locked] template {} for {} ({}) has no usable facegen; leaving NPC unchanged",
                            template_key,
                            npc.display_name(),
                            npc.key
                        );
                        return self.unpatched(
                            npc,
                            UnpatchedReason::LockedTemplateUnavailable {
                                template: template_key.clone(),
                            },
                            ctx,
                        );
                    }
                    Ok(_) => info!(
                        "[{}] template {} for {} has no usable facegen; assigning a new one",
                        route,
                        template_key,
                        npc.display_name()
                    ),
                    Err(why) => info!(
                        "[{}] cached template {} is invalid for {} (race {}): {}; assigning a new one",
                        route,
                        template_key,
                        npc.display_name(),
                        race,
                        why
                    ),
                },
                None if locked => info!(
                    "[locked] no cached template for {}; assigning a new one",
                    npc.display_name()
                ),
                None => {}
            }
        }

        if let Some(candidate) = select_fresh(&candidates, self.filter, self.assets, rng) {
            let candidate = candidate.clone();
            return self.commit(
                npc,
                race,
                &candidate,
                PatchRoute::FreshSelection,
                remapper,
                ctx,
                patch,
            );
        }

        let fallback = ctx
            .successful_by_group
            .get(race)
            .and_then(|list| list.choose(rng))
            .cloned();
        if let Some(candidate) = fallback {
            info!(
                "no valid template for {}; falling back to {} used earlier this run",
                npc.display_name(),
                candidate.key
            );
            return self.commit(
                npc,
                race,
                &candidate,
                PatchRoute::RunFallback,
                remapper,
                ctx,
                patch,
            );
        }

        self.unpatched(
            npc,
            UnpatchedReason::NoCandidateAvailable {
                race: race.to_string(),
            },
            ctx,
        )
    }

    /// A remembered template is reusable while it still exists and its race is
    /// one of the groups this subject may draw from.
    fn reusable(&self, key: &FormKey, groups: &[&str]) -> Result<TemplateCandidate, String> {
        let template = self
            .load_order
            .npc(key)
            .ok_or_else(|| "template not found in the load order".to_string())?;
        let template_race = template
            .race
            .as_deref()
            .ok_or_else(|| "template has no race".to_string())?;
        if !groups.contains(&template_race) {
            return Err(format!("template race {} is not compatible", template_race));
        }

        Ok(self.pools.find(key).cloned().unwrap_or_else(|| {
            TemplateCandidate::inspect(key, template_race, self.filter, self.assets)
        }))
    }

    #[allow(clippy::too_many_arguments)]
    fn commit(
        &self,
        npc: &Npc,
        race: &str,
        candidate: &TemplateCandidate,
        route: PatchRoute,
        remapper: &VoiceRemapper<'_>,
        ctx: &mut RunContext,
        patch: &mut PatchMod,
    ) -> SubjectOutcome {
        let Some(template) = self.load_order.npc(&candidate.key) else {
            warn!("template {} vanished from the load order", candidate.key);
            return self.unpatched(
                npc,
                UnpatchedReason::NoCandidateAvailable {
                    race: race.to_string(),
                },
                ctx,
            );
        };

        let mut patched = npc.clone();
        patched.appearance.apply_from(&template.appearance, self.parts);
        patched.female = true;
        patched.height = if template.height != 0.0 {
            template.height
        } else {
            DEFAULT_HEIGHT
        };
        patched.weight = if template.weight != 0.0 {
            template.weight
        } else {
            DEFAULT_WEIGHT
        };

        if let Some(voice) = npc.voice.as_deref() {
            // Keyed on the pairing alone so a reused template keeps its voice.
            let mut voice_rng = StdRng::seed_from_u64(voice_seed(&npc.key, &candidate.key));
            match remapper.remap(voice, race, &mut voice_rng) {
                VoiceRemap::Mapped(new) | VoiceRemap::Fallback(new) => {
                    debug!("swapped voice for {} from {} to {}", npc.display_name(), voice, new);
                    patched.voice = Some(new);
                    ctx.summary.voices_changed += 1;
                }
                VoiceRemap::Unavailable(wanted) => debug!(
                    "voice {} for {} is not in the load order; keeping {}",
                    wanted,
                    npc.display_name(),
                    voice
                ),
                VoiceRemap::NoMapping => debug!(
                    "no voice mapping for {} (race {}); keeping {}",
                    npc.display_name(),
                    race,
                    voice
                ),
                VoiceRemap::AlreadyTarget => {}
            }
        }

        let marker = &self.settings.patched_marker;
        if !patched.has_keyword(marker) {
            patched.keywords.push(marker.clone());
        }

        let geom_dest = facegeom_path(&self.settings.output_path, &npc.key);
        let tint_dest = facetint_path(&self.settings.output_path, &npc.key);
        if candidate.assets_ok() {
            let data = &self.settings.data_path;
            let geom_src = self
                .assets
                .geometry_path(&candidate.key)
                .unwrap_or_else(|| facegeom_path(data, &candidate.key));
            let tint_src = self
                .assets
                .texture_path(&candidate.key)
                .unwrap_or_else(|| facetint_path(data, &candidate.key));
            ctx.copies.copy(geom_src, geom_dest);
            ctx.copies.copy(tint_src, tint_dest);
        } else {
            // Trusted templates: the game supplies the facegen.
            if let Some(dir) = geom_dest.parent() {
                ctx.copies.ensure_dir(dir.to_path_buf());
            }
            if let Some(dir) = tint_dest.parent() {
                ctx.copies.ensure_dir(dir.to_path_buf());
            }
            info!(
                "assumed vanilla facegen for template {} ({})",
                template.display_name(),
                candidate.key
            );
        }

        ctx.assignments
            .insert(npc.key.clone(), candidate.key.clone());
        if route != PatchRoute::RunFallback {
            ctx.successful_by_group
                .entry(race.to_string())
                .or_default()
                .push(candidate.clone());
        }
        ctx.committed.insert(npc.key.clone());
        ctx.summary.record_patched(route);
        patch.set_override(patched);

        info!(
            "patched: {} ({}) using {} ({}) [{}]",
            npc.display_name(),
            npc.key,
            template.display_name(),
            candidate.key,
            route
        );
        SubjectOutcome::Patched {
            template: candidate.key.clone(),
            route,
        }
    }

    fn unpatched(&self, npc: &Npc, reason: UnpatchedReason, ctx: &mut RunContext) -> SubjectOutcome {
        info!(
            "failed to patch {} ({}): {}",
            npc.display_name(),
            npc.key,
            reason
        );
        ctx.summary
            .unpatched
            .push((format!("{} ({})", npc.display_name(), npc.key), reason.clone()));
        SubjectOutcome::Unpatched(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{female, groups, male, StaticAssets};
    use crate::record::TintLayer;
    use crate::store::LockSpec;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    struct World {
        settings: PatcherSettings,
        load_order: LoadOrder,
        groups: BTreeSet<String>,
        graph: CompatibilityGraph,
        filter: SourceFilter,
        assets: StaticAssets,
        voices: VoiceTables,
        parts: BTreeSet<AppearancePart>,
    }

    impl World {
        fn new(npcs: Vec<Npc>) -> Self {
            let load_order = LoadOrder::new(
                vec!["A".into(), "B".into(), "C".into()],
                vec!["FemaleCommander".into()],
                npcs,
            );
            let graph = CompatibilityGraph::resolve(
                &[
                    ("A".to_string(), vec!["A".to_string(), "B".to_string()]),
                    ("B".to_string(), vec!["A".to_string(), "B".to_string()]),
                ],
                load_order.races(),
            )
            .unwrap();
            let assets = StaticAssets::all_present(load_order.npcs());
            let mut voices = VoiceTables::default();
            voices
                .voice_map
                .insert("MaleGuard".into(), vec!["FemaleCommander".into()]);
            Self {
                settings: PatcherSettings::default(),
                load_order,
                groups: groups(&["A", "B", "C"]),
                graph,
                filter: SourceFilter::default(),
                assets,
                voices,
                parts: AppearancePart::ALL.into_iter().collect(),
            }
        }

        fn run(&self, previous: &Assignments, seed: u64) -> (EngineOutput, PatchMod) {
            let pools = CandidatePools::build(
                &self.load_order,
                &self.groups,
                &self.filter,
                &self.assets,
                &self.settings.patched_marker,
            );
            let engine = AssignmentEngine {
                settings: &self.settings,
                load_order: &self.load_order,
                groups: &self.groups,
                graph: &self.graph,
                pools: &pools,
                filter: &self.filter,
                assets: &self.assets,
                voices: &self.voices,
                parts: &self.parts,
                previous,
            };
            let mut patch = PatchMod::new("Patch.esp");
            let mut rng = StdRng::seed_from_u64(seed);
            let output = engine.run(&mut rng, &mut patch);
            (output, patch)
        }
    }

    fn key(id: u32) -> FormKey {
        FormKey::new(id, "Mods.esp")
    }

    fn outcome_of(output: &EngineOutput, k: &FormKey) -> SubjectOutcome {
        output
            .outcomes
            .iter()
            .find(|(key, _)| key == k)
            .map(|(_, o)| o.clone())
            .unwrap()
    }

    fn template_of(output: &EngineOutput, k: &FormKey) -> Option<FormKey> {
        match outcome_of(output, k) {
            SubjectOutcome::Patched { template, .. } => Some(template),
            _ => None,
        }
    }

    fn example_world() -> World {
        World::new(vec![
            female(1, "Mods.esp", "A"),
            female(2, "Mods.esp", "A"),
            female(3, "Mods.esp", "B"),
            male(0x10, "Mods.esp", "B"),
            male(0x11, "Mods.esp", "A"),
        ])
    }

    #[test]
    fn compatible_templates_only() {
        let world = example_world();
        let mut seen_for_b = BTreeSet::new();
        for seed in 0..64 {
            let (output, _) = world.run(&Assignments::new(), seed);
            let b = template_of(&output, &key(0x10)).unwrap();
            let a = template_of(&output, &key(0x11)).unwrap();
            assert!([key(1), key(2), key(3)].contains(&b));
            assert!([key(1), key(2), key(3)].contains(&a));
            seen_for_b.insert(b);
        }
        // Every reachable candidate gets picked at some point.
        assert_eq!(seen_for_b.len(), 3);
    }

    #[test]
    fn group_without_entry_only_uses_itself() {
        let mut world = World::new(vec![
            female(1, "Mods.esp", "A"),
            female(4, "Mods.esp", "C"),
            male(0x10, "Mods.esp", "C"),
        ]);
        world.graph = CompatibilityGraph::resolve(
            &[("A".to_string(), vec!["A".to_string()])],
            world.load_order.races(),
        )
        .unwrap();
        for seed in 0..16 {
            let (output, _) = world.run(&Assignments::new(), seed);
            assert_eq!(template_of(&output, &key(0x10)), Some(key(4)));
        }
    }

    #[test]
    fn blacklisted_source_is_never_selected() {
        let candidates = vec![
            TemplateCandidate {
                key: FormKey::new(1, "Banned.esp"),
                group: "A".into(),
                geometry_exists: true,
                texture_exists: true,
                trusted: false,
            },
            TemplateCandidate {
                key: FormKey::new(2, "Fine.esp"),
                group: "A".into(),
                geometry_exists: true,
                texture_exists: true,
                trusted: false,
            },
        ];
        let filter = SourceFilter::new(&["Banned.esp".to_string()], &[]);
        let assets = StaticAssets::default();
        for seed in 0..32 {
            let mut rng = StdRng::seed_from_u64(seed);
            let chosen = select_fresh(&candidates, &filter, &assets, &mut rng).unwrap();
            assert_eq!(chosen.key, FormKey::new(2, "Fine.esp"));
        }
    }

    #[test]
    fn packed_archive_sources_are_rejected() {
        let mut world = World::new(vec![
            female(1, "Packed.esp", "A"),
            female(2, "Mods.esp", "A"),
            male(0x10, "Mods.esp", "A"),
        ]);
        world.assets.archives.insert("Packed.esp".to_string());
        for seed in 0..16 {
            let (output, _) = world.run(&Assignments::new(), seed);
            assert_eq!(template_of(&output, &key(0x10)), Some(key(2)));
        }
    }

    #[test]
    fn preserve_mode_reuses_previous_assignment() {
        let mut world = example_world();
        world.settings.preserve_assignments = true;
        let mut previous = Assignments::new();
        previous.insert(key(0x10), key(2));

        for seed in 0..16 {
            let (output, _) = world.run(&previous, seed);
            assert_eq!(
                outcome_of(&output, &key(0x10)),
                SubjectOutcome::Patched {
                    template: key(2),
                    route: PatchRoute::PreservedReuse
                }
            );
        }
    }

    #[test]
    fn preserve_mode_discards_unreachable_assignment() {
        let mut world = World::new(vec![
            female(1, "Mods.esp", "A"),
            female(4, "Mods.esp", "C"),
            male(0x10, "Mods.esp", "A"),
        ]);
        world.settings.preserve_assignments = true;
        let mut previous = Assignments::new();
        previous.insert(key(0x10), key(4));

        let (output, _) = world.run(&previous, 7);
        assert_eq!(
            outcome_of(&output, &key(0x10)),
            SubjectOutcome::Patched {
                template: key(1),
                route: PatchRoute::FreshSelection
            }
        );
    }

    #[test]
    fn second_preserving_run_is_identical() {
        let mut world = example_world();
        world.settings.preserve_assignments = true;

        let (first, first_patch) = world.run(&Assignments::new(), 11);
        let (second, second_patch) = world.run(&first.assignments, 99);

        assert_eq!(first.assignments, second.assignments);
        assert_eq!(first_patch.records, second_patch.records);
    }

    #[test]
    fn preserving_rerun_keeps_rolled_voices() {
        let mut brute = male(0x10, "Mods.esp", "B");
        brute.voice = Some("MaleBrute".into());
        let mut nord = male(0x11, "Mods.esp", "A");
        nord.voice = Some("MaleNord".into());
        let mut world = World::new(vec![
            female(1, "Mods.esp", "A"),
            female(2, "Mods.esp", "A"),
            female(3, "Mods.esp", "B"),
            brute,
            nord,
        ]);
        world.load_order = LoadOrder::new(
            vec!["A".into(), "B".into(), "C".into()],
            vec![
                "FemaleCommander".into(),
                "FemaleSultry".into(),
                "FemaleNord".into(),
                "FemaleEvenToned".into(),
            ],
            world.load_order.npcs().to_vec(),
        );
        world.voices.voice_map.insert(
            "MaleBrute".into(),
            vec!["FemaleCommander".into(), "FemaleSultry".into()],
        );
        world.voices.race_fallbacks.insert(
            "A".into(),
            vec!["FemaleNord".into(), "FemaleEvenToned".into()],
        );
        world.settings.preserve_assignments = true;

        for seed in 0..16 {
            let (first, first_patch) = world.run(&Assignments::new(), seed);
            assert_eq!(first.summary.voices_changed, 2);
            for rerun_seed in [seed, seed + 1000] {
                let (second, second_patch) = world.run(&first.assignments, rerun_seed);
                assert_eq!(first.assignments, second.assignments);
                assert_eq!(first_patch.records, second_patch.records);
            }
        }
    }

    #[test]
    fn lock_survives_pool_churn() {
        let mut world = example_world();
        world.settings.locked = vec![LockSpec::new(key(0x10))];
        let mut previous = Assignments::new();
        previous.insert(key(0x10), key(3));
        // The locked template's source gets blacklisted and a new template
        // shows up; neither may move the lock.
        world.filter = SourceFilter::new(&["Mods.esp".to_string()], &[]);
        world.load_order = LoadOrder::new(
            vec!["A".into(), "B".into()],
            vec![],
            vec![
                female(1, "Mods.esp", "A"),
                female(3, "Mods.esp", "B"),
                female(5, "Other.esp", "B"),
                male(0x10, "Mods.esp", "B"),
            ],
        );
        world.assets = StaticAssets::all_present(world.load_order.npcs());

        for seed in 0..16 {
            let (output, _) = world.run(&previous, seed);
            assert_eq!(
                outcome_of(&output, &key(0x10)),
                SubjectOutcome::Patched {
                    template: key(3),
                    route: PatchRoute::LockedReuse
                }
            );
        }
    }

    #[test]
    fn pinned_lock_template_beats_store() {
        let mut world = example_world();
        world.settings.locked = vec![LockSpec {
            npc: key(0x10),
            template: Some(key(1)),
        }];
        let mut previous = Assignments::new();
        previous.insert(key(0x10), key(3));

        let (output, _) = world.run(&previous, 3);
        assert_eq!(template_of(&output, &key(0x10)), Some(key(1)));
    }

    #[test]
    fn locked_template_without_facegen_leaves_subject_unpatched() {
        let mut world = example_world();
        world.settings.locked = vec![LockSpec::new(key(0x10))];
        world.assets.textures.remove(&key(3));
        let mut previous = Assignments::new();
        previous.insert(key(0x10), key(3));

        let (output, patch) = world.run(&previous, 5);
        assert_eq!(
            outcome_of(&output, &key(0x10)),
            SubjectOutcome::Unpatched(UnpatchedReason::LockedTemplateUnavailable {
                template: key(3)
            })
        );
        assert!(patch.records.iter().all(|r| r.key != key(0x10)));
    }

    #[test]
    fn lock_without_history_gets_fresh_template_recorded() {
        let mut world = example_world();
        world.settings.locked = vec![LockSpec::new(key(0x10))];
        let (output, _) = world.run(&Assignments::new(), 8);
        assert!(output.assignments.contains_key(&key(0x10)));
    }

    #[test]
    fn default_group_fallback() {
        let mut world = World::new(vec![
            female(1, "Mods.esp", "A"),
            male(0x10, "Mods.esp", "C"),
        ]);
        let (without, _) = world.run(&Assignments::new(), 1);
        assert_eq!(
            outcome_of(&without, &key(0x10)),
            SubjectOutcome::Unpatched(UnpatchedReason::NoCandidateAvailable { race: "C".into() })
        );

        world.settings.use_default_group_fallback = true;
        world.settings.default_fallback_groups = vec!["A".into()];
        let (with, _) = world.run(&Assignments::new(), 1);
        assert_eq!(template_of(&with, &key(0x10)), Some(key(1)));
    }

    #[test]
    fn run_fallback_reuses_successful_templates() {
        // The only template turns unusable after its first pick: its source
        // reports a packed archive from the second lookup on.
        let world = World::new(vec![
            female(1, "Mods.esp", "A"),
            male(0x10, "Mods.esp", "A"),
            male(0x11, "Mods.esp", "A"),
        ]);
        let pools = CandidatePools::build(
            &world.load_order,
            &world.groups,
            &world.filter,
            &world.assets,
            &world.settings.patched_marker,
        );

        struct FlakyAssets<'a> {
            inner: &'a StaticAssets,
            calls: std::cell::Cell<usize>,
        }
        impl AssetIndex for FlakyAssets<'_> {
            fn geometry_path(&self, key: &FormKey) -> Option<PathBuf> {
                self.inner.geometry_path(key)
            }
            fn texture_path(&self, key: &FormKey) -> Option<PathBuf> {
                self.inner.texture_path(key)
            }
            fn archive_exists(&self, _source: &str) -> bool {
                let n = self.calls.get();
                self.calls.set(n + 1);
                n > 0
            }
        }
        let previous = Assignments::new();
        let flaky = FlakyAssets {
            inner: &world.assets,
            calls: std::cell::Cell::new(0),
        };

        let engine = AssignmentEngine {
            settings: &world.settings,
            load_order: &world.load_order,
            groups: &world.groups,
            graph: &world.graph,
            pools: &pools,
            filter: &world.filter,
            assets: &flaky,
            voices: &world.voices,
            parts: &world.parts,
            previous: &previous,
        };
        let mut patch = PatchMod::new("Patch.esp");
        let output = engine.run(&mut StdRng::seed_from_u64(0), &mut patch);

        assert_eq!(
            outcome_of(&output, &key(0x10)),
            SubjectOutcome::Patched {
                template: key(1),
                route: PatchRoute::FreshSelection
            }
        );
        assert_eq!(
            outcome_of(&output, &key(0x11)),
            SubjectOutcome::Patched {
                template: key(1),
                route: PatchRoute::RunFallback
            }
        );
    }

    #[test]
    fn filters_are_classified() {
        let mut player = male(0x20, "Mods.esp", "A");
        player.editor_id = Some("Player".into());
        let mut preset = male(0x21, "Mods.esp", "A");
        preset.editor_id = Some("CharGenPresetNord".into());
        let mut done = male(0x22, "Mods.esp", "A");
        done.keywords.push(PatcherSettings::default().patched_marker);
        let mut no_race = male(0x23, "Mods.esp", "A");
        no_race.race = None;

        let mut world = World::new(vec![
            female(1, "Mods.esp", "A"),
            player,
            preset,
            done,
            no_race,
            male(0x24, "Mods.esp", "Unknown"),
            male(0x25, "Excluded.esp", "A"),
            male(0x26, "Mods.esp", "A"),
            male(0x27, "Mods.esp", "A"),
        ]);
        world.settings.excluded_sources = vec!["excluded.esp".into()];
        world.settings.excluded_npcs = vec![key(0x26)];

        let (output, _) = world.run(&Assignments::new(), 2);
        let expect = [
            (key(1), FilterReason::Template),
            (key(0x20), FilterReason::PlayerOrPreset),
            (key(0x21), FilterReason::PlayerOrPreset),
            (key(0x22), FilterReason::AlreadyPatched),
            (key(0x23), FilterReason::NoRace),
            (key(0x24), FilterReason::UnknownGroup),
            (FormKey::new(0x25, "Excluded.esp"), FilterReason::ExcludedSource),
            (key(0x26), FilterReason::ExcludedNpc),
        ];
        for (k, reason) in expect {
            assert_eq!(outcome_of(&output, &k), SubjectOutcome::Filtered(reason), "{}", k);
        }
        assert!(matches!(
            outcome_of(&output, &key(0x27)),
            SubjectOutcome::Patched { .. }
        ));
        assert_eq!(output.summary.eligible, 1);
        assert_eq!(output.summary.excluded_by_source.get("Excluded.esp"), Some(&1));
        assert_eq!(output.summary.excluded_by_source.get("Mods.esp"), Some(&1));
    }

    #[test]
    fn target_sources_and_selection_mode() {
        let mut world = World::new(vec![
            female(1, "Mods.esp", "A"),
            male(0x10, "Mods.esp", "A"),
            male(0x11, "Target.esp", "A"),
        ]);
        world.settings.target_sources = vec!["Target.esp".into()];
        let (output, _) = world.run(&Assignments::new(), 1);
        assert_eq!(
            outcome_of(&output, &key(0x10)),
            SubjectOutcome::Filtered(FilterReason::NotTargeted)
        );
        assert!(template_of(&output, &FormKey::new(0x11, "Target.esp")).is_some());

        world.settings.patch_selected_only = true;
        world.settings.selected_npcs = vec![key(0x10)];
        let (output, _) = world.run(&Assignments::new(), 1);
        assert!(template_of(&output, &key(0x10)).is_some());
        assert_eq!(
            outcome_of(&output, &FormKey::new(0x11, "Target.esp")),
            SubjectOutcome::Filtered(FilterReason::NotTargeted)
        );
    }

    #[test]
    fn every_reachable_subject_reaches_a_terminal_state() {
        let world = World::new(vec![
            female(1, "Mods.esp", "A"),
            male(0x10, "Mods.esp", "A"),
            male(0x11, "Mods.esp", "B"),
            male(0x12, "Mods.esp", "C"),
        ]);
        let (output, _) = world.run(&Assignments::new(), 4);
        let patched = output
            .outcomes
            .iter()
            .filter(|(_, o)| matches!(o, SubjectOutcome::Patched { .. }))
            .count();
        let unpatched = output
            .outcomes
            .iter()
            .filter(|(_, o)| matches!(o, SubjectOutcome::Unpatched(_)))
            .count();
        assert_eq!(patched, 2);
        assert_eq!(unpatched, 1);
        assert_eq!(output.summary.eligible, patched + unpatched);
        assert_eq!(output.summary.unpatched.len(), 1);
    }

    #[test]
    fn patched_record_takes_template_appearance() {
        let mut template = female(1, "Mods.esp", "A");
        template.appearance.head_parts = vec![FormKey::new(0x50, "Heads.esp")];
        template.appearance.tint_layers = vec![TintLayer {
            index: 3,
            color: [1, 2, 3, 255],
            interpolation: 0.5,
            preset: None,
        }];
        template.height = 0.0;
        template.weight = 20.0;
        let mut subject = male(0x10, "Mods.esp", "A");
        subject.voice = Some("MaleGuard".into());

        let mut world = World::new(vec![template.clone(), subject]);
        world.parts = [AppearancePart::HeadParts, AppearancePart::TintLayers]
            .into_iter()
            .collect();
        let (output, patch) = world.run(&Assignments::new(), 1);

        let patched = &patch.records[0];
        assert!(patched.female);
        assert_eq!(patched.appearance.head_parts, template.appearance.head_parts);
        assert_eq!(patched.appearance.tint_layers, template.appearance.tint_layers);
        assert_eq!(patched.height, DEFAULT_HEIGHT);
        assert_eq!(patched.weight, 20.0);
        assert_eq!(patched.voice.as_deref(), Some("FemaleCommander"));
        assert!(patched.has_keyword(&world.settings.patched_marker));
        assert_eq!(output.summary.voices_changed, 1);

        let copies: BTreeMap<_, _> = output.copies.copies().iter().cloned().collect();
        assert_eq!(copies.len(), 2);
        let tint_src = world.assets.texture_path(&key(1)).unwrap();
        assert!(copies.contains_key(&world.assets.geometry_path(&key(1)).unwrap()));
        assert_eq!(
            copies[&tint_src],
            facetint_path(&world.settings.output_path, &key(0x10))
        );
    }

    #[test]
    fn trusted_template_queues_no_copies() {
        let mut world = World::new(vec![
            female(1, "Skyrim.esm", "A"),
            male(0x10, "Mods.esp", "A"),
        ]);
        world.assets = StaticAssets::default();
        world.filter = SourceFilter::new(&[], &[crate::pool::TrustedSource::new("A", "Skyrim.esm")]);
        let (output, _) = world.run(&Assignments::new(), 1);
        assert_eq!(
            template_of(&output, &key(0x10)),
            Some(FormKey::new(1, "Skyrim.esm"))
        );
        assert!(output.copies.copies().is_empty());
    }
}
