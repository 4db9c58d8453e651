use clap::Parser;
use rand::Rng;
use std::path::PathBuf;
use tracing::info;

use patcher_core::config::write_default_config;
use patcher_core::record::FormKey;
use patcher_core::store::LockSpec;
use patcher_core::{run, PatcherSettings};

#[derive(Debug, Parser)]
#[command(
    name = "appearance-patcher",
    version,
    about = "Assigns female appearance templates to male NPCs and splits the resulting patch"
)]
struct Args {
    /// JSON settings document; flags given on the command line override it.
    #[arg(long, value_name = "JSON")]
    settings: Option<PathBuf>,

    /// Write any missing default configuration files into --config and exit.
    #[arg(long)]
    init_config: bool,

    #[arg(long)]
    data: Option<PathBuf>,

    #[arg(long)]
    load_order: Option<PathBuf>,

    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    output: Option<PathBuf>,

    /// Assignment store; defaults to assignments.json in the output folder.
    #[arg(long)]
    store: Option<PathBuf>,

    /// Random when neither this nor the settings file provides one.
    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    output_name: Option<String>,

    /// Suffix for the output plugin name; without a value the current
    /// local time is used.
    #[arg(long, num_args = 0..=1, default_missing_value = "")]
    suffix: Option<String>,

    /// Reuse templates recorded by earlier runs.
    #[arg(long)]
    preserve: bool,

    #[arg(long)]
    no_default_fallback: bool,

    /// Only patch these NPCs (FormKey, e.g. 01A2B3:Skyrim.esm).
    #[arg(long = "select", value_delimiter = ',')]
    selected: Vec<FormKey>,

    /// NPC[=TEMPLATE]; without a template the stored one is kept.
    #[arg(long = "lock", value_parser = parse_lock)]
    locked: Vec<LockSpec>,

    /// Plugins whose templates are never used.
    #[arg(long, value_delimiter = ',')]
    blacklist: Vec<String>,

    /// Only patch NPCs from these plugins.
    #[arg(long = "target-source", value_delimiter = ',')]
    target_sources: Vec<String>,

    #[arg(long = "exclude-source", value_delimiter = ',')]
    excluded_sources: Vec<String>,

    #[arg(long = "exclude-npc", value_delimiter = ',')]
    excluded_npcs: Vec<FormKey>,

    #[arg(long)]
    flag_compact: bool,

    #[arg(long)]
    master_cap: Option<usize>,

    #[arg(long, default_value_t = false)]
    debug: bool,
}

fn parse_lock(text: &str) -> Result<LockSpec, String> {
    match text.split_once('=') {
        Some((npc, template)) => Ok(LockSpec {
            npc: npc.parse().map_err(|e| format!("{e}"))?,
            template: Some(template.parse().map_err(|e| format!("{e}"))?),
        }),
        None => Ok(LockSpec::new(text.parse().map_err(|e| format!("{e}"))?)),
    }
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_target(false)
        .init();
}

fn load_settings(args: &Args) -> Result<PatcherSettings, String> {
    let mut settings = match &args.settings {
        Some(path) => {
            let data = std::fs::read_to_string(path)
                .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
            serde_json::from_str(&data)
                .map_err(|e| format!("cannot parse {}: {e}", path.display()))?
        }
        None => PatcherSettings {
            seed: rand::thread_rng().gen(),
            ..PatcherSettings::default()
        },
    };

    if let Some(seed) = args.seed {
        settings.seed = seed;
    }
    if let Some(data) = &args.data {
        settings.data_path = data.clone();
    }
    if let Some(load_order) = &args.load_order {
        settings.load_order_path = load_order.clone();
    }
    if let Some(config) = &args.config {
        settings.config_dir = config.clone();
    }
    if let Some(output) = &args.output {
        settings.output_path = output.clone();
    }
    if let Some(store) = &args.store {
        settings.store_path = Some(store.clone());
    }
    if let Some(name) = &args.output_name {
        settings.output_name = name.clone();
    }
    match args.suffix.as_deref() {
        Some("") => {
            settings.output_suffix = Some(chrono::Local::now().format("%Y%m%d_%H%M").to_string())
        }
        Some(suffix) => settings.output_suffix = Some(suffix.to_string()),
        None => {}
    }
    if let Some(cap) = args.master_cap {
        settings.master_cap = cap;
    }

    settings.preserve_assignments |= args.preserve;
    settings.flag_compact |= args.flag_compact;
    settings.debug |= args.debug;
    if args.no_default_fallback {
        settings.use_default_group_fallback = false;
    }
    if !args.selected.is_empty() {
        settings.patch_selected_only = true;
        settings.selected_npcs.extend(args.selected.iter().cloned());
    }
    settings.locked.extend(args.locked.iter().cloned());
    settings
        .template_source_blacklist
        .extend(args.blacklist.iter().cloned());
    settings
        .target_sources
        .extend(args.target_sources.iter().cloned());
    settings
        .excluded_sources
        .extend(args.excluded_sources.iter().cloned());
    settings
        .excluded_npcs
        .extend(args.excluded_npcs.iter().cloned());

    Ok(settings)
}

fn main() {
    let args = Args::parse();
    init_tracing(args.debug);

    let settings = match load_settings(&args) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("Error: {err}");
            std::process::exit(1);
        }
    };

    if args.init_config {
        match write_default_config(&settings.config_dir) {
            Ok(created) => {
                for path in created {
                    println!("created {}", path.display());
                }
            }
            Err(err) => {
                eprintln!("Error: {err}");
                std::process::exit(1);
            }
        }
        return;
    }

    info!("seed {}", settings.seed);
    match run(&settings) {
        Ok(outcome) => println!("{}", outcome.report()),
        Err(err) => {
            eprintln!("Error: {err}");
            std::process::exit(1);
        }
    }
}
