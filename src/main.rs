//! shadow-set CLI - Create, list, expose and delete shadow copy sets

use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::Serialize;
use shadow_set::{
    default_engine, logging, BackupOptions, BackupType, DriveLetter, EngineConfig, Error,
    ExposeOutcome, Host, OperationMode, Provider, Resolution, Result, SetId, ShadowCopyEngine,
    SnapshotContext, SnapshotId, SnapshotSet, VolumeName, VolumeSelection,
};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "shadow-set")]
#[command(about = "Orchestrate Volume Shadow Copy snapshot sets", long_about = None)]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Snapshot context (backup, app-rollback, client-accessible, ... or a mask)
    #[arg(long, global = true)]
    context: Option<String>,

    /// Log protocol steps
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// List snapshot sets visible in the context
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Snapshot volumes as one set
    Create {
        /// Volumes to snapshot, e.g. C:\ D:\
        #[arg(required = true)]
        volumes: Vec<String>,
        /// Do not include the bootable system state
        #[arg(long)]
        no_system_state: bool,
        /// full, incremental, differential, log, copy, other
        #[arg(long, default_value = "full")]
        backup_type: String,
    },

    /// Expose a snapshot at a drive letter, empty directory or share
    Expose {
        /// Snapshot to expose
        snapshot_id: String,
        /// Drive letter (R:), empty directory, or share name with --remote
        target: String,
        /// Expose as a network share
        #[arg(long)]
        remote: bool,
        /// Share only this subdirectory of the snapshot (with --remote)
        #[arg(long)]
        path_from_root: Option<String>,
    },

    /// Remove a snapshot's exposure
    Unexpose {
        /// Snapshot to unexpose
        snapshot_id: String,
    },

    /// Expose every snapshot of a set on the first free drive letters
    ExposeSet {
        /// Set to expose
        set_id: String,
    },

    /// Delete every snapshot of a set
    Delete {
        /// Set to delete
        set_id: String,
        /// Delete even if snapshots are in use
        #[arg(long)]
        force: bool,
    },
}

fn info(msg: &str) {
    println!("{} {}", "[INFO]".blue(), msg);
}

fn success(msg: &str) {
    println!("{} {}", "[OK]".green(), msg);
}

fn warn(msg: &str) {
    println!("{} {}", "[WARN]".yellow(), msg);
}

fn error(msg: &str) {
    eprintln!("{} {}", "[ERROR]".red(), msg);
}

/// Everything a command needs, resolved once per invocation
struct App {
    config: EngineConfig,
    engine: std::sync::Arc<dyn ShadowCopyEngine>,
    host: Host,
}

impl App {
    fn provider(&self, mode: OperationMode) -> Result<Provider> {
        Provider::new(self.engine.as_ref(), mode, self.config.context, self.host.clone())
    }
}

#[derive(Serialize)]
struct SnapshotListing {
    snapshot_id: String,
    volume: Option<String>,
    device: Option<String>,
    exposed: Option<String>,
}

#[derive(Serialize)]
struct SetListing {
    set_id: String,
    snapshots: Vec<SnapshotListing>,
}

fn listing(set: &SnapshotSet) -> SetListing {
    SetListing {
        set_id: set.set_id().map(|id| id.to_string()).unwrap_or_default(),
        snapshots: set
            .snapshots()
            .iter()
            .map(|snap| SnapshotListing {
                snapshot_id: snap.id().to_string(),
                volume: snap.volume().map(|v| v.to_string()),
                device: snap.device_id().map(|d| d.to_string()),
                exposed: snap.exposed_path().map(str::to_string),
            })
            .collect(),
    }
}

fn cmd_list(app: &App, json: bool) -> Result<()> {
    let provider = app.provider(OperationMode::Query)?;
    let sets = provider.query_sets(Resolution::Flag)?;
    let listings: Vec<SetListing> = sets.iter().map(listing).collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&listings)?);
        return Ok(());
    }

    info(&format!("Snapshot sets in context {}:", app.config.context));
    println!();
    if listings.is_empty() {
        println!("  (no snapshot sets)");
        return Ok(());
    }
    for set in &listings {
        println!("{}", set.set_id.bold());
        println!("  {:<38} {:<8} {}", "SNAPSHOT", "VOLUME", "EXPOSED");
        for snap in &set.snapshots {
            println!(
                "  {:<38} {:<8} {}",
                snap.snapshot_id,
                snap.volume.as_deref().unwrap_or("?"),
                snap.exposed.as_deref().unwrap_or("-")
            );
        }
    }
    for set in &sets {
        for id in set.unresolved() {
            warn(&format!("Volume of snapshot {} is not mounted", id));
        }
    }
    Ok(())
}

fn cmd_create(app: &App, volumes: &[String], no_system_state: bool, backup_type: &str) -> Result<()> {
    let volumes = volumes
        .iter()
        .map(|v| VolumeName::new(v.as_str()))
        .collect::<Result<Vec<_>>>()?;
    let options = BackupOptions {
        system_state: !no_system_state,
        backup_type: backup_type.parse::<BackupType>()?,
        ..BackupOptions::default()
    };

    if !app.config.context.is_persistent() {
        warn(&format!(
            "Context {} is not persistent: the snapshots are released when this command exits",
            app.config.context
        ));
    }

    let provider = app.provider(OperationMode::Backup)?;
    let mut set = SnapshotSet::new(&provider, options)?;
    info(&format!(
        "Snapshotting {}...",
        volumes.iter().map(VolumeName::name).collect::<Vec<_>>().join(", ")
    ));
    set.create(VolumeSelection::Explicit(volumes))?;

    if let Some(set_id) = set.set_id() {
        success(&format!("Snapshot set {} created", set_id));
    }
    for snap in set.snapshots() {
        println!(
            "  {} {}",
            snap.volume().map(VolumeName::name).unwrap_or("?"),
            snap.id()
        );
    }
    Ok(())
}

/// Query every set in the context and find the one holding `snapshot`
fn find_snapshot_set(provider: &Provider, snapshot: SnapshotId) -> Result<SnapshotSet> {
    provider
        .query_sets(Resolution::Flag)?
        .into_iter()
        .find(|set| set.snapshots().iter().any(|s| s.id() == snapshot))
        .ok_or_else(|| {
            Error::Other(format!(
                "Snapshot {} not found in context {}",
                snapshot,
                provider.context()
            ))
        })
}

fn report_exposure(snapshot: SnapshotId, outcome: &ExposeOutcome) {
    match outcome {
        ExposeOutcome::Exposed(path) => success(&format!("Snapshot {} exposed at {}", snapshot, path)),
        refused => warn(&format!(
            "Snapshot {} was not exposed: {}",
            snapshot,
            refused.reason().unwrap_or_default()
        )),
    }
}

fn cmd_expose(
    app: &App,
    snapshot_id: &str,
    target: &str,
    remote: bool,
    path_from_root: Option<&str>,
) -> Result<()> {
    let snapshot_id = SnapshotId::parse(snapshot_id)?;
    let attributes = if remote {
        SnapshotContext::EXPOSED_REMOTELY
    } else {
        SnapshotContext::EXPOSED_LOCALLY
    };

    let provider = app.provider(OperationMode::Query)?;
    let mut set = find_snapshot_set(&provider, snapshot_id)?;
    let snapshot = set
        .snapshot_mut(snapshot_id)
        .ok_or_else(|| Error::Other(format!("Snapshot {} not found", snapshot_id)))?;

    info(&format!("Exposing snapshot {} at {}...", snapshot_id, target));
    let outcome = snapshot.expose(target, attributes, path_from_root)?;
    report_exposure(snapshot_id, &outcome);
    Ok(())
}

fn cmd_unexpose(app: &App, snapshot_id: &str) -> Result<()> {
    let snapshot_id = SnapshotId::parse(snapshot_id)?;
    let provider = app.provider(OperationMode::Query)?;
    let mut set = find_snapshot_set(&provider, snapshot_id)?;
    let snapshot = set
        .snapshot_mut(snapshot_id)
        .ok_or_else(|| Error::Other(format!("Snapshot {} not found", snapshot_id)))?;

    let previous = snapshot.exposed_path().map(str::to_string);
    snapshot.unexpose()?;
    match previous {
        Some(path) => success(&format!("Snapshot {} no longer exposed at {}", snapshot_id, path)),
        None => success(&format!("Snapshot {} unexposed", snapshot_id)),
    }
    Ok(())
}

/// Free letters from the pool, in pool order
fn free_letters(app: &App) -> Vec<DriveLetter> {
    app.config
        .expose_letters
        .chars()
        .filter_map(|c| DriveLetter::new(c).ok())
        .filter(|letter| !app.host.paths.drive_mounted(*letter))
        .collect()
}

fn cmd_expose_set(app: &App, set_id: &str) -> Result<()> {
    let set_id = SetId::parse(set_id)?;
    let provider = app.provider(OperationMode::Query)?;
    let mut set = SnapshotSet::new(&provider, BackupOptions::default())?;
    if !set.query(set_id, Resolution::Flag)? {
        return Err(Error::Other(format!(
            "No snapshots found for set {} in context {}",
            set_id, app.config.context
        )));
    }

    let mut letters = free_letters(app).into_iter();
    let mut exposed = 0usize;
    for snapshot in set.snapshots_mut() {
        if let Some(path) = snapshot.exposed_path() {
            info(&format!("Snapshot {} is already exposed at {}", snapshot.id(), path));
            continue;
        }
        let Some(letter) = letters.next() else {
            warn(&format!(
                "No free drive letter left in '{}' for snapshot {}",
                app.config.expose_letters,
                snapshot.id()
            ));
            continue;
        };
        let outcome = snapshot.expose(&letter.drive_spec(), SnapshotContext::EXPOSED_LOCALLY, None)?;
        if outcome.is_exposed() {
            exposed += 1;
        }
        report_exposure(snapshot.id(), &outcome);
    }

    success(&format!(
        "Exposed {} of {} snapshots in set {}",
        exposed,
        set.snapshots().len(),
        set_id
    ));
    Ok(())
}

fn cmd_delete(app: &App, set_id: &str, force: bool) -> Result<()> {
    let set_id = SetId::parse(set_id)?;
    let provider = app.provider(OperationMode::Delete)?;
    let mut set = SnapshotSet::existing(&provider, set_id, BackupOptions::default())?;

    info(&format!("Deleting snapshot set {}...", set_id));
    let deleted = set.delete(force)?;
    if deleted == 0 {
        warn(&format!("No snapshots were deleted for set {}", set_id));
    } else {
        success(&format!("Deleted {} snapshots of set {}", deleted, set_id));
    }
    Ok(())
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let mut config = EngineConfig::resolve(cli.config.as_deref())?;
    if let Some(context) = &cli.context {
        config.context = context.parse()?;
    }
    let engine = default_engine(&config)?;
    let app = App {
        config,
        engine,
        host: Host::local(),
    };

    match cli.command {
        None => cmd_list(&app, false),
        Some(Commands::List { json }) => cmd_list(&app, json),
        Some(Commands::Create {
            volumes,
            no_system_state,
            backup_type,
        }) => cmd_create(&app, &volumes, no_system_state, &backup_type),
        Some(Commands::Expose {
            snapshot_id,
            target,
            remote,
            path_from_root,
        }) => cmd_expose(&app, &snapshot_id, &target, remote, path_from_root.as_deref()),
        Some(Commands::Unexpose { snapshot_id }) => cmd_unexpose(&app, &snapshot_id),
        Some(Commands::ExposeSet { set_id }) => cmd_expose_set(&app, &set_id),
        Some(Commands::Delete { set_id, force }) => cmd_delete(&app, &set_id, force),
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error(&e.to_string());
            ExitCode::FAILURE
        }
    }
}
