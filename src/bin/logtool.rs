use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use fieldcam::{
    actuators,
    analyzer::{pairwise_magnitudes, MagnitudeStats},
    camera::{self, FrameSource},
    config::FieldcamConfig,
    logstore::{DurableLogStore, LogEntry, LogTable},
    params::ParameterStore,
    uplink::UploadQueue,
};
use serde::Serialize;
use tracing::info;

/// Inspect and repair a node's log store and upload queue, and calibrate
/// its motion thresholds.
#[derive(Parser, Debug)]
#[command(name = "logtool")]
#[command(about = "Inspect the fieldcam log store and upload queue, calibrate thresholds")]
struct Args {
    /// Path to fieldcam configuration file (for storage settings)
    #[arg(short = 'c', long, default_value = "fieldcam.toml")]
    config: PathBuf,

    /// Log store path; overrides the configured one
    #[arg(long)]
    database: Option<PathBuf>,

    /// Print JSON instead of text
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Entries still awaiting delivery, both tables
    Pending,
    /// Every entry of one table
    List {
        /// capture or upload
        table: LogTable,
    },
    /// Settle entries by datestamp
    MarkDone {
        table: LogTable,
        #[arg(required = true)]
        datestamps: Vec<String>,
    },
    /// Frames waiting in events/
    Queue,
    /// Magnitude statistics of a quiet scene, for choosing thresholds
    Calibrate {
        /// Force night mode instead of following sunrise and sunset
        #[arg(long)]
        night: bool,
    },
}

#[derive(Serialize)]
struct EntryView<'a> {
    table: String,
    datestamp: &'a str,
    log_type: String,
    pending: bool,
    message: &'a str,
}

impl<'a> From<&'a LogEntry> for EntryView<'a> {
    fn from(entry: &'a LogEntry) -> Self {
        Self {
            table: entry.table.to_string(),
            datestamp: &entry.datestamp,
            log_type: entry.category.to_string(),
            pending: entry.pending,
            message: &entry.message,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = FieldcamConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;

    match args.command {
        Command::Pending => {
            let store = open_store(&args.database, &config).await?;
            let pending = store.pending().await?;
            let entries: Vec<&LogEntry> = pending.capture.iter().chain(pending.upload.iter()).collect();
            print_entries(&entries, args.json)?;
        }
        Command::List { table } => {
            let store = open_store(&args.database, &config).await?;
            let entries = store.entries(table).await?;
            print_entries(&entries.iter().collect::<Vec<_>>(), args.json)?;
        }
        Command::MarkDone { table, datestamps } => {
            let store = open_store(&args.database, &config).await?;
            let targets: Vec<LogEntry> = store
                .entries(table)
                .await?
                .into_iter()
                .filter(|e| e.pending && datestamps.contains(&e.datestamp))
                .collect();
            let unknown: Vec<&String> = datestamps
                .iter()
                .filter(|d| !targets.iter().any(|e| &e.datestamp == *d))
                .collect();
            for datestamp in &unknown {
                eprintln!("No pending entry {} in {}", datestamp, table);
            }
            let settled = store.mark_done(&targets).await?;
            println!("Marked {} entr{} done in {}", settled, if settled == 1 { "y" } else { "ies" }, table);
        }
        Command::Queue => print_queue(&config, args.json).await?,
        Command::Calibrate { night } => calibrate(&config, night, args.json).await?,
    }

    Ok(())
}

async fn open_store(database: &Option<PathBuf>, config: &FieldcamConfig) -> Result<DurableLogStore> {
    let db_path = database
        .clone()
        .unwrap_or_else(|| config.storage.database_path());
    if !db_path.exists() {
        return Err(anyhow!("No log store at {}", db_path.display()));
    }
    DurableLogStore::open(&db_path, config.storage.lock_timeout())
        .await
        .with_context(|| format!("Failed to open {}", db_path.display()))
}

fn print_entries(entries: &[&LogEntry], json: bool) -> Result<()> {
    if json {
        let views: Vec<EntryView> = entries.iter().map(|e| EntryView::from(*e)).collect();
        println!("{}", serde_json::to_string_pretty(&views)?);
    } else if entries.is_empty() {
        println!("No entries");
    } else {
        for entry in entries {
            println!("{:<12} {}", entry.table.table_name(), entry);
        }
    }
    Ok(())
}

async fn print_queue(config: &FieldcamConfig, json: bool) -> Result<()> {
    let queue = UploadQueue::new(config.storage.events_dir());
    let pending = queue
        .pending_frames()
        .await
        .context("Failed to read the upload queue")?;

    if json {
        let map: serde_json::Map<String, serde_json::Value> = pending
            .into_iter()
            .map(|(event, frames)| (event, serde_json::json!(frames)))
            .collect();
        println!("{}", serde_json::to_string_pretty(&map)?);
        return Ok(());
    }

    if pending.is_empty() {
        println!("Upload queue is empty");
    }
    for (event, frames) in pending {
        println!("{}  {} frame(s)", event, frames.len());
    }
    Ok(())
}

/// Capture one motion check plus one recording worth of frames and report the
/// spread of consecutive-pair magnitudes. Run against an empty scene.
async fn calibrate(config: &FieldcamConfig, force_night: bool, json: bool) -> Result<()> {
    let tz = config.node.tz()?;
    let params = ParameterStore::load(
        &config.storage.params_cache_path(),
        config.node.defaults.clone(),
    )
    .await
    .snapshot();
    let night = force_night || !params.is_sunlight(Utc::now(), tz);

    let source = FrameSource::new(
        camera::opener_from_config(&config.camera)?,
        actuators::from_config(&config.actuators),
        config.camera.warm_up_frames,
    );
    let count = params.motion_interval + params.video_interval;
    let fps = params.frames_per_sec;
    info!(
        "Calibrating on {} with {} frames ({} mode)",
        source.describe(),
        count,
        if night { "night" } else { "day" }
    );

    let frames = tokio::task::spawn_blocking(move || {
        let mut session = source.open(night)?;
        let frames = session.capture_n(count, fps);
        session.close();
        frames
    })
    .await
    .context("Capture task failed")?
    .context("Failed to capture calibration frames")?;

    let magnitudes = pairwise_magnitudes(&frames)?;
    let stats = MagnitudeStats::from_magnitudes(&magnitudes)
        .ok_or_else(|| anyhow!("Need at least 3 frames, captured {}", frames.len()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!("{}", stats);
        println!(
            "Current thresholds: day {:.1}, night {:.1}",
            params.day_threshold, params.night_threshold
        );
    }
    Ok(())
}
