use anyhow::{Context, Result};
use clap::Parser;
use fieldcam::{Collaborators, FieldcamConfig, FieldcamOrchestrator, RunMode};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;

#[derive(Parser, Debug)]
#[command(name = "fieldcam")]
#[command(about = "Field camera node with motion confirmation and power-aware uplink")]
#[command(version)]
#[command(long_about = "Runs the capture loop (trigger wait, motion probe, recording, \
classification) and the uplink loop (oldest-first frame delivery, backoff, radio power) \
of a solar powered field camera. Both loops share an on-disk queue and a SQLite log store, \
so they can run in one process or as two services.")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "fieldcam.toml", help = "Path to TOML configuration file")]
    config: String,

    /// Loops to run in this process
    #[arg(short, long, value_enum, default_value_t = RunMode::All)]
    mode: RunMode,

    /// Enable debug logging (most verbose)
    #[arg(short, long, help = "Enable debug level logging")]
    debug: bool,

    /// Enable verbose logging (info level)
    #[arg(short, long, help = "Enable verbose info level logging")]
    verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(short, long, help = "Enable quiet mode - only log errors")]
    quiet: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration file and exit without starting the node")]
    validate_config: bool,

    /// Print default configuration and exit
    #[arg(long, help = "Print default configuration in TOML format and exit")]
    print_config: bool,

    /// Dry run mode - initialize but don't start the loops
    #[arg(long, help = "Prepare storage and the log store, then exit")]
    dry_run: bool,

    /// Synthetic camera and in-memory remote; nothing leaves the node
    #[arg(long)]
    offline: bool,

    /// Override log format (json, pretty, compact)
    #[arg(long, value_name = "FORMAT", help = "Log output format: json, pretty, or compact")]
    log_format: Option<String>,

    /// Also write daily rotated log files to this directory
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        print_default_config()?;
        return Ok(());
    }

    let _guard = init_logging(&args)?;

    info!("Starting fieldcam v{} ({} mode)", env!("CARGO_PKG_VERSION"), args.mode);
    info!("Configuration file: {}", args.config);

    let config = match FieldcamConfig::load_from_file(&args.config) {
        Ok(config) => {
            info!("Configuration loaded successfully from: {}", args.config);
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    if args.validate_config {
        match config.validate() {
            Ok(()) => {
                info!("Configuration validation successful");
                println!("✓ Configuration is valid");
                return Ok(());
            }
            Err(e) => {
                error!("Configuration validation failed: {}", e);
                eprintln!("✗ Configuration validation failed: {}", e);
                std::process::exit(1);
            }
        }
    }

    let mut orchestrator = if args.offline {
        info!("Offline mode - synthetic camera, no remote traffic");
        let collaborators = Collaborators::offline(&config);
        FieldcamOrchestrator::with_collaborators(config, args.mode, collaborators)
    } else {
        FieldcamOrchestrator::new(config, args.mode)
            .context("Failed to create orchestrator")?
    };

    orchestrator.initialize().await.map_err(|e| {
        error!("Failed to initialize node: {}", e);
        e
    })?;

    if args.dry_run {
        info!("Dry run mode - storage prepared but loops not started");
        println!("✓ Dry run completed successfully - storage and log store ready");
        return Ok(());
    }

    orchestrator.start().await.map_err(|e| {
        error!("Failed to start node: {}", e);
        e
    })?;

    let exit_code = orchestrator.run().await.map_err(|e| {
        error!("Node error during execution: {}", e);
        e
    })?;

    info!("Fieldcam exited with code: {}", exit_code);

    // Exit code is reported to systemd
    std::process::exit(exit_code);
}

fn init_logging(args: &Args) -> Result<Option<WorkerGuard>> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else if args.quiet {
        "error"
    } else {
        "warn"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("fieldcam={}", log_level)));

    let fmt_layer = match args.log_format.as_deref() {
        Some("json") => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        Some("compact") => fmt::layer()
            .compact()
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .boxed(),
        Some("pretty") | None => fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_ids(args.debug)
            .with_file(args.debug)
            .with_line_number(args.debug)
            .boxed(),
        Some(format) => {
            eprintln!("Warning: Unknown log format '{}', using default", format);
            fmt::layer()
                .with_target(true)
                .with_thread_ids(args.debug)
                .with_file(args.debug)
                .with_line_number(args.debug)
                .boxed()
        }
    };

    // Unattended nodes keep a local trail for the field visit
    let (file_layer, guard) = match &args.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Cannot create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "fieldcam.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_target(true)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(file_layer)
        .with(env_filter)
        .init();

    Ok(guard)
}

/// Print default configuration in TOML format
fn print_default_config() -> Result<()> {
    println!("# Fieldcam Configuration File");
    println!("# This is the default configuration with all available options.");
    println!("# [node.defaults] is used until the site supplies parameters.");
    println!();

    let rendered = toml::to_string_pretty(&FieldcamConfig::default())
        .context("Failed to render default configuration")?;
    println!("{}", rendered);
    Ok(())
}
