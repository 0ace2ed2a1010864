//! mediascan - resumable video library scanner.
//!
//! Usage:
//!   mediascan scan [--incremental]       Scan the configured library
//!   mediascan resume                     Resume an interrupted scan
//!   mediascan status                     Show checkpoint and index state
//!   mediascan settings show|set|reset    Manage scan settings
//!   mediascan checkpoint show|clear      Inspect or drop the checkpoint
//!   mediascan --help                     Show help

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{Context, Result, bail, eyre};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use mediascan_core::{AutoPauseTimeRange, ProcessingPriority, ScanEvent};
use mediascan_engine::{
    FfprobeProbe, JsonCheckpointRepository, JsonFileIndex, LibraryConfig, MediaIndex,
    ProgressPayload, ScanOrchestrator, ScanProgressEvent, ScanSettings,
    ScanSettingsPatch, ScanState, ScanType,
};

#[derive(Parser)]
#[command(
    name = "mediascan",
    version,
    about = "Resumable, cancellable video library scanner",
    long_about = "mediascan walks your video directories, probes every file with ffprobe \
                  and keeps a JSON media index up to date.\n\n\
                  Interrupted scans resume from their checkpoint with `mediascan resume`."
)]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the index, checkpoint and settings files
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Library root; repeat for several. Overrides config and VIDEO_DIRECTORY
    #[arg(short, long = "root", global = true)]
    roots: Vec<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan the library
    Scan {
        /// Only probe new and changed files; never delete index entries
        #[arg(short, long)]
        incremental: bool,

        /// Output format for progress
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Resume the scan recorded in the checkpoint
    Resume {
        /// Output format for progress
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Show checkpoint and index state
    Status {
        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Show or change scan settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },

    /// Inspect or clear the scan checkpoint
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },
}

#[derive(Subcommand)]
enum SettingsAction {
    /// Print the current settings as JSON
    Show,
    /// Change one or more settings
    Set(SettingsArgs),
    /// Restore the defaults
    Reset,
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// Print checkpoint diagnostics as JSON
    Show,
    /// Invalidate the stored checkpoint
    Clear,
}

#[derive(Args)]
struct SettingsArgs {
    /// Files per metadata batch (1-200)
    #[arg(long)]
    batch_size: Option<usize>,

    /// Discovered files between progress events (10-1000)
    #[arg(long)]
    progress_update_interval: Option<u64>,

    /// Pause between batches in milliseconds (0-100)
    #[arg(long)]
    sleep_interval: Option<u64>,

    /// Processing priority (low, normal, high)
    #[arg(long)]
    priority: Option<ProcessingPriority>,

    /// Probes running at once (1-8)
    #[arg(long)]
    max_concurrent: Option<usize>,

    /// Memory use in MB above which batches shrink (50-2048)
    #[arg(long)]
    memory_threshold: Option<u64>,

    /// Shrink batches while CPU use is high
    #[arg(long)]
    auto_pause_on_high_cpu: Option<bool>,

    /// CPU percentage counted as high (50-95)
    #[arg(long)]
    auto_pause_threshold: Option<u8>,

    /// Hours with reduced batches, as START-END (e.g. "22-6"), or "off"
    #[arg(long)]
    quiet_hours: Option<String>,

    /// Log every batch at debug level
    #[arg(long)]
    detailed_logging: Option<bool>,

    /// Log throttle state at debug level
    #[arg(long)]
    resource_monitoring: Option<bool>,

    /// Include speed and ETA in progress events
    #[arg(long)]
    performance_metrics: Option<bool>,
}

#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Files kept in the data directory.
struct DataFiles {
    dir: PathBuf,
}

impl DataFiles {
    fn settings(&self) -> PathBuf {
        self.dir.join("settings.toml")
    }

    fn index(&self) -> PathBuf {
        self.dir.join("index.json")
    }

    fn checkpoint(&self) -> PathBuf {
        self.dir.join("checkpoint.json")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_logging(cli.verbose);

    let data = DataFiles {
        dir: match &cli.data_dir {
            Some(dir) => dir.clone(),
            None => LibraryConfig::default_data_dir()
                .ok_or_else(|| eyre!("cannot determine a data directory; pass --data-dir"))?,
        },
    };
    tracing::debug!(data_dir = %data.dir.display(), "using data directory");

    match &cli.command {
        Command::Scan {
            incremental,
            format,
        } => {
            let scan_type = if *incremental {
                ScanType::Incremental
            } else {
                ScanType::Full
            };
            let (engine, index) = open_engine(&cli, &data).await?;
            run_scan(&engine, &index, Start::New(scan_type), *format).await?;
        }
        Command::Resume { format } => {
            let (engine, index) = open_engine(&cli, &data).await?;
            run_scan(&engine, &index, Start::Resume, *format).await?;
        }
        Command::Status { format } => {
            let (engine, index) = open_engine(&cli, &data).await?;
            run_status(&engine, &index, &data, *format).await?;
        }
        Command::Settings { action } => run_settings(action, &data)?,
        Command::Checkpoint { action } => {
            let (engine, _) = open_engine(&cli, &data).await?;
            match action {
                CheckpointAction::Show => {
                    let info = engine.checkpoint_info().await?;
                    println!("{}", serde_json::to_string_pretty(&info)?);
                }
                CheckpointAction::Clear => {
                    engine.clear_checkpoint().await?;
                    eprintln!("Checkpoint cleared");
                }
            }
        }
    }

    Ok(())
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .with(filter)
        .init();
}

/// Build the library config from the config file, environment and flags.
fn load_config(cli: &Cli) -> Result<LibraryConfig> {
    let mut config = match &cli.config {
        Some(path) => LibraryConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => match LibraryConfig::default_path() {
            Some(path) => LibraryConfig::load(&path)?,
            None => LibraryConfig::default(),
        },
    }
    .with_env_overrides();

    if !cli.roots.is_empty() {
        config.roots = cli.roots.clone();
    }
    Ok(config)
}

async fn open_engine(cli: &Cli, data: &DataFiles) -> Result<(ScanOrchestrator, Arc<JsonFileIndex>)> {
    let config = load_config(cli)?;
    let settings = ScanSettings::load(&data.settings()).context("Invalid settings file")?;
    let index = Arc::new(
        JsonFileIndex::open(data.index())
            .await
            .context("Failed to open media index")?,
    );

    let engine = ScanOrchestrator::new(
        config.clone(),
        settings,
        Arc::new(FfprobeProbe::new(&config)),
        Box::new(JsonCheckpointRepository::new(data.checkpoint())),
        Arc::clone(&index) as Arc<dyn MediaIndex>,
    )?;
    Ok((engine, index))
}

enum Start {
    New(ScanType),
    Resume,
}

/// Run a scan to its end, rendering events and cancelling on Ctrl-C.
async fn run_scan(
    engine: &ScanOrchestrator,
    index: &JsonFileIndex,
    start: Start,
    format: OutputFormat,
) -> Result<()> {
    let mut events = engine.subscribe();
    let scan_id = match start {
        Start::New(scan_type) => engine.start_scan(scan_type).await?,
        Start::Resume => match engine.resume_if_checkpoint_valid().await? {
            Some(scan_id) => scan_id,
            None => {
                eprintln!("No resumable checkpoint");
                return Ok(());
            }
        },
    };
    if format == OutputFormat::Text {
        eprintln!("Scan {scan_id} started");
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut cancelling = false;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if event.scan_id().is_some_and(|id| *id != scan_id) {
                    continue;
                }
                render(&event, format)?;
                if event.is_terminal() {
                    break;
                }
            }
            _ = &mut ctrl_c, if !cancelling => {
                cancelling = true;
                eprintln!("\nCancelling scan...");
                if let Err(e) = engine.cancel(&scan_id).await {
                    tracing::warn!("cancel failed: {e}");
                }
            }
        }
    }

    let state = engine.wait().await;
    engine.shutdown();

    match state {
        ScanState::Completed => {
            if format == OutputFormat::Text {
                print_index_summary(index).await?;
            }
            Ok(())
        }
        ScanState::Cancelled => {
            eprintln!("Scan cancelled");
            Ok(())
        }
        other => Err(eyre!("scan {scan_id} ended as {other}")),
    }
}

fn render(event: &ScanProgressEvent, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        println!("{}", event.to_json()?);
        return Ok(());
    }

    match &event.kind {
        ScanEvent::Phase(payload) => {
            eprintln!();
            eprintln!(
                "== {} {}",
                payload.phase,
                payload.message.as_deref().unwrap_or_default()
            );
        }
        ScanEvent::Progress(payload) => {
            eprint!("\r{}", progress_line(payload));
            std::io::stderr().flush()?;
        }
        ScanEvent::Complete(payload) => {
            eprintln!("\r{}", progress_line(payload));
            println!("{}", "─".repeat(60));
            println!(" Scan {} completed", payload.scan_id);
            if let Some(elapsed) = payload.metrics.total_elapsed_time {
                println!(" Finished in {elapsed}s");
            }
        }
        ScanEvent::ScanStats(stats) => {
            let stats = &stats.skip_stats;
            eprintln!();
            println!(
                " {} files: {} new, {} changed, {} unchanged ({:.1}%), {} removed",
                stats.total_files,
                stats.new_files,
                stats.changed_files,
                stats.unchanged_files,
                stats.unchanged_percentage,
                stats.deleted_files
            );
            if stats.unreadable_entries > 0 {
                println!(" {} unreadable entries skipped", stats.unreadable_entries);
            }
        }
        ScanEvent::Error(error) => {
            eprintln!();
            eprintln!(
                "Scan {} stopped after {}/{} files: {}",
                error.scan_id, error.processed_files, error.total_files, error.error
            );
        }
        ScanEvent::ControlPause(_) => eprintln!("\nPaused"),
        ScanEvent::ControlResume(_) => eprintln!("\nResumed"),
        ScanEvent::ControlCancel(_) | ScanEvent::Connected(_) | ScanEvent::Heartbeat(_) => {}
    }
    Ok(())
}

fn progress_line(payload: &ProgressPayload) -> String {
    let mut line = format!(
        "[{:>9}] {:5.1}% {}/{}",
        payload.phase.to_string(),
        payload.progress,
        payload.processed_files,
        payload.total_files
    );
    if let Some(speed) = payload.metrics.processing_speed {
        line.push_str(&format!("  {speed:.1} files/s"));
    }
    if let Some(eta) = payload.metrics.estimated_time_remaining {
        line.push_str(&format!("  ETA {eta}s"));
    }
    line
}

async fn print_index_summary(index: &JsonFileIndex) -> Result<()> {
    let snapshot = index.snapshot().await?;
    let total: u64 = snapshot.values().map(|stamp| stamp.size).sum();
    println!(
        " Index: {} videos, {}",
        snapshot.len(),
        format_size(total)
    );
    println!("{}", "─".repeat(60));
    Ok(())
}

async fn run_status(
    engine: &ScanOrchestrator,
    index: &JsonFileIndex,
    data: &DataFiles,
    format: OutputFormat,
) -> Result<()> {
    let checkpoint = engine.checkpoint_info().await?;
    let snapshot = index.snapshot().await?;
    let total: u64 = snapshot.values().map(|stamp| stamp.size).sum();

    if format == OutputFormat::Json {
        let status = serde_json::json!({
            "checkpoint": checkpoint,
            "indexedVideos": snapshot.len(),
            "indexedBytes": total,
            "dataDir": data.dir,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Data directory: {}", data.dir.display());
    println!("Indexed videos: {} ({})", snapshot.len(), format_size(total));
    if !checkpoint.exists {
        println!("Checkpoint:     none");
    } else {
        println!(
            "Checkpoint:     {} ({} min old, phase {}, {}%)",
            if checkpoint.is_valid { "resumable" } else { "invalid" },
            checkpoint.age_minutes,
            checkpoint
                .phase
                .map(|phase| phase.to_string())
                .unwrap_or_default(),
            checkpoint.progress.unwrap_or(0)
        );
    }
    Ok(())
}

fn run_settings(action: &SettingsAction, data: &DataFiles) -> Result<()> {
    let path = data.settings();
    let settings = match action {
        SettingsAction::Show => ScanSettings::load(&path)?,
        SettingsAction::Set(args) => {
            let patch = args.to_patch()?;
            let next = ScanSettings::load(&path)?.merged(&patch)?;
            next.save(&path)?;
            eprintln!("Settings saved to {}", path.display());
            next
        }
        SettingsAction::Reset => {
            let defaults = ScanSettings::default();
            defaults.save(&path)?;
            eprintln!("Settings reset to defaults");
            defaults
        }
    };
    println!("{}", serde_json::to_string_pretty(&settings)?);
    Ok(())
}

impl SettingsArgs {
    fn to_patch(&self) -> Result<ScanSettingsPatch> {
        let auto_pause_time_range = self.quiet_hours.as_deref().map(parse_quiet_hours).transpose()?;
        Ok(ScanSettingsPatch {
            batch_size: self.batch_size,
            progress_update_interval: self.progress_update_interval,
            sleep_interval_ms: self.sleep_interval,
            processing_priority: self.priority,
            max_concurrent_operations: self.max_concurrent,
            memory_threshold_mb: self.memory_threshold,
            auto_pause_on_high_cpu: self.auto_pause_on_high_cpu,
            auto_pause_threshold: self.auto_pause_threshold,
            auto_pause_time_range,
            enable_detailed_logging: self.detailed_logging,
            show_resource_monitoring: self.resource_monitoring,
            enable_performance_metrics: self.performance_metrics,
        })
    }
}

/// Parse "START-END" hours, or "off".
fn parse_quiet_hours(value: &str) -> Result<AutoPauseTimeRange> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("off") {
        return Ok(AutoPauseTimeRange {
            enabled: false,
            ..AutoPauseTimeRange::default()
        });
    }
    let Some((start, end)) = value.split_once('-') else {
        bail!("quiet hours must look like START-END, got {value:?}");
    };
    let start_hour: u8 = start.trim().parse().context("Invalid start hour")?;
    let end_hour: u8 = end.trim().parse().context("Invalid end hour")?;
    Ok(AutoPauseTimeRange {
        enabled: true,
        start_hour,
        end_hour,
    })
}

/// Format bytes as human-readable size.
fn format_size(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::BINARY)
}
