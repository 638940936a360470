//! NeuroFocus Agent CLI
//!
//! Records band-power focus features from a biosignal board.

use clap::{Args, Parser, Subcommand};
use neurofocus_agent::{
    acquisition::Acquisition,
    config::Config,
    core::{ChannelGrouping, FeatureRecord, FocusFormula},
    diagnostics::{create_shared_log_with_persistence, PersistedDiagnostics},
    recording::read_recording,
    session::ConnectionKind,
    VERSION,
};
use statrs::statistics::Statistics;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "neurofocus")]
#[command(version = VERSION)]
#[command(about = "Band-power focus features from biosignal boards", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire features and record them to CSV
    Record {
        #[command(flatten)]
        source: SourceArgs,

        /// Directory for the recording (defaults to the configured one)
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Also serve the latest features over HTTP (requires server feature)
        #[arg(long)]
        serve: bool,

        /// Port for the feature server
        #[arg(long)]
        server_port: Option<u16>,
    },

    /// Acquire features and serve them over HTTP without recording
    Serve {
        #[command(flatten)]
        source: SourceArgs,

        /// Port for the feature server
        #[arg(long)]
        server_port: Option<u16>,

        /// Bind to localhost only
        #[arg(long)]
        local: bool,
    },

    /// Show configuration and cumulative diagnostics
    Status,

    /// Summarize a recording
    Inspect {
        /// Recording to read
        file: PathBuf,
    },

    /// Show configuration
    Config {
        /// Write the effective configuration to the config file
        #[arg(long)]
        save: bool,
    },
}

/// Overrides for where samples come from and how they are analysed.
#[derive(Args, Clone, Default)]
struct SourceArgs {
    /// Source kind: streamer, serial, remote, or synthetic
    #[arg(long)]
    source: Option<ConnectionKind>,

    /// Serial port path or host
    #[arg(long)]
    address: Option<String>,

    /// Streamer or remote server port
    #[arg(long)]
    port: Option<u16>,

    /// Number of channels the board produces
    #[arg(long)]
    channel_count: Option<usize>,

    /// Sampling rate in Hz
    #[arg(long)]
    sampling_rate: Option<u32>,

    /// Channels to analyse, comma separated (default: all)
    #[arg(long, value_delimiter = ',')]
    channels: Option<Vec<usize>>,

    /// Focus formula: v1 or v2
    #[arg(long)]
    formula: Option<FocusFormula>,

    /// Channel grouping: per-channel or pooled
    #[arg(long)]
    grouping: Option<ChannelGrouping>,

    /// Omit the relaxation index
    #[arg(long)]
    no_relaxation: bool,

    /// Tick interval in milliseconds
    #[arg(long)]
    interval_ms: Option<u64>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Record {
            source,
            output,
            serve,
            server_port,
        } => {
            cmd_record(&source, output, serve.then_some(server_port));
        }
        Commands::Serve {
            source,
            server_port,
            local,
        } => {
            cmd_serve(&source, server_port, local);
        }
        Commands::Status => {
            cmd_status();
        }
        Commands::Inspect { file } => {
            cmd_inspect(&file);
        }
        Commands::Config { save } => {
            cmd_config(save);
        }
    }
}

/// Load the config file and apply command-line overrides.
fn build_config(args: &SourceArgs) -> Config {
    let mut config = Config::load().unwrap_or_else(|e| {
        eprintln!("Warning: Could not load config ({e}); using defaults");
        Config::default()
    });

    let session = &mut config.session;
    if let Some(kind) = args.source {
        session.kind = kind;
    }
    if let Some(address) = &args.address {
        session.address = address.clone();
    }
    if let Some(port) = args.port {
        session.port = port;
    }
    if let Some(count) = args.channel_count {
        session.channel_count = count;
    }
    if let Some(rate) = args.sampling_rate {
        session.sampling_rate = rate;
    }
    if let Some(channels) = &args.channels {
        session.channels = channels.clone();
    }
    if let Some(formula) = args.formula {
        config.focus_formula = formula;
    }
    if let Some(grouping) = args.grouping {
        config.channel_grouping = grouping;
    }
    if args.no_relaxation {
        config.emit_relaxation = false;
    }
    if let Some(ms) = args.interval_ms {
        config.tick_interval = Duration::from_millis(ms);
    }

    if let Err(e) = config.validate() {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
    config
}

fn print_source(config: &Config) {
    let session = &config.session;
    println!("  Source: {:?}", session.kind);
    match session.kind {
        ConnectionKind::Synthetic => {}
        ConnectionKind::LocalSerial => {
            println!("  Port: {} @ {} baud", session.serial_port(), session.baud_rate)
        }
        _ => println!("  Endpoint: {}", session.socket_addr()),
    }
    if session.kind != ConnectionKind::RemoteHttp {
        println!(
            "  Channels: {:?} of {} @ {} Hz ({:?})",
            session.analysed_channels(),
            session.channel_count,
            session.sampling_rate,
            config.channel_grouping
        );
    }
    println!("  Focus formula: {}", config.focus_formula.name());
    println!("  Tick interval: {}ms", config.tick_interval.as_millis());
}

fn cmd_record(args: &SourceArgs, output: Option<PathBuf>, serve_port: Option<Option<u16>>) {
    let mut config = build_config(args);
    if let Some(dir) = output {
        config.recording_path = dir;
    }

    let server_port = serve_port.map(|p| p.unwrap_or(config.server_port));
    run_acquisition(config, true, server_port.map(|p| (p, false)));
}

fn cmd_serve(args: &SourceArgs, server_port: Option<u16>, local: bool) {
    if cfg!(not(feature = "server")) {
        eprintln!("Error: serve requires the server feature");
        std::process::exit(1);
    }

    let config = build_config(args);
    if config.session.kind == ConnectionKind::RemoteHttp {
        eprintln!("Error: serve needs a board source, not another feature server");
        std::process::exit(1);
    }
    let port = server_port.unwrap_or(config.server_port);
    run_acquisition(config, false, Some((port, local)));
}

/// Feature server running on its own runtime.
#[cfg(feature = "server")]
struct RunningServer {
    runtime: tokio::runtime::Runtime,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
}

#[cfg(feature = "server")]
fn start_server(
    port: u16,
    local: bool,
    latest: neurofocus_agent::poller::LatestSlot,
) -> Option<RunningServer> {
    use neurofocus_agent::server::{run, ServerConfig};

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error creating server runtime: {e}");
            return None;
        }
    };

    let server_config = if local {
        ServerConfig::local(port)
    } else {
        ServerConfig {
            port,
            ..ServerConfig::default()
        }
    };

    match runtime.block_on(run(server_config, latest)) {
        Ok((addr, shutdown_tx)) => {
            println!("  Feature server: http://{addr}/data");
            Some(RunningServer {
                runtime,
                shutdown_tx,
            })
        }
        Err(e) => {
            eprintln!("Error starting feature server: {e}");
            None
        }
    }
}

fn run_acquisition(config: Config, record: bool, server: Option<(u16, bool)>) {
    println!("NeuroFocus Agent v{VERSION}");
    println!();

    if let Err(e) = config.ensure_directories() {
        eprintln!("Warning: Could not create directories: {e}");
    }

    println!("Starting acquisition...");
    print_source(&config);

    let diagnostics = create_shared_log_with_persistence(config.diagnostics_path());
    let display_refresh = config.display_refresh;

    let mut acquisition = Acquisition::new(config, diagnostics.clone());
    if !record {
        acquisition = acquisition.without_recording();
    }

    if let Err(e) = acquisition.start() {
        eprintln!("Error starting acquisition: {e}");
        std::process::exit(1);
    }
    if let Some(path) = acquisition.recording_path() {
        println!("  Recording: {}", path.display());
    }

    #[cfg(feature = "server")]
    let server = server.and_then(|(port, local)| start_server(port, local, acquisition.latest()));
    #[cfg(not(feature = "server"))]
    if server.is_some() {
        eprintln!("Warning: feature server disabled (server feature not enabled at compile time)");
    }

    println!();
    println!("Press Ctrl+C to stop");
    println!();

    let running = Arc::new(AtomicBool::new(true));
    ctrlc_handler(running.clone());

    let feed = acquisition.live_feed().cloned();
    while running.load(Ordering::SeqCst) {
        let Some(feed) = &feed else { break };

        match feed.recv_timeout(display_refresh) {
            Ok(record) => print_record(&record),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                eprintln!("Poller stopped unexpectedly");
                break;
            }
        }
    }

    println!();
    println!("Stopping acquisition...");

    #[cfg(feature = "server")]
    if let Some(server) = server {
        let _ = server.shutdown_tx.send(());
        server.runtime.shutdown_timeout(Duration::from_secs(1));
    }

    acquisition.stop();

    if let Some(path) = acquisition.recording_path() {
        println!("Recording saved to {}", path.display());
    }

    println!();
    println!("{}", diagnostics.summary());
}

fn print_record(record: &FeatureRecord) {
    let b = &record.bands;
    let relaxation = record
        .relaxation
        .map(|r| format!(" | relaxation: {r:.2}"))
        .unwrap_or_default();
    println!(
        "[{}] tick {} | δ {:.3} θ {:.3} α {:.3} β {:.3} γ {:.3} | focus: {:.2}{}",
        record.timestamp.format("%H:%M:%S"),
        record.tick,
        b.delta,
        b.theta,
        b.alpha,
        b.beta,
        b.gamma,
        record.focus,
        relaxation
    );
}

fn cmd_status() {
    let config = Config::load().unwrap_or_default();

    println!("NeuroFocus Agent Status");
    println!("=======================");
    println!();

    println!("Configuration:");
    print_source(&config);
    println!("  Recordings: {}", config.recording_path.display());
    println!();

    let stats_path = config.diagnostics_path();
    if !stats_path.exists() {
        println!("No previous run data found.");
        return;
    }

    let persisted = std::fs::read_to_string(&stats_path)
        .ok()
        .and_then(|content| serde_json::from_str::<PersistedDiagnostics>(&content).ok());

    match persisted {
        Some(stats) => {
            println!("Cumulative Statistics:");
            println!("  Ticks: {}", stats.ticks);
            println!("  Records written: {}", stats.records_written);
            println!("  Ticks without data: {}", stats.no_data_ticks);
            println!("  Ticks skipped on error: {}", stats.failed_ticks);
            println!("  Write failures: {}", stats.write_failures);
            println!("  Cleanup errors: {}", stats.cleanup_errors);
            println!("  Last updated: {}", stats.last_updated.format("%Y-%m-%d %H:%M:%S"));

            if !stats.recent.is_empty() {
                println!();
                println!("Recent diagnostics:");
                for entry in stats.recent.iter().rev().take(10) {
                    let tick = entry.tick.map(|t| format!("tick {t} ")).unwrap_or_default();
                    println!(
                        "  [{}] {}{:?}: {}",
                        entry.at.format("%H:%M:%S"),
                        tick,
                        entry.kind,
                        entry.message
                    );
                }
            }
        }
        None => eprintln!("Warning: Could not read {stats_path:?}"),
    }
}

fn cmd_inspect(file: &Path) {
    let rows = match read_recording(file) {
        Ok(rows) => rows,
        Err(e) => {
            eprintln!("Error reading recording: {e}");
            std::process::exit(1);
        }
    };

    println!("Recording: {}", file.display());

    let (Some(first), Some(last)) = (rows.first(), rows.last()) else {
        println!("No records.");
        return;
    };

    println!("  Records: {}", rows.len());
    println!("  Focus formula: {}", first.formula.name());
    println!(
        "  Span: {} to {} ({}s)",
        first.timestamp.format("%Y-%m-%d %H:%M:%S"),
        last.timestamp.format("%H:%M:%S"),
        (last.timestamp - first.timestamp).num_seconds()
    );
    if let (Some(a), Some(b)) = (first.frame_index, last.frame_index) {
        println!("  Frames: {a} to {b}");
    }

    let focus: Vec<f64> = rows.iter().map(|r| r.focus).collect();
    println!(
        "  Focus: mean {:.3}, min {:.3}, max {:.3}",
        Statistics::mean(&focus),
        Statistics::min(&focus),
        Statistics::max(&focus)
    );

    let relaxation: Vec<f64> = rows.iter().filter_map(|r| r.relaxation).collect();
    if !relaxation.is_empty() {
        println!("  Relaxation: mean {:.3}", Statistics::mean(&relaxation));
    }
}

fn cmd_config(save: bool) {
    let config = Config::load().unwrap_or_default();

    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {:?}", Config::config_path());
    println!();
    println!(
        "{}",
        serde_json::to_string_pretty(&config).unwrap_or_else(|_| "Error".to_string())
    );

    if save {
        match config.save() {
            Ok(()) => println!("Saved to {:?}", Config::config_path()),
            Err(e) => {
                eprintln!("Error saving config: {e}");
                std::process::exit(1);
            }
        }
    }
}

/// Set up Ctrl+C handler.
fn ctrlc_handler(running: Arc<AtomicBool>) {
    if let Err(e) = ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    }) {
        eprintln!("Warning: Could not set Ctrl+C handler: {e}");
    }
}
