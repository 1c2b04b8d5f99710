//! PEPPER experiment CLI.
//!
//! Commands:
//! - run: reserve devices, run a PEPPER campaign on all of them, save the data
//! - classify: classify a captured TERMLOG offline
//! - sanitize: repair the first line of a TERMLOG

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pepper_data::{ExperimentSnapshot, NodeRecord, classify};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use pepper_experiment::channel::decode_lenient;
use pepper_experiment::results::{ExperimentDataStore, format_duration, summarize};
use pepper_experiment::sanitizer::sanitize_termlog;
use pepper_experiment::{ExperimentConfig, Orchestrator, PepperParams, ReservationSpec, RiotMakeTool};

#[derive(Parser)]
#[command(name = "pepper-experiment")]
#[command(version)]
#[command(about = "PEPPER proximity-tracing experiments on RIOT devices")]
struct Cli {
    /// TOML configuration file; CLI flags override its values
    #[arg(long, global = true, env = "PEPPER_EXPERIMENT_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace); RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "info")]
    loglevel: String,

    /// Enable verbose logging (same as --loglevel debug)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an experiment
    Run {
        /// RIOT application directory
        #[arg(long)]
        app_dir: Option<PathBuf>,

        /// Directory for TERMLOGs and the data file
        #[arg(long)]
        log_dir: Option<PathBuf>,

        /// Data file name inside the log directory
        #[arg(long)]
        data_file: Option<String>,

        /// IoT-LAB node addresses or boards to reserve (comma-separated)
        #[arg(long, value_delimiter = ',')]
        iotlab_nodes: Vec<String>,

        /// Reserve this many dwm1001 boards on IoT-LAB
        #[arg(short = 'n', long)]
        count: Option<usize>,

        /// Static boards file, used when nothing is reserved on IoT-LAB
        #[arg(long, default_value = ".boards.yaml")]
        boards_file: PathBuf,

        /// IoT-LAB site
        #[arg(long)]
        site: Option<String>,

        /// IoT-LAB experiment name
        #[arg(long)]
        exp_name: Option<String>,

        /// IoT-LAB experiment duration in minutes
        #[arg(long)]
        exp_duration: Option<u32>,

        /// Number of epochs, 0 runs until interrupted (default 5)
        #[arg(short = 'c', long)]
        iterations: Option<u32>,

        /// Epoch duration in seconds (default 300)
        #[arg(short = 'd', long)]
        duration: Option<u32>,

        /// Advertisement interval in ms (default 1000)
        #[arg(long)]
        adv_itvl: Option<u32>,

        /// Advertisements per slice (default 10)
        #[arg(long)]
        advs_slice: Option<u32>,

        /// Scan interval in ms (default 1024)
        #[arg(long)]
        scan_itvl: Option<u32>,

        /// Scan window in ms (default 1024)
        #[arg(long)]
        scan_win: Option<u32>,

        /// Align epoch start with the wall clock (default false)
        #[arg(long)]
        align_start: Option<bool>,

        /// Align epoch end with the wall clock (default true)
        #[arg(long)]
        align_end: Option<bool>,

        /// Pre-built firmware; devices are flashed without compiling
        #[arg(long)]
        flashfile: Option<PathBuf>,

        /// Extra CFLAGS
        #[arg(long, allow_hyphen_values = true)]
        cflags: Option<String>,

        /// Extra USEMODULE
        #[arg(long)]
        modules: Option<String>,
    },

    /// Classify a captured TERMLOG
    Classify {
        /// TERMLOG to read
        termlog: PathBuf,

        /// Write the classified data as a snapshot (NDJSON)
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Repair the first line of a TERMLOG
    Sanitize {
        /// TERMLOG to repair
        termlog: PathBuf,
    },
}

/// Campaign parameters used when no configuration file is given.
fn default_campaign() -> PepperParams {
    PepperParams {
        iterations: 5,
        duration: 300,
        adv_itvl: 1000,
        advs_slice: 10,
        scan_itvl: 1024,
        scan_win: 1024,
        align_start: false,
        align_end: true,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let level = if cli.verbose { "debug" } else { cli.loglevel.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let mut config = match &cli.config {
        Some(path) => ExperimentConfig::load(path)?,
        None => ExperimentConfig {
            params: default_campaign(),
            ..Default::default()
        },
    };

    match cli.command {
        Commands::Run {
            app_dir,
            log_dir,
            data_file,
            iotlab_nodes,
            count,
            boards_file,
            site,
            exp_name,
            exp_duration,
            iterations,
            duration,
            adv_itvl,
            advs_slice,
            scan_itvl,
            scan_win,
            align_start,
            align_end,
            flashfile,
            cflags,
            modules,
        } => {
            if let Some(app_dir) = app_dir {
                config.app_dir = app_dir;
            }
            if let Some(log_dir) = log_dir {
                config.log_dir = log_dir;
            }
            if let Some(data_file) = data_file {
                config.data_file = data_file;
            }
            if let Some(site) = site {
                config.testbed.site = site;
            }
            if let Some(name) = exp_name {
                config.testbed.name = name;
            }
            if let Some(minutes) = exp_duration {
                config.testbed.duration_min = minutes;
            }
            config.flashfile = flashfile.or(config.flashfile);
            config.cflags = cflags.or(config.cflags);
            config.modules = modules.or(config.modules);

            let params = &mut config.params;
            params.iterations = iterations.unwrap_or(params.iterations);
            params.duration = duration.unwrap_or(params.duration);
            params.adv_itvl = adv_itvl.unwrap_or(params.adv_itvl);
            params.advs_slice = advs_slice.unwrap_or(params.advs_slice);
            params.scan_itvl = scan_itvl.unwrap_or(params.scan_itvl);
            params.scan_win = scan_win.unwrap_or(params.scan_win);
            params.align_start = align_start.unwrap_or(params.align_start);
            params.align_end = align_end.unwrap_or(params.align_end);

            let boards = if !iotlab_nodes.is_empty() {
                Some(iotlab_nodes)
            } else {
                count.map(|n| vec!["dwm1001".to_string(); n])
            };
            let spec = match boards {
                Some(boards) => ReservationSpec::Testbed {
                    boards,
                    name: config.testbed.name.clone(),
                    site: config.testbed.site.clone(),
                    duration_min: config.testbed.duration_min,
                },
                None => ReservationSpec::File { path: boards_file },
            };

            let (stop_tx, stop_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, stopping running campaigns");
                    let _ = stop_tx.send(true);
                }
            });

            let tool = Arc::new(RiotMakeTool::new(config.app_dir.clone()));
            let orchestrator = Orchestrator::new(config, tool);

            let started = Instant::now();
            let snapshot = orchestrator
                .run_until(&spec, stop_rx)
                .await
                .context("experiment failed")?;

            println!("\n=== Experiment Result ===");
            println!("Nodes: {}", snapshot.nodes.len());
            println!(
                "Elapsed: {}",
                format_duration(started.elapsed().as_millis() as u64)
            );
            if !snapshot.is_empty() {
                println!("Data: {}", orchestrator.store().path().display());
            }
            print_summary(&snapshot);
        }

        Commands::Classify { termlog, output } => {
            let bytes = std::fs::read(&termlog)
                .with_context(|| format!("failed to read {}", termlog.display()))?;
            let node_id = termlog
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("node")
                .to_string();

            let mut record = NodeRecord::new(node_id, None);
            record.absorb(classify(&decode_lenient(&bytes)));
            let snapshot = ExperimentSnapshot::new(vec![record]);
            print_summary(&snapshot);

            if let Some(output) = output {
                ExperimentDataStore::new(output.clone())
                    .persist(std::slice::from_ref(&snapshot))
                    .with_context(|| format!("failed to write {}", output.display()))?;
                info!(path = %output.display(), "Wrote classified data");
            }
        }

        Commands::Sanitize { termlog } => {
            let rewritten = sanitize_termlog(&termlog)
                .with_context(|| format!("failed to sanitize {}", termlog.display()))?;
            if rewritten {
                println!("Cleaned {}", termlog.display());
            } else {
                println!("Nothing to clean in {}", termlog.display());
            }
        }
    }

    Ok(())
}

fn print_summary(snapshot: &ExperimentSnapshot) {
    for node in summarize(snapshot) {
        println!("\n{}", node.node_id);
        if let Some(uid) = &node.uid {
            println!("  uid: {}", uid);
        }
        if let Some(outcome) = &node.outcome {
            println!("  outcome: {:?}", outcome);
        }
        println!("  epochs: {} ({} encounters)", node.epochs, node.encounters);
        println!("  telemetry: {} ble, {} uwb", node.ble_samples, node.uwb_samples);
    }
}
