//! PhotonDB Datastore Binary
//!
//! Stress and inspection tool for the generation-aware data store:
//! - Concurrent stress run (one writer, many verifying readers)
//! - Effective configuration dump
//!
//! # Examples
//!
//! ```bash
//! # Stress with 8 readers and JSON output
//! datastore stress --readers 8 --operations 1000000 --json
//!
//! # Print configuration after environment overrides
//! PHOTON_DATASTORE_OFFSET_BITS=20 datastore config
//! ```

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use photondb_datastore::datastore::{AddressSpace, MemoryStats};
use photondb_datastore::metrics::DataStoreMetrics;
use photondb_datastore::{DataStore, DataStoreConfig, EntryRef, GenerationHandler};
use rayon::prelude::*;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Instant;
use tracing::{error, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// PhotonDB Datastore - generation-aware arena storage
#[derive(Parser, Debug)]
#[command(name = "datastore")]
#[command(version = photondb_datastore::VERSION)]
#[command(about = "PhotonDB Datastore - generation-aware arena storage", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML)
    #[arg(long, global = true, env = "PHOTON_DATASTORE_CONFIG")]
    config: Option<PathBuf>,

    /// Log directory path
    #[arg(long, global = true, default_value = "logs", env = "PHOTON_DATASTORE_LOG_DIR")]
    log_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a concurrent writer/reader stress test
    Stress(StressArgs),

    /// Print the effective configuration as TOML
    Config,

    /// Show version
    Version,
}

#[derive(Args, Debug)]
struct StressArgs {
    /// Number of live entries kept by the writer
    #[arg(long, default_value = "4096")]
    entries: usize,

    /// Entry replacements performed by the writer
    #[arg(long, default_value = "200000")]
    operations: u64,

    /// Reader threads
    #[arg(long, default_value = "4")]
    readers: usize,

    /// Replacements between generation commits
    #[arg(long, default_value = "256")]
    commit_interval: u64,

    /// Replacements between compaction checks
    #[arg(long, default_value = "8192")]
    compact_interval: u64,

    /// Seed for the replacement order
    #[arg(long, default_value = "1")]
    seed: u64,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    /// Print Prometheus metrics after the run
    #[arg(long)]
    metrics: bool,
}

#[derive(Debug, Serialize)]
struct StressReport {
    entries: usize,
    operations: u64,
    readers: usize,
    reads: u64,
    failures: u64,
    commits: u64,
    compactions: u64,
    moved_entries: u64,
    final_generation: u64,
    elapsed_ms: u128,
    mem_stats: MemoryStats,
    address_space: AddressSpace,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli)?;

    match &cli.command {
        Commands::Stress(args) => {
            let config = load_config(&cli)?;
            stress_command(&config, args)
        }
        Commands::Config => {
            let config = load_config(&cli)?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
        Commands::Version => {
            println!("PhotonDB Datastore {}", photondb_datastore::VERSION);
            Ok(())
        }
    }
}

/// Setup logging with rolling files and console output
fn setup_logging(cli: &Cli) -> anyhow::Result<()> {
    std::fs::create_dir_all(&cli.log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &cli.log_dir, "datastore.log");

    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(!cli.no_color)
                .compact(),
        )
        .with(fmt::layer().with_writer(file_appender).with_ansi(false))
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<DataStoreConfig> {
    let config = match &cli.config {
        Some(path) => DataStoreConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => DataStoreConfig::default(),
    };
    Ok(config.with_env_overrides()?)
}

/// Small deterministic generator for the replacement order
struct XorShift(u64);

impl XorShift {
    fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}

fn encode(slot: usize, version: u64) -> u64 {
    ((slot as u64) << 32) | (version & 0xffff_ffff)
}

fn slot_of(value: u64) -> usize {
    (value >> 32) as usize
}

/// Stress command - one writer replacing entries while readers verify them
fn stress_command(config: &DataStoreConfig, args: &StressArgs) -> anyhow::Result<()> {
    if args.entries == 0 {
        bail!("--entries must be positive");
    }
    info!(
        entries = args.entries,
        operations = args.operations,
        readers = args.readers,
        offset_bits = config.offset_bits,
        "starting stress run"
    );

    let mut store = DataStore::<u64>::with_config(config)?;
    let generations = GenerationHandler::new();
    let reader = store.reader();
    let slots: Vec<AtomicU32> = (0..args.entries).map(|_| AtomicU32::new(0)).collect();
    let mut current: Vec<EntryRef> = Vec::with_capacity(args.entries);
    for i in 0..args.entries {
        let entry_ref = store.add_entry(encode(i, 0));
        slots[i].store(entry_ref.raw(), Ordering::Release);
        current.push(entry_ref);
    }

    let stop = AtomicBool::new(false);
    let reads = AtomicU64::new(0);
    let failures = AtomicU64::new(0);
    let mut commits = 0u64;
    let mut compactions = 0u64;
    let mut moved_entries = 0u64;
    let started = Instant::now();

    std::thread::scope(|s| {
        for reader_id in 0..args.readers {
            let reader = reader.clone();
            let generations = generations.clone();
            let (slots, stop, reads, failures) = (&slots, &stop, &reads, &failures);
            s.spawn(move || {
                let mut rng = XorShift::new(reader_id as u64 + 0x9e37_79b9);
                let mut local_reads = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    let guard = generations.take_guard();
                    for _ in 0..64 {
                        let i = (rng.next() % slots.len() as u64) as usize;
                        let entry_ref = EntryRef::from_raw(slots[i].load(Ordering::Acquire));
                        // SAFETY: the ref was published after its value was
                        // written and is loaded under a guard taken before
                        let value = unsafe { *reader.get_entry::<u64>(&guard, entry_ref) };
                        if slot_of(value) != i {
                            failures.fetch_add(1, Ordering::Relaxed);
                        }
                        local_reads += 1;
                    }
                }
                reads.fetch_add(local_reads, Ordering::Relaxed);
            });
        }

        let mut rng = XorShift::new(args.seed);
        for op in 1..=args.operations {
            let i = (rng.next() % args.entries as u64) as usize;
            let new_ref = store.add_entry(encode(i, op));
            slots[i].store(new_ref.raw(), Ordering::Release);
            store.hold_entry(current[i]);
            current[i] = new_ref;

            if op % args.commit_interval.max(1) == 0 {
                store.commit(&generations);
                commits += 1;
            }
            if op % args.compact_interval.max(1) == 0 {
                let spec = config.compaction.compaction_spec(
                    &store.base().dynamic_memory_usage(),
                    &store.address_space_usage(),
                );
                if spec.compact() {
                    let compacting = store.start_compact(spec, &config.compaction);
                    for (i, entry_ref) in current.iter_mut().enumerate() {
                        if compacting.has(*entry_ref) {
                            *entry_ref = store.move_on_compact(*entry_ref);
                            slots[i].store(entry_ref.raw(), Ordering::Release);
                            moved_entries += 1;
                        }
                    }
                    store.finish_compact(compacting);
                    compactions += 1;
                }
            }
        }
        stop.store(true, Ordering::Relaxed);
    });

    let final_generation = store.commit(&generations);
    commits += 1;

    let stale = (0..args.entries)
        .into_par_iter()
        .filter(|&i| slot_of(*store.get_entry(current[i])) != i)
        .count() as u64;
    let failures = failures.load(Ordering::Relaxed) + stale;

    let report = StressReport {
        entries: args.entries,
        operations: args.operations,
        readers: args.readers,
        reads: reads.load(Ordering::Relaxed),
        failures,
        commits,
        compactions,
        moved_entries,
        final_generation,
        elapsed_ms: started.elapsed().as_millis(),
        mem_stats: store.mem_stats(),
        address_space: store.address_space_usage(),
    };
    info!(
        reads = report.reads,
        failures = report.failures,
        compactions = report.compactions,
        elapsed_ms = report.elapsed_ms as u64,
        "stress run finished"
    );

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    if args.metrics {
        let metrics = DataStoreMetrics::new("photondb")?;
        metrics.observe_reader(&reader);
        print!("{}", metrics.export()?);
    }

    if failures > 0 {
        error!(failures, "readers observed inconsistent entries");
        bail!("{} inconsistent reads", failures);
    }
    Ok(())
}

fn print_report(report: &StressReport) {
    println!("Stress run ({} ms)", report.elapsed_ms);
    println!("  entries:      {}", report.entries);
    println!("  operations:   {}", report.operations);
    println!("  readers:      {}", report.readers);
    println!("  reads:        {}", report.reads);
    println!("  failures:     {}", report.failures);
    println!("  commits:      {}", report.commits);
    println!(
        "  compactions:  {} ({} entries moved)",
        report.compactions, report.moved_entries
    );
    println!("  generation:   {}", report.final_generation);
    let stats = &report.mem_stats;
    println!(
        "  memory:       {} allocated, {} used, {} dead, {} on hold (bytes)",
        stats.alloc_bytes, stats.used_bytes, stats.dead_bytes, stats.hold_bytes
    );
    println!(
        "  buffers:      {} active, {} hold, {} free",
        stats.active_buffers, stats.hold_buffers, stats.free_buffers
    );
    println!(
        "  address space: {} used, {} dead, {} limit (arrays)",
        report.address_space.used(),
        report.address_space.dead(),
        report.address_space.limit()
    );
}
