//! usbtop - per-endpoint USB bandwidth monitor
//!
//! Loads the eBPF probe, attaches it to URB completion, and prints the
//! bandwidth of every active endpoint at a fixed refresh interval.
//!
//! ## Usage
//!
//! ```bash
//! # Live view of every bus, refreshed every 250 ms
//! sudo ./usbtop --ebpf-object path/to/usbtop.o
//!
//! # Only bus 3, refreshed every second
//! sudo ./usbtop -b 3 -i 1
//!
//! # Classify in userspace and keep at most 256 endpoints
//! sudo ./usbtop --mode events --table-entries 256 --eviction reject
//!
//! # Prometheus textfile for 60 seconds
//! sudo ./usbtop --duration 60 --format prometheus --output usbtop.prom
//! ```

use anyhow::Result;
use clap::Parser;
use log::{info, warn};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::{
    signal,
    time::{self, Instant, MissedTickBehavior},
};
use usbtop::{
    collector::TrafficCollector,
    config::{load_offsets, probe_config, ProbeMode},
    events::{EventProcessor, KernelCounters, MapPoller},
    exporter::{build_exporter, ExporterType},
    loader::ProbeLoader,
    table::{AggregationTable, EvictionPolicy, TableConfig},
    types::kernel::constants::MAX_TRANSFER_KEYS,
};

/// Per-endpoint USB bandwidth monitor using eBPF
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Bus to monitor (0 = all buses)
    #[arg(short, long, default_value_t = 0)]
    bus: u32,

    /// Refresh interval in seconds
    #[arg(short, long, default_value_t = 0.25)]
    interval: f64,

    /// Seconds before an inactive device is removed
    #[arg(short, long, default_value_t = 5)]
    timeout: u64,

    /// Where transfers are classified
    #[arg(short, long, value_enum, default_value_t = ProbeMode::Aggregate)]
    mode: ProbeMode,

    /// Capacity of the kernel USB_STATS map
    #[arg(long, default_value_t = MAX_TRANSFER_KEYS)]
    max_entries: u32,

    /// Cap on endpoints held by the userspace table (unbounded if unset)
    #[arg(long)]
    table_entries: Option<usize>,

    /// What to do with a new endpoint when the table is full
    #[arg(long, value_enum, default_value_t = EvictionPolicy::LeastRecent)]
    eviction: EvictionPolicy,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = ExporterType::Text)]
    format: ExporterType,

    /// Overwrite this file every interval instead of printing to stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Duration to run (in seconds, 0 = until Ctrl-C)
    #[arg(short, long, default_value_t = 0)]
    duration: u64,

    /// Path to eBPF object file (if not embedded)
    #[arg(long)]
    ebpf_object: Option<PathBuf>,

    /// JSON file overriding kernel struct offsets
    #[arg(long)]
    offsets: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_default_env()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    if !args.interval.is_finite() || args.interval < 0.001 {
        anyhow::bail!("Interval must be at least 0.001 seconds");
    }
    if args.table_entries == Some(0) {
        anyhow::bail!("--table-entries must be at least 1");
    }
    let interval = Duration::from_secs_f64(args.interval);
    let timeout = Duration::from_secs(args.timeout);

    info!("Starting usbtop...");
    info!("   Mode: {:?}", args.mode);
    info!("   Interval: {:.2} s, device timeout: {} s", args.interval, args.timeout);
    info!(
        "   Table: {} entries, eviction {:?}",
        args.table_entries
            .map_or_else(|| "unbounded".to_string(), |n| n.to_string()),
        args.eviction
    );

    let offsets = load_offsets(args.offsets.as_deref())?;

    let mut loader = ProbeLoader::load(args.ebpf_object.clone(), args.max_entries)?;
    loader.init_logger();
    loader.configure(probe_config(args.mode, args.bus), offsets)?;
    loader.attach_kprobe()?;

    let table = Arc::new(AggregationTable::new(TableConfig {
        max_entries: args.table_entries,
        eviction: args.eviction,
        ..TableConfig::default()
    }));

    let mut poller: Option<MapPoller<KernelCounters>> = match args.mode {
        ProbeMode::Aggregate => Some(MapPoller::new(loader.take_stats_map()?)),
        ProbeMode::Events => {
            let processor = EventProcessor::new(Arc::clone(&table), args.verbose);
            processor.spawn_cpu_readers(loader.take_event_array()?).await?;
            None
        }
    };

    let mut collector = TrafficCollector::new(interval, timeout, args.bus);
    let exporter = build_exporter(args.format, args.output.clone());

    println!("Tracing USB transfers... Hit Ctrl-C to end.");

    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;
    collector.collect(&table, Instant::now().into_std());

    let deadline = (args.duration > 0).then(|| Instant::now() + Duration::from_secs(args.duration));
    let run_out = wait_until(deadline);
    tokio::pin!(run_out);
    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Some(poller) = poller.as_mut() {
                    if let Err(e) = poller.poll(&table) {
                        warn!("Failed to poll USB_STATS: {:#}", e);
                    }
                }

                let report = collector.collect(&table, Instant::now().into_std());
                if let Err(e) = exporter.export(&report) {
                    warn!("Failed to export report: {:#}", e);
                }
            }
            _ = &mut ctrl_c => {
                println!("\nDetaching...");
                break;
            }
            _ = &mut run_out => {
                info!("Duration reached, shutting down...");
                break;
            }
        }
    }

    print_summary(&loader, &table, &collector);

    Ok(())
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn print_summary(loader: &ProbeLoader, table: &AggregationTable, collector: &TrafficCollector) {
    let table_stats = table.stats();

    info!("");
    info!("============================================");
    info!("             Summary Report");
    info!("============================================");
    info!("");
    info!("  Devices listed:     {}", collector.device_count());
    info!("  Endpoints listed:   {}", collector.endpoint_count());
    info!("");
    info!("  Aggregation table:");
    info!("    entries:          {:>10}", table_stats.entries);
    info!("    rejected bytes:   {:>10}", table_stats.rejected_bytes);
    info!("    evicted keys:     {:>10}", table_stats.evicted_keys);
    info!("    evicted bytes:    {:>10}", table_stats.evicted_bytes);

    match loader.read_probe_stats() {
        Ok(probe) => {
            info!("");
            info!("  Kernel probe:");
            info!("    completions:      {:>10}", probe.completions);
            info!("    zero length:      {:>10}", probe.zero_length);
            info!("    filtered:         {:>10}", probe.filtered);
            info!("    read errors:      {:>10}", probe.read_errors);
            info!("    map errors:       {:>10}", probe.map_errors);
            info!("    events emitted:   {:>10}", probe.events_emitted);
        }
        Err(e) => warn!("Could not read probe statistics: {:#}", e),
    }

    info!("");
    info!("============================================");
}
