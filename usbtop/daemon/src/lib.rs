//! usbtop userspace library
//!
//! Loads the USB transfer probe, accumulates per-endpoint byte counts in a
//! concurrent aggregation table and turns them into periodic reports.

pub mod collector;
pub mod config;
pub mod events;
pub mod exporter;
pub mod loader;
pub mod table;
pub mod types;

pub use collector::TrafficCollector;
pub use config::ProbeMode;
pub use events::{EventProcessor, KernelCounters, MapPoller};
pub use exporter::{build_exporter, ExporterType, MetricsExporter};
pub use loader::ProbeLoader;
pub use table::{AggregationTable, EvictionPolicy, TableConfig, TableStats};
pub use types::*;
