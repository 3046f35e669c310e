//! Report exporters
//!
//! Provides the terminal view plus machine-readable exporters (JSON,
//! Prometheus text format). Each exporter writes one report per tick,
//! either to stdout or by overwriting a file.

use crate::types::TrafficReport;
use anyhow::{Context, Result};
use clap::ValueEnum;
use std::{
    fs::File,
    io::{self, Write},
    path::{Path, PathBuf},
};

/// ANSI clear screen + cursor home
const CLEAR_SCREEN: &str = "\x1b[2J\x1b[H";

/// Trait for report exporters
pub trait MetricsExporter {
    /// Export one interval's report
    fn export(&self, report: &TrafficReport) -> Result<()>;
}

/// Export format type
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExporterType {
    /// Refreshing terminal table
    Text,
    /// JSON document per interval
    Json,
    /// Prometheus text exposition format
    Prometheus,
}

/// Build the exporter for `kind`, writing to `output` or stdout
pub fn build_exporter(kind: ExporterType, output: Option<PathBuf>) -> Box<dyn MetricsExporter> {
    match kind {
        ExporterType::Text => Box::new(TextExporter::new(output)),
        ExporterType::Json => Box::new(JsonExporter::new(output)),
        ExporterType::Prometheus => Box::new(PrometheusExporter::new(output)),
    }
}

fn write_output(path: Option<&Path>, data: &str) -> Result<()> {
    match path {
        Some(path) => {
            let mut file = File::create(path)
                .with_context(|| format!("Failed to create output file: {:?}", path))?;
            file.write_all(data.as_bytes())
                .with_context(|| format!("Failed to write to output file: {:?}", path))?;
        }
        None => {
            let mut stdout = io::stdout().lock();
            stdout
                .write_all(data.as_bytes())
                .and_then(|_| stdout.flush())
                .context("Failed to write to stdout")?;
        }
    }
    Ok(())
}

/// Format a rate with binary byte units or decimal bit units
///
/// ```
/// use usbtop::exporter::format_speed;
///
/// assert_eq!(format_speed(2048.0, false), "2.00 KiB/s");
/// assert_eq!(format_speed(2048.0, true), "16.38 Kbps");
/// ```
pub fn format_speed(bytes_per_second: f64, use_bits: bool) -> String {
    let (mut speed, units, divisor): (f64, [&str; 5], f64) = if use_bits {
        (bytes_per_second * 8.0, ["bps", "Kbps", "Mbps", "Gbps", "Tbps"], 1000.0)
    } else {
        (bytes_per_second, ["B/s", "KiB/s", "MiB/s", "GiB/s", "TiB/s"], 1024.0)
    };

    let mut unit = 0;
    while speed >= divisor && unit < units.len() - 1 {
        speed /= divisor;
        unit += 1;
    }

    format!("{:.2} {}", speed, units[unit])
}

/// Terminal table exporter
pub struct TextExporter {
    output: Option<PathBuf>,
}

impl TextExporter {
    /// Create a new text exporter
    ///
    /// On stdout the screen is cleared before each report.
    pub fn new(output: Option<PathBuf>) -> Self {
        Self { output }
    }

    /// Render the report as the bus / device / endpoint tree
    pub fn render(report: &TrafficReport) -> String {
        let mut lines = Vec::new();

        for bus in &report.buses {
            lines.push(format!("Bus {}:", bus.bus));
            for device in &bus.devices {
                let bus_dev = format!("{:>3}.{:<3}", bus.bus, device.device);
                let vid_pid = format!("[{:04x}:{:04x}]", device.vendor, device.product);
                lines.push(format!("  Device {} {}:", bus_dev, vid_pid));

                for endpoint in &device.endpoints {
                    lines.push(format!(
                        "    0x{:02x} ({}, {:<3}): {:>15} {:>15}",
                        endpoint.address,
                        endpoint.transfer_type,
                        endpoint.direction,
                        format_speed(endpoint.bytes_per_second, true),
                        format_speed(endpoint.bytes_per_second, false),
                    ));
                }
            }
        }

        lines.join("\n")
    }
}

impl MetricsExporter for TextExporter {
    fn export(&self, report: &TrafficReport) -> Result<()> {
        let body = Self::render(report);
        match &self.output {
            Some(path) => write_output(Some(path.as_path()), &format!("{}\n", body)),
            None => write_output(None, &format!("{}{}\n", CLEAR_SCREEN, body)),
        }
    }
}

/// JSON exporter
pub struct JsonExporter {
    output: Option<PathBuf>,
}

impl JsonExporter {
    /// Create a new JSON exporter
    ///
    /// Files get the latest report pretty-printed; stdout gets one compact
    /// line per report.
    pub fn new(output: Option<PathBuf>) -> Self {
        Self { output }
    }
}

impl MetricsExporter for JsonExporter {
    fn export(&self, report: &TrafficReport) -> Result<()> {
        match &self.output {
            Some(path) => {
                let json = serde_json::to_string_pretty(report)?;
                write_output(Some(path.as_path()), &json)
            }
            None => {
                let json = serde_json::to_string(report)?;
                write_output(None, &format!("{}\n", json))
            }
        }
    }
}

/// Prometheus exporter
pub struct PrometheusExporter {
    output: Option<PathBuf>,
}

impl PrometheusExporter {
    /// Create a new Prometheus exporter
    ///
    /// Pointing `output` at a node_exporter textfile directory exposes the
    /// latest interval.
    pub fn new(output: Option<PathBuf>) -> Self {
        Self { output }
    }

    /// Convert a report to Prometheus format
    fn to_prometheus_format(report: &TrafficReport) -> String {
        let mut output = String::new();

        output.push_str("# HELP usbtop_endpoint_bytes_per_second Average endpoint throughput over the last interval\n");
        output.push_str("# TYPE usbtop_endpoint_bytes_per_second gauge\n");
        for (bus, device, endpoint) in report.endpoints() {
            output.push_str(&format!(
                "usbtop_endpoint_bytes_per_second{{bus=\"{}\",device=\"{}\",vendor=\"{:04x}\",product=\"{:04x}\",endpoint=\"0x{:02x}\",type=\"{}\",direction=\"{}\"}} {}\n",
                bus.bus,
                device.device,
                device.vendor,
                device.product,
                endpoint.address,
                endpoint.transfer_type,
                endpoint.direction,
                endpoint.bytes_per_second
            ));
        }
        output.push('\n');

        output.push_str("# HELP usbtop_interval_bytes Bytes transferred during the last interval\n");
        output.push_str("# TYPE usbtop_interval_bytes gauge\n");
        output.push_str(&format!("usbtop_interval_bytes {}\n", report.total_bytes));
        output.push('\n');

        output.push_str("# HELP usbtop_interval_seconds Length of the last interval\n");
        output.push_str("# TYPE usbtop_interval_seconds gauge\n");
        output.push_str(&format!("usbtop_interval_seconds {}\n", report.interval_seconds));
        output.push('\n');

        output.push_str("# HELP usbtop_table_entries Endpoints tracked by the aggregation table\n");
        output.push_str("# TYPE usbtop_table_entries gauge\n");
        output.push_str(&format!("usbtop_table_entries {}\n", report.table.entries));
        output.push('\n');

        output.push_str("# HELP usbtop_table_rejected_bytes_total Bytes dropped because the table was full\n");
        output.push_str("# TYPE usbtop_table_rejected_bytes_total counter\n");
        output.push_str(&format!("usbtop_table_rejected_bytes_total {}\n", report.table.rejected_bytes));
        output.push('\n');

        output.push_str("# HELP usbtop_table_evicted_keys_total Endpoints evicted to make room\n");
        output.push_str("# TYPE usbtop_table_evicted_keys_total counter\n");
        output.push_str(&format!("usbtop_table_evicted_keys_total {}\n", report.table.evicted_keys));

        output
    }
}

impl MetricsExporter for PrometheusExporter {
    fn export(&self, report: &TrafficReport) -> Result<()> {
        write_output(self.output.as_deref(), &Self::to_prometheus_format(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        table::TableStats,
        types::{BusReport, DeviceReport, EndpointReport},
    };

    fn create_test_report() -> TrafficReport {
        TrafficReport {
            timestamp: "2025-01-01T00:00:00Z".to_string(),
            interval_seconds: 0.25,
            total_bytes: 16509,
            buses: vec![BusReport {
                bus: 1,
                devices: vec![DeviceReport {
                    device: 5,
                    vendor: 0x1234,
                    product: 0x5678,
                    endpoints: vec![
                        EndpointReport {
                            address: 0x80,
                            transfer_type: "CTRL".to_string(),
                            direction: "IN".to_string(),
                            bytes: 125,
                            bytes_per_second: 500.0,
                        },
                        EndpointReport {
                            address: 0x81,
                            transfer_type: "BULK".to_string(),
                            direction: "IN".to_string(),
                            bytes: 16384,
                            bytes_per_second: 65536.0,
                        },
                    ],
                }],
            }],
            table: TableStats {
                entries: 2,
                ..TableStats::default()
            },
        }
    }

    #[test]
    fn test_format_speed() {
        assert_eq!(format_speed(0.0, false), "0.00 B/s");
        assert_eq!(format_speed(1023.0, false), "1023.00 B/s");
        assert_eq!(format_speed(1024.0, false), "1.00 KiB/s");
        assert_eq!(format_speed(1.5 * 1024.0 * 1024.0, false), "1.50 MiB/s");
        assert_eq!(format_speed(125.0, true), "1.00 Kbps");
        assert_eq!(format_speed(60_000_000.0, true), "480.00 Mbps");
        // Saturates at the largest unit
        assert_eq!(format_speed(2048.0 * 1024f64.powi(4), false), "2048.00 TiB/s");
    }

    #[test]
    fn test_text_format() {
        let text = TextExporter::render(&create_test_report());
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], "Bus 1:");
        assert_eq!(lines[1], "  Device   1.5   [1234:5678]:");
        assert_eq!(
            lines[2],
            format!("    0x80 (CTRL, IN ): {:>15} {:>15}", "4.00 Kbps", "500.00 B/s")
        );
        assert!(lines[3].starts_with("    0x81 (BULK, IN ):"));
        assert!(lines[3].ends_with("64.00 KiB/s"));
    }

    #[test]
    fn test_prometheus_format() {
        let prometheus = PrometheusExporter::to_prometheus_format(&create_test_report());

        assert!(prometheus.contains(
            "usbtop_endpoint_bytes_per_second{bus=\"1\",device=\"5\",vendor=\"1234\",product=\"5678\",endpoint=\"0x81\",type=\"BULK\",direction=\"IN\"} 65536"
        ));
        assert!(prometheus.contains("usbtop_interval_bytes 16509"));
        assert!(prometheus.contains("usbtop_table_entries 2"));
    }

    #[test]
    fn test_json_round_trip() {
        let report = create_test_report();
        let json = serde_json::to_string(&report).unwrap();
        let parsed: TrafficReport = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.buses, report.buses);
        assert_eq!(parsed.table, report.table);
    }
}
