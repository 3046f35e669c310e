//! Userspace type definitions
//!
//! ## Organization
//!
//! - **Kernel Types**: types shared with the eBPF program (from usb_probe_common)
//! - **Userspace Types**: report structures produced by the collector and
//!   consumed by the exporters

use serde::{Deserialize, Serialize};

use crate::table::TableStats;

// ============================================================================
// Kernel Types (from eBPF programs)
// ============================================================================

pub mod kernel {
    //! Types shared between the kernel eBPF program and userspace
    //!
    //! These are re-exported from the usb-probe-common crate and must
    //! maintain binary compatibility with the eBPF program.

    pub use usb_probe_common::constants;
    pub use usb_probe_common::types::{
        Direction, ProbeConfig, TransferKey, TransferType, UrbCompletion, UrbOffsets,
    };
}

// Re-export commonly used kernel types at module level for convenience
pub use kernel::{Direction, TransferKey, TransferType, UrbCompletion};

/// A physical device as seen on one bus
///
/// Device numbers are reused after unplug, so vendor/product are part of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId {
    pub bus: u32,
    pub device: u32,
    pub vendor: u16,
    pub product: u16,
}

impl From<&TransferKey> for DeviceId {
    fn from(key: &TransferKey) -> Self {
        Self {
            bus: key.bus,
            device: key.device,
            vendor: key.vendor,
            product: key.product,
        }
    }
}

/// One reporting interval
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TrafficReport {
    /// ISO 8601 timestamp when the interval ended
    pub timestamp: String,
    /// Length of the interval the rates are computed over
    pub interval_seconds: f64,
    /// Bytes transferred across all listed endpoints
    pub total_bytes: u64,
    /// Per-bus breakdown, sorted by bus number
    pub buses: Vec<BusReport>,
    /// Aggregation table health
    pub table: TableStats,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BusReport {
    pub bus: u32,
    pub devices: Vec<DeviceReport>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DeviceReport {
    pub device: u32,
    pub vendor: u16,
    pub product: u16,
    pub endpoints: Vec<EndpointReport>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EndpointReport {
    /// Endpoint address including the direction bit
    pub address: u8,
    /// "CTRL", "ISOC", "BULK" or "INTR"
    pub transfer_type: String,
    /// "IN" or "OUT"
    pub direction: String,
    /// Bytes transferred during the interval
    pub bytes: u64,
    /// Average rate over the interval
    pub bytes_per_second: f64,
}

impl TrafficReport {
    /// Iterate over every endpoint with its bus and device
    pub fn endpoints(&self) -> impl Iterator<Item = (&BusReport, &DeviceReport, &EndpointReport)> {
        self.buses.iter().flat_map(|bus| {
            bus.devices.iter().flat_map(move |device| {
                device
                    .endpoints
                    .iter()
                    .map(move |endpoint| (bus, device, endpoint))
            })
        })
    }
}

/// Kernel probe health counters (PROBE_STATS)
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProbeStats {
    pub completions: u64,
    pub zero_length: u64,
    pub filtered: u64,
    pub read_errors: u64,
    pub map_errors: u64,
    pub events_emitted: u64,
}

impl ProbeStats {
    /// Build from counters indexed by the STAT_* constants
    pub fn from_counters(counters: &[u64]) -> Self {
        use kernel::constants::*;

        let at = |idx: u32| counters.get(idx as usize).copied().unwrap_or(0);
        Self {
            completions: at(STAT_COMPLETIONS),
            zero_length: at(STAT_ZERO_LENGTH),
            filtered: at(STAT_FILTERED),
            read_errors: at(STAT_READ_ERRORS),
            map_errors: at(STAT_MAP_ERRORS),
            events_emitted: at(STAT_EVENTS_EMITTED),
        }
    }
}
