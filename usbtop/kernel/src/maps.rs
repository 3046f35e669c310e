//! BPF map definitions for USB transfer accounting
//!
//! Defines the aggregation table shared with userspace plus the small
//! configuration and health maps.

use aya_ebpf::{
    macros::map,
    maps::{Array, LruHashMap, PerfEventArray},
};
use usb_probe_common::{constants::*, types::*};

/// Per-endpoint byte counters
///
/// Key: TransferKey
/// Value: u64 cumulative bytes
///
/// Only ever incremented here. Userspace reads it without clearing, so an
/// increment can never be lost to a reset. The LRU type bounds the table:
/// once full, the least recently updated endpoint is evicted. Userspace
/// may resize it at load time.
#[map]
pub static USB_STATS: LruHashMap<TransferKey, u64> =
    LruHashMap::with_max_entries(MAX_TRANSFER_KEYS, 0);

/// Raw completions for userspace classification (events mode)
#[map]
pub static USB_EVENTS: PerfEventArray<UrbCompletion> = PerfEventArray::new(0);

/// Runtime configuration, slot 0
#[map]
pub static PROBE_CONFIG: Array<ProbeConfig> = Array::with_max_entries(1, 0);

/// Kernel struct offsets, slot 0
#[map]
pub static URB_OFFSETS: Array<UrbOffsets> = Array::with_max_entries(1, 0);

/// Health counters
/// Index: stat_id (see STAT_* constants)
#[map]
pub static PROBE_STATS: Array<u64> = Array::with_max_entries(MAX_STATS, 0);
