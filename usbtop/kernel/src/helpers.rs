//! Helper functions for the eBPF program
//!
//! Counter updates shared by the kprobe handler. Several CPUs complete URBs
//! at once, so every add goes through an atomic on the map value.

use core::sync::atomic::{AtomicU64, Ordering};

use aya_ebpf::bindings::BPF_NOEXIST;
use usb_probe_common::types::TransferKey;

use crate::maps::{PROBE_STATS, USB_STATS};

#[inline(always)]
fn atomic_add(ptr: *mut u64, value: u64) {
    // SAFETY: ptr comes from a map lookup and stays valid for this program run
    let counter = unsafe { AtomicU64::from_ptr(ptr) };
    counter.fetch_add(value, Ordering::Relaxed);
}

/// Increment a statistics counter
#[inline(always)]
pub fn increment_stat(stat_id: u32) {
    if let Some(ptr) = PROBE_STATS.get_ptr_mut(stat_id) {
        atomic_add(ptr, 1);
    }
}

/// Add `bytes` to the counter for `key`, creating it on first sight
///
/// The insert uses BPF_NOEXIST: if another CPU created the entry between
/// our lookup and insert, the insert fails and we add to theirs.
#[inline(always)]
pub fn add_bytes(key: &TransferKey, bytes: u64) -> Result<(), i64> {
    if let Some(ptr) = USB_STATS.get_ptr_mut(key) {
        atomic_add(ptr, bytes);
        return Ok(());
    }

    if USB_STATS.insert(key, &bytes, BPF_NOEXIST as u64).is_ok() {
        return Ok(());
    }

    let ptr = USB_STATS.get_ptr_mut(key).ok_or(-1i64)?;
    atomic_add(ptr, bytes);
    Ok(())
}
