//! eBPF program loader
//!
//! Handles loading the USB probe object, configuring it and attaching the
//! kprobe on URB completion.

use anyhow::{Context, Result};
use aya::{
    maps::{perf::AsyncPerfEventArray, Array, HashMap, MapData},
    programs::KProbe,
    Bpf, BpfLoader,
};
use log::{info, warn};
use std::path::PathBuf;

use crate::{
    events::KernelCounters,
    types::{
        kernel::{constants::*, ProbeConfig, UrbOffsets},
        ProbeStats,
    },
};

/// Name of the kprobe program inside the object
const PROGRAM_NAME: &str = "usb_hcd_giveback_urb";

/// eBPF program loader and manager
pub struct ProbeLoader {
    bpf: Bpf,
}

impl ProbeLoader {
    /// Load eBPF program from file or embedded bytecode
    ///
    /// # Arguments
    ///
    /// * `path` - Optional path to eBPF object file. If None, uses embedded bytecode.
    /// * `max_entries` - Capacity of the kernel USB_STATS map
    pub fn load(path: Option<PathBuf>, max_entries: u32) -> Result<Self> {
        info!("Loading eBPF program...");

        let owned;
        let data: &[u8] = match path {
            Some(obj_path) => {
                info!("Loading eBPF object from: {:?}", obj_path);
                owned = std::fs::read(&obj_path)
                    .with_context(|| format!("Failed to read eBPF object file: {:?}", obj_path))?;
                &owned
            }
            None => embedded_object()?,
        };

        if max_entries == 0 {
            anyhow::bail!("--max-entries must be at least 1");
        }

        let bpf = BpfLoader::new()
            .set_max_entries(MAP_USB_STATS, max_entries)
            .load(data)
            .context("Failed to load eBPF program")?;

        info!("eBPF program loaded ({} max transfer keys)", max_entries);

        Ok(Self { bpf })
    }

    /// Forward kernel-side log records to the `log` facade
    ///
    /// Non-fatal if it fails.
    pub fn init_logger(&mut self) {
        if let Err(e) = aya_log::BpfLogger::init(&mut self.bpf) {
            warn!("eBPF logger not initialised, kernel-side records will be dropped: {}", e);
        }
    }

    /// Write PROBE_CONFIG and URB_OFFSETS
    ///
    /// Must happen before [`attach_kprobe`](Self::attach_kprobe); the probe
    /// skips every completion while the offsets are unset.
    pub fn configure(&mut self, config: ProbeConfig, offsets: UrbOffsets) -> Result<()> {
        let mut config_map: Array<_, ProbeConfig> = Array::try_from(
            self.bpf
                .map_mut(MAP_PROBE_CONFIG)
                .context("PROBE_CONFIG map not found in eBPF object")?,
        )
        .context("Failed to open PROBE_CONFIG as an array")?;
        config_map
            .set(0, config, 0)
            .context("Failed to write PROBE_CONFIG")?;

        let mut offsets_map: Array<_, UrbOffsets> = Array::try_from(
            self.bpf
                .map_mut(MAP_URB_OFFSETS)
                .context("URB_OFFSETS map not found in eBPF object")?,
        )
        .context("Failed to open URB_OFFSETS as an array")?;
        offsets_map
            .set(0, offsets, 0)
            .context("Failed to write URB_OFFSETS")?;

        info!(
            "Probe configured (mode {}, bus filter {})",
            config.mode,
            if config.bus_filter == 0 {
                "all".to_string()
            } else {
                config.bus_filter.to_string()
            }
        );

        Ok(())
    }

    /// Attach the kprobe to the HCD completion path
    pub fn attach_kprobe(&mut self) -> Result<()> {
        info!("Attaching kprobe to {}...", PROBE_FUNCTION);

        let program: &mut KProbe = self
            .bpf
            .program_mut(PROGRAM_NAME)
            .context("usb_hcd_giveback_urb program not found in eBPF object")?
            .try_into()
            .context("Failed to get usb_hcd_giveback_urb as KProbe")?;
        program
            .load()
            .context("Failed to load usb_hcd_giveback_urb")?;
        program
            .attach(PROBE_FUNCTION, 0)
            .with_context(|| format!("Failed to attach kprobe to {}", PROBE_FUNCTION))?;
        info!("  ✓ Attached to {}", PROBE_FUNCTION);

        Ok(())
    }

    /// Take the kernel's cumulative per-key counters
    pub fn take_stats_map(&mut self) -> Result<KernelCounters> {
        let map = self
            .bpf
            .take_map(MAP_USB_STATS)
            .context("USB_STATS map not found in eBPF object")?;

        let map = HashMap::try_from(map).context("Failed to open USB_STATS as a hash map")?;
        Ok(KernelCounters::new(map))
    }

    /// Take the perf event array carrying raw completions
    pub fn take_event_array(&mut self) -> Result<AsyncPerfEventArray<MapData>> {
        let map = self
            .bpf
            .take_map(MAP_USB_EVENTS)
            .context("USB_EVENTS map not found in eBPF object")?;

        AsyncPerfEventArray::try_from(map)
            .context("Failed to create AsyncPerfEventArray from USB_EVENTS map")
    }

    /// Read the probe's health counters
    pub fn read_probe_stats(&self) -> Result<ProbeStats> {
        let stats: Array<_, u64> = Array::try_from(
            self.bpf
                .map(MAP_PROBE_STATS)
                .context("PROBE_STATS map not found in eBPF object")?,
        )
        .context("Failed to open PROBE_STATS as an array")?;

        let counters = (0..MAX_STATS)
            .map(|idx| {
                stats
                    .get(&idx, 0)
                    .with_context(|| format!("Failed to read PROBE_STATS[{}]", idx))
            })
            .collect::<Result<Vec<u64>>>()?;

        Ok(ProbeStats::from_counters(&counters))
    }
}

#[cfg(feature = "embedded")]
fn embedded_object() -> Result<&'static [u8]> {
    info!("Loading embedded eBPF program...");
    Ok(aya::include_bytes_aligned!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/../kernel/target/bpfel-unknown-none/release/usbtop"
    )))
}

#[cfg(not(feature = "embedded"))]
fn embedded_object() -> Result<&'static [u8]> {
    anyhow::bail!("No eBPF object file provided. Use --ebpf-object or compile with 'embedded' feature")
}
