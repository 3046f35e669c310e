//! Probe configuration
//!
//! Kernel struct offsets and the probe mode. Offsets of `struct urb`,
//! `struct usb_device` and `struct usb_bus` depend on the kernel build;
//! the defaults match x86_64 Linux 6.x distribution kernels. Check them with
//! `pahole -C urb,usb_device,usb_bus vmlinux` and override any field via
//! `--offsets file.json`.

use std::{fs, path::Path};

use anyhow::{Context, Result};
use clap::ValueEnum;
use log::info;
use serde::{Deserialize, Serialize};
use usb_probe_common::constants::{PROBE_MODE_AGGREGATE, PROBE_MODE_EVENTS};

use crate::types::kernel::{ProbeConfig, UrbOffsets};

/// Where transfers are classified
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProbeMode {
    /// In the kernel, into the USB_STATS map (lowest overhead)
    Aggregate,
    /// In userspace, from a perf event per completed transfer
    Events,
}

impl ProbeMode {
    pub fn as_raw(self) -> u8 {
        match self {
            ProbeMode::Aggregate => PROBE_MODE_AGGREGATE,
            ProbeMode::Events => PROBE_MODE_EVENTS,
        }
    }
}

/// Build the PROBE_CONFIG value
pub fn probe_config(mode: ProbeMode, bus_filter: u32) -> ProbeConfig {
    ProbeConfig {
        bus_filter,
        mode: mode.as_raw(),
        _padding: [0; 3],
    }
}

/// On-disk form of [`UrbOffsets`]; missing fields keep their defaults
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct OffsetsFile {
    pub urb_dev: u32,
    pub urb_ep: u32,
    pub urb_pipe: u32,
    pub urb_actual_length: u32,
    pub device_devnum: u32,
    pub device_bus: u32,
    pub device_descriptor: u32,
    pub bus_busnum: u32,
}

impl Default for OffsetsFile {
    fn default() -> Self {
        Self {
            urb_dev: 64,
            urb_ep: 72,
            urb_pipe: 80,
            urb_actual_length: 132,
            device_devnum: 0,
            device_bus: 80,
            device_descriptor: 904,
            bus_busnum: 16,
        }
    }
}

impl From<OffsetsFile> for UrbOffsets {
    fn from(file: OffsetsFile) -> Self {
        Self {
            urb_dev: file.urb_dev,
            urb_ep: file.urb_ep,
            urb_pipe: file.urb_pipe,
            urb_actual_length: file.urb_actual_length,
            device_devnum: file.device_devnum,
            device_bus: file.device_bus,
            device_descriptor: file.device_descriptor,
            bus_busnum: file.bus_busnum,
        }
    }
}

/// Parse offsets from JSON
pub fn parse_offsets(json: &str) -> Result<UrbOffsets> {
    let file: OffsetsFile = serde_json::from_str(json).context("Invalid offsets JSON")?;
    Ok(file.into())
}

/// Load offsets from `path`, or the built-in defaults
pub fn load_offsets(path: Option<&Path>) -> Result<UrbOffsets> {
    match path {
        Some(path) => {
            info!("Loading kernel struct offsets from: {:?}", path);
            let json = fs::read_to_string(path)
                .with_context(|| format!("Failed to read offsets file: {:?}", path))?;
            parse_offsets(&json).with_context(|| format!("Failed to parse offsets file: {:?}", path))
        }
        None => {
            info!("Using built-in x86_64 kernel struct offsets (override with --offsets)");
            Ok(OffsetsFile::default().into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_offsets_keep_defaults() {
        let offsets = parse_offsets(r#"{ "device_descriptor": 1312, "urb_actual_length": 140 }"#)
            .expect("valid offsets");

        assert_eq!(offsets.device_descriptor, 1312);
        assert_eq!(offsets.urb_actual_length, 140);
        assert_eq!(offsets.urb_dev, OffsetsFile::default().urb_dev);
        assert_eq!(offsets.bus_busnum, 16);
    }

    #[test]
    fn test_unknown_offset_is_rejected() {
        assert!(parse_offsets(r#"{ "urb_status": 88 }"#).is_err());
    }

    #[test]
    fn test_probe_config_encodes_mode() {
        let config = probe_config(ProbeMode::Events, 3);
        assert_eq!(config.bus_filter, 3);
        assert_eq!(config.mode, PROBE_MODE_EVENTS);
        assert_eq!(probe_config(ProbeMode::Aggregate, 0).mode, PROBE_MODE_AGGREGATE);
    }
}
