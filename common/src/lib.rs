//! Shared types, constants and the transfer classifier for usbtop
//!
//! This crate is used by both the eBPF kernel program and the userspace
//! daemon. It stays `no_std` so the classifier can run inside the kprobe.

#![cfg_attr(not(test), no_std)]

pub mod classify;
pub mod constants;
pub mod types;

// Re-export commonly used types
pub use classify::classify;
pub use types::{Direction, ProbeConfig, TransferKey, TransferType, UrbCompletion, UrbOffsets};
pub use constants::*;
