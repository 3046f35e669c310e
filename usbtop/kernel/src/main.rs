//! usbtop eBPF program - kernel side
//!
//! Attaches to `usb_hcd_giveback_urb`, which every host controller driver
//! calls once per completed URB, and accounts the transferred bytes per
//! (bus, device, vendor:product, endpoint, transfer type).
//!
//! ## Architecture
//!
//! ```text
//! usb_hcd_giveback_urb() -> read urb/device/endpoint fields (URB_OFFSETS)
//!                           |
//!            aggregate mode | events mode
//!                           v
//!   classify() -> USB_STATS += len     USB_EVENTS <- UrbCompletion
//!                           |
//!                           v
//! Userspace    -> poll USB_STATS or classify events, report rates
//! ```
//!
//! ## Usage
//!
//! This program must be compiled for the bpfel-unknown-none target:
//!
//! ```bash
//! cargo build --release
//! ```
//!
//! The compiled bytecode is then loaded by the `usbtop` daemon.

#![no_std]
#![no_main]

mod handlers;
mod helpers;
mod maps;
mod urb_reader;

// Re-export kprobe functions so they're visible to the loader
pub use handlers::usb_hcd_giveback_urb;

// Re-export maps for verification
pub use maps::{PROBE_CONFIG, PROBE_STATS, URB_OFFSETS, USB_EVENTS, USB_STATS};

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    // eBPF programs cannot panic - the verifier rejects any path that could
    loop {}
}
