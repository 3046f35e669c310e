//! Shared data structures between kernel and userspace
//!
//! These structures must be repr(C) to ensure consistent memory layout
//! between the eBPF program and userspace code.

use core::fmt;

use crate::constants::{USB_DIR_IN, USB_ENDPOINT_NUMBER_MASK, USB_ENDPOINT_XFERTYPE_MASK};

/// Endpoint transfer type (bmAttributes bits 0..1)
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransferType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

impl TransferType {
    /// Decode the transfer type from an endpoint's bmAttributes byte.
    ///
    /// Only the two type bits are looked at, so every byte maps to a type.
    #[inline(always)]
    pub const fn from_attributes(attributes: u8) -> Self {
        match attributes & USB_ENDPOINT_XFERTYPE_MASK {
            0 => TransferType::Control,
            1 => TransferType::Isochronous,
            2 => TransferType::Bulk,
            _ => TransferType::Interrupt,
        }
    }

    /// Short label used in reports
    pub const fn label(self) -> &'static str {
        match self {
            TransferType::Control => "CTRL",
            TransferType::Isochronous => "ISOC",
            TransferType::Bulk => "BULK",
            TransferType::Interrupt => "INTR",
        }
    }
}

impl fmt::Display for TransferType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Data direction of an endpoint, relative to the host
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    Out,
    In,
}

impl Direction {
    pub const fn from_address(address: u8) -> Self {
        if address & USB_DIR_IN != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Direction::In => "IN",
            Direction::Out => "OUT",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Identity of one accounted endpoint
///
/// Key of the USB_STATS map. The trailing bytes are always zero so the
/// kernel hashes fully initialised memory; build keys with [`TransferKey::new`].
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferKey {
    /// USB bus number
    pub bus: u32,
    /// Device address on the bus
    pub device: u32,
    /// idVendor from the device descriptor
    pub vendor: u16,
    /// idProduct from the device descriptor
    pub product: u16,
    /// Endpoint address, with the direction bit filled in for control endpoint 0
    pub endpoint: u8,
    /// Raw transfer type (see [`TransferType`])
    pub transfer_type: u8,
    _padding: [u8; 2],
}

impl TransferKey {
    #[inline(always)]
    pub const fn new(
        bus: u32,
        device: u32,
        vendor: u16,
        product: u16,
        endpoint: u8,
        transfer_type: TransferType,
    ) -> Self {
        Self {
            bus,
            device,
            vendor,
            product,
            endpoint,
            transfer_type: transfer_type as u8,
            _padding: [0; 2],
        }
    }

    /// Endpoint number without the direction bit
    pub const fn endpoint_number(&self) -> u8 {
        self.endpoint & USB_ENDPOINT_NUMBER_MASK
    }

    pub const fn direction(&self) -> Direction {
        Direction::from_address(self.endpoint)
    }

    pub const fn transfer_type(&self) -> TransferType {
        TransferType::from_attributes(self.transfer_type)
    }
}

impl fmt::Display for TransferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{} [{:04x}:{:04x}] 0x{:02x} ({}, {})",
            self.bus,
            self.device,
            self.vendor,
            self.product,
            self.endpoint,
            self.transfer_type(),
            self.direction()
        )
    }
}

/// One completed URB as read from the kernel
///
/// Sent to userspace as-is in events mode.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UrbCompletion {
    /// usb_bus.busnum
    pub bus: u32,
    /// usb_device.devnum
    pub device: u32,
    /// descriptor.idVendor
    pub vendor: u16,
    /// descriptor.idProduct
    pub product: u16,
    /// ep->desc.bEndpointAddress
    pub endpoint_address: u8,
    /// ep->desc.bmAttributes
    pub attributes: u8,
    /// Padding for alignment
    pub _padding: [u8; 2],
    /// urb->pipe (bit 7 carries the direction)
    pub pipe: u32,
    /// urb->actual_length
    pub actual_length: i32,
}

/// Runtime configuration for the kernel program (PROBE_CONFIG slot 0)
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProbeConfig {
    /// Only account this bus (0 = all buses)
    pub bus_filter: u32,
    /// PROBE_MODE_AGGREGATE or PROBE_MODE_EVENTS
    pub mode: u8,
    /// Padding for alignment
    pub _padding: [u8; 3],
}

/// Byte offsets of the kernel struct fields the probe reads
///
/// Kernel layouts depend on version and build options, so userspace
/// writes these into URB_OFFSETS before attaching.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UrbOffsets {
    /// urb->dev
    pub urb_dev: u32,
    /// urb->ep
    pub urb_ep: u32,
    /// urb->pipe
    pub urb_pipe: u32,
    /// urb->actual_length
    pub urb_actual_length: u32,
    /// usb_device->devnum
    pub device_devnum: u32,
    /// usb_device->bus
    pub device_bus: u32,
    /// usb_device->descriptor
    pub device_descriptor: u32,
    /// usb_bus->busnum
    pub bus_busnum: u32,
}

// Compile-time layout checks
const _: () = {
    assert!(core::mem::size_of::<TransferKey>() == 16);
    assert!(core::mem::size_of::<UrbCompletion>() == 24);
    assert!(core::mem::size_of::<ProbeConfig>() == 8);
    assert!(core::mem::size_of::<UrbOffsets>() % core::mem::align_of::<UrbOffsets>() == 0);
};

// Implement Aya's Pod trait for userspace usage
#[cfg(feature = "userspace")]
mod userspace_impls {
    use super::*;

    unsafe impl aya::Pod for TransferKey {}
    unsafe impl aya::Pod for UrbCompletion {}
    unsafe impl aya::Pod for ProbeConfig {}
    unsafe impl aya::Pod for UrbOffsets {}
}
