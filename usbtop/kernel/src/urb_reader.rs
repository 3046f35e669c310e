//! URB field extraction
//!
//! Reads the handful of `struct urb`, `struct usb_device` and `struct usb_bus`
//! fields the classifier needs. Offsets of kernel-internal structs come from
//! URB_OFFSETS; descriptor layouts are fixed by the USB standard.

use aya_ebpf::{helpers::bpf_probe_read_kernel, programs::ProbeContext};
use usb_probe_common::{
    constants::{
        DEVICE_DESC_ID_PRODUCT, DEVICE_DESC_ID_VENDOR, ENDPOINT_DESC_ADDRESS,
        ENDPOINT_DESC_ATTRIBUTES,
    },
    types::{UrbCompletion, UrbOffsets},
};

/// Read a `T` located `offset` bytes into the kernel object at `base`
#[inline(always)]
fn read_at<T>(base: *const u8, offset: u32) -> Result<T, i64> {
    if base.is_null() {
        return Err(-1);
    }
    // SAFETY: bpf_probe_read_kernel validates the address and faults safely
    unsafe { bpf_probe_read_kernel(base.add(offset as usize) as *const T).map_err(|e| e as i64) }
}

/// Extract the urb pointer from the kprobe context
///
/// `usb_hcd_giveback_urb(struct usb_hcd *hcd, struct urb *urb, int status)`
#[inline(always)]
pub fn get_urb_from_context(ctx: &ProbeContext) -> Result<*const u8, i64> {
    ctx.arg::<*const u8>(1).ok_or(-1)
}

/// Read urb->actual_length
///
/// Done before anything else so empty completions cost a single read.
#[inline(always)]
pub fn read_actual_length(urb: *const u8, offsets: &UrbOffsets) -> Result<i32, i64> {
    read_at::<i32>(urb, offsets.urb_actual_length)
}

/// Read everything else the classifier needs
#[inline(always)]
pub fn read_completion(
    urb: *const u8,
    offsets: &UrbOffsets,
    actual_length: i32,
) -> Result<UrbCompletion, i64> {
    let dev = read_at::<*const u8>(urb, offsets.urb_dev)?;
    let ep = read_at::<*const u8>(urb, offsets.urb_ep)?;
    let pipe = read_at::<u32>(urb, offsets.urb_pipe)?;

    let devnum = read_at::<i32>(dev, offsets.device_devnum)?;
    let bus = read_at::<*const u8>(dev, offsets.device_bus)?;
    let busnum = read_at::<i32>(bus, offsets.bus_busnum)?;

    // Descriptor words are little-endian on the wire and in memory
    let vendor = read_at::<u16>(dev, offsets.device_descriptor + DEVICE_DESC_ID_VENDOR)?;
    let product = read_at::<u16>(dev, offsets.device_descriptor + DEVICE_DESC_ID_PRODUCT)?;

    // usb_host_endpoint starts with its usb_endpoint_descriptor
    let endpoint_address = read_at::<u8>(ep, ENDPOINT_DESC_ADDRESS)?;
    let attributes = read_at::<u8>(ep, ENDPOINT_DESC_ATTRIBUTES)?;

    Ok(UrbCompletion {
        bus: busnum as u32,
        device: devnum as u32,
        vendor: u16::from_le(vendor),
        product: u16::from_le(product),
        endpoint_address,
        attributes,
        _padding: [0; 2],
        pipe,
        actual_length,
    })
}
