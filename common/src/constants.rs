//! Shared constants for the usbtop probe
//!
//! These constants are used by both the kernel program and the userspace
//! daemon so both sides agree on map names, sizes and bit layouts.

// ============================================================================
// USB bit layouts (from linux/usb/ch9.h)
// ============================================================================

/// Direction bit of an endpoint address and of an URB pipe
pub const USB_DIR_IN: u8 = 0x80;

/// Endpoint number bits of an endpoint address
pub const USB_ENDPOINT_NUMBER_MASK: u8 = 0x0f;

/// Transfer type bits of an endpoint's bmAttributes
pub const USB_ENDPOINT_XFERTYPE_MASK: u8 = 0x03;

/// Offset of idVendor inside `struct usb_device_descriptor`
pub const DEVICE_DESC_ID_VENDOR: u32 = 8;

/// Offset of idProduct inside `struct usb_device_descriptor`
pub const DEVICE_DESC_ID_PRODUCT: u32 = 10;

/// Offset of bEndpointAddress inside `struct usb_endpoint_descriptor`
pub const ENDPOINT_DESC_ADDRESS: u32 = 2;

/// Offset of bmAttributes inside `struct usb_endpoint_descriptor`
pub const ENDPOINT_DESC_ATTRIBUTES: u32 = 3;

// ============================================================================
// BPF Maps
// ============================================================================

/// Per-endpoint byte counters (LRU hash keyed by `TransferKey`)
pub const MAP_USB_STATS: &str = "USB_STATS";

/// Raw completion events for userspace classification
pub const MAP_USB_EVENTS: &str = "USB_EVENTS";

/// Runtime configuration written by userspace
pub const MAP_PROBE_CONFIG: &str = "PROBE_CONFIG";

/// Kernel struct field offsets written by userspace
pub const MAP_URB_OFFSETS: &str = "URB_OFFSETS";

/// Probe health counters
pub const MAP_PROBE_STATS: &str = "PROBE_STATS";

/// Default capacity of the per-endpoint counter map
pub const MAX_TRANSFER_KEYS: u32 = 4096;

/// Name of the kprobe program and of the kernel function it attaches to
pub const PROBE_FUNCTION: &str = "usb_hcd_giveback_urb";

// ============================================================================
// Probe modes (for ProbeConfig.mode)
// ============================================================================

/// Classify in the kernel and aggregate into USB_STATS
pub const PROBE_MODE_AGGREGATE: u8 = 0;

/// Forward every non-empty completion to USB_EVENTS
pub const PROBE_MODE_EVENTS: u8 = 1;

// ============================================================================
// Statistics Counter Indices (for PROBE_STATS map)
// ============================================================================

/// Completions seen by the kprobe
pub const STAT_COMPLETIONS: u32 = 0;

/// Completions skipped because nothing was transferred
pub const STAT_ZERO_LENGTH: u32 = 1;

/// Completions skipped by the in-kernel bus filter
pub const STAT_FILTERED: u32 = 2;

/// Failed kernel memory reads
pub const STAT_READ_ERRORS: u32 = 3;

/// Failed USB_STATS updates (map full or insert race lost twice)
pub const STAT_MAP_ERRORS: u32 = 4;

/// Events written to USB_EVENTS
pub const STAT_EVENTS_EMITTED: u32 = 5;

/// Total number of statistics counters
pub const MAX_STATS: u32 = 6;
