//! Kprobe handler for USB transfer accounting
//!
//! Runs on the URB completion path of every host controller, often in
//! interrupt context. Nothing here may block; the work per completion is a
//! few kernel reads and one atomic add.

use aya_ebpf::{macros::kprobe, programs::ProbeContext};
use aya_log_ebpf::warn;
use usb_probe_common::{classify, constants::*, types::*};

use crate::{helpers::*, maps::*, urb_reader::*};

/// Account one completed URB
///
/// Attached to: usb_hcd_giveback_urb
#[kprobe]
pub fn usb_hcd_giveback_urb(ctx: ProbeContext) -> u32 {
    match try_usb_hcd_giveback_urb(&ctx) {
        Ok(ret) => ret,
        Err(_) => {
            increment_stat(STAT_READ_ERRORS);
            1
        }
    }
}

fn try_usb_hcd_giveback_urb(ctx: &ProbeContext) -> Result<u32, i64> {
    increment_stat(STAT_COMPLETIONS);

    let offsets = URB_OFFSETS.get(0).ok_or(-1i64)?;
    let config = PROBE_CONFIG.get(0).copied().unwrap_or_default();

    let urb = get_urb_from_context(ctx)?;

    let actual_length = read_actual_length(urb, offsets)?;
    if actual_length <= 0 {
        increment_stat(STAT_ZERO_LENGTH);
        return Ok(0);
    }

    let completion = read_completion(urb, offsets, actual_length)?;

    if config.bus_filter != 0 && completion.bus != config.bus_filter {
        increment_stat(STAT_FILTERED);
        return Ok(0);
    }

    if config.mode == PROBE_MODE_EVENTS {
        USB_EVENTS.output(ctx, &completion, 0);
        increment_stat(STAT_EVENTS_EMITTED);
        return Ok(0);
    }

    let Some((key, bytes)) = classify(&completion) else {
        increment_stat(STAT_ZERO_LENGTH);
        return Ok(0);
    };

    if add_bytes(&key, bytes).is_err() {
        increment_stat(STAT_MAP_ERRORS);
        warn!(
            ctx,
            "usbtop: failed to account {} bytes for {}.{} ep 0x{:x}",
            bytes,
            key.bus,
            key.device,
            key.endpoint
        );
    }

    Ok(0)
}
