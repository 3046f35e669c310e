//! Transfer classification
//!
//! Turns one completed URB into the key it is accounted under. Runs inside
//! the kprobe in aggregate mode and in the daemon's perf readers in events
//! mode, so it must stay allocation-free and branch-light.

use crate::{
    constants::{USB_DIR_IN, USB_ENDPOINT_NUMBER_MASK},
    types::{TransferKey, TransferType, UrbCompletion},
};

/// Classify a completed transfer
///
/// Returns the key and the number of bytes to account, or `None` when
/// nothing was transferred. Empty completions are routine (status stages,
/// short polls) and are not an error.
///
/// The default control endpoint always reports address 0, so its direction
/// is taken from the URB pipe instead. That keeps control IN and control OUT
/// on endpoint 0 apart.
#[inline(always)]
pub fn classify(urb: &UrbCompletion) -> Option<(TransferKey, u64)> {
    if urb.actual_length <= 0 {
        return None;
    }

    let transfer_type = TransferType::from_attributes(urb.attributes);
    let mut endpoint = urb.endpoint_address;
    if transfer_type == TransferType::Control && endpoint & USB_ENDPOINT_NUMBER_MASK == 0 {
        endpoint |= (urb.pipe as u8) & USB_DIR_IN;
    }

    let key = TransferKey::new(
        urb.bus,
        urb.device,
        urb.vendor,
        urb.product,
        endpoint,
        transfer_type,
    );

    Some((key, urb.actual_length as u64))
}
