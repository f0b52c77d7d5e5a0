//
// Copyright 2021 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

/// Expands a truncated counter value to the full length by using the previous largest value as
/// guide to rollover/rollunder. Updates this maximum.
///
/// # Arguments
///
/// * `truncated` - The truncated counter value.
/// * `max` - The previously return value from this function.
/// * `width` - The bit width the supplied value has been truncated to.
pub fn expand_truncated_counter(truncated: u64, max: &mut u64, width: u32) -> u64 {
    debug_assert!(width > 0 && width < 64);
    let mask: u64 = (1 << width) - 1;
    let really_big: u64 = 1 << (width - 1);

    let truncated = truncated & mask;
    let truncated_max = *max & mask;
    let max_roc = *max >> width;
    let roc = if truncated_max > truncated && truncated_max - truncated > really_big {
        // Truncated is a lot smaller than the max;  It's likely a rollover.
        max_roc + 1
    } else if max_roc > 0 && truncated > truncated_max && truncated - truncated_max > really_big {
        // Truncated is a lot bigger than the max;  It's likely a rollunder.
        max_roc - 1
    } else {
        max_roc
    };
    let full = (roc << width) | truncated;
    if full > *max {
        *max = full;
    }
    full
}

/// Unwraps 16-bit RTP sequence numbers into a monotonic counter.
#[derive(Debug, Default, Clone)]
pub struct SequenceUnwrapper {
    max: u64,
}

impl SequenceUnwrapper {
    pub fn unwrap(&mut self, seqnum: u16) -> u64 {
        expand_truncated_counter(seqnum as u64, &mut self.max, 16)
    }

    pub fn reset(&mut self) {
        self.max = 0;
    }
}
