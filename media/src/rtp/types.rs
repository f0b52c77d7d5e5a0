//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

pub type PayloadType = u8;
pub type FullSequenceNumber = u64; // Unwrapped, monotonically increasing
pub type TruncatedSequenceNumber = u16; // What actually goes in the packet
pub type TruncatedTimestamp = u32;
pub type Ssrc = u32;

/// RTP video clock rate.
pub const VIDEO_CLOCK_RATE_HZ: u32 = 90_000;
pub const VIDEO_TICKS_PER_MILLISECOND: u32 = VIDEO_CLOCK_RATE_HZ / 1000;

/// Whether `timestamp` is later than `other`, allowing for the 32-bit counter wrapping.
pub fn is_later_timestamp(timestamp: TruncatedTimestamp, other: TruncatedTimestamp) -> bool {
    (timestamp.wrapping_sub(other) as i32) > 0
}
