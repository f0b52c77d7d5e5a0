//
// Copyright 2022 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketizeError {
    #[error("no free outbound packets in the pool")]
    PoolExhausted,
    #[error("unit of {size} bytes exceeds {max} and the scheme cannot fragment")]
    FragmentationNotSupported { size: usize, max: usize },
    #[error("frame is malformed at offset {offset}")]
    MalformedFrame { offset: usize },
    #[error("payload of {size} bytes does not fit in a packet of {capacity} bytes")]
    UnitTooLarge { size: usize, capacity: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DepacketizeError {
    #[error("unsupported NAL unit type {0}")]
    UnsupportedNalType(u8),
    #[error("fragment {actual} arrived while {expected} was expected")]
    OutOfOrderFragment { expected: u64, actual: u64 },
    #[error("continuation fragment without a start fragment")]
    OrphanFragment,
    #[error("picture data arrived before its picture start code")]
    MissingPictureStart,
    #[error("partial bytes do not line up ({leading} leading, {trailing} trailing)")]
    MergeMismatch { leading: u8, trailing: u8 },
    #[error("frame buffer would exceed its capacity of {capacity} bytes")]
    BufferOverflow { capacity: usize },
    #[error("payload truncated")]
    Truncated,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RtcpError {
    #[error("RTCP packet too short")]
    Truncated,
    #[error("RTCP version {0} is not supported")]
    BadVersion(u8),
    #[error("unsupported RTCP packet type {0} format {1}")]
    Unsupported(u8, u8),
}

impl From<std::io::Error> for RtcpError {
    fn from(_: std::io::Error) -> Self {
        RtcpError::Truncated
    }
}

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("the channel is closed")]
    Closed,
    #[error("the display sink rejected the frame: {0}")]
    SinkRejected(String),
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}
