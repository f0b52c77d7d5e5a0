//
// Copyright 2022 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Codec identifiers and the negotiated ways of carrying them over RTP.

use strum_macros::{Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum VideoCodec {
    H263,
    H264,
    H265,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum PacketizationScheme {
    H263Rfc2190,
    H263Rfc2429,
    H264SingleNal,
    #[default]
    H264NonInterleaved,
    H264Interleaved,
    H265NonInterleaved,
}

impl PacketizationScheme {
    pub fn codec(&self) -> VideoCodec {
        match self {
            Self::H263Rfc2190 | Self::H263Rfc2429 => VideoCodec::H263,
            Self::H264SingleNal | Self::H264NonInterleaved | Self::H264Interleaved => {
                VideoCodec::H264
            }
            Self::H265NonInterleaved => VideoCodec::H265,
        }
    }

    /// The scheme used when the offer names only a codec.
    pub fn default_for(codec: VideoCodec) -> Self {
        match codec {
            VideoCodec::H263 => Self::H263Rfc2190,
            VideoCodec::H264 => Self::H264SingleNal,
            VideoCodec::H265 => Self::H265NonInterleaved,
        }
    }
}

/// How the encoder delimits units inside one frame, and how the depacketizer writes them back.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum FrameFormat {
    /// Units separated by `00 00 01` or `00 00 00 01` start codes.
    ByteStream,
    LittleEndianPacked,
    #[default]
    BigEndianPacked,
    /// Little endian length prefix, each unit padded to a four byte boundary.
    LittleEndianFourByteAligned,
}

impl FrameFormat {
    pub fn uses_start_codes(&self) -> bool {
        matches!(self, Self::ByteStream)
    }
}

/// Which byte count feeds the received-bytes statistics when partial-byte payloads are merged.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum ByteAccounting {
    /// Bytes actually copied into the frame, after blending shared partial bytes.
    #[default]
    Processed,
    /// Payload bytes as they arrived off the wire.
    Received,
}
