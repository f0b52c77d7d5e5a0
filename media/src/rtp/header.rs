//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::ops::Range;

use byteorder::{ReadBytesExt, BE};
use videophone_common::{Writable, Writer};

use super::types::*;

pub const VERSION: u8 = 2;
pub const RTP_MIN_HEADER_LEN: usize = 12;
const RTP_PAYLOAD_TYPE_OFFSET: usize = 1;
const RTP_SEQNUM_RANGE: Range<usize> = 2..4;

/// Where the payload begins inside a packet buffer: the RTP header plus any multiplexing-ID
/// prefix that precedes it on the wire. Both directions read it; only negotiation changes it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RtpHeaderOffset {
    header_len: usize,
    multiplex_len: usize,
}

impl Default for RtpHeaderOffset {
    fn default() -> Self {
        Self::new(RTP_MIN_HEADER_LEN, 0)
    }
}

impl RtpHeaderOffset {
    pub fn new(header_len: usize, multiplex_len: usize) -> Self {
        Self {
            header_len,
            multiplex_len,
        }
    }

    pub fn header_len(&self) -> usize {
        self.header_len
    }

    pub fn multiplex_len(&self) -> usize {
        self.multiplex_len
    }

    pub fn set_header_len(&mut self, header_len: usize) {
        self.header_len = header_len;
    }

    pub fn set_multiplex_len(&mut self, multiplex_len: usize) {
        self.multiplex_len = multiplex_len;
    }

    pub fn offset(&self) -> usize {
        self.header_len + self.multiplex_len
    }

    /// The payload portion of a full packet, or None if the packet is shorter than the offset.
    pub fn payload<'a>(&self, packet: &'a [u8]) -> Option<&'a [u8]> {
        packet.get(self.offset()..)
    }
}

/// The fixed 12-byte RTP header. CSRCs and extensions are not produced by this core and are
/// skipped when parsing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RtpHeader {
    pub marker: bool,
    pub payload_type: PayloadType,
    pub seqnum: TruncatedSequenceNumber,
    pub timestamp: TruncatedTimestamp,
    pub ssrc: Ssrc,
}

impl RtpHeader {
    /// Parses the header and returns it with the length it occupies, CSRCs and extensions
    /// included.
    //
    //     0                   1                   2                   3
    //     0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
    //    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    //    |V=2|P|X|  CC   |M|     PT      |       sequence number         |
    //    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    //    |                           timestamp                           |
    //    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    //    |           synchronization source (SSRC) identifier            |
    //    +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
    pub fn parse(packet: &[u8]) -> Option<(Self, usize)> {
        if packet.len() < RTP_MIN_HEADER_LEN || packet[0] >> 6 != VERSION {
            return None;
        }
        let has_extensions = (packet[0] & 0b0001_0000) > 0;
        let csrc_count = (packet[0] & 0b0000_1111) as usize;
        let marker = (packet[RTP_PAYLOAD_TYPE_OFFSET] & 0b1000_0000) > 0;
        let payload_type = packet[RTP_PAYLOAD_TYPE_OFFSET] & 0b0111_1111;

        let mut reader = &packet[RTP_SEQNUM_RANGE.start..];
        let seqnum = reader.read_u16::<BE>().ok()?;
        let timestamp = reader.read_u32::<BE>().ok()?;
        let ssrc = reader.read_u32::<BE>().ok()?;

        let mut header_len = RTP_MIN_HEADER_LEN + 4 * csrc_count;
        if has_extensions {
            let mut extension_header = packet.get(header_len..)?;
            let _profile = extension_header.read_u16::<BE>().ok()?;
            let extension_words = extension_header.read_u16::<BE>().ok()? as usize;
            header_len += 4 + extension_words * 4;
        }
        if header_len > packet.len() {
            return None;
        }

        Some((
            Self {
                marker,
                payload_type,
                seqnum,
                timestamp,
                ssrc,
            },
            header_len,
        ))
    }
}

impl Writer for RtpHeader {
    fn written_len(&self) -> usize {
        RTP_MIN_HEADER_LEN
    }

    fn write(&self, out: &mut dyn Writable) {
        [
            VERSION << 6,
            ((self.marker as u8) << 7) | (self.payload_type & 0b0111_1111),
        ]
        .write(out);
        self.seqnum.write(out);
        self.timestamp.write(out);
        self.ssrc.write(out);
    }
}
