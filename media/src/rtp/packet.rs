//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

use byteorder::{ReadBytesExt, BE};
use videophone_common::Writer;

use super::{header::RtpHeader, types::*, RtpHeaderOffset};
use crate::{error::PacketizeError, pool::Recycle};

/// A received packet. The buffer holds the whole packet as it arrived (multiplex prefix, RTP
/// header and payload); the payload starts at `payload_offset`.
#[derive(Debug, Clone, Default)]
pub struct InboundPacket {
    data: Vec<u8>,
    payload_offset: usize,
    pub seqnum: FullSequenceNumber,
    pub truncated_seqnum: TruncatedSequenceNumber,
    pub timestamp: TruncatedTimestamp,
    pub ssrc: Ssrc,
    pub marker: bool,
    pub payload_type: PayloadType,
    pub retransmission: bool,
    /// Bits of the first payload byte that belong to the previous packet (H.263).
    pub leading_skip_bits: u8,
    /// Bits of the last payload byte that belong to the next packet (H.263).
    pub trailing_skip_bits: u8,
}

impl InboundPacket {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            ..Default::default()
        }
    }

    /// Copies a received packet in. The extended sequence number is filled in later by the
    /// receive pipeline.
    pub fn fill(&mut self, header: &RtpHeader, packet: &[u8], offset: RtpHeaderOffset) {
        self.data.clear();
        self.data.extend_from_slice(packet);
        self.payload_offset = offset.offset().min(self.data.len());
        self.truncated_seqnum = header.seqnum;
        self.seqnum = header.seqnum as FullSequenceNumber;
        self.timestamp = header.timestamp;
        self.ssrc = header.ssrc;
        self.marker = header.marker;
        self.payload_type = header.payload_type;
        self.retransmission = false;
        self.leading_skip_bits = 0;
        self.trailing_skip_bits = 0;
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[self.payload_offset..]
    }

    pub fn payload_len(&self) -> usize {
        self.data.len() - self.payload_offset
    }

    /// Undoes RTX encapsulation (RFC 4588): the original sequence number is in the first two
    /// payload bytes. Returns None if the payload is too short to hold it.
    pub fn unwrap_rtx(&mut self, original_payload_type: PayloadType) -> Option<()> {
        let original_seqnum = self.payload().read_u16::<BE>().ok()?;
        self.payload_offset += 2;
        self.truncated_seqnum = original_seqnum;
        self.seqnum = original_seqnum as FullSequenceNumber;
        self.payload_type = original_payload_type;
        self.retransmission = true;
        Some(())
    }
}

impl Recycle for InboundPacket {
    fn recycle(&mut self) {
        self.data.clear();
        self.payload_offset = 0;
        self.retransmission = false;
        self.leading_skip_bits = 0;
        self.trailing_skip_bits = 0;
    }
}

/// A packet being sent. Headroom equal to the header offset is reserved in front of the
/// payload so the transport can write the multiplex prefix and RTP header in place.
#[derive(Debug, Clone)]
pub struct OutboundPacket {
    buffer: Vec<u8>,
    headroom: usize,
    capacity: usize,
    pub payload_type: PayloadType,
    pub timestamp: TruncatedTimestamp,
    pub marker: bool,
    pub keyframe: bool,
    /// Assigned by the transport when the packet is sent.
    pub seqnum: Option<TruncatedSequenceNumber>,
}

impl OutboundPacket {
    /// `capacity` bounds the whole packet, headroom included.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
            headroom: 0,
            capacity,
            payload_type: 0,
            timestamp: 0,
            marker: false,
            keyframe: false,
            seqnum: None,
        }
    }

    pub fn reserve_headroom(&mut self, offset: RtpHeaderOffset) {
        self.buffer.clear();
        self.headroom = offset.offset();
        self.buffer.resize(self.headroom, 0);
    }

    /// Appends the pieces to the payload, failing without writing anything if they would not
    /// all fit.
    pub fn write_payload(&mut self, pieces: &[&[u8]]) -> Result<(), PacketizeError> {
        let size: usize = pieces.iter().map(|piece| piece.len()).sum();
        if self.buffer.len() + size > self.capacity {
            return Err(PacketizeError::UnitTooLarge {
                size: self.payload_len() + size,
                capacity: self.capacity.saturating_sub(self.headroom),
            });
        }
        for piece in pieces {
            self.buffer.extend_from_slice(piece);
        }
        Ok(())
    }

    pub fn payload(&self) -> &[u8] {
        &self.buffer[self.headroom..]
    }

    pub fn payload_len(&self) -> usize {
        self.buffer.len() - self.headroom
    }

    /// Writes the multiplex prefix and RTP header into the headroom and returns the finished
    /// packet bytes.
    pub fn serialize(&mut self, multiplex_id: &[u8], header: &RtpHeader) -> &[u8] {
        let multiplex_len = multiplex_id.len().min(self.headroom);
        self.buffer[..multiplex_len].copy_from_slice(&multiplex_id[..multiplex_len]);
        let header = header.to_vec();
        let header_len = header.len().min(self.headroom - multiplex_len);
        self.buffer[multiplex_len..][..header_len].copy_from_slice(&header[..header_len]);
        &self.buffer
    }
}

impl Recycle for OutboundPacket {
    fn recycle(&mut self) {
        self.buffer.clear();
        self.headroom = 0;
        self.marker = false;
        self.keyframe = false;
        self.seqnum = None;
    }
}
