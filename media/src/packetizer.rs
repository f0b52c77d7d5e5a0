//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Slices an encoded frame into RTP payloads.
//!
//! The frame is split into units according to its [`FrameFormat`]. Units that fit are sent
//! whole; larger ones are fragmented (FU-A for H.264, FU for H.265) into pieces of equal size
//! so that no tiny trailing fragment is produced. The last payload of the frame carries the
//! marker bit.

use std::{collections::VecDeque, iter::Peekable, sync::Arc};

use log::*;
use videophone_metrics::{EventCountReporter, Metrics};

use crate::{
    codec::{FrameFormat, PacketizationScheme, VideoCodec},
    error::PacketizeError,
    pool::Pool,
    rtp::{OutboundPacket, PayloadType, RtpHeaderOffset, TruncatedTimestamp},
};

const H264_FU_A_TYPE: u8 = 28;
const H264_STAP_A_TYPE: u8 = 24;
const H265_FU_TYPE: u8 = 49;
const MAX_PAYLOAD_HEADER_LEN: usize = 4;

/// One frame as delivered by the encoder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodedFrame {
    pub data: Vec<u8>,
    pub keyframe: bool,
}

/// A payload header (FU indicator and header, or an H.263 payload header) and the unit bytes
/// that follow it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Payload<'a> {
    header: [u8; MAX_PAYLOAD_HEADER_LEN],
    header_len: usize,
    pub body: &'a [u8],
    pub marker: bool,
}

impl<'a> Payload<'a> {
    fn new(header: &[u8], body: &'a [u8]) -> Self {
        let mut payload = Self {
            header: [0; MAX_PAYLOAD_HEADER_LEN],
            header_len: header.len(),
            body,
            marker: false,
        };
        payload.header[..header.len()].copy_from_slice(header);
        payload
    }

    pub fn header(&self) -> &[u8] {
        &self.header[..self.header_len]
    }

    pub fn len(&self) -> usize {
        self.header_len + self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        [self.header(), self.body].concat()
    }
}

/// Returns (position, length) of the next `00 00 01` or `00 00 00 01` at or after `from`.
fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let at = from + data.get(from..)?.windows(3).position(|w| w == [0, 0, 1])?;
    if at > from && data[at - 1] == 0 {
        Some((at - 1, 4))
    } else {
        Some((at, 3))
    }
}

/// The units of one frame. Stops after the first error.
struct Units<'a> {
    data: &'a [u8],
    /// None carries the whole frame as one unit.
    format: Option<FrameFormat>,
    position: usize,
    failed: bool,
}

impl<'a> Units<'a> {
    fn next_unit(&mut self) -> Option<Result<&'a [u8], PacketizeError>> {
        if self.failed || self.position >= self.data.len() {
            return None;
        }
        let Some(format) = self.format else {
            self.position = self.data.len();
            return Some(Ok(self.data));
        };
        if format.uses_start_codes() {
            let Some((at, len)) = find_start_code(self.data, self.position) else {
                self.position = self.data.len();
                return None;
            };
            let start = at + len;
            let end = find_start_code(self.data, start).map_or(self.data.len(), |(at, _)| at);
            self.position = end;
            return Some(Ok(&self.data[start..end]));
        }

        let offset = self.position;
        let Some(prefix) = self.data.get(offset..offset + 4) else {
            return Some(Err(PacketizeError::MalformedFrame { offset }));
        };
        let prefix = [prefix[0], prefix[1], prefix[2], prefix[3]];
        let size = match format {
            FrameFormat::BigEndianPacked => u32::from_be_bytes(prefix),
            _ => u32::from_le_bytes(prefix),
        } as usize;
        let Some(unit) = self.data.get(offset + 4..offset + 4 + size) else {
            return Some(Err(PacketizeError::MalformedFrame { offset }));
        };
        let advance = match format {
            FrameFormat::LittleEndianFourByteAligned => (size + 4 + 3) & !3,
            _ => size + 4,
        };
        self.position = offset + advance;
        Some(Ok(unit))
    }
}

impl<'a> Iterator for Units<'a> {
    type Item = Result<&'a [u8], PacketizeError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let unit = self.next_unit()?;
            match unit {
                Ok(unit) if unit.is_empty() => continue,
                Err(_) => self.failed = true,
                Ok(_) => {}
            }
            return Some(unit);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FragmentKind {
    /// FU-A, RFC 6184 section 5.8.
    H264,
    /// FU, RFC 7798 section 4.4.3.
    H265,
}

impl FragmentKind {
    fn nal_header_len(&self) -> usize {
        match self {
            Self::H264 => 1,
            Self::H265 => 2,
        }
    }

    fn fu_header_len(&self) -> usize {
        self.nal_header_len() + 1
    }

    fn write_header(&self, unit: &[u8], start: bool, end: bool, out: &mut [u8]) -> usize {
        let flags = ((start as u8) << 7) | ((end as u8) << 6);
        match self {
            Self::H264 => {
                out[0] = (unit[0] & 0xE0) | H264_FU_A_TYPE;
                out[1] = flags | (unit[0] & 0x1F);
                2
            }
            Self::H265 => {
                out[0] = (unit[0] & 0x81) | (H265_FU_TYPE << 1);
                out[1] = unit[1];
                out[2] = flags | ((unit[0] >> 1) & 0x3F);
                3
            }
        }
    }
}

/// Walks one oversized unit in equal-sized fragments.
struct Fragmenter<'a> {
    unit: &'a [u8],
    kind: FragmentKind,
    offset: usize,
    fragment_size: usize,
}

impl<'a> Fragmenter<'a> {
    fn new(unit: &'a [u8], kind: FragmentKind, max_payload_size: usize) -> Self {
        let offset = kind.nal_header_len();
        let remaining = unit.len() - offset;
        let room = max_payload_size.saturating_sub(kind.fu_header_len()).max(1);
        Self {
            unit,
            kind,
            offset,
            fragment_size: remaining / ((remaining / room) + 1),
        }
    }

    /// Returns the next fragment and whether it is the last.
    fn next_fragment(&mut self, max_payload_size: usize) -> (Payload<'a>, bool) {
        let start = self.offset == self.kind.nal_header_len();
        let rest = self.unit.len() - self.offset;
        let end = rest <= max_payload_size.saturating_sub(self.kind.fu_header_len());
        let size = if end { rest } else { self.fragment_size.max(1) };

        let mut header = [0u8; MAX_PAYLOAD_HEADER_LEN];
        let header_len = self.kind.write_header(self.unit, start, end, &mut header);
        let body = &self.unit[self.offset..self.offset + size];
        self.offset += size;
        (Payload::new(&header[..header_len], body), end)
    }
}

/// The lazy, finite sequence of payloads for one frame.
pub struct Payloads<'a> {
    scheme: PacketizationScheme,
    max_payload_size: usize,
    keyframe: bool,
    units: Peekable<Units<'a>>,
    fragmenter: Option<Fragmenter<'a>>,
    failed: bool,
}

impl<'a> Payloads<'a> {
    fn finish(&mut self, mut payload: Payload<'a>) -> Payload<'a> {
        payload.marker = self.fragmenter.is_none() && self.units.peek().is_none();
        payload
    }

    fn next_payload(&mut self) -> Option<Result<Payload<'a>, PacketizeError>> {
        if let Some(fragmenter) = &mut self.fragmenter {
            let (payload, end) = fragmenter.next_fragment(self.max_payload_size);
            if end {
                self.fragmenter = None;
            }
            return Some(Ok(self.finish(payload)));
        }

        let unit = match self.units.next()? {
            Ok(unit) => unit,
            Err(err) => return Some(Err(err)),
        };
        let payload = match self.scheme {
            PacketizationScheme::H263Rfc2190 => {
                // Mode A header; only the picture coding type is filled in.
                let header = [0, if self.keyframe { 0x00 } else { 0x10 }, 0, 0];
                Payload::new(&header, unit)
            }
            PacketizationScheme::H263Rfc2429 => match unit {
                [0, 0, rest @ ..] => Payload::new(&[0x04, 0x00], rest),
                _ => Payload::new(&[0x00, 0x00], unit),
            },
            _ if unit.len() <= self.max_payload_size => Payload::new(&[], unit),
            PacketizationScheme::H264NonInterleaved | PacketizationScheme::H264Interleaved => {
                let mut fragmenter =
                    Fragmenter::new(unit, FragmentKind::H264, self.max_payload_size);
                let (payload, _) = fragmenter.next_fragment(self.max_payload_size);
                self.fragmenter = Some(fragmenter);
                payload
            }
            PacketizationScheme::H265NonInterleaved => {
                let mut fragmenter =
                    Fragmenter::new(unit, FragmentKind::H265, self.max_payload_size);
                let (payload, _) = fragmenter.next_fragment(self.max_payload_size);
                self.fragmenter = Some(fragmenter);
                payload
            }
            PacketizationScheme::H264SingleNal => {
                return Some(Err(PacketizeError::FragmentationNotSupported {
                    size: unit.len(),
                    max: self.max_payload_size,
                }));
            }
        };
        if self.scheme.codec() == VideoCodec::H263 && payload.len() > self.max_payload_size {
            return Some(Err(PacketizeError::FragmentationNotSupported {
                size: payload.len(),
                max: self.max_payload_size,
            }));
        }
        Some(Ok(self.finish(payload)))
    }
}

impl<'a> Iterator for Payloads<'a> {
    type Item = Result<Payload<'a>, PacketizeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let next = self.next_payload();
        if matches!(next, Some(Err(_))) {
            self.failed = true;
        }
        next
    }
}

/// Packs small NAL units behind a single STAP-A header, each preceded by its 2-byte length.
pub fn aggregate_stap_a(units: &[&[u8]]) -> Vec<u8> {
    let forbidden = units.iter().any(|unit| unit.first().is_some_and(|h| h & 0x80 != 0));
    let nri = units
        .iter()
        .filter_map(|unit| unit.first().map(|h| h & 0x60))
        .max()
        .unwrap_or(0);
    let mut out = vec![((forbidden as u8) << 7) | nri | H264_STAP_A_TYPE];
    for unit in units {
        out.extend_from_slice(&(unit.len() as u16).to_be_bytes());
        out.extend_from_slice(unit);
    }
    out
}

pub struct Packetizer {
    scheme: PacketizationScheme,
    format: FrameFormat,
    max_payload_size: usize,
    header_offset: RtpHeaderOffset,
    payload_type: PayloadType,
    frames: Arc<EventCountReporter>,
    packets: Arc<EventCountReporter>,
    pool_exhausted: Arc<EventCountReporter>,
}

impl Packetizer {
    pub fn new(
        scheme: PacketizationScheme,
        format: FrameFormat,
        max_payload_size: usize,
        header_offset: RtpHeaderOffset,
        payload_type: PayloadType,
        metrics: &Metrics,
    ) -> Self {
        Self {
            scheme,
            format,
            max_payload_size,
            header_offset,
            payload_type,
            frames: metrics.event("videophone.packetizer.frames"),
            packets: metrics.event("videophone.packetizer.packets"),
            pool_exhausted: metrics.event("videophone.packetizer.pool_exhausted"),
        }
    }

    pub fn payloads<'a>(&self, frame: &'a EncodedFrame) -> Payloads<'a> {
        // H.263 pictures are carried whole.
        let format = (self.scheme.codec() != VideoCodec::H263).then_some(self.format);
        Payloads {
            scheme: self.scheme,
            max_payload_size: self.max_payload_size,
            keyframe: frame.keyframe,
            units: Units {
                data: &frame.data,
                format,
                position: 0,
                failed: false,
            }
            .peekable(),
            fragmenter: None,
            failed: false,
        }
    }

    /// Turns the frame into packets drawn from `pool`, appending them to `queue`. If the pool
    /// runs dry, the rest of the frame is abandoned and the packets already queued stay queued.
    pub fn packetize(
        &self,
        frame: &EncodedFrame,
        timestamp: TruncatedTimestamp,
        pool: &mut Pool<OutboundPacket>,
        queue: &mut VecDeque<OutboundPacket>,
    ) -> Result<usize, PacketizeError> {
        self.frames.count();
        let queued_before = queue.len();
        let result = self.fill_queue(frame, timestamp, pool, queue);
        let count = queue.len() - queued_before;
        self.packets.count_n(count);
        result.map(|()| count)
    }

    fn fill_queue(
        &self,
        frame: &EncodedFrame,
        timestamp: TruncatedTimestamp,
        pool: &mut Pool<OutboundPacket>,
        queue: &mut VecDeque<OutboundPacket>,
    ) -> Result<(), PacketizeError> {
        for payload in self.payloads(frame) {
            let payload = payload?;
            let Some(mut packet) = pool.take() else {
                self.pool_exhausted.count();
                warn!(
                    "packet pool exhausted, abandoning the rest of frame {}",
                    timestamp
                );
                return Err(PacketizeError::PoolExhausted);
            };
            packet.reserve_headroom(self.header_offset);
            if let Err(err) = packet.write_payload(&[payload.header(), payload.body]) {
                pool.give_back(packet);
                return Err(err);
            }
            packet.payload_type = self.payload_type;
            packet.timestamp = timestamp;
            packet.marker = payload.marker;
            packet.keyframe = frame.keyframe;
            queue.push_back(packet);
        }
        Ok(())
    }
}
