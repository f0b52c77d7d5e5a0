//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Reverses packetization: single units, aggregation packets (STAP-A, AP), fragmentation
//! units (FU-A, FU) and H.263 payloads are written into a [`VideoFrame`] as prefixed units.
//!
//! A fragmented unit is only kept once its end fragment arrives. Anything that breaks the
//! chain (a gap, a buffer overflow, a new unit starting) rolls the frame back to where the
//! unit began.

use std::sync::Arc;

use log::*;
use videophone_metrics::{EventCountReporter, Metrics};

use crate::{
    codec::{ByteAccounting, FrameFormat, PacketizationScheme, VideoCodec},
    error::DepacketizeError,
    frame_buffer::{FragmentInProgress, VideoFrame, START_CODE, UNIT_PREFIX_LEN},
    rtp::{FullSequenceNumber, InboundPacket},
};

const H264_NAL_TYPE_MASK: u8 = 0x1F;
const H264_NAL_TYPE_IDR: u8 = 5;
const H264_NAL_TYPE_STAP_A: u8 = 24;
const H264_NAL_TYPE_FU_A: u8 = 28;
const H265_NAL_TYPE_AP: u8 = 48;
const H265_NAL_TYPE_FU: u8 = 49;
const FU_START_BIT: u8 = 0x80;
const FU_END_BIT: u8 = 0x40;

// Indexed by the number of bits to drop from the start (or end) of a byte.
const H263_START_MASK: [u8; 9] = [0xff, 0x7f, 0x3f, 0x1f, 0x0f, 0x07, 0x03, 0x01, 0x00];
const H263_END_MASK: [u8; 9] = [0xff, 0xfe, 0xfc, 0xf8, 0xf0, 0xe0, 0xc0, 0x80, 0x00];

pub fn h264_nal_type(header: u8) -> u8 {
    header & H264_NAL_TYPE_MASK
}

pub fn h265_nal_type(header: u8) -> u8 {
    (header >> 1) & 0x3F
}

/// BLA, IDR and CRA pictures.
pub fn is_h265_keyframe_type(nal_type: u8) -> bool {
    (16..=21).contains(&nal_type)
}

/// The partial-bit counts from an RFC 2190 payload header: (SBIT, EBIT).
pub fn h263_skip_bits(payload: &[u8]) -> Option<(u8, u8)> {
    payload
        .first()
        .map(|first| ((first >> 3) & 0x07, first & 0x07))
}

/// Mode A is 4 bytes, mode B 8 and mode C 12, selected by the F and P bits.
fn rfc2190_header_len(first: u8) -> usize {
    match (first & 0x80 != 0, first & 0x40 != 0) {
        (false, _) => 4,
        (true, false) => 8,
        (true, true) => 12,
    }
}

/// A picture start code is 22 bits: `0000 0000 0000 0000 1000 00`.
fn is_h263_picture_start(data: &[u8]) -> bool {
    matches!(data, [0, 0, third, ..] if (0x80..=0x83).contains(third))
}

/// Intra pictures have the picture coding type bit of PTYPE clear.
fn is_h263_intra(picture: &[u8]) -> bool {
    picture.get(4).is_some_and(|ptype| ptype & 0x02 == 0)
}

pub struct Depacketizer {
    scheme: PacketizationScheme,
    format: FrameFormat,
    byte_accounting: ByteAccounting,
    unsupported_units: Arc<EventCountReporter>,
    ignored_units: Arc<EventCountReporter>,
    merge_failures: Arc<EventCountReporter>,
}

impl Depacketizer {
    pub fn new(
        scheme: PacketizationScheme,
        format: FrameFormat,
        byte_accounting: ByteAccounting,
        metrics: &Metrics,
    ) -> Self {
        Self {
            scheme,
            format,
            byte_accounting,
            unsupported_units: metrics.event("videophone.depacketizer.unsupported_unit"),
            ignored_units: metrics.event("videophone.depacketizer.ignored_unit"),
            merge_failures: metrics.event("videophone.depacketizer.merge_failure"),
        }
    }

    pub fn scheme(&self) -> PacketizationScheme {
        self.scheme
    }

    pub fn set_scheme(&mut self, scheme: PacketizationScheme) {
        self.scheme = scheme;
    }

    /// Adds one packet's payload to the frame and returns the byte count to charge to the
    /// received-bytes statistics.
    ///
    /// On failure any unfinished fragmented unit is rolled back and the frame is marked as
    /// missing data, except for unsupported unit types which are skipped without
    /// affecting the frame.
    pub fn process(
        &self,
        frame: &mut VideoFrame,
        packet: &InboundPacket,
    ) -> Result<usize, DepacketizeError> {
        let result = match self.scheme {
            PacketizationScheme::H263Rfc2190 => self.process_h263_rfc2190(frame, packet),
            PacketizationScheme::H263Rfc2429 => self.process_h263_rfc2429(frame, packet),
            PacketizationScheme::H264SingleNal
            | PacketizationScheme::H264NonInterleaved
            | PacketizationScheme::H264Interleaved => self.process_h264(frame, packet),
            PacketizationScheme::H265NonInterleaved => self.process_h265(frame, packet),
        };
        match result {
            Ok(processed) => Ok(match self.byte_accounting {
                ByteAccounting::Processed => processed,
                ByteAccounting::Received => packet.payload_len(),
            }),
            Err(err @ DepacketizeError::UnsupportedNalType(_)) => {
                self.unsupported_units.count();
                warn!("seqnum {}: {}", packet.seqnum, err);
                Err(err)
            }
            Err(err) => {
                self.merge_failures.count();
                debug!("seqnum {}: merge failed: {}", packet.seqnum, err);
                frame.roll_back_fragment();
                frame.missing_packet = true;
                if self.scheme.codec() == VideoCodec::H263 {
                    // Bit-aligned data cannot be resynchronized mid-picture.
                    frame.buffer.clear();
                }
                Err(err)
            }
        }
    }

    fn unit_prefix(&self, size: usize) -> [u8; UNIT_PREFIX_LEN] {
        if self.format.uses_start_codes() {
            START_CODE
        } else {
            (size as u32).to_be_bytes()
        }
    }

    /// Writes a complete unit with its prefix, or nothing at all.
    fn write_unit(&self, frame: &mut VideoFrame, unit: &[u8]) -> Result<usize, DepacketizeError> {
        let checkpoint = frame.buffer.checkpoint();
        let result = frame
            .buffer
            .extend_from_slice(&self.unit_prefix(unit.len()))
            .and_then(|_| frame.buffer.extend_from_slice(unit));
        if result.is_err() {
            frame.buffer.truncate_to(checkpoint);
        }
        result.map(|_| unit.len())
    }

    /// Walks (2-byte length, unit) pairs.
    fn write_aggregate(
        &self,
        frame: &mut VideoFrame,
        units: &[u8],
        is_keyframe_unit: impl Fn(u8) -> bool,
    ) -> Result<usize, DepacketizeError> {
        frame.roll_back_fragment();
        let mut position = 0;
        let mut processed = 0;
        while position + 2 < units.len() {
            let size = u16::from_be_bytes([units[position], units[position + 1]]) as usize;
            let unit = units
                .get(position + 2..position + 2 + size)
                .ok_or(DepacketizeError::Truncated)?;
            processed += self.write_unit(frame, unit)?;
            if unit.first().is_some_and(|header| is_keyframe_unit(*header)) {
                frame.keyframe = true;
            }
            position += 2 + size;
        }
        Ok(processed)
    }

    fn write_fragment(
        &self,
        frame: &mut VideoFrame,
        seqnum: FullSequenceNumber,
        fu_header: u8,
        unit_header: &[u8],
        body: &[u8],
    ) -> Result<usize, DepacketizeError> {
        if fu_header & FU_START_BIT != 0 {
            frame.roll_back_fragment();
            let unit_start = frame.buffer.reserve_prefix()?;
            frame.fragment = Some(FragmentInProgress {
                unit_start,
                next_seqnum: seqnum + 1,
            });
            frame.buffer.extend_from_slice(unit_header)?;
            frame.buffer.extend_from_slice(body)?;
            return Ok(body.len());
        }

        let fragment = frame
            .fragment
            .as_mut()
            .ok_or(DepacketizeError::OrphanFragment)?;
        if fragment.next_seqnum != seqnum {
            return Err(DepacketizeError::OutOfOrderFragment {
                expected: fragment.next_seqnum,
                actual: seqnum,
            });
        }
        fragment.next_seqnum += 1;
        let unit_start = fragment.unit_start;

        frame.buffer.extend_from_slice(body)?;
        if fu_header & FU_END_BIT != 0 {
            let size = frame.len() - unit_start.offset() - UNIT_PREFIX_LEN;
            frame.buffer.fill_prefix(unit_start, self.unit_prefix(size));
            frame.fragment = None;
        }
        Ok(body.len())
    }

    fn process_h264(
        &self,
        frame: &mut VideoFrame,
        packet: &InboundPacket,
    ) -> Result<usize, DepacketizeError> {
        let payload = packet.payload();
        let nal_header = *payload.first().ok_or(DepacketizeError::Truncated)?;
        match h264_nal_type(nal_header) {
            nal_type @ 1..=12 => {
                frame.roll_back_fragment();
                let processed = self.write_unit(frame, payload)?;
                if nal_type == H264_NAL_TYPE_IDR {
                    frame.keyframe = true;
                }
                Ok(processed)
            }
            13..=23 => {
                self.ignored_units.count();
                trace!("ignoring NAL unit type {}", h264_nal_type(nal_header));
                Ok(0)
            }
            H264_NAL_TYPE_STAP_A => self.write_aggregate(frame, &payload[1..], |header| {
                h264_nal_type(header) == H264_NAL_TYPE_IDR
            }),
            H264_NAL_TYPE_FU_A => {
                let fu_header = *payload.get(1).ok_or(DepacketizeError::Truncated)?;
                let unit_header = (nal_header & 0xE0) | (fu_header & H264_NAL_TYPE_MASK);
                let processed = self.write_fragment(
                    frame,
                    packet.seqnum,
                    fu_header,
                    &[unit_header],
                    &payload[2..],
                )?;
                if fu_header & FU_START_BIT != 0 && h264_nal_type(unit_header) == H264_NAL_TYPE_IDR
                {
                    frame.keyframe = true;
                }
                Ok(processed)
            }
            nal_type => Err(DepacketizeError::UnsupportedNalType(nal_type)),
        }
    }

    fn process_h265(
        &self,
        frame: &mut VideoFrame,
        packet: &InboundPacket,
    ) -> Result<usize, DepacketizeError> {
        let payload = packet.payload();
        if payload.len() < 2 {
            return Err(DepacketizeError::Truncated);
        }
        match h265_nal_type(payload[0]) {
            nal_type @ 0..=47 => {
                frame.roll_back_fragment();
                let processed = self.write_unit(frame, payload)?;
                if is_h265_keyframe_type(nal_type) {
                    frame.keyframe = true;
                }
                Ok(processed)
            }
            H265_NAL_TYPE_AP => self.write_aggregate(frame, &payload[2..], |header| {
                is_h265_keyframe_type(h265_nal_type(header))
            }),
            H265_NAL_TYPE_FU => {
                let fu_header = *payload.get(2).ok_or(DepacketizeError::Truncated)?;
                let fu_type = fu_header & 0x3F;
                let unit_header = [(payload[0] & 0x81) | (fu_type << 1), payload[1]];
                let processed = self.write_fragment(
                    frame,
                    packet.seqnum,
                    fu_header,
                    &unit_header,
                    &payload[3..],
                )?;
                if fu_header & FU_START_BIT != 0 && is_h265_keyframe_type(fu_type) {
                    frame.keyframe = true;
                }
                Ok(processed)
            }
            nal_type => Err(DepacketizeError::UnsupportedNalType(nal_type)),
        }
    }

    fn process_h263_rfc2190(
        &self,
        frame: &mut VideoFrame,
        packet: &InboundPacket,
    ) -> Result<usize, DepacketizeError> {
        let payload = packet.payload();
        let first = *payload.first().ok_or(DepacketizeError::Truncated)?;
        let data = payload
            .get(rfc2190_header_len(first)..)
            .filter(|data| !data.is_empty())
            .ok_or(DepacketizeError::Truncated)?;
        let leading = packet.leading_skip_bits;

        if frame.is_empty() {
            if !is_h263_picture_start(data) {
                return Err(DepacketizeError::MissingPictureStart);
            }
            frame.buffer.extend_from_slice(data)?;
            frame.leading_skip_bits = leading;
            frame.trailing_skip_bits = packet.trailing_skip_bits;
            frame.keyframe = is_h263_intra(data);
            return Ok(data.len());
        }

        let trailing = frame.trailing_skip_bits;
        let mut blended = 0;
        if trailing > 0 {
            if leading + trailing != 8 {
                return Err(DepacketizeError::MergeMismatch { leading, trailing });
            }
            if let Some(last) = frame.buffer.last_mut() {
                *last = (*last & H263_END_MASK[trailing as usize])
                    | (data[0] & H263_START_MASK[leading as usize]);
            }
            blended = 1;
        }
        frame.buffer.extend_from_slice(&data[blended..])?;
        frame.trailing_skip_bits = packet.trailing_skip_bits;
        Ok(data.len() - blended)
    }

    /// RFC 2429 (H.263+): a 2-byte header; when P is set the two zero bytes of the start code
    /// were elided by the sender.
    fn process_h263_rfc2429(
        &self,
        frame: &mut VideoFrame,
        packet: &InboundPacket,
    ) -> Result<usize, DepacketizeError> {
        let payload = packet.payload();
        if payload.len() < 2 {
            return Err(DepacketizeError::Truncated);
        }
        let picture_start = payload[0] & 0x04 != 0;
        let has_vrc = payload[0] & 0x02 != 0;
        let extra_header_len = (((payload[0] & 0x01) << 5) | (payload[1] >> 3)) as usize;
        let data = payload
            .get(2 + has_vrc as usize + extra_header_len..)
            .ok_or(DepacketizeError::Truncated)?;

        let was_empty = frame.is_empty();
        if was_empty && !picture_start {
            return Err(DepacketizeError::MissingPictureStart);
        }
        if picture_start {
            frame.buffer.extend_from_slice(&[0, 0])?;
        }
        frame.buffer.extend_from_slice(data)?;
        if was_empty {
            frame.keyframe = is_h263_intra(frame.data());
        }
        Ok(data.len())
    }
}

#[cfg(test)]
mod tests {
    use videophone_common::Writer;

    use super::*;
    use crate::rtp::{RtpHeader, RtpHeaderOffset};

    fn packet(seqnum: FullSequenceNumber, payload: &[u8]) -> InboundPacket {
        let header = RtpHeader {
            payload_type: 96,
            seqnum: seqnum as u16,
            timestamp: 9000,
            ..Default::default()
        };
        let mut raw = header.to_vec();
        raw.extend_from_slice(payload);
        let mut packet = InboundPacket::with_capacity(1500);
        packet.fill(&header, &raw, RtpHeaderOffset::default());
        packet.seqnum = seqnum;
        packet
    }

    fn h263_packet(seqnum: FullSequenceNumber, payload: &[u8]) -> InboundPacket {
        let mut packet = packet(seqnum, payload);
        let (leading, trailing) = h263_skip_bits(payload).unwrap();
        packet.leading_skip_bits = leading;
        packet.trailing_skip_bits = trailing;
        packet
    }

    fn depacketizer(scheme: PacketizationScheme, format: FrameFormat) -> Depacketizer {
        Depacketizer::new(scheme, format, ByteAccounting::Processed, &Metrics::default())
    }

    fn frame() -> VideoFrame {
        let mut frame = VideoFrame::with_capacity(64 * 1024);
        frame.start(9000);
        frame
    }

    #[test]
    fn single_nal_units() {
        let depacketizer =
            depacketizer(PacketizationScheme::H264NonInterleaved, FrameFormat::BigEndianPacked);
        let mut frame = frame();
        assert_eq!(Ok(3), depacketizer.process(&mut frame, &packet(1, &[0x67, 1, 2])));
        assert!(!frame.keyframe);
        assert_eq!(Ok(2), depacketizer.process(&mut frame, &packet(2, &[0x65, 3])));
        assert!(frame.keyframe);
        assert_eq!(&[0, 0, 0, 3, 0x67, 1, 2, 0, 0, 0, 2, 0x65, 3], frame.data());
    }

    #[test]
    fn byte_stream_uses_start_codes() {
        let depacketizer =
            depacketizer(PacketizationScheme::H264NonInterleaved, FrameFormat::ByteStream);
        let mut frame = frame();
        depacketizer.process(&mut frame, &packet(1, &[0x41, 9])).unwrap();
        assert_eq!(&[0, 0, 0, 1, 0x41, 9], frame.data());
    }

    #[test]
    fn ignored_and_unsupported_types() {
        let depacketizer =
            depacketizer(PacketizationScheme::H264NonInterleaved, FrameFormat::BigEndianPacked);
        let mut frame = frame();
        assert_eq!(Ok(0), depacketizer.process(&mut frame, &packet(1, &[0x0e, 1])));
        assert_eq!(
            Err(DepacketizeError::UnsupportedNalType(25)),
            depacketizer.process(&mut frame, &packet(2, &[0x19, 1]))
        );
        assert_eq!(
            Err(DepacketizeError::UnsupportedNalType(0)),
            depacketizer.process(&mut frame, &packet(3, &[0x00, 1]))
        );
        assert!(frame.is_empty());
        assert!(!frame.missing_packet);
        assert_eq!(2, depacketizer.unsupported_units.get());
        assert_eq!(1, depacketizer.ignored_units.get());
    }

    #[test]
    fn stap_a_detects_keyframe() {
        let depacketizer =
            depacketizer(PacketizationScheme::H264NonInterleaved, FrameFormat::BigEndianPacked);
        let mut frame = frame();
        let stap = [0x18, 0, 2, 0x67, 1, 0, 3, 0x65, 2, 3];
        assert_eq!(Ok(5), depacketizer.process(&mut frame, &packet(1, &stap)));
        assert!(frame.keyframe);
        assert_eq!(
            &[0, 0, 0, 2, 0x67, 1, 0, 0, 0, 3, 0x65, 2, 3],
            frame.data()
        );

        let mut frame = self::frame();
        let truncated = [0x18, 0, 9, 0x67, 1];
        assert_eq!(
            Err(DepacketizeError::Truncated),
            depacketizer.process(&mut frame, &packet(2, &truncated))
        );
        assert!(frame.missing_packet);
    }

    #[test]
    fn fu_a_reassembly() {
        let depacketizer =
            depacketizer(PacketizationScheme::H264NonInterleaved, FrameFormat::BigEndianPacked);
        let mut frame = frame();
        // Original NAL header 0x65: NRI 3, type 5.
        depacketizer.process(&mut frame, &packet(10, &[0x7c, 0x85, 1, 2])).unwrap();
        assert!(frame.fragment.is_some());
        depacketizer.process(&mut frame, &packet(11, &[0x7c, 0x05, 3])).unwrap();
        depacketizer.process(&mut frame, &packet(12, &[0x7c, 0x45, 4])).unwrap();
        assert!(frame.fragment.is_none());
        assert!(frame.keyframe);
        assert_eq!(&[0, 0, 0, 5, 0x65, 1, 2, 3, 4], frame.data());
    }

    #[test]
    fn fu_a_gap_fails_the_merge_and_rolls_back() {
        let depacketizer =
            depacketizer(PacketizationScheme::H264NonInterleaved, FrameFormat::BigEndianPacked);
        let mut frame = frame();
        depacketizer.process(&mut frame, &packet(1, &[0x41, 7])).unwrap();
        let before = frame.len();

        depacketizer.process(&mut frame, &packet(10, &[0x7c, 0x81, 1, 2])).unwrap();
        assert_eq!(
            Err(DepacketizeError::OutOfOrderFragment {
                expected: 11,
                actual: 12
            }),
            depacketizer.process(&mut frame, &packet(12, &[0x7c, 0x41, 4]))
        );
        assert_eq!(before, frame.len());
        assert!(frame.missing_packet);
        assert!(frame.fragment.is_none());

        assert_eq!(
            Err(DepacketizeError::OrphanFragment),
            depacketizer.process(&mut frame, &packet(13, &[0x7c, 0x01, 4]))
        );
    }

    #[test]
    fn new_start_rolls_back_incomplete_unit() {
        let depacketizer =
            depacketizer(PacketizationScheme::H264NonInterleaved, FrameFormat::BigEndianPacked);
        let mut frame = frame();
        depacketizer.process(&mut frame, &packet(1, &[0x41, 7])).unwrap();
        let before = frame.len();

        depacketizer.process(&mut frame, &packet(2, &[0x7c, 0x81, 1, 2, 3])).unwrap();
        depacketizer.process(&mut frame, &packet(3, &[0x7c, 0x01, 4])).unwrap();
        // Start of another unit before the first ended.
        depacketizer.process(&mut frame, &packet(4, &[0x7c, 0x81, 5])).unwrap();
        assert_eq!(before + UNIT_PREFIX_LEN + 2, frame.len());
        depacketizer.process(&mut frame, &packet(5, &[0x7c, 0x41, 6])).unwrap();
        assert_eq!(&[0, 0, 0, 2, 0x41, 7, 0, 0, 0, 3, 0x61, 5, 6], frame.data());

        // A whole unit also discards an unfinished fragment.
        depacketizer.process(&mut frame, &packet(6, &[0x7c, 0x81, 8])).unwrap();
        depacketizer.process(&mut frame, &packet(7, &[0x41, 9])).unwrap();
        assert_eq!(
            &[0, 0, 0, 2, 0x41, 7, 0, 0, 0, 3, 0x61, 5, 6, 0, 0, 0, 2, 0x41, 9],
            frame.data()
        );
    }

    #[test]
    fn h265_fragments_and_aggregates() {
        let depacketizer =
            depacketizer(PacketizationScheme::H265NonInterleaved, FrameFormat::BigEndianPacked);
        let mut frame = frame();
        // IDR_W_RADL (19): header 0x26 0x01.
        depacketizer.process(&mut frame, &packet(1, &[0x62, 0x01, 0x93, 1])).unwrap();
        depacketizer.process(&mut frame, &packet(2, &[0x62, 0x01, 0x53, 2])).unwrap();
        assert!(frame.keyframe);
        assert_eq!(&[0, 0, 0, 4, 0x26, 0x01, 1, 2], frame.data());

        let mut frame = self::frame();
        let ap = [0x60, 0x01, 0, 3, 0x02, 0x01, 5, 0, 2, 0x40, 0x01];
        depacketizer.process(&mut frame, &packet(3, &ap)).unwrap();
        assert!(!frame.keyframe);
        assert_eq!(&[0, 0, 0, 3, 0x02, 0x01, 5, 0, 0, 0, 2, 0x40, 0x01], frame.data());
    }

    #[test]
    fn h263_partial_bytes_are_merged() {
        let depacketizer =
            depacketizer(PacketizationScheme::H263Rfc2190, FrameFormat::BigEndianPacked);
        let mut frame = frame();
        // Mode A header with EBIT 3, then a picture start with PTYPE intra.
        let first = [0x03, 0, 0, 0, 0x00, 0x00, 0x80, 0x02, 0x00, 0xAD];
        depacketizer.process(&mut frame, &h263_packet(1, &first)).unwrap();
        assert!(frame.keyframe);
        assert_eq!(3, frame.trailing_skip_bits);

        // SBIT 5 completes the shared byte.
        let second = [0x28, 0, 0, 0, 0x07, 0x11];
        assert_eq!(Ok(1), depacketizer.process(&mut frame, &h263_packet(2, &second)));
        assert_eq!(&[0x00, 0x00, 0x80, 0x02, 0x00, 0xAF, 0x11], frame.data());
        assert_eq!(0, frame.trailing_skip_bits);
    }

    #[test]
    fn h263_mismatch_clears_frame() {
        let depacketizer =
            depacketizer(PacketizationScheme::H263Rfc2190, FrameFormat::BigEndianPacked);
        let mut frame = frame();
        let first = [0x03, 0, 0, 0, 0x00, 0x00, 0x80, 0x02, 0x00, 0xAD];
        depacketizer.process(&mut frame, &h263_packet(1, &first)).unwrap();
        let second = [0x20, 0, 0, 0, 0x07, 0x11];
        assert_eq!(
            Err(DepacketizeError::MergeMismatch {
                leading: 4,
                trailing: 3
            }),
            depacketizer.process(&mut frame, &h263_packet(2, &second))
        );
        assert!(frame.is_empty());
        assert!(frame.missing_packet);

        assert_eq!(
            Err(DepacketizeError::MissingPictureStart),
            depacketizer.process(&mut frame, &h263_packet(3, &[0, 0, 0, 0, 1, 2, 3]))
        );
    }

    #[test]
    fn h263_plus_restores_start_code() {
        let depacketizer =
            depacketizer(PacketizationScheme::H263Rfc2429, FrameFormat::BigEndianPacked);
        let mut frame = frame();
        depacketizer.process(&mut frame, &packet(1, &[0x04, 0x00, 0x80, 0x02, 0x00])).unwrap();
        depacketizer.process(&mut frame, &packet(2, &[0x00, 0x00, 0x33])).unwrap();
        assert_eq!(&[0, 0, 0x80, 0x02, 0x00, 0x33], frame.data());
        assert!(frame.keyframe);
    }

    #[test]
    fn byte_accounting_policy() {
        let received = Depacketizer::new(
            PacketizationScheme::H263Rfc2190,
            FrameFormat::BigEndianPacked,
            ByteAccounting::Received,
            &Metrics::default(),
        );
        let mut frame = frame();
        let first = [0x03, 0, 0, 0, 0x00, 0x00, 0x80, 0x02, 0x00, 0xAD];
        assert_eq!(Ok(10), received.process(&mut frame, &h263_packet(1, &first)));
        let second = [0x28, 0, 0, 0, 0x07, 0x11];
        assert_eq!(Ok(6), received.process(&mut frame, &h263_packet(2, &second)));
    }
}
