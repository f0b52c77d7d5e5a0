//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! The RTCP messages that close the two control loops: receiver reports, retransmission and
//! keyframe requests, and rate limits. See https://tools.ietf.org/html/rfc4585,
//! https://tools.ietf.org/html/rfc5104 and
//! https://datatracker.ietf.org/doc/html/draft-alvestrand-rmcat-remb-03.

use std::ops::Range;

use byteorder::{ReadBytesExt, BE};
use log::*;
use videophone_common::{DataRate, Writable, Writer};

use super::{
    header::VERSION,
    nack::{parse_nack, write_nack, Nack},
    types::*,
};
use crate::error::RtcpError;

pub const RTCP_TYPE_SENDER_REPORT: u8 = 200;
pub const RTCP_TYPE_RECEIVER_REPORT: u8 = 201;
pub const RTCP_TYPE_GENERIC_FEEDBACK: u8 = 205;
pub const RTCP_FORMAT_NACK: u8 = 1;
pub const RTCP_FORMAT_TMMBR: u8 = 3;
pub const RTCP_FORMAT_TMMBN: u8 = 4;
pub const RTCP_TYPE_SPECIFIC_FEEDBACK: u8 = 206;
pub const RTCP_FORMAT_PLI: u8 = 1;
pub const RTCP_FORMAT_FIR: u8 = 4;
pub const RTCP_FORMAT_REMB: u8 = 15;

const REMB_IDENTIFIER: [u8; 4] = *b"REMB";
const TMMB_MANTISSA_BITS: u32 = 17;
const REMB_MANTISSA_BITS: u32 = 18;
const TMMB_OVERHEAD_MASK: u32 = 0x1FF;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcpHeader {
    pub count_or_format: u8,
    pub payload_type: u8,
    /// length of the RTCP packet in words, minus the 1-word header
    pub length_in_words: u16,
}

impl RtcpHeader {
    pub const LENGTH: usize = 4;
    const RC_MASK: u8 = 0b0001_1111;

    pub fn new(count_or_format: u8, payload_type: u8, length_in_words: u16) -> Self {
        Self {
            count_or_format,
            payload_type,
            length_in_words,
        }
    }

    //     0                   1                   2                   3
    //     0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
    //    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    //    |V=2|P|  RC/FMT |      PT       |             length            |
    //    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    fn parse(mut value: &[u8]) -> Result<Self, RtcpError> {
        let first = value.read_u8()?;
        let version = first >> 6;
        if version != VERSION {
            return Err(RtcpError::BadVersion(version));
        }
        let payload_type = value.read_u8()?;
        let length_in_words = value.read_u16::<BE>()?;
        Ok(Self {
            count_or_format: first & Self::RC_MASK,
            payload_type,
            length_in_words,
        })
    }

    /// Number of bytes in the packet, header included
    pub fn packet_length_in_bytes(&self) -> usize {
        (self.length_in_words as usize + 1) * 4
    }
}

impl Writer for RtcpHeader {
    fn written_len(&self) -> usize {
        Self::LENGTH
    }

    fn write(&self, out: &mut dyn Writable) {
        [(VERSION << 6) | self.count_or_format, self.payload_type].write(out);
        self.length_in_words.write(out);
    }
}

/// One reception report block of a receiver report (RFC 3550 section 6.4.1).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportBlock {
    pub ssrc: Ssrc,
    pub fraction_lost: u8,
    pub cumulative_lost: u32,
    pub highest_seqnum: u32,
    pub jitter: u32,
    // middle 32 bits of the last sender report's 64-bit NTP timestamp
    pub last_sender_report: u32,
    pub delay_since_last_sender_report: u32,
}

impl ReportBlock {
    pub const LENGTH: usize = 24;
    const CUMULATIVE_LOSS_RANGE: Range<usize> = 5..8;

    fn parse(value: &[u8]) -> Result<Self, RtcpError> {
        if value.len() < Self::LENGTH {
            return Err(RtcpError::Truncated);
        }
        let cumulative = &value[Self::CUMULATIVE_LOSS_RANGE];
        let mut reader = value;
        let ssrc = reader.read_u32::<BE>()?;
        let fraction_lost = reader.read_u8()?;
        reader = &reader[3..];
        Ok(Self {
            ssrc,
            fraction_lost,
            cumulative_lost: u32::from_be_bytes([0, cumulative[0], cumulative[1], cumulative[2]]),
            highest_seqnum: reader.read_u32::<BE>()?,
            jitter: reader.read_u32::<BE>()?,
            last_sender_report: reader.read_u32::<BE>()?,
            delay_since_last_sender_report: reader.read_u32::<BE>()?,
        })
    }
}

impl Writer for ReportBlock {
    fn written_len(&self) -> usize {
        Self::LENGTH
    }

    fn write(&self, out: &mut dyn Writable) {
        self.ssrc.write(out);
        let cumulative = self.cumulative_lost.min(0x00FF_FFFF).to_be_bytes();
        [self.fraction_lost, cumulative[1], cumulative[2], cumulative[3]].write(out);
        self.highest_seqnum.write(out);
        self.jitter.write(out);
        self.last_sender_report.write(out);
        self.delay_since_last_sender_report.write(out);
    }
}

/// A maximum bit rate entry of a TMMBR or TMMBN (RFC 5104 section 4.2.1.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TmmbItem {
    pub ssrc: Ssrc,
    pub max_rate: DataRate,
    /// Per-packet overhead in bytes the limit was computed with.
    pub overhead: u16,
}

impl TmmbItem {
    const LENGTH: usize = 8;

    fn parse(mut value: &[u8]) -> Result<Self, RtcpError> {
        let ssrc = value.read_u32::<BE>()?;
        let word = value.read_u32::<BE>()?;
        let exp = word >> 26;
        let mantissa = (word >> 9) & ((1 << TMMB_MANTISSA_BITS) - 1);
        Ok(Self {
            ssrc,
            max_rate: DataRate::from_bps((mantissa as u64) << exp),
            overhead: (word & TMMB_OVERHEAD_MASK) as u16,
        })
    }
}

impl Writer for TmmbItem {
    fn written_len(&self) -> usize {
        Self::LENGTH
    }

    fn write(&self, out: &mut dyn Writable) {
        let (exp, mantissa) = split_exp_mantissa(self.max_rate.as_bps(), TMMB_MANTISSA_BITS);
        self.ssrc.write(out);
        ((exp << 26) | (mantissa << 9) | (self.overhead as u32 & TMMB_OVERHEAD_MASK)).write(out);
    }
}

/// Receiver-estimated maximum bit rate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remb {
    pub max_rate: DataRate,
    pub ssrcs: Vec<Ssrc>,
}

impl Remb {
    fn parse(mut value: &[u8]) -> Result<Self, RtcpError> {
        let mut identifier = [0u8; 4];
        std::io::Read::read_exact(&mut value, &mut identifier)?;
        if identifier != REMB_IDENTIFIER {
            return Err(RtcpError::Unsupported(
                RTCP_TYPE_SPECIFIC_FEEDBACK,
                RTCP_FORMAT_REMB,
            ));
        }
        let ssrc_count = value.read_u8()?;
        let word = value.read_u24::<BE>()?;
        let exp = word >> REMB_MANTISSA_BITS;
        let mantissa = word & ((1 << REMB_MANTISSA_BITS) - 1);
        let ssrcs = (0..ssrc_count)
            .map(|_| value.read_u32::<BE>())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            max_rate: DataRate::from_bps((mantissa as u64) << exp),
            ssrcs,
        })
    }
}

impl Writer for Remb {
    fn written_len(&self) -> usize {
        8 + 4 * self.ssrcs.len()
    }

    fn write(&self, out: &mut dyn Writable) {
        let (exp, mantissa) = split_exp_mantissa(self.max_rate.as_bps(), REMB_MANTISSA_BITS);
        REMB_IDENTIFIER.write(out);
        let word = ((exp << REMB_MANTISSA_BITS) | mantissa).to_be_bytes();
        [self.ssrcs.len() as u8, word[1], word[2], word[3]].write(out);
        for ssrc in &self.ssrcs {
            ssrc.write(out);
        }
    }
}

/// Scales `value` down until it fits in `mantissa_bits`, returning (exponent, mantissa).
fn split_exp_mantissa(value: u64, mantissa_bits: u32) -> (u32, u32) {
    let mut exp = 0;
    let mut mantissa = value;
    while mantissa >= (1 << mantissa_bits) {
        mantissa >>= 1;
        exp += 1;
    }
    (exp, mantissa as u32)
}

/// The RTCP messages this core sends and understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feedback {
    ReceiverReport(Vec<ReportBlock>),
    Nack(Nack),
    Pli { ssrc: Ssrc },
    Fir { ssrc: Ssrc, seq: u8 },
    Tmmbr(TmmbItem),
    Tmmbn(Vec<TmmbItem>),
    Remb(Remb),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPacket {
    pub sender_ssrc: Ssrc,
    pub feedback: Feedback,
}

impl Feedback {
    /// Serializes one complete RTCP packet.
    pub fn serialize(&self, sender_ssrc: Ssrc) -> Vec<u8> {
        let (payload_type, count_or_format, body): (u8, u8, Vec<u8>) = match self {
            Feedback::ReceiverReport(blocks) => (
                RTCP_TYPE_RECEIVER_REPORT,
                blocks.len() as u8,
                (sender_ssrc, blocks).to_vec(),
            ),
            Feedback::Nack(nack) => (
                RTCP_TYPE_GENERIC_FEEDBACK,
                RTCP_FORMAT_NACK,
                (
                    sender_ssrc,
                    write_nack(
                        nack.ssrc,
                        nack.seqnums.iter().map(|seqnum| *seqnum as FullSequenceNumber),
                    ),
                )
                    .to_vec(),
            ),
            Feedback::Pli { ssrc } => (
                RTCP_TYPE_SPECIFIC_FEEDBACK,
                RTCP_FORMAT_PLI,
                (sender_ssrc, *ssrc).to_vec(),
            ),
            Feedback::Fir { ssrc, seq } => (
                RTCP_TYPE_SPECIFIC_FEEDBACK,
                RTCP_FORMAT_FIR,
                (sender_ssrc, 0u32, *ssrc, [*seq, 0, 0, 0]).to_vec(),
            ),
            Feedback::Tmmbr(item) => (
                RTCP_TYPE_GENERIC_FEEDBACK,
                RTCP_FORMAT_TMMBR,
                (sender_ssrc, 0u32, item).to_vec(),
            ),
            Feedback::Tmmbn(items) => (
                RTCP_TYPE_GENERIC_FEEDBACK,
                RTCP_FORMAT_TMMBN,
                (sender_ssrc, 0u32, items).to_vec(),
            ),
            Feedback::Remb(remb) => (
                RTCP_TYPE_SPECIFIC_FEEDBACK,
                RTCP_FORMAT_REMB,
                (sender_ssrc, 0u32, remb).to_vec(),
            ),
        };
        debug_assert_eq!(0, body.len() % 4);
        let header = RtcpHeader::new(count_or_format, payload_type, (body.len() / 4) as u16);
        (header, body).to_vec()
    }

    /// Parses a compound RTCP packet. Message types this core does not use are skipped.
    pub fn parse_compound(mut compound: &[u8]) -> Result<Vec<ControlPacket>, RtcpError> {
        let mut packets = vec![];
        while compound.len() >= RtcpHeader::LENGTH {
            let header = RtcpHeader::parse(compound)?;
            let packet_len = header.packet_length_in_bytes();
            if packet_len > compound.len() || header.length_in_words == 0 {
                return Err(RtcpError::Truncated);
            }
            let (packet, rest) = compound.split_at(packet_len);
            compound = rest;

            let mut payload = &packet[RtcpHeader::LENGTH..];
            let sender_ssrc = payload.read_u32::<BE>()?;
            let feedback = match Self::parse_payload(&header, payload) {
                Ok(feedback) => feedback,
                Err(RtcpError::Unsupported(payload_type, format)) => {
                    debug!("Skipping RTCP ({}, {})", payload_type, format);
                    continue;
                }
                Err(err) => return Err(err),
            };
            packets.push(ControlPacket {
                sender_ssrc,
                feedback,
            });
        }
        Ok(packets)
    }

    // `payload` excludes the sender SSRC. For feedback messages it starts at the media SSRC.
    fn parse_payload(header: &RtcpHeader, payload: &[u8]) -> Result<Self, RtcpError> {
        let fci = payload.get(4..).ok_or(RtcpError::Truncated);
        match (header.payload_type, header.count_or_format) {
            (RTCP_TYPE_RECEIVER_REPORT, count) => {
                let blocks = (0..count as usize)
                    .map(|index| {
                        payload
                            .get(index * ReportBlock::LENGTH..)
                            .ok_or(RtcpError::Truncated)
                            .and_then(ReportBlock::parse)
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Feedback::ReceiverReport(blocks))
            }
            (RTCP_TYPE_GENERIC_FEEDBACK, RTCP_FORMAT_NACK) => {
                Ok(Feedback::Nack(parse_nack(payload)?))
            }
            (RTCP_TYPE_GENERIC_FEEDBACK, RTCP_FORMAT_TMMBR) => {
                Ok(Feedback::Tmmbr(TmmbItem::parse(fci?)?))
            }
            (RTCP_TYPE_GENERIC_FEEDBACK, RTCP_FORMAT_TMMBN) => {
                let items = fci?
                    .chunks_exact(TmmbItem::LENGTH)
                    .map(TmmbItem::parse)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Feedback::Tmmbn(items))
            }
            (RTCP_TYPE_SPECIFIC_FEEDBACK, RTCP_FORMAT_PLI) => {
                let mut reader = payload;
                Ok(Feedback::Pli {
                    ssrc: reader.read_u32::<BE>()?,
                })
            }
            (RTCP_TYPE_SPECIFIC_FEEDBACK, RTCP_FORMAT_FIR) => {
                let mut reader = fci?;
                Ok(Feedback::Fir {
                    ssrc: reader.read_u32::<BE>()?,
                    seq: reader.read_u8()?,
                })
            }
            (RTCP_TYPE_SPECIFIC_FEEDBACK, RTCP_FORMAT_REMB) => {
                Ok(Feedback::Remb(Remb::parse(fci?)?))
            }
            (payload_type, format) => Err(RtcpError::Unsupported(payload_type, format)),
        }
    }
}
