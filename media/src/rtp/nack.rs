//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Generic NACK (RFC 4585 section 6.2.1): a list of (PID, BLP) items, where the bitmask marks
//! which of the 16 sequence numbers after PID are also missing.

use byteorder::{ReadBytesExt, BE};
use videophone_common::{Bits, Writer};

use super::{FullSequenceNumber, Ssrc, TruncatedSequenceNumber};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nack {
    pub ssrc: Ssrc,
    pub seqnums: Vec<TruncatedSequenceNumber>,
}

pub fn parse_nack(rtcp_payload: &[u8]) -> std::io::Result<Nack> {
    let mut reader = rtcp_payload;
    let ssrc = reader.read_u32::<BE>()?;
    let mut seqnums = Vec::new();
    while !reader.is_empty() {
        let first_seqnum = reader.read_u16::<BE>()?;
        let mask = reader.read_u16::<BE>()?;
        seqnums.push(first_seqnum);
        seqnums.extend(
            (0..16u16)
                .filter(|index| mask.ls_bit(*index as u8))
                .map(|index| first_seqnum.wrapping_add(index + 1)),
        );
    }
    Ok(Nack { ssrc, seqnums })
}

/// Packs ascending sequence numbers into as few items as possible.
pub fn write_nack(
    ssrc: Ssrc,
    mut seqnums: impl Iterator<Item = FullSequenceNumber>,
) -> impl Writer {
    let mut items: Vec<(TruncatedSequenceNumber, u16)> = vec![];
    if let Some(mut first_seqnum) = seqnums.next() {
        let mut mask = 0u16;
        for seqnum in seqnums {
            let diff = seqnum.saturating_sub(first_seqnum);
            if (1..=16).contains(&diff) {
                mask = mask.set_ls_bit((diff - 1) as u8);
            } else {
                items.push((first_seqnum as TruncatedSequenceNumber, mask));
                first_seqnum = seqnum;
                mask = 0;
            }
        }
        items.push((first_seqnum as TruncatedSequenceNumber, mask));
    }
    (ssrc, items)
}
