//
// Copyright 2021 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! RTP packets as this core handles them (https://tools.ietf.org/html/rfc3550), and the RTCP
//! feedback that flows back against them.

mod header;
mod nack;
mod packet;
mod rtcp;
mod types;

pub use header::{RtpHeader, RtpHeaderOffset, RTP_MIN_HEADER_LEN};
pub use nack::{parse_nack, write_nack, Nack};
pub use packet::{InboundPacket, OutboundPacket};
pub use rtcp::{ControlPacket, Feedback, Remb, ReportBlock, RtcpHeader, TmmbItem};
pub use types::*;
