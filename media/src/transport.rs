//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! The collaborators around the core: the RTP/RTCP session below it, the encoder feeding the
//! send side and the display sink fed by the receive side.

use async_trait::async_trait;
use videophone_common::DataRate;

use crate::{
    capture_size::CaptureSize,
    error::ChannelError,
    frame_buffer::VideoFrame,
    packetizer::EncodedFrame,
    rtp::{Feedback, Nack, OutboundPacket},
};

/// Sends RTCP feedback to the peer.
pub trait RtcpTransport: Send {
    fn send_feedback(&mut self, feedback: Feedback) -> anyhow::Result<()>;
}

/// Sends RTP packets to the peer. The transport owns the SSRC and the sequence numbers and
/// writes both into the packet's headroom.
pub trait RtpTransport: RtcpTransport {
    fn send_packet(&mut self, packet: &mut OutboundPacket) -> anyhow::Result<()>;

    /// Resends whatever the transport still has of the packets named. Returns how many were
    /// resent.
    fn retransmit(&mut self, nack: &Nack) -> anyhow::Result<usize>;
}

/// Renders assembled frames. The frame goes back to the pool when `play` returns.
pub trait FrameSink: Send {
    fn play(&mut self, frame: &VideoFrame) -> Result<(), ChannelError>;

    /// A keyframe is needed but neither PLI nor FIR is available; the application has to ask
    /// over its own signaling.
    fn request_keyframe_in_band(&mut self) {}
}

/// What the encoder should produce next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderSettings {
    pub rate: DataRate,
    pub capture: CaptureSize,
}

/// Pull-style source of encoded frames.
#[async_trait]
pub trait VideoEncoder: Send {
    /// Waits for the next frame. Returns None once the encoder has stopped. Must be cancel
    /// safe: the send loop drops the future whenever another event wins.
    async fn next_frame(&mut self) -> Option<EncodedFrame>;

    fn request_keyframe(&mut self);

    fn configure(&mut self, settings: EncoderSettings);
}
