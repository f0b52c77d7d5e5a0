//
// Copyright 2021 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Configuration options for the video media core.

use clap;
use videophone_common::{DataRate, Duration};

use crate::{
    codec::{ByteAccounting, FrameFormat, PacketizationScheme},
    flow_control::AutospeedMode,
    keyframe::KEYFRAME_FAILSAFE_INTERVAL,
};

/// General configuration options, set by command line arguments or
/// falls back to defaults.
#[derive(Default, clap::Parser, Debug, Clone)]
#[clap(name = "videophone_media")]
pub struct Config {
    /// Largest RTP payload produced by the packetizer, in bytes.
    #[clap(long, default_value = "1200")]
    pub max_packet_size: usize,

    /// How the encoder delimits units within a frame.
    #[clap(long, default_value = "big-endian-packed")]
    pub frame_format: FrameFormat,

    /// The negotiated RTP packetization.
    #[clap(long, default_value = "h264-non-interleaved")]
    pub packetization: PacketizationScheme,

    /// The negotiated RTP payload type for video.
    #[clap(long, default_value = "96")]
    pub payload_type: u8,

    /// The payload type retransmissions arrive under (RFC 4588), if negotiated.
    #[clap(long)]
    pub rtx_payload_type: Option<u8>,

    /// Length of the multiplex ID written in front of each RTP header, if any.
    #[clap(long, default_value = "0")]
    pub multiplex_len: usize,

    /// How many frames the jitter buffer tries to keep queued.
    #[clap(long, default_value = "3")]
    pub frames_to_buffer: usize,

    /// Whether the peer retransmits packets named in a NACK.
    #[clap(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub nack_enabled: bool,

    /// Whether picture loss indications may be sent to request keyframes.
    #[clap(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub pli_enabled: bool,

    /// Whether full intra requests may be sent to request keyframes.
    #[clap(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub fir_enabled: bool,

    /// Whether both ends control the send rate with TMMBR. Otherwise the sender falls back to
    /// autospeed on receiver reports.
    #[clap(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub tmmbr_enabled: bool,

    /// The receiver report algorithm autospeed uses.
    #[clap(long, default_value = "auto")]
    pub autospeed_mode: AutospeedMode,

    /// Which byte count the received-bytes statistics use for partial-byte payloads.
    #[clap(long, default_value = "processed")]
    pub byte_accounting: ByteAccounting,

    /// Number of packet buffers allocated per channel.
    #[clap(long, default_value = "512")]
    pub packet_pool_size: usize,

    /// Number of frame buffers allocated for the receive side.
    #[clap(long, default_value = "8")]
    pub frame_pool_size: usize,

    /// Capacity of each frame buffer, in bytes.
    #[clap(long, default_value = "1048576")]
    pub max_frame_bytes: usize,

    /// The highest send rate, from negotiation or local policy.
    #[clap(long, default_value = "2000000")]
    pub max_send_rate_bps: u64,

    /// Rate to start sending at. Each controller has its own default.
    #[clap(long)]
    pub initial_send_rate_bps: Option<u64>,

    /// Bandwidth kept free for audio.
    #[clap(long, default_value = "0")]
    pub reserved_rate_bps: u64,

    /// Maximum frame size the peer decodes, in macroblocks.
    #[clap(long, default_value = "8160")]
    pub max_frame_size_macroblocks: u32,

    /// Maximum macroblocks per second the peer decodes.
    #[clap(long, default_value = "244800")]
    pub max_macroblocks_per_second: u32,

    /// Tallest 16:9 capture size to use. Unlimited if not set.
    #[clap(long)]
    pub max_capture_height: Option<u32>,

    /// Loopback only: fraction of packets dropped between the channels.
    #[clap(long, default_value = "0.0")]
    pub simulated_loss: f64,

    /// Loopback only: how long to run.
    #[clap(long, default_value = "20")]
    pub duration_secs: u64,

    /// Loopback only: frames per second produced by the synthetic encoder.
    #[clap(long, default_value = "30")]
    pub frames_per_second: u32,
}

impl Config {
    pub fn max_send_rate(&self) -> DataRate {
        DataRate::from_bps(self.max_send_rate_bps)
    }

    pub fn initial_send_rate(&self) -> Option<DataRate> {
        self.initial_send_rate_bps.map(DataRate::from_bps)
    }

    pub fn reserved_rate(&self) -> DataRate {
        DataRate::from_bps(self.reserved_rate_bps)
    }
}

/// Timers and limits of the channel event loops.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// How often the receive side recalculates the maximum rate it publishes with TMMBR.
    pub tmmbr_interval: Duration,
    /// How often missing packets are checked for NACKs.
    pub nack_interval: Duration,
    /// How often receiver reports are generated for autospeed peers.
    pub receiver_report_interval: Duration,
    pub keyframe_failsafe_interval: Duration,
    /// The send queue is dropped when its oldest packet has waited this long.
    pub max_send_queue_age: Duration,
    /// Missing sequence numbers remembered for NACKs.
    pub max_missing_packets: usize,
    /// Events handled per turn of a loop before yielding.
    pub batch_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            tmmbr_interval: Duration::from_secs(5),
            nack_interval: Duration::from_millis(20),
            receiver_report_interval: Duration::from_secs(1),
            keyframe_failsafe_interval: KEYFRAME_FAILSAFE_INTERVAL,
            max_send_queue_age: Duration::from_millis(500),
            max_missing_packets: 1000,
            batch_size: 32,
        }
    }
}

#[cfg(test)]
pub(crate) fn default_test_config() -> Config {
    Config {
        max_packet_size: 1200,
        frame_format: FrameFormat::BigEndianPacked,
        packetization: PacketizationScheme::H264NonInterleaved,
        payload_type: 96,
        rtx_payload_type: None,
        multiplex_len: 0,
        frames_to_buffer: 3,
        nack_enabled: true,
        pli_enabled: true,
        fir_enabled: true,
        tmmbr_enabled: true,
        autospeed_mode: AutospeedMode::Auto,
        byte_accounting: ByteAccounting::Processed,
        packet_pool_size: 256,
        frame_pool_size: 4,
        max_frame_bytes: 64 * 1024,
        max_send_rate_bps: 2_000_000,
        initial_send_rate_bps: None,
        reserved_rate_bps: 0,
        max_frame_size_macroblocks: 8160,
        max_macroblocks_per_second: 244800,
        max_capture_height: None,
        simulated_loss: 0.0,
        duration_secs: 1,
        frames_per_second: 30,
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn command_line_defaults() {
        let config = Config::parse_from(["videophone_media"]);
        assert_eq!(1200, config.max_packet_size);
        assert_eq!(FrameFormat::BigEndianPacked, config.frame_format);
        assert!(config.nack_enabled);
        assert_eq!(None, config.initial_send_rate());
        assert_eq!(DataRate::from_kbps(2000), config.max_send_rate());
    }

    #[test]
    fn command_line_overrides() {
        let config = Config::parse_from([
            "videophone_media",
            "--frame-format",
            "byte-stream",
            "--packetization",
            "h265-non-interleaved",
            "--tmmbr-enabled",
            "false",
            "--autospeed-mode",
            "legacy",
            "--initial-send-rate-bps",
            "300000",
        ]);
        assert_eq!(FrameFormat::ByteStream, config.frame_format);
        assert_eq!(PacketizationScheme::H265NonInterleaved, config.packetization);
        assert!(!config.tmmbr_enabled);
        assert_eq!(AutospeedMode::Legacy, config.autospeed_mode);
        assert_eq!(Some(DataRate::from_kbps(300)), config.initial_send_rate());
    }
}
