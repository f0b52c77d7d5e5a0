//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! The send direction of a video channel: encoded frames in, RTP packets out, with the rate
//! controller and capture size following the peer's feedback.

use std::{collections::VecDeque, sync::Arc};

use log::*;
use videophone_common::{DataRate, Duration, Instant};
use videophone_metrics::{EventCountReporter, Metrics};

use crate::{
    capture_size::{CaptureSize, CaptureSizeSelector, DecoderLimits},
    codec::VideoCodec,
    config::{ChannelConfig, Config},
    error::PacketizeError,
    flow_control::{rate_controller, RateController},
    keyframe::KeyframeThrottle,
    packetizer::{EncodedFrame, Packetizer},
    pool::Pool,
    rtp::{
        Feedback, Nack, OutboundPacket, RtpHeaderOffset, TruncatedTimestamp, RTP_MIN_HEADER_LEN,
        VIDEO_TICKS_PER_MILLISECOND,
    },
    transport::EncoderSettings,
};

#[derive(Debug, Default)]
pub struct SendOutput {
    /// Replies to the peer, such as TMMBN.
    pub feedback: Vec<Feedback>,
    /// NACKs for the transport to serve.
    pub retransmissions: Vec<Nack>,
    /// The encoder should produce a keyframe next.
    pub keyframe_requested: bool,
    /// The encoder should switch to these settings.
    pub settings: Option<EncoderSettings>,
}

impl SendOutput {
    pub fn is_empty(&self) -> bool {
        self.feedback.is_empty()
            && self.retransmissions.is_empty()
            && !self.keyframe_requested
            && self.settings.is_none()
    }

    /// Folds a later output into this one. Later settings win.
    pub fn append(&mut self, other: SendOutput) {
        self.feedback.extend(other.feedback);
        self.retransmissions.extend(other.retransmissions);
        self.keyframe_requested |= other.keyframe_requested;
        if other.settings.is_some() {
            self.settings = other.settings;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendStats {
    pub frames_sent: u64,
    pub keyframes_sent: u64,
    pub frames_dropped: u64,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub pool_exhausted: u64,
    pub queue_drops: u64,
    pub rate_changes: u64,
    pub keyframe_requests: u64,
    pub target_rate: DataRate,
    pub controller: &'static str,
    pub capture: Option<CaptureSize>,
}

struct Counters {
    frames_dropped: Arc<EventCountReporter>,
    queue_drops: Arc<EventCountReporter>,
    rate_changes: Arc<EventCountReporter>,
    keyframe_requests: Arc<EventCountReporter>,
    rtcp_errors: Arc<EventCountReporter>,
}

pub struct VideoSender {
    packetizer: Packetizer,
    pool: Pool<OutboundPacket>,
    queue: VecDeque<OutboundPacket>,
    /// When each queued packet was queued, in queue order.
    queued_at: VecDeque<Instant>,
    max_queue_age: Duration,

    controller: Box<dyn RateController>,
    capture: CaptureSizeSelector,
    decoder_limits: DecoderLimits,
    codec: VideoCodec,
    current_capture: Option<CaptureSize>,
    throttle: KeyframeThrottle,

    started: Instant,
    timestamp_base: TruncatedTimestamp,
    /// Since the last tick, for the average packet size.
    tick_bytes: u64,
    tick_packets: u64,

    muted: bool,
    held: bool,
    closed: bool,

    stats: SendStats,
    counters: Counters,
}

impl VideoSender {
    pub fn new(config: &Config, channel: &ChannelConfig, metrics: &Metrics, now: Instant) -> Self {
        let header_offset = RtpHeaderOffset::new(RTP_MIN_HEADER_LEN, config.multiplex_len);
        let packet_capacity = header_offset.offset() + config.max_packet_size;
        let mut controller = rate_controller(
            config.tmmbr_enabled,
            config.autospeed_mode,
            config.max_send_rate(),
            config.initial_send_rate(),
            now,
        );
        controller.set_reserved_rate(config.reserved_rate());
        info!(
            "sending with the {} controller, starting at {}",
            controller.name(),
            controller.target_rate()
        );
        Self {
            packetizer: Packetizer::new(
                config.packetization,
                config.frame_format,
                config.max_packet_size,
                header_offset,
                config.payload_type,
                metrics,
            ),
            pool: Pool::new(config.packet_pool_size, || {
                OutboundPacket::with_capacity(packet_capacity)
            }),
            queue: VecDeque::new(),
            queued_at: VecDeque::new(),
            max_queue_age: channel.max_send_queue_age,

            stats: SendStats {
                frames_sent: 0,
                keyframes_sent: 0,
                frames_dropped: 0,
                packets_sent: 0,
                bytes_sent: 0,
                pool_exhausted: 0,
                queue_drops: 0,
                rate_changes: 0,
                keyframe_requests: 0,
                target_rate: controller.target_rate(),
                controller: controller.name(),
                capture: None,
            },
            controller,
            capture: CaptureSizeSelector::new(config.max_capture_height),
            decoder_limits: DecoderLimits {
                max_frame_size_macroblocks: config.max_frame_size_macroblocks,
                max_macroblocks_per_second: config.max_macroblocks_per_second,
            },
            codec: config.packetization.codec(),
            current_capture: None,
            throttle: KeyframeThrottle::default(),

            started: now,
            timestamp_base: rand::random(),
            tick_bytes: 0,
            tick_packets: 0,

            muted: false,
            held: false,
            closed: false,

            counters: Counters {
                frames_dropped: metrics.event("videophone.send.frames_dropped"),
                queue_drops: metrics.event("videophone.send.queue_drops"),
                rate_changes: metrics.event("videophone.send.rate_changes"),
                keyframe_requests: metrics.event("videophone.send.keyframe_requests"),
                rtcp_errors: metrics.event("videophone.send.rtcp_errors"),
            },
        }
    }

    pub fn is_paused(&self) -> bool {
        self.muted || self.held || self.closed
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn target_rate(&self) -> DataRate {
        self.controller.target_rate()
    }

    pub fn stats(&self) -> SendStats {
        SendStats {
            target_rate: self.controller.target_rate(),
            capture: self.current_capture,
            ..self.stats
        }
    }

    /// The settings the encoder should currently run with.
    pub fn encoder_settings(&mut self) -> EncoderSettings {
        let rate = self.controller.target_rate();
        let capture = self.capture.select(rate, self.decoder_limits, self.codec);
        self.current_capture = Some(capture);
        EncoderSettings { rate, capture }
    }

    fn rtp_timestamp(&self, now: Instant) -> TruncatedTimestamp {
        let millis = now.saturating_duration_since(self.started).as_millis() as u64;
        self.timestamp_base
            .wrapping_add((millis * VIDEO_TICKS_PER_MILLISECOND as u64) as TruncatedTimestamp)
    }

    fn clear_queue(&mut self) {
        for packet in self.queue.drain(..) {
            self.pool.give_back(packet);
        }
        self.queued_at.clear();
    }

    fn expire_queue(&mut self, now: Instant) {
        let expired = self
            .queued_at
            .front()
            .is_some_and(|queued| now.saturating_duration_since(*queued) > self.max_queue_age);
        if expired {
            warn!("dropping {} packets that waited too long to be sent", self.queue.len());
            self.stats.queue_drops += 1;
            self.counters.queue_drops.count();
            self.clear_queue();
        }
    }

    /// Packetizes one frame into the send queue and returns how many packets were queued.
    pub fn send_frame(
        &mut self,
        frame: &EncodedFrame,
        now: Instant,
    ) -> Result<usize, PacketizeError> {
        if self.is_paused() {
            self.stats.frames_dropped += 1;
            self.counters.frames_dropped.count();
            return Ok(0);
        }
        self.expire_queue(now);

        let timestamp = self.rtp_timestamp(now);
        let queued_before = self.queue.len();
        let result = self
            .packetizer
            .packetize(frame, timestamp, &mut self.pool, &mut self.queue);
        let queued = self.queue.len() - queued_before;
        self.queued_at.extend(std::iter::repeat(now).take(queued));

        self.stats.frames_sent += 1;
        if frame.keyframe {
            self.stats.keyframes_sent += 1;
        }
        if let Err(err) = &result {
            if *err == PacketizeError::PoolExhausted {
                self.stats.pool_exhausted += 1;
            } else {
                debug!("frame {} was not packetized: {}", timestamp, err);
            }
        }
        result
    }

    pub fn has_queued(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn next_packet(&mut self) -> Option<OutboundPacket> {
        self.queued_at.pop_front();
        self.queue.pop_front()
    }

    /// Takes back a packet once the transport is done with it.
    pub fn recycle(&mut self, packet: OutboundPacket, sent: bool) {
        if sent {
            let size = packet.payload_len() as u64;
            self.stats.packets_sent += 1;
            self.stats.bytes_sent += size;
            self.tick_packets += 1;
            self.tick_bytes += size;
        }
        self.pool.give_back(packet);
    }

    fn apply_rate(&mut self, rate: DataRate, output: &mut SendOutput) {
        self.stats.rate_changes += 1;
        self.counters.rate_changes.count();
        let capture = self.capture.select(rate, self.decoder_limits, self.codec);
        debug!(
            "target rate {}: capturing {}x{} at {} fps",
            rate, capture.width, capture.height, capture.frame_rate
        );
        self.current_capture = Some(capture);
        output.settings = Some(EncoderSettings { rate, capture });
    }

    /// Handles a compound RTCP packet from the peer.
    pub fn receive_rtcp(&mut self, raw: &[u8], now: Instant) -> SendOutput {
        let mut output = SendOutput::default();
        let packets = match Feedback::parse_compound(raw) {
            Ok(packets) => packets,
            Err(err) => {
                debug!("dropping RTCP: {}", err);
                self.counters.rtcp_errors.count();
                return output;
            }
        };
        for packet in packets {
            self.handle_feedback(packet.feedback, now, &mut output);
        }
        output
    }

    fn handle_feedback(&mut self, feedback: Feedback, now: Instant, output: &mut SendOutput) {
        match feedback {
            Feedback::Pli { .. } | Feedback::Fir { .. } => {
                if self.throttle.should_forward(now) {
                    self.stats.keyframe_requests += 1;
                    self.counters.keyframe_requests.count();
                    output.keyframe_requested = true;
                } else {
                    trace!("throttling keyframe request");
                }
            }
            Feedback::Nack(nack) => output.retransmissions.push(nack),
            feedback => {
                let outcome = self.controller.on_feedback(&feedback, now);
                output.feedback.extend(outcome.replies);
                if let Some(rate) = outcome.new_rate {
                    self.apply_rate(rate, output);
                }
            }
        }
    }

    pub fn tick_interval(&self) -> Duration {
        self.controller.tick_interval()
    }

    /// Runs the rate controller once.
    pub fn on_tick(&mut self, now: Instant) -> SendOutput {
        let mut output = SendOutput::default();
        let average_packet_size = self
            .tick_bytes
            .checked_div(self.tick_packets)
            .unwrap_or_default() as usize;
        self.tick_bytes = 0;
        self.tick_packets = 0;
        if let Some(rate) = self.controller.on_tick(average_packet_size, now) {
            self.apply_rate(rate, &mut output);
        }
        output
    }

    pub fn set_max_rate(&mut self, max_rate: DataRate, now: Instant) -> SendOutput {
        let mut output = SendOutput::default();
        let previous = self.controller.target_rate();
        self.controller.set_max_rate(max_rate, now);
        let rate = self.controller.target_rate();
        if rate != previous {
            self.apply_rate(rate, &mut output);
        }
        output
    }

    pub fn set_reserved_rate(&mut self, reserved: DataRate) {
        self.controller.set_reserved_rate(reserved);
    }

    pub fn set_muted(&mut self, muted: bool) {
        if muted == self.muted {
            return;
        }
        info!("send side {}", if muted { "muted" } else { "unmuted" });
        self.muted = muted;
        self.controller.on_muted();
        self.clear_queue();
    }

    pub fn set_held(&mut self, held: bool) {
        if held == self.held {
            return;
        }
        info!("send side {}", if held { "held" } else { "resumed" });
        self.held = held;
        self.controller.on_muted();
        self.clear_queue();
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        info!("send side closed");
        self.closed = true;
        self.clear_queue();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::default_test_config, rtp::TmmbItem};

    fn sender(config: &Config, now: Instant) -> VideoSender {
        VideoSender::new(config, &ChannelConfig::default(), &Metrics::default(), now)
    }

    fn idr_frame(len: usize) -> EncodedFrame {
        let mut unit = vec![0xAB; len];
        unit[0] = 0x65;
        EncodedFrame {
            data: [(len as u32).to_be_bytes().to_vec(), unit].concat(),
            keyframe: true,
        }
    }

    fn drain(sender: &mut VideoSender) -> Vec<OutboundPacket> {
        std::iter::from_fn(|| sender.next_packet()).collect()
    }

    #[test]
    fn frames_become_queued_packets() {
        let now = Instant::now();
        let at = |millis| now + Duration::from_millis(millis);
        let mut sender = sender(&default_test_config(), at(0));

        let queued = sender.send_frame(&idr_frame(5000), at(0)).unwrap();
        let packets = drain(&mut sender);
        assert_eq!(queued, packets.len());
        assert!(packets.len() > 1);
        assert!(packets.iter().all(|packet| packet.keyframe));
        assert!(packets.iter().all(|packet| packet.payload_len() <= 1200));
        assert_eq!(1, packets.iter().filter(|packet| packet.marker).count());
        assert!(packets[packets.len() - 1].marker);
        let first_timestamp = packets[0].timestamp;
        for packet in packets {
            sender.recycle(packet, true);
        }

        sender.send_frame(&idr_frame(100), at(100)).unwrap();
        let packets = drain(&mut sender);
        assert_eq!(1, packets.len());
        assert_eq!(first_timestamp.wrapping_add(9000), packets[0].timestamp);

        let stats = sender.stats();
        assert_eq!(2, stats.frames_sent);
        assert_eq!(queued as u64, stats.packets_sent);
        assert_eq!("tmmbr", stats.controller);
    }

    #[test]
    fn stale_queue_is_dropped() {
        let now = Instant::now();
        let at = |millis| now + Duration::from_millis(millis);
        let mut sender = sender(&default_test_config(), at(0));

        sender.send_frame(&idr_frame(3000), at(0)).unwrap();
        sender.send_frame(&idr_frame(100), at(500)).unwrap();
        assert_eq!(0, sender.stats().queue_drops);

        sender.send_frame(&idr_frame(100), at(501)).unwrap();
        assert_eq!(1, sender.stats().queue_drops);
        assert_eq!(1, drain(&mut sender).len());
    }

    #[test]
    fn pool_exhaustion_abandons_the_frame() {
        let now = Instant::now();
        let mut config = default_test_config();
        config.packet_pool_size = 2;
        let mut sender = sender(&config, now);

        assert_eq!(
            Err(PacketizeError::PoolExhausted),
            sender.send_frame(&idr_frame(5000), now)
        );
        assert_eq!(2, drain(&mut sender).len());
        assert_eq!(1, sender.stats().pool_exhausted);
    }

    #[test]
    fn keyframe_requests_are_throttled() {
        let now = Instant::now();
        let at = |millis| now + Duration::from_millis(millis);
        let mut sender = sender(&default_test_config(), at(0));
        let pli = Feedback::Pli { ssrc: 5 }.serialize(9);
        let fir = Feedback::Fir { ssrc: 5, seq: 1 }.serialize(9);

        assert!(sender.receive_rtcp(&pli, at(0)).keyframe_requested);
        assert!(!sender.receive_rtcp(&fir, at(100)).keyframe_requested);
        assert!(sender.receive_rtcp(&fir, at(300)).keyframe_requested);
        assert_eq!(2, sender.stats().keyframe_requests);
    }

    #[test]
    fn nacks_go_to_the_transport() {
        let now = Instant::now();
        let mut sender = sender(&default_test_config(), now);
        let nack = Nack {
            ssrc: 5,
            seqnums: vec![10, 12],
        };
        let output = sender.receive_rtcp(&Feedback::Nack(nack.clone()).serialize(9), now);
        assert_eq!(vec![nack], output.retransmissions);
    }

    #[test]
    fn tmmbr_lowers_the_rate_and_the_capture_size() {
        let now = Instant::now();
        let mut sender = sender(&default_test_config(), now);
        let initial = sender.encoder_settings();
        assert_eq!(DataRate::from_kbps(512), initial.rate);

        let item = TmmbItem {
            ssrc: 5,
            max_rate: DataRate::from_kbps(300),
            overhead: 40,
        };
        let output = sender.receive_rtcp(&Feedback::Tmmbr(item).serialize(9), now);
        assert_eq!(vec![Feedback::Tmmbn(vec![item])], output.feedback);
        let settings = output.settings.unwrap();
        assert_eq!(DataRate::from_kbps(300), settings.rate);
        assert_eq!(352, settings.capture.width);
        assert_eq!(1, sender.stats().rate_changes);
    }

    #[test]
    fn tick_ramps_the_rate() {
        let now = Instant::now();
        let at = |millis| now + Duration::from_millis(millis);
        let mut sender = sender(&default_test_config(), at(0));
        assert_eq!(Duration::from_secs(1), sender.tick_interval());

        assert!(sender.on_tick(at(1000)).is_empty());
        let output = sender.on_tick(at(2000));
        assert_eq!(
            Some(DataRate::from_bps(520_192)),
            output.settings.map(|settings| settings.rate)
        );
    }

    #[test]
    fn autospeed_without_tmmbr() {
        let now = Instant::now();
        let mut config = default_test_config();
        config.tmmbr_enabled = false;
        let sender = sender(&config, now);
        assert_eq!("autospeed", sender.stats().controller);
        assert_eq!(Duration::from_secs(5), sender.tick_interval());
    }

    #[test]
    fn muting_drops_frames_and_the_queue() {
        let now = Instant::now();
        let mut sender = sender(&default_test_config(), now);
        sender.send_frame(&idr_frame(3000), now).unwrap();
        sender.set_muted(true);
        assert!(!sender.has_queued());
        assert_eq!(Ok(0), sender.send_frame(&idr_frame(3000), now));
        assert_eq!(1, sender.stats().frames_dropped);

        sender.set_muted(false);
        assert!(sender.send_frame(&idr_frame(100), now).unwrap() > 0);
    }
}
