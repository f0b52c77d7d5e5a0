//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! The receive direction of a video channel: RTP packets in, frames and RTCP feedback out.
//!
//! [`VideoReceiver`] is driven entirely by its caller. Every entry point takes the current time
//! and returns a [`ReceiveOutput`] with the frames to play and the feedback to send, so the
//! same code runs under the receive channel's event loop and in tests.

use std::sync::Arc;

use itertools::Itertools;
use log::*;
use videophone_common::{DataRate, Instant, SequenceUnwrapper};
use videophone_metrics::{EventCountReporter, Metrics};

use crate::{
    codec::PacketizationScheme,
    config::{ChannelConfig, Config},
    depacketizer::{h263_skip_bits, Depacketizer},
    error::DepacketizeError,
    flow_control::ReceiveRateLimiter,
    frame_buffer::VideoFrame,
    jitter_buffer::{AddOutcome, JitterBuffer, PacketGroup, Release},
    keyframe::{KeyframeRequest, KeyframeRequester, KeyframeWaitStats},
    loss_tracker::LossTracker,
    pool::Pool,
    rtp::{
        Feedback, FullSequenceNumber, InboundPacket, Nack, PayloadType, ReportBlock, RtpHeader,
        RtpHeaderOffset, Ssrc, TruncatedTimestamp, VIDEO_TICKS_PER_MILLISECOND,
    },
};

/// IPv4 and UDP headers, charged to every packet on top of the RTP header.
const IP_UDP_OVERHEAD: usize = 28;
/// The widest cumulative loss a report block can carry.
const MAX_CUMULATIVE_LOST: u64 = 0x7F_FFFF;

#[derive(Debug, Default)]
pub struct ReceiveOutput {
    /// Frames to hand to the sink, in order. Each must come back through
    /// [`VideoReceiver::recycle_frame`].
    pub frames: Vec<VideoFrame>,
    pub feedback: Vec<Feedback>,
    /// Keyframe requests that have to go over the application's own signaling.
    pub in_band_keyframe_requests: usize,
}

impl ReceiveOutput {
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty() && self.feedback.is_empty() && self.in_band_keyframe_requests == 0
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveStats {
    pub packets_received: u64,
    pub bytes_received: u64,
    pub packets_lost: u64,
    pub packets_retransmitted: u64,
    pub packets_out_of_order: u64,
    pub duplicates: u64,
    pub late_packets: u64,
    pub discarded_while_paused: u64,
    pub discarded_keepalives: u64,
    pub discarded_old_ssrc: u64,
    pub discarded_malformed: u64,
    pub packet_pool_exhausted: u64,
    pub frames_released: u64,
    pub frames_incomplete: u64,
    pub frames_dropped: u64,
    pub keyframes_requested: u64,
    pub keyframes_received: u64,
    pub burst_drops: u64,
    pub nacks_sent: u64,
    pub max_rate: DataRate,
    pub keyframe_wait: KeyframeWaitStats,
}

struct Counters {
    discarded: Arc<EventCountReporter>,
    duplicates: Arc<EventCountReporter>,
    late: Arc<EventCountReporter>,
    packet_pool_exhausted: Arc<EventCountReporter>,
    frames_released: Arc<EventCountReporter>,
    frames_incomplete: Arc<EventCountReporter>,
    burst_drops: Arc<EventCountReporter>,
    nacks_sent: Arc<EventCountReporter>,
}

impl Counters {
    fn new(metrics: &Metrics) -> Self {
        Self {
            discarded: metrics.event("videophone.receive.discarded"),
            duplicates: metrics.event("videophone.receive.duplicates"),
            late: metrics.event("videophone.receive.late"),
            packet_pool_exhausted: metrics.event("videophone.receive.packet_pool_exhausted"),
            frames_released: metrics.event("videophone.receive.frames_released"),
            frames_incomplete: metrics.event("videophone.receive.frames_incomplete"),
            burst_drops: metrics.event("videophone.receive.burst_drops"),
            nacks_sent: metrics.event("videophone.receive.nacks_sent"),
        }
    }
}

/// RFC 3550 appendix A.3 and A.8 bookkeeping for receiver reports.
#[derive(Debug, Default)]
struct ReportState {
    base_seqnum: Option<FullSequenceNumber>,
    received: u64,
    expected_prior: u64,
    received_prior: u64,
    last_transit: Option<i64>,
    jitter: f64,
}

impl ReportState {
    fn on_packet(
        &mut self,
        seqnum: FullSequenceNumber,
        arrival_ticks: i64,
        timestamp: TruncatedTimestamp,
    ) {
        self.base_seqnum = Some(self.base_seqnum.map_or(seqnum, |base| base.min(seqnum)));
        self.received += 1;
        let transit = arrival_ticks - timestamp as i64;
        if let Some(last_transit) = self.last_transit {
            let difference = (transit - last_transit).abs() as f64;
            self.jitter += (difference - self.jitter) / 16.0;
        }
        self.last_transit = Some(transit);
    }
}

pub struct VideoReceiver {
    payload_type: PayloadType,
    rtx_payload_type: Option<PayloadType>,
    multiplex_len: usize,
    nack_enabled: bool,
    tmmbr_enabled: bool,

    depacketizer: Depacketizer,
    packet_pool: Pool<InboundPacket>,
    frame_pool: Pool<VideoFrame>,
    jitter: JitterBuffer,
    loss: LossTracker,
    keyframes: KeyframeRequester,
    limiter: ReceiveRateLimiter,
    unwrapper: SequenceUnwrapper,

    ssrc: Option<Ssrc>,
    previous_ssrc: Option<Ssrc>,
    /// Set when the next packet has to restart the stream state, as after a flush.
    restart_pending: bool,
    last_processed: Option<FullSequenceNumber>,
    last_assembled: Option<FullSequenceNumber>,
    /// Nothing is played until a complete keyframe arrives.
    playing: bool,
    started: Instant,

    muted: bool,
    held: bool,
    closed: bool,

    report: ReportState,
    stats: ReceiveStats,
    counters: Counters,
}

impl VideoReceiver {
    pub fn new(config: &Config, channel: &ChannelConfig, metrics: &Metrics, now: Instant) -> Self {
        let max_frame_bytes = config.max_frame_bytes;
        let max_packet_bytes = config.max_packet_size + config.multiplex_len + 64;
        let overhead =
            (IP_UDP_OVERHEAD + config.multiplex_len + crate::rtp::RTP_MIN_HEADER_LEN) as u16;
        Self {
            payload_type: config.payload_type,
            rtx_payload_type: config.rtx_payload_type,
            multiplex_len: config.multiplex_len,
            nack_enabled: config.nack_enabled,
            tmmbr_enabled: config.tmmbr_enabled,

            depacketizer: Depacketizer::new(
                config.packetization,
                config.frame_format,
                config.byte_accounting,
                metrics,
            ),
            packet_pool: Pool::new(config.packet_pool_size, || {
                InboundPacket::with_capacity(max_packet_bytes)
            }),
            frame_pool: Pool::new(config.frame_pool_size, || {
                VideoFrame::with_capacity(max_frame_bytes)
            }),
            jitter: JitterBuffer::new(config.frames_to_buffer, now),
            loss: LossTracker::new(channel.max_missing_packets),
            keyframes: KeyframeRequester::new(config.pli_enabled, config.fir_enabled, metrics)
                .with_failsafe_interval(channel.keyframe_failsafe_interval),
            limiter: ReceiveRateLimiter::new(config.max_send_rate(), overhead, metrics, now),
            unwrapper: SequenceUnwrapper::default(),

            ssrc: None,
            previous_ssrc: None,
            restart_pending: true,
            last_processed: None,
            last_assembled: None,
            playing: false,
            started: now,

            muted: false,
            held: false,
            closed: false,

            report: ReportState::default(),
            stats: ReceiveStats::default(),
            counters: Counters::new(metrics),
        }
    }

    pub fn ssrc(&self) -> Option<Ssrc> {
        self.ssrc
    }

    pub fn is_paused(&self) -> bool {
        self.muted || self.held || self.closed
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn set_scheme(&mut self, scheme: PacketizationScheme) {
        self.depacketizer.set_scheme(scheme);
    }

    pub fn stats(&self) -> ReceiveStats {
        ReceiveStats {
            max_rate: self.limiter.max_rate(),
            keyframe_wait: self.keyframes.wait_stats(),
            ..self.stats
        }
    }

    /// When the jitter buffer wants [`Self::release`] called.
    pub fn next_release(&self) -> Option<Instant> {
        self.jitter.next_release()
    }

    pub fn failsafe_deadline(&self) -> Option<Instant> {
        self.keyframes.failsafe_deadline()
    }

    fn discard(&mut self, count: impl FnOnce(&mut ReceiveStats)) {
        count(&mut self.stats);
        self.counters.discarded.count();
    }

    /// Takes in one packet as it came off the wire, multiplex prefix included.
    pub fn receive_rtp(&mut self, raw: &[u8], now: Instant) -> ReceiveOutput {
        let mut output = ReceiveOutput::default();
        if self.is_paused() {
            self.discard(|stats| stats.discarded_while_paused += 1);
            return output;
        }

        let Some((header, header_len)) = raw
            .get(self.multiplex_len..)
            .and_then(RtpHeader::parse)
        else {
            debug!("dropping malformed RTP packet of {} bytes", raw.len());
            self.discard(|stats| stats.discarded_malformed += 1);
            return output;
        };
        let offset = RtpHeaderOffset::new(header_len, self.multiplex_len);
        if raw.len() <= offset.offset() {
            trace!("keepalive from {}", header.ssrc);
            self.discard(|stats| stats.discarded_keepalives += 1);
            return output;
        }
        let is_rtx = self.rtx_payload_type == Some(header.payload_type);
        if header.payload_type != self.payload_type && !is_rtx {
            debug!("dropping packet with unexpected payload type {}", header.payload_type);
            self.discard(|stats| stats.discarded_malformed += 1);
            return output;
        }

        match self.ssrc {
            Some(ssrc) if ssrc == header.ssrc => {}
            Some(_) if self.previous_ssrc == Some(header.ssrc) => {
                trace!("straggler from the previous SSRC {}", header.ssrc);
                self.discard(|stats| stats.discarded_old_ssrc += 1);
                return output;
            }
            Some(ssrc) => {
                info!("SSRC changed from {} to {}", ssrc, header.ssrc);
                self.flush();
                self.previous_ssrc = Some(ssrc);
                self.ssrc = Some(header.ssrc);
                self.unwrapper.reset();
                self.report = ReportState::default();
                self.keyframes.reset_need();
                self.request_keyframe(header.timestamp, now, &mut output);
            }
            None => {
                info!("receiving from SSRC {}", header.ssrc);
                self.ssrc = Some(header.ssrc);
            }
        }

        let Some(mut packet) = self.packet_pool.take() else {
            debug!("packet pool exhausted, dropping seqnum {}", header.seqnum);
            self.stats.packet_pool_exhausted += 1;
            self.counters.packet_pool_exhausted.count();
            return output;
        };
        packet.fill(&header, raw, offset);
        if is_rtx && packet.unwrap_rtx(self.payload_type).is_none() {
            debug!("dropping truncated retransmission");
            self.packet_pool.give_back(packet);
            self.discard(|stats| stats.discarded_malformed += 1);
            return output;
        }
        packet.seqnum = self.unwrapper.unwrap(packet.truncated_seqnum);
        let seqnum = packet.seqnum;

        if self.restart_pending {
            self.restart_pending = false;
            self.last_processed = None;
            self.last_assembled = None;
            self.keyframes.reset_need();
            self.jitter.restart(packet.timestamp, now);
        }

        if self.last_assembled.is_some_and(|last| seqnum <= last) {
            trace!("seqnum {} arrived after its frame was assembled", seqnum);
            self.stats.late_packets += 1;
            self.counters.late.count();
            self.packet_pool.give_back(packet);
            return output;
        }

        match self.last_processed {
            Some(last) if seqnum > last + 1 => {
                if self.nack_enabled {
                    self.loss.record_gap(last, seqnum, now);
                }
                self.last_processed = Some(seqnum);
            }
            Some(last) if seqnum > last => self.last_processed = Some(seqnum),
            Some(last) if seqnum < last => {
                self.stats.packets_out_of_order += 1;
                if self.loss.remember_arrival(seqnum) {
                    packet.retransmission = true;
                }
            }
            Some(_) => {}
            None => self.last_processed = Some(seqnum),
        }

        if self.depacketizer.scheme() == PacketizationScheme::H263Rfc2190 {
            if let Some((leading, trailing)) = h263_skip_bits(packet.payload()) {
                packet.leading_skip_bits = leading;
                packet.trailing_skip_bits = trailing;
            }
        }

        let arrival_ticks = now.saturating_duration_since(self.started).as_millis() as i64
            * VIDEO_TICKS_PER_MILLISECOND as i64;
        let timestamp = packet.timestamp;
        match self
            .jitter
            .add_packet(packet, self.nack_enabled, &mut self.packet_pool, now)
        {
            AddOutcome::Added { closed } => {
                self.stats.packets_received += 1;
                self.report.on_packet(seqnum, arrival_ticks, timestamp);
                if closed > 0 {
                    trace!("{} groups closed by seqnum {}", closed, seqnum);
                }
            }
            AddOutcome::Duplicate => {
                self.stats.duplicates += 1;
                self.counters.duplicates.count();
            }
        }

        if self.nack_enabled && !self.loss.is_empty() {
            self.collect_nacks(now, &mut output);
        }
        output
    }

    /// Parses feedback arriving on the receive direction. Only TMMBN is expected here.
    pub fn receive_rtcp(&mut self, raw: &[u8]) {
        match Feedback::parse_compound(raw) {
            Ok(packets) => {
                for packet in packets {
                    match packet.feedback {
                        Feedback::Tmmbn(items) => {
                            for item in items {
                                trace!("peer acknowledged max rate {}", item.max_rate);
                            }
                        }
                        other => trace!("ignoring {:?} on the receive side", other),
                    }
                }
            }
            Err(err) => debug!("dropping RTCP: {}", err),
        }
    }

    /// Plays whatever the jitter buffer has due.
    pub fn release(&mut self, now: Instant) -> ReceiveOutput {
        let mut output = ReceiveOutput::default();
        if self.is_paused() {
            return output;
        }
        loop {
            match self
                .jitter
                .release(now, self.frame_pool.is_exhausted(), &mut self.packet_pool)
            {
                Release::Idle | Release::Wait(_) => break,
                Release::Dumped {
                    dropped_packets,
                    last_timestamp,
                } => {
                    warn!("jitter buffer overflowed, dropped {} packets", dropped_packets);
                    self.stats.burst_drops += 1;
                    self.counters.burst_drops.count();
                    self.last_assembled =
                        self.jitter.last_seqnum_in_buffer().or(self.last_assembled);
                    self.request_keyframe(last_timestamp, now, &mut output);
                }
                Release::Play(group) => self.assemble(group, now, &mut output),
            }
        }
        output
    }

    fn assemble(&mut self, group: PacketGroup, now: Instant, output: &mut ReceiveOutput) {
        let timestamp = group.timestamp();
        let lost_before = self
            .last_assembled
            .map_or(0, |last| group.first_seqnum().saturating_sub(last + 1));
        let lost_within: u64 = group
            .packets()
            .iter()
            .tuple_windows()
            .map(|(earlier, later)| later.seqnum - earlier.seqnum - 1)
            .sum();
        let lost = lost_before + lost_within;
        let retransmitted = group
            .packets()
            .iter()
            .filter(|packet| packet.retransmission)
            .count() as u64;
        self.limiter
            .stats_mut()
            .add_lost(lost as u32, retransmitted as u32);
        self.stats.packets_lost += lost;
        self.stats.packets_retransmitted += retransmitted;
        self.last_assembled = Some(group.last_seqnum());

        let Some(mut frame) = self.frame_pool.take() else {
            debug!("frame pool exhausted, dropping frame {}", timestamp);
            self.stats.frames_dropped += 1;
            group.recycle_into(&mut self.packet_pool);
            self.request_keyframe(timestamp, now, output);
            return;
        };
        frame.start(timestamp);
        for packet in group.packets() {
            match self.depacketizer.process(&mut frame, packet) {
                Ok(bytes) => {
                    self.limiter.stats_mut().add_received(bytes);
                    self.stats.bytes_received += bytes as u64;
                }
                // Skipped without harming the frame.
                Err(DepacketizeError::UnsupportedNalType(_)) => {}
                Err(_) => debug_assert!(frame.missing_packet),
            }
        }
        if frame.roll_back_fragment() {
            debug!("frame {} ends inside a fragmented unit", timestamp);
            frame.missing_packet = true;
        }
        frame.complete = group.is_complete() && !group.has_gap() && !frame.missing_packet;
        group.recycle_into(&mut self.packet_pool);

        self.stats.frames_released += 1;
        self.counters.frames_released.count();
        if !frame.complete {
            self.stats.frames_incomplete += 1;
            self.counters.frames_incomplete.count();
        }

        if frame.is_empty() {
            self.frame_pool.give_back(frame);
            self.request_keyframe(timestamp, now, output);
            return;
        }

        if !frame.complete || lost > 0 {
            self.request_keyframe(timestamp, now, output);
        } else if frame.keyframe {
            self.stats.keyframes_received += 1;
            if let Some(request) = self.keyframes.received(timestamp, now) {
                self.send_keyframe_request(request, output);
            }
        }

        if !self.playing {
            if frame.keyframe && frame.complete {
                debug!("starting playback at keyframe {}", timestamp);
                self.playing = true;
            } else {
                trace!("waiting for a keyframe, dropping frame {}", timestamp);
                self.frame_pool.give_back(frame);
                self.request_keyframe(timestamp, now, output);
                return;
            }
        }
        output.frames.push(frame);
    }

    /// Returns a frame the sink is done with.
    pub fn recycle_frame(&mut self, frame: VideoFrame) {
        self.frame_pool.give_back(frame);
    }

    fn request_keyframe(
        &mut self,
        timestamp: TruncatedTimestamp,
        now: Instant,
        output: &mut ReceiveOutput,
    ) {
        if let Some(request) = self.keyframes.request(timestamp, now) {
            self.send_keyframe_request(request, output);
        }
    }

    fn send_keyframe_request(&mut self, request: KeyframeRequest, output: &mut ReceiveOutput) {
        self.stats.keyframes_requested += 1;
        match request.to_feedback(self.ssrc.unwrap_or_default()) {
            Some(feedback) => output.feedback.push(feedback),
            None => output.in_band_keyframe_requests += 1,
        }
    }

    fn collect_nacks(&mut self, now: Instant, output: &mut ReceiveOutput) {
        let (Some(ssrc), false) = (self.ssrc, self.is_paused()) else {
            return;
        };
        let due = self.loss.nacks_due(self.last_assembled, now);
        if due.is_empty() {
            return;
        }
        trace!("NACKing {:?}", due);
        self.stats.nacks_sent += 1;
        self.counters.nacks_sent.count();
        output.feedback.push(Feedback::Nack(Nack {
            ssrc,
            seqnums: due.into_iter().map(|seqnum| seqnum as u16).collect(),
        }));
    }

    pub fn on_nack_timer(&mut self, now: Instant) -> ReceiveOutput {
        let mut output = ReceiveOutput::default();
        if self.nack_enabled {
            self.collect_nacks(now, &mut output);
        }
        output
    }

    /// Publishes a new maximum rate when it changed. Only used when the peer obeys TMMBR.
    pub fn on_tmmbr_timer(&mut self, now: Instant) -> ReceiveOutput {
        let mut output = ReceiveOutput::default();
        let (Some(ssrc), true, false) = (self.ssrc, self.tmmbr_enabled, self.is_paused()) else {
            return output;
        };
        if let Some(item) = self.limiter.on_tick(ssrc, now) {
            output.feedback.push(Feedback::Tmmbr(item));
        }
        output
    }

    /// Sends a receiver report for peers that run autospeed instead of obeying TMMBR.
    pub fn on_report_timer(&mut self) -> ReceiveOutput {
        let mut output = ReceiveOutput::default();
        if !self.tmmbr_enabled && !self.is_paused() {
            if let Some(block) = self.receiver_report() {
                output.feedback.push(Feedback::ReceiverReport(vec![block]));
            }
        }
        output
    }

    pub fn on_failsafe(&mut self, now: Instant) -> ReceiveOutput {
        let mut output = ReceiveOutput::default();
        if let Some(request) = self.keyframes.on_failsafe(now) {
            self.send_keyframe_request(request, &mut output);
        }
        output
    }

    /// Builds a report block for the interval since the last one. No sender reports are
    /// received, so LSR and DLSR stay zero.
    pub fn receiver_report(&mut self) -> Option<ReportBlock> {
        let ssrc = self.ssrc?;
        let base = self.report.base_seqnum?;
        let highest = self.last_processed?;
        let expected = highest.saturating_sub(base) + 1;
        let received = self.report.received;
        let cumulative_lost = expected.saturating_sub(received).min(MAX_CUMULATIVE_LOST);

        let expected_interval = expected.saturating_sub(self.report.expected_prior);
        let received_interval = received.saturating_sub(self.report.received_prior);
        self.report.expected_prior = expected;
        self.report.received_prior = received;
        let lost_interval = expected_interval.saturating_sub(received_interval);
        let fraction_lost = if expected_interval == 0 || lost_interval == 0 {
            0
        } else {
            ((lost_interval << 8) / expected_interval).min(255) as u8
        };

        Some(ReportBlock {
            ssrc,
            fraction_lost,
            cumulative_lost: cumulative_lost as u32,
            highest_seqnum: highest as u32,
            jitter: self.report.jitter as u32,
            last_sender_report: 0,
            delay_since_last_sender_report: 0,
        })
    }

    /// Drops every held packet and stops the timers. Playback resumes at the next keyframe.
    fn flush(&mut self) {
        self.jitter.flush(&mut self.packet_pool);
        self.loss.clear();
        self.keyframes.stop();
        self.restart_pending = true;
        self.playing = false;
    }

    fn update_suppression(&mut self) {
        self.keyframes.set_suppressed(self.is_paused());
    }

    pub fn set_muted(&mut self, muted: bool) {
        if muted == self.muted {
            return;
        }
        info!("receive side {}", if muted { "muted" } else { "unmuted" });
        self.muted = muted;
        self.flush();
        self.update_suppression();
    }

    pub fn set_held(&mut self, held: bool) {
        if held == self.held {
            return;
        }
        info!("receive side {}", if held { "held" } else { "resumed" });
        self.held = held;
        self.flush();
        self.update_suppression();
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        info!("receive side closed");
        self.closed = true;
        self.flush();
        self.update_suppression();
    }
}

#[cfg(test)]
mod tests {
    use videophone_common::{Duration, Writer};

    use super::*;
    use crate::{config::default_test_config, rtp::RTP_MIN_HEADER_LEN};

    const IDR: [u8; 4] = [0x65, 1, 2, 3];
    const NON_IDR: [u8; 4] = [0x41, 4, 5, 6];

    fn rtp(ssrc: Ssrc, seqnum: u16, timestamp: u32, marker: bool, payload: &[u8]) -> Vec<u8> {
        let header = RtpHeader {
            marker,
            payload_type: 96,
            seqnum,
            timestamp,
            ssrc,
        };
        [header.to_vec(), payload.to_vec()].concat()
    }

    fn receiver(config: &Config, now: Instant) -> VideoReceiver {
        VideoReceiver::new(config, &ChannelConfig::default(), &Metrics::default(), now)
    }

    fn unit(payload: &[u8]) -> Vec<u8> {
        [(payload.len() as u32).to_be_bytes().to_vec(), payload.to_vec()].concat()
    }

    #[test]
    fn plays_a_complete_keyframe() {
        let now = Instant::now();
        let at = |millis| now + Duration::from_millis(millis);
        let mut receiver = receiver(&default_test_config(), at(0));

        assert!(receiver.receive_rtp(&rtp(1, 100, 3000, true, &IDR), at(0)).is_empty());
        assert_eq!(Some(at(5)), receiver.next_release());

        let mut output = receiver.release(at(5));
        assert_eq!(1, output.frames.len());
        let frame = output.frames.remove(0);
        assert_eq!(3000, frame.timestamp);
        assert!(frame.keyframe);
        assert!(frame.complete);
        assert_eq!(unit(&IDR), frame.data());
        receiver.recycle_frame(frame);

        let stats = receiver.stats();
        assert_eq!(1, stats.packets_received);
        assert_eq!(1, stats.frames_released);
        assert_eq!(1, stats.keyframes_received);
        assert_eq!(0, stats.keyframes_requested);
    }

    #[test]
    fn playback_starts_at_a_keyframe() {
        let now = Instant::now();
        let at = |millis| now + Duration::from_millis(millis);
        let mut receiver = receiver(&default_test_config(), at(0));

        receiver.receive_rtp(&rtp(1, 1, 3000, true, &NON_IDR), at(0));
        let output = receiver.release(at(5));
        assert!(output.frames.is_empty());
        assert_eq!(vec![Feedback::Pli { ssrc: 1 }], output.feedback);

        // One request in flight at a time.
        receiver.receive_rtp(&rtp(1, 2, 6000, true, &NON_IDR), at(40));
        let output = receiver.release(at(100));
        assert!(output.frames.is_empty());
        assert!(output.feedback.is_empty());

        receiver.receive_rtp(&rtp(1, 3, 9000, true, &IDR), at(140));
        let output = receiver.release(at(200));
        assert_eq!(1, output.frames.len());
        assert!(output.frames[0].keyframe);
        assert!(output.feedback.is_empty());
        assert_eq!(None, receiver.failsafe_deadline());
    }

    #[test]
    fn failsafe_repeats_the_request() {
        let now = Instant::now();
        let at = |millis| now + Duration::from_millis(millis);
        let mut receiver = receiver(&default_test_config(), at(0));

        receiver.receive_rtp(&rtp(1, 1, 3000, true, &NON_IDR), at(0));
        receiver.release(at(5));
        assert_eq!(Some(at(3005)), receiver.failsafe_deadline());
        assert!(receiver.on_failsafe(at(3000)).is_empty());
        assert_eq!(
            vec![Feedback::Pli { ssrc: 1 }],
            receiver.on_failsafe(at(3005)).feedback
        );
        assert_eq!(2, receiver.stats().keyframes_requested);
    }

    #[test]
    fn in_band_request_without_pli_or_fir() {
        let now = Instant::now();
        let mut config = default_test_config();
        config.pli_enabled = false;
        config.fir_enabled = false;
        let mut receiver = receiver(&config, now);

        receiver.receive_rtp(&rtp(1, 1, 3000, true, &NON_IDR), now);
        let output = receiver.release(now + Duration::from_millis(5));
        assert!(output.feedback.is_empty());
        assert_eq!(1, output.in_band_keyframe_requests);
    }

    #[test]
    fn gap_is_nacked_and_the_retransmission_flagged() {
        let now = Instant::now();
        let at = |millis| now + Duration::from_millis(millis);
        let mut receiver = receiver(&default_test_config(), at(0));

        receiver.receive_rtp(&rtp(1, 1, 3000, true, &IDR), at(0));
        let output = receiver.receive_rtp(&rtp(1, 4, 6000, true, &NON_IDR), at(10));
        assert_eq!(
            vec![Feedback::Nack(Nack {
                ssrc: 1,
                seqnums: vec![2, 3]
            })],
            output.feedback
        );
        // Not again until the retry interval passed.
        assert!(receiver.on_nack_timer(at(30)).is_empty());

        receiver.receive_rtp(&rtp(1, 2, 6000, false, &NON_IDR), at(40));
        let output = receiver.on_nack_timer(at(200));
        assert_eq!(
            vec![Feedback::Nack(Nack {
                ssrc: 1,
                seqnums: vec![3]
            })],
            output.feedback
        );
        // The last retry was spent, so this one is no longer known as a retransmission.
        receiver.receive_rtp(&rtp(1, 3, 6000, false, &NON_IDR), at(210));

        let mut frames = vec![];
        for millis in (220..400).step_by(10) {
            frames.extend(receiver.release(at(millis)).frames);
        }
        assert_eq!(2, frames.len());
        assert!(frames[1].complete);
        assert_eq!(
            [unit(&NON_IDR), unit(&NON_IDR), unit(&NON_IDR)].concat(),
            frames[1].data()
        );

        let stats = receiver.stats();
        assert_eq!(2, stats.packets_out_of_order);
        assert_eq!(1, stats.packets_retransmitted);
        assert_eq!(0, stats.packets_lost);
        assert_eq!(2, stats.nacks_sent);
    }

    #[test]
    fn incomplete_frame_is_forced_through_and_requests_a_keyframe() {
        let now = Instant::now();
        let at = |millis| now + Duration::from_millis(millis);
        let mut config = default_test_config();
        config.nack_enabled = false;
        let mut receiver = receiver(&config, at(0));

        receiver.receive_rtp(&rtp(1, 1, 3000, true, &IDR), at(0));
        assert_eq!(1, receiver.release(at(5)).frames.len());

        // Seqnum 2 never arrives.
        receiver.receive_rtp(&rtp(1, 3, 6000, true, &NON_IDR), at(40));
        receiver.receive_rtp(&rtp(1, 4, 9000, true, &NON_IDR), at(70));
        receiver.receive_rtp(&rtp(1, 5, 12000, true, &NON_IDR), at(100));
        receiver.receive_rtp(&rtp(1, 6, 15000, true, &NON_IDR), at(130));

        let output = receiver.release(at(135));
        assert_eq!(1, output.frames.len());
        assert_eq!(6000, output.frames[0].timestamp);
        assert!(!output.frames[0].complete);
        assert_eq!(vec![Feedback::Pli { ssrc: 1 }], output.feedback);

        let stats = receiver.stats();
        assert_eq!(1, stats.packets_lost);
        assert_eq!(1, stats.frames_incomplete);
    }

    #[test]
    fn ssrc_change_starts_over() {
        let now = Instant::now();
        let at = |millis| now + Duration::from_millis(millis);
        let mut receiver = receiver(&default_test_config(), at(0));

        receiver.receive_rtp(&rtp(1, 1, 3000, true, &IDR), at(0));
        receiver.release(at(5));

        let output = receiver.receive_rtp(&rtp(2, 5000, 90000, true, &NON_IDR), at(40));
        assert_eq!(vec![Feedback::Pli { ssrc: 2 }], output.feedback);
        assert_eq!(Some(2), receiver.ssrc());

        assert!(receiver.receive_rtp(&rtp(1, 2, 6000, true, &NON_IDR), at(50)).is_empty());
        assert_eq!(1, receiver.stats().discarded_old_ssrc);

        // Playback waits for the new source's keyframe.
        assert!(receiver.release(at(60)).frames.is_empty());
        receiver.receive_rtp(&rtp(2, 5001, 93000, true, &IDR), at(70));
        let frames = receiver.release(at(120)).frames;
        assert_eq!(1, frames.len());
        assert_eq!(93000, frames[0].timestamp);
    }

    #[test]
    fn discards_keepalives_strays_and_packets_while_muted() {
        let now = Instant::now();
        let mut receiver = receiver(&default_test_config(), now);

        receiver.receive_rtp(&rtp(1, 1, 3000, false, &[]), now);
        receiver.receive_rtp(&[0x80, 96, 0], now);
        let mut stray = rtp(1, 1, 3000, true, &IDR);
        stray[1] = 97;
        receiver.receive_rtp(&stray, now);

        receiver.set_muted(true);
        assert!(receiver.is_paused());
        receiver.receive_rtp(&rtp(1, 1, 3000, true, &IDR), now);
        receiver.set_muted(false);
        receiver.receive_rtp(&rtp(1, 2, 6000, true, &IDR), now);

        let stats = receiver.stats();
        assert_eq!(1, stats.discarded_keepalives);
        assert_eq!(2, stats.discarded_malformed);
        assert_eq!(1, stats.discarded_while_paused);
        assert_eq!(1, stats.packets_received);
        assert_eq!(RTP_MIN_HEADER_LEN, rtp(1, 1, 0, false, &[]).len());
    }

    #[test]
    fn restart_after_mute_forgets_the_old_need() {
        let now = Instant::now();
        let at = |millis| now + Duration::from_millis(millis);
        let mut receiver = receiver(&default_test_config(), at(0));

        receiver.receive_rtp(&rtp(1, 1, 900_000, true, &NON_IDR), at(0));
        let output = receiver.release(at(5));
        assert_eq!(vec![Feedback::Pli { ssrc: 1 }], output.feedback);

        receiver.set_muted(true);
        receiver.set_muted(false);
        receiver.receive_rtp(&rtp(1, 2, 3000, true, &IDR), at(100));
        let output = receiver.release(at(200));
        assert_eq!(1, output.frames.len());
        assert!(output.feedback.is_empty());
        assert_eq!(1, receiver.stats().keyframes_requested);
    }

    #[test]
    fn duplicates_and_late_packets_are_dropped() {
        let now = Instant::now();
        let at = |millis| now + Duration::from_millis(millis);
        let mut receiver = receiver(&default_test_config(), at(0));

        receiver.receive_rtp(&rtp(1, 1, 3000, false, &IDR), at(0));
        receiver.receive_rtp(&rtp(1, 1, 3000, false, &IDR), at(1));
        receiver.receive_rtp(&rtp(1, 2, 3000, true, &NON_IDR), at(2));
        assert_eq!(1, receiver.release(at(10)).frames.len());
        receiver.receive_rtp(&rtp(1, 2, 3000, true, &NON_IDR), at(20));

        let stats = receiver.stats();
        assert_eq!(1, stats.duplicates);
        assert_eq!(1, stats.late_packets);
        assert_eq!(2, stats.packets_received);
    }

    #[test]
    fn close_flushes_and_stops_the_timers() {
        let now = Instant::now();
        let at = |millis| now + Duration::from_millis(millis);
        let mut receiver = receiver(&default_test_config(), at(0));

        receiver.receive_rtp(&rtp(1, 1, 3000, true, &NON_IDR), at(0));
        receiver.release(at(5));
        receiver.receive_rtp(&rtp(1, 2, 6000, true, &NON_IDR), at(10));
        assert!(receiver.next_release().is_some());
        assert!(receiver.failsafe_deadline().is_some());

        receiver.close();
        assert!(receiver.is_closed());
        assert_eq!(None, receiver.next_release());
        assert_eq!(None, receiver.failsafe_deadline());
        assert!(receiver.release(at(100)).is_empty());
        assert!(receiver.on_failsafe(at(4000)).is_empty());
    }

    #[test]
    fn receiver_report_follows_rfc_3550() {
        let now = Instant::now();
        let mut config = default_test_config();
        config.nack_enabled = false;
        config.tmmbr_enabled = false;
        let mut receiver = receiver(&config, now);

        for seqnum in (1..=10).filter(|seqnum| ![3, 4].contains(seqnum)) {
            receiver.receive_rtp(&rtp(1, seqnum, seqnum as u32 * 3000, true, &NON_IDR), now);
        }
        let output = receiver.on_report_timer();
        let [Feedback::ReceiverReport(blocks)] = &output.feedback[..] else {
            panic!("expected one receiver report, got {:?}", output.feedback);
        };
        assert_eq!(1, blocks.len());
        assert_eq!(1, blocks[0].ssrc);
        assert_eq!(51, blocks[0].fraction_lost);
        assert_eq!(2, blocks[0].cumulative_lost);
        assert_eq!(10, blocks[0].highest_seqnum);

        // Nothing lost since the last report.
        receiver.receive_rtp(&rtp(1, 11, 33000, true, &NON_IDR), now);
        let block = receiver.receiver_report().unwrap();
        assert_eq!(0, block.fraction_lost);
        assert_eq!(2, block.cumulative_lost);
    }

    #[test]
    fn tmmbr_only_when_negotiated() {
        let now = Instant::now();
        let mut config = default_test_config();
        config.tmmbr_enabled = false;
        let mut receiver = receiver(&config, now);
        receiver.receive_rtp(&rtp(1, 1, 3000, true, &IDR), now);
        assert!(receiver
            .on_tmmbr_timer(now + Duration::from_secs(5))
            .is_empty());

        let mut receiver = self::receiver(&default_test_config(), now);
        receiver.receive_rtp(&rtp(1, 1, 3000, true, &IDR), now);
        assert!(receiver.on_report_timer().is_empty());
        let output = receiver.on_tmmbr_timer(now + Duration::from_secs(5));
        assert!(output
            .feedback
            .iter()
            .all(|feedback| matches!(feedback, Feedback::Tmmbr(item) if item.ssrc == 1)));
    }
}
