//
// Copyright 2021 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Loopback simulation: a send channel and a receive channel wired back to back over an
//! in-process link that can drop packets.

#[macro_use]
extern crate log;

use std::{collections::VecDeque, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use env_logger::Env;
use parking_lot::Mutex;
use rand::Rng;
use tokio::{
    runtime,
    sync::{mpsc, oneshot},
};
use videophone_common::{Duration, Instant};
use videophone_media::{
    clock,
    codec::{FrameFormat, PacketizationScheme, VideoCodec},
    config::{ChannelConfig, Config},
    error::ChannelError,
    frame_buffer::VideoFrame,
    packetizer::EncodedFrame,
    receive_channel::{self, ReceiveEvent},
    receiver::VideoReceiver,
    rtp::{Feedback, Nack, OutboundPacket, RtpHeader, Ssrc, TruncatedSequenceNumber},
    send_channel::{self, SendEvent},
    sender::VideoSender,
    transport::{EncoderSettings, FrameSink, RtcpTransport, RtpTransport, VideoEncoder},
};
use videophone_metrics::Metrics;

const EVENT_QUEUE_CAPACITY: usize = 1024;
const RETRANSMIT_HISTORY: usize = 512;
const KEYFRAME_INTERVAL: Duration = Duration::from_secs(10);
const KEYFRAME_SIZE_MULTIPLIER: usize = 4;
const MIN_FRAME_SIZE: usize = 16;

#[rustfmt::skip]
fn print_config(config: &Config) {
    info!("config:");
    info!("  {:38}{}", "packetization:", config.packetization);
    info!("  {:38}{}", "frame_format:", config.frame_format);
    info!("  {:38}{}", "max_packet_size:", config.max_packet_size);
    info!("  {:38}{}", "payload_type:", config.payload_type);
    info!("  {:38}{:?}", "rtx_payload_type:", config.rtx_payload_type);
    info!("  {:38}{}", "multiplex_len:", config.multiplex_len);
    info!("  {:38}{}", "frames_to_buffer:", config.frames_to_buffer);
    info!("  {:38}nack {} pli {} fir {} tmmbr {}", "feedback:", config.nack_enabled, config.pli_enabled, config.fir_enabled, config.tmmbr_enabled);
    info!("  {:38}{}", "autospeed_mode:", config.autospeed_mode);
    info!("  {:38}{}", "max_send_rate:", config.max_send_rate());
    info!("  {:38}{:?}", "initial_send_rate_bps:", config.initial_send_rate_bps);
    info!("  {:38}{}", "reserved_rate:", config.reserved_rate());
    info!("  {:38}{}", "simulated_loss:", config.simulated_loss);
    info!("  {:38}{}", "duration_secs:", config.duration_secs);
}

/// Both directions of the link. RTP and the sender's RTCP replies flow to the receive
/// channel, subject to the simulated loss.
struct LoopbackTransport {
    ssrc: Ssrc,
    next_seqnum: TruncatedSequenceNumber,
    multiplex_id: Vec<u8>,
    loss: f64,
    /// Recently sent packets, for retransmission.
    history: VecDeque<(TruncatedSequenceNumber, Vec<u8>)>,
    receive_events_tx: mpsc::Sender<ReceiveEvent>,
}

impl LoopbackTransport {
    fn deliver(&self, event: ReceiveEvent) -> Result<()> {
        self.receive_events_tx
            .try_send(event)
            .map_err(|err| anyhow::anyhow!("receive channel unavailable: {}", err))
    }
}

impl RtcpTransport for LoopbackTransport {
    fn send_feedback(&mut self, feedback: Feedback) -> Result<()> {
        self.deliver(ReceiveEvent::Rtcp(feedback.serialize(self.ssrc)))
    }
}

impl RtpTransport for LoopbackTransport {
    fn send_packet(&mut self, packet: &mut OutboundPacket) -> Result<()> {
        let seqnum = self.next_seqnum;
        self.next_seqnum = self.next_seqnum.wrapping_add(1);
        packet.seqnum = Some(seqnum);
        let header = RtpHeader {
            marker: packet.marker,
            payload_type: packet.payload_type,
            seqnum,
            timestamp: packet.timestamp,
            ssrc: self.ssrc,
        };
        let bytes = packet.serialize(&self.multiplex_id, &header).to_vec();

        if self.history.len() == RETRANSMIT_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back((seqnum, bytes.clone()));

        if rand::thread_rng().gen_bool(self.loss) {
            trace!("dropping packet {}", seqnum);
            return Ok(());
        }
        self.deliver(ReceiveEvent::Rtp(bytes))
    }

    fn retransmit(&mut self, nack: &Nack) -> Result<usize> {
        let mut resent = 0;
        for seqnum in &nack.seqnums {
            if let Some((_, bytes)) = self.history.iter().find(|(sent, _)| sent == seqnum) {
                self.deliver(ReceiveEvent::Rtp(bytes.clone()))?;
                resent += 1;
            }
        }
        Ok(resent)
    }
}

/// Carries the receive side's feedback back to the send channel.
struct FeedbackTransport {
    ssrc: Ssrc,
    send_events_tx: mpsc::Sender<SendEvent>,
}

impl RtcpTransport for FeedbackTransport {
    fn send_feedback(&mut self, feedback: Feedback) -> Result<()> {
        self.send_events_tx
            .try_send(SendEvent::Rtcp(feedback.serialize(self.ssrc)))
            .map_err(|err| anyhow::anyhow!("send channel unavailable: {}", err))
    }
}

#[derive(Debug, Default)]
struct Played {
    frames: u64,
    keyframes: u64,
    incomplete: u64,
    bytes: u64,
    in_band_requests: u64,
}

struct CountingSink {
    played: Arc<Mutex<Played>>,
}

impl FrameSink for CountingSink {
    fn play(&mut self, frame: &VideoFrame) -> Result<(), ChannelError> {
        let mut played = self.played.lock();
        played.frames += 1;
        played.bytes += frame.len() as u64;
        if frame.keyframe {
            played.keyframes += 1;
        }
        if !frame.complete {
            played.incomplete += 1;
        }
        Ok(())
    }

    fn request_keyframe_in_band(&mut self) {
        self.played.lock().in_band_requests += 1;
    }
}

/// Produces frames of filler sized to the configured rate.
struct SyntheticEncoder {
    scheme: PacketizationScheme,
    format: FrameFormat,
    max_packet_size: usize,
    frame_interval: Duration,
    settings: Option<EncoderSettings>,
    next_frame_at: Instant,
    next_keyframe_at: Instant,
    keyframe_requested: bool,
}

impl SyntheticEncoder {
    fn new(config: &Config, now: Instant) -> Self {
        Self {
            scheme: config.packetization,
            format: config.frame_format,
            max_packet_size: config.max_packet_size,
            frame_interval: Duration::from_millis(1000 / config.frames_per_second.max(1) as u64),
            settings: None,
            next_frame_at: now,
            next_keyframe_at: now,
            keyframe_requested: true,
        }
    }

    fn frame_size(&self, keyframe: bool) -> usize {
        let Some(settings) = self.settings else {
            return MIN_FRAME_SIZE;
        };
        let frame_rate = settings.capture.frame_rate.max(1) as u64;
        let mut size = (settings.rate.as_bps() / 8 / frame_rate) as usize;
        if keyframe {
            size *= KEYFRAME_SIZE_MULTIPLIER;
        }
        if self.scheme.codec() == VideoCodec::H263
            || self.scheme == PacketizationScheme::H264SingleNal
        {
            // These travel whole, behind at most a four byte payload header.
            size = size.min(self.max_packet_size.saturating_sub(4));
        }
        size.max(MIN_FRAME_SIZE)
    }

    /// One picture in the encoder's output format.
    fn encode(&self, keyframe: bool, size: usize) -> Vec<u8> {
        let mut unit = vec![0xA5; size];
        match self.scheme.codec() {
            VideoCodec::H263 => {
                unit[..3].copy_from_slice(&[0x00, 0x00, 0x80]);
                return unit;
            }
            VideoCodec::H264 => unit[0] = if keyframe { 0x65 } else { 0x41 },
            VideoCodec::H265 => {
                unit[0] = if keyframe { 19 << 1 } else { 1 << 1 };
                unit[1] = 0x01;
            }
        }
        let len = unit.len() as u32;
        match self.format {
            FrameFormat::ByteStream => [&[0, 0, 0, 1][..], &unit].concat(),
            FrameFormat::BigEndianPacked => [&len.to_be_bytes()[..], &unit].concat(),
            FrameFormat::LittleEndianPacked => [&len.to_le_bytes()[..], &unit].concat(),
            FrameFormat::LittleEndianFourByteAligned => {
                let mut data = [&len.to_le_bytes()[..], &unit].concat();
                data.resize((data.len() + 3) & !3, 0);
                data
            }
        }
    }
}

#[async_trait]
impl VideoEncoder for SyntheticEncoder {
    async fn next_frame(&mut self) -> Option<EncodedFrame> {
        clock::sleep_until(Some(self.next_frame_at)).await;
        let now = clock::now();
        self.next_frame_at = now + self.frame_interval;

        let keyframe = self.keyframe_requested || now >= self.next_keyframe_at;
        if keyframe {
            self.keyframe_requested = false;
            self.next_keyframe_at = now + KEYFRAME_INTERVAL;
        }
        let size = self.frame_size(keyframe);
        Some(EncodedFrame {
            data: self.encode(keyframe, size),
            keyframe,
        })
    }

    fn request_keyframe(&mut self) {
        debug!("keyframe requested");
        self.keyframe_requested = true;
    }

    fn configure(&mut self, settings: EncoderSettings) {
        info!(
            "encoding at {} ({}x{} @ {} fps)",
            settings.rate,
            settings.capture.width,
            settings.capture.height,
            settings.capture.frame_rate
        );
        self.frame_interval =
            Duration::from_millis(1000 / settings.capture.frame_rate.max(1) as u64);
        self.settings = Some(settings);
    }
}

async fn run(config: &Config, metrics: &Metrics) -> Result<()> {
    let channel = ChannelConfig::default();
    let now = clock::now();
    let sender = Arc::new(Mutex::new(VideoSender::new(config, &channel, metrics, now)));
    let receiver = Arc::new(Mutex::new(VideoReceiver::new(config, &channel, metrics, now)));
    let played = Arc::new(Mutex::new(Played::default()));

    let (send_events_tx, send_events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    let (receive_events_tx, receive_events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    let (send_ender_tx, send_ender_rx) = oneshot::channel();
    let (receive_ender_tx, receive_ender_rx) = oneshot::channel();

    let transport = LoopbackTransport {
        ssrc: rand::random(),
        next_seqnum: rand::random(),
        multiplex_id: vec![0; config.multiplex_len],
        loss: config.simulated_loss.clamp(0.0, 1.0),
        history: VecDeque::with_capacity(RETRANSMIT_HISTORY),
        receive_events_tx: receive_events_tx.clone(),
    };
    let feedback_transport = FeedbackTransport {
        ssrc: rand::random(),
        send_events_tx: send_events_tx.clone(),
    };
    let encoder = SyntheticEncoder::new(config, now);
    let sink = CountingSink {
        played: played.clone(),
    };

    let send_handle = tokio::spawn(send_channel::start(
        sender.clone(),
        channel.clone(),
        send_events_rx,
        transport,
        encoder,
        send_ender_rx,
    ));
    let receive_handle = tokio::spawn(receive_channel::start(
        receiver.clone(),
        channel,
        receive_events_rx,
        feedback_transport,
        sink,
        receive_ender_rx,
    ));

    tokio::select!(
        _ = tokio::time::sleep(Duration::from_secs(config.duration_secs).into()) => {
            info!("simulation finished");
        },
        _ = tokio::signal::ctrl_c() => {
            info!("terminating by signal: SIGINT");
        },
    );

    let _ = send_events_tx.send(SendEvent::Close).await;
    let _ = receive_events_tx.send(ReceiveEvent::Close).await;
    let _ = send_ender_tx.send(());
    let _ = receive_ender_tx.send(());
    let (send_result, receive_result) = tokio::join!(send_handle, receive_handle);
    send_result??;
    receive_result??;

    info!("send stats: {:?}", sender.lock().stats());
    info!("receive stats: {:?}", receiver.lock().stats());
    info!("played: {:?}", played.lock());
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(
        Env::default()
            .default_filter_or("videophone_media=info")
            .default_write_style_or("never"),
    )
    .format(videophone_common::format_log_line)
    .init();

    info!(
        "videophone_media: v{}",
        option_env!("CARGO_PKG_VERSION").unwrap_or("unknown")
    );

    let config = Config::parse();
    print_config(&config);
    if !(0.0..=1.0).contains(&config.simulated_loss) {
        anyhow::bail!("simulated-loss must be between 0 and 1");
    }

    let metrics = Metrics::new();
    let threaded_rt = runtime::Runtime::new()?;
    threaded_rt.block_on(run(&config, &metrics))?;

    let report = metrics.report();
    for event in report.events {
        info!("  {:48}{}", event.name, event.event_count);
    }
    for value in report.values {
        info!(
            "  {:48}samples {} min {:?} mean {:?} max {:?}",
            value.name,
            value.sample_count,
            value.min,
            value.mean(),
            value.max
        );
    }

    info!("shutting down the runtime");
    threaded_rt.shutdown_timeout(Duration::from_millis(500).into());
    Ok(())
}
