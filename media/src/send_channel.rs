//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Drives a [`VideoSender`]: pulls frames from the encoder, pushes packets to the transport and
//! feeds the peer's RTCP and the controller ticks back into the encoder settings.

use std::sync::Arc;

use log::*;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use videophone_common::DataRate;

use crate::{
    clock,
    config::ChannelConfig,
    sender::{SendOutput, VideoSender},
    transport::{RtpTransport, VideoEncoder},
};

#[derive(Debug)]
pub enum SendEvent {
    Rtcp(Vec<u8>),
    Mute(bool),
    Hold(bool),
    SetMaxRate(DataRate),
    SetReservedRate(DataRate),
    Close,
}

/// Runs the send loop until the channel is closed, the encoder stops, the event sender goes
/// away or the ender fires.
pub async fn start(
    sender: Arc<Mutex<VideoSender>>,
    channel: ChannelConfig,
    mut events_rx: mpsc::Receiver<SendEvent>,
    mut transport: impl RtpTransport,
    mut encoder: impl VideoEncoder,
    mut ender_rx: oneshot::Receiver<()>,
) -> anyhow::Result<()> {
    let (settings, tick_interval) = {
        let mut sender = sender.lock();
        (sender.encoder_settings(), sender.tick_interval())
    };
    encoder.configure(settings);
    let mut tick_at = clock::now() + tick_interval;
    let mut batch = Vec::with_capacity(channel.batch_size);

    info!("send channel started");
    loop {
        let (paused, has_queued) = {
            let sender = sender.lock();
            (sender.is_paused(), sender.has_queued())
        };

        let output = tokio::select!(
            biased;

            _ = &mut ender_rx => break,
            event = events_rx.recv() => {
                let Some(event) = event else {
                    break;
                };
                batch.push(event);
                while batch.len() < channel.batch_size {
                    match events_rx.try_recv() {
                        Ok(event) => batch.push(event),
                        Err(_) => break,
                    }
                }
                handle_events(&mut sender.lock(), batch.drain(..))
            },
            _ = clock::sleep_until(Some(tick_at)) => {
                let mut sender = sender.lock();
                let now = clock::now();
                tick_at = now + sender.tick_interval();
                sender.on_tick(now)
            },
            frame = encoder.next_frame(), if !paused => {
                let Some(frame) = frame else {
                    info!("encoder stopped");
                    break;
                };
                if let Err(err) = sender.lock().send_frame(&frame, clock::now()) {
                    debug!("frame not fully sent: {}", err);
                }
                SendOutput::default()
            },
            _ = std::future::ready(()), if has_queued => SendOutput::default(),
        );

        apply(output, &mut transport, &mut encoder);
        send_queued(&mut sender.lock(), &mut transport, channel.batch_size);
        if sender.lock().is_closed() {
            break;
        }
    }

    info!("send channel shutdown");
    Ok(())
}

fn handle_events(sender: &mut VideoSender, events: impl Iterator<Item = SendEvent>) -> SendOutput {
    let mut output = SendOutput::default();
    for event in events {
        match event {
            SendEvent::Rtcp(raw) => output.append(sender.receive_rtcp(&raw, clock::now())),
            SendEvent::Mute(muted) => sender.set_muted(muted),
            SendEvent::Hold(held) => sender.set_held(held),
            SendEvent::SetMaxRate(rate) => output.append(sender.set_max_rate(rate, clock::now())),
            SendEvent::SetReservedRate(rate) => sender.set_reserved_rate(rate),
            SendEvent::Close => {
                sender.close();
                break;
            }
        }
    }
    output
}

fn apply(output: SendOutput, transport: &mut impl RtpTransport, encoder: &mut impl VideoEncoder) {
    for feedback in output.feedback {
        if let Err(err) = transport.send_feedback(feedback) {
            warn!("failed to send feedback: {:?}", err);
        }
    }
    for nack in &output.retransmissions {
        match transport.retransmit(nack) {
            Ok(resent) => trace!("resent {} of {} packets", resent, nack.seqnums.len()),
            Err(err) => warn!("failed to retransmit: {:?}", err),
        }
    }
    if output.keyframe_requested {
        encoder.request_keyframe();
    }
    if let Some(settings) = output.settings {
        encoder.configure(settings);
    }
}

fn send_queued(sender: &mut VideoSender, transport: &mut impl RtpTransport, batch_size: usize) {
    for _ in 0..batch_size {
        let Some(mut packet) = sender.next_packet() else {
            break;
        };
        let sent = match transport.send_packet(&mut packet) {
            Ok(()) => true,
            Err(err) => {
                warn!("failed to send packet: {:?}", err);
                false
            }
        };
        sender.recycle(packet, sent);
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::VecDeque, time::Duration};

    use itertools::Itertools;
    use tokio::task::JoinHandle;
    use videophone_metrics::Metrics;

    use super::*;
    use crate::{
        config::default_test_config,
        packetizer::EncodedFrame,
        rtp::{Feedback, Nack, RtpHeader, TmmbItem},
        transport::test_doubles::{Recorder, RecordingTransport, ScriptedEncoder},
    };

    struct Running {
        events_tx: mpsc::Sender<SendEvent>,
        ender_tx: oneshot::Sender<()>,
        recorded: Recorder,
        sender: Arc<Mutex<VideoSender>>,
        handle: JoinHandle<anyhow::Result<()>>,
    }

    fn run(frames: Vec<EncodedFrame>, events: Vec<SendEvent>) -> Running {
        let channel = ChannelConfig::default();
        let sender = Arc::new(Mutex::new(VideoSender::new(
            &default_test_config(),
            &channel,
            &Metrics::default(),
            clock::now(),
        )));
        let recorded = Recorder::default();
        let (events_tx, events_rx) = mpsc::channel(64);
        for event in events {
            events_tx.try_send(event).unwrap();
        }
        let (ender_tx, ender_rx) = oneshot::channel();
        let handle = tokio::spawn(start(
            sender.clone(),
            channel,
            events_rx,
            RecordingTransport::new(recorded.clone(), 5),
            ScriptedEncoder {
                recorded: recorded.clone(),
                frames: VecDeque::from(frames),
            },
            ender_rx,
        ));
        Running {
            events_tx,
            ender_tx,
            recorded,
            sender,
            handle,
        }
    }

    fn idr_frame(len: usize) -> EncodedFrame {
        let mut unit = vec![0xAB; len];
        unit[0] = 0x65;
        EncodedFrame {
            data: [(len as u32).to_be_bytes().to_vec(), unit].concat(),
            keyframe: true,
        }
    }

    fn rtcp(feedback: Feedback) -> SendEvent {
        SendEvent::Rtcp(feedback.serialize(2))
    }

    #[tokio::test(start_paused = true)]
    async fn sends_encoded_frames() {
        let running = run(vec![idr_frame(5000)], vec![]);
        tokio::time::sleep(Duration::from_millis(1)).await;

        let recorded = running.recorded.lock();
        assert_eq!(1, recorded.settings.len());
        assert_eq!(DataRate::from_kbps(512), recorded.settings[0].rate);

        let headers = recorded
            .packets
            .iter()
            .map(|packet| RtpHeader::parse(packet).unwrap().0)
            .collect::<Vec<_>>();
        assert!(headers.len() > 1);
        assert_eq!(
            (1..=headers.len() as u16).collect::<Vec<_>>(),
            headers.iter().map(|header| header.seqnum).collect::<Vec<_>>()
        );
        assert!(headers.iter().all(|header| header.ssrc == 5));
        assert!(headers.iter().all(|header| header.timestamp == headers[0].timestamp));
        assert_eq!(
            vec![headers.len() - 1],
            headers
                .iter()
                .positions(|header| header.marker)
                .collect::<Vec<_>>()
        );
        assert_eq!(
            headers.len() as u64,
            running.sender.lock().stats().packets_sent
        );
    }

    #[tokio::test(start_paused = true)]
    async fn feedback_reaches_the_encoder_and_transport() {
        let tmmbr = TmmbItem {
            ssrc: 5,
            max_rate: DataRate::from_kbps(300),
            overhead: 40,
        };
        let nack = Nack {
            ssrc: 5,
            seqnums: vec![3],
        };
        let running = run(
            vec![],
            vec![
                rtcp(Feedback::Pli { ssrc: 5 }),
                rtcp(Feedback::Tmmbr(tmmbr)),
                rtcp(Feedback::Nack(nack.clone())),
            ],
        );
        tokio::time::sleep(Duration::from_millis(1)).await;

        let recorded = running.recorded.lock();
        assert_eq!(1, recorded.keyframe_requests);
        assert_eq!(vec![Feedback::Tmmbn(vec![tmmbr])], recorded.feedback);
        assert_eq!(vec![nack], recorded.retransmitted);
        assert_eq!(2, recorded.settings.len());
        assert_eq!(DataRate::from_kbps(300), recorded.settings[1].rate);
    }

    #[tokio::test(start_paused = true)]
    async fn controller_ticks_raise_the_rate() {
        let running = run(vec![], vec![]);
        tokio::time::sleep(Duration::from_millis(2100)).await;

        let recorded = running.recorded.lock();
        assert_eq!(2, recorded.settings.len());
        assert_eq!(DataRate::from_bps(520_192), recorded.settings[1].rate);
    }

    #[tokio::test(start_paused = true)]
    async fn muted_sender_leaves_the_encoder_alone() {
        let running = run(vec![idr_frame(100)], vec![SendEvent::Mute(true)]);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(running.recorded.lock().packets.is_empty());
        assert_eq!(0, running.sender.lock().stats().frames_sent);

        running.events_tx.send(SendEvent::Mute(false)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(1, running.recorded.lock().packets.len());
    }

    #[tokio::test(start_paused = true)]
    async fn close_and_ender_end_the_loop() {
        let running = run(vec![], vec![SendEvent::Close]);
        running.handle.await.unwrap().unwrap();
        assert!(running.sender.lock().is_closed());

        let running = run(vec![], vec![]);
        running.ender_tx.send(()).unwrap();
        running.handle.await.unwrap().unwrap();
    }
}
