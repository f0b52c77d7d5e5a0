//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Drives a [`VideoReceiver`] from the network and its timers.

use std::sync::Arc;

use log::*;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::{
    clock,
    config::ChannelConfig,
    receiver::{ReceiveOutput, VideoReceiver},
    transport::{FrameSink, RtcpTransport},
};

#[derive(Debug)]
pub enum ReceiveEvent {
    Rtp(Vec<u8>),
    Rtcp(Vec<u8>),
    Mute(bool),
    Hold(bool),
    Close,
}

/// Runs the receive loop until the channel is closed, the event sender goes away or the ender
/// fires. The receiver stays shared so the application can read its stats meanwhile.
pub async fn start(
    receiver: Arc<Mutex<VideoReceiver>>,
    channel: ChannelConfig,
    mut events_rx: mpsc::Receiver<ReceiveEvent>,
    mut transport: impl RtcpTransport,
    mut sink: impl FrameSink,
    mut ender_rx: oneshot::Receiver<()>,
) -> anyhow::Result<()> {
    let mut nack_interval = clock::interval(channel.nack_interval);
    let mut tmmbr_interval = clock::interval(channel.tmmbr_interval);
    let mut report_interval = clock::interval(channel.receiver_report_interval);
    let mut batch = Vec::with_capacity(channel.batch_size);

    info!("receive channel started");
    loop {
        let (release_at, failsafe_at) = {
            let receiver = receiver.lock();
            (receiver.next_release(), receiver.failsafe_deadline())
        };

        let outputs = tokio::select!(
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
                handle_events(&mut receiver.lock(), batch.drain(..))
            },
            _ = clock::sleep_until(release_at) => vec![receiver.lock().release(clock::now())],
            _ = clock::sleep_until(failsafe_at) => vec![receiver.lock().on_failsafe(clock::now())],
            _ = nack_interval.tick() => vec![receiver.lock().on_nack_timer(clock::now())],
            _ = tmmbr_interval.tick() => vec![receiver.lock().on_tmmbr_timer(clock::now())],
            _ = report_interval.tick() => vec![receiver.lock().on_report_timer()],
        );

        for output in outputs {
            deliver(&receiver, output, &mut transport, &mut sink);
        }
        if receiver.lock().is_closed() {
            break;
        }
    }

    info!("receive channel shutdown");
    Ok(())
}

fn handle_events(
    receiver: &mut VideoReceiver,
    events: impl Iterator<Item = ReceiveEvent>,
) -> Vec<ReceiveOutput> {
    let mut outputs = vec![];
    for event in events {
        match event {
            ReceiveEvent::Rtp(raw) => {
                let output = receiver.receive_rtp(&raw, clock::now());
                if !output.is_empty() {
                    outputs.push(output);
                }
            }
            ReceiveEvent::Rtcp(raw) => receiver.receive_rtcp(&raw),
            ReceiveEvent::Mute(muted) => receiver.set_muted(muted),
            ReceiveEvent::Hold(held) => receiver.set_held(held),
            ReceiveEvent::Close => {
                receiver.close();
                break;
            }
        }
    }
    outputs
}

fn deliver(
    receiver: &Mutex<VideoReceiver>,
    output: ReceiveOutput,
    transport: &mut impl RtcpTransport,
    sink: &mut impl FrameSink,
) {
    for feedback in output.feedback {
        if let Err(err) = transport.send_feedback(feedback) {
            warn!("failed to send feedback: {:?}", err);
        }
    }
    for _ in 0..output.in_band_keyframe_requests {
        sink.request_keyframe_in_band();
    }
    for frame in output.frames {
        if let Err(err) = sink.play(&frame) {
            warn!("failed to play frame {}: {}", frame.timestamp, err);
        }
        receiver.lock().recycle_frame(frame);
    }
}
