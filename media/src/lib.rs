//
// Copyright 2021 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

pub mod capture_size;
pub mod clock;
pub mod codec;
pub mod config;
pub mod depacketizer;
pub mod error;
pub mod flow_control;
pub mod frame_buffer;
pub mod jitter_buffer;
pub mod keyframe;
pub mod loss_tracker;
pub mod packetizer;
pub mod pool;
pub mod receive_channel;
pub mod receiver;
pub mod rtp;
pub mod send_channel;
pub mod sender;
pub mod transport;
