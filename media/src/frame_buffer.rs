//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! The destination of reassembly: a bounded byte buffer that can be rolled back to a saved
//! length, and the frame that owns it.

use crate::{
    error::DepacketizeError,
    pool::Recycle,
    rtp::{FullSequenceNumber, TruncatedTimestamp},
};

pub const UNIT_PREFIX_LEN: usize = 4;
pub const START_CODE: [u8; UNIT_PREFIX_LEN] = [0, 0, 0, 1];

/// A saved buffer length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint(usize);

impl Checkpoint {
    pub fn offset(&self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone)]
pub struct FrameBuffer {
    data: Vec<u8>,
    capacity: usize,
}

impl FrameBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint(self.data.len())
    }

    /// Drops everything written since the checkpoint.
    pub fn truncate_to(&mut self, checkpoint: Checkpoint) {
        self.data.truncate(checkpoint.0);
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> Result<(), DepacketizeError> {
        if self.data.len() + bytes.len() > self.capacity {
            return Err(DepacketizeError::BufferOverflow {
                capacity: self.capacity,
            });
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Reserves room for a unit prefix whose value is only known once the unit is complete.
    pub fn reserve_prefix(&mut self) -> Result<Checkpoint, DepacketizeError> {
        let checkpoint = self.checkpoint();
        self.extend_from_slice(&[0; UNIT_PREFIX_LEN])?;
        Ok(checkpoint)
    }

    pub fn fill_prefix(&mut self, at: Checkpoint, prefix: [u8; UNIT_PREFIX_LEN]) {
        self.data[at.0..][..UNIT_PREFIX_LEN].copy_from_slice(&prefix);
    }

    pub fn last_mut(&mut self) -> Option<&mut u8> {
        self.data.last_mut()
    }
}

/// A fragmented unit that has started but not yet ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentInProgress {
    /// Length of the frame before the unit's prefix was written.
    pub unit_start: Checkpoint,
    pub next_seqnum: FullSequenceNumber,
}

#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub buffer: FrameBuffer,
    pub timestamp: TruncatedTimestamp,
    pub keyframe: bool,
    pub complete: bool,
    pub leading_skip_bits: u8,
    pub trailing_skip_bits: u8,
    pub fragment: Option<FragmentInProgress>,
    /// Set when reassembly had to discard data; the frame is then never reported complete.
    pub missing_packet: bool,
}

impl VideoFrame {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: FrameBuffer::with_capacity(capacity),
            timestamp: 0,
            keyframe: false,
            complete: false,
            leading_skip_bits: 0,
            trailing_skip_bits: 0,
            fragment: None,
            missing_packet: false,
        }
    }

    pub fn start(&mut self, timestamp: TruncatedTimestamp) {
        self.recycle();
        self.timestamp = timestamp;
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        self.buffer.as_slice()
    }

    /// Discards a fragmented unit that never ended. Returns true if there was one.
    pub fn roll_back_fragment(&mut self) -> bool {
        if let Some(fragment) = self.fragment.take() {
            self.buffer.truncate_to(fragment.unit_start);
            true
        } else {
            false
        }
    }
}

impl Recycle for VideoFrame {
    fn recycle(&mut self) {
        self.buffer.clear();
        self.timestamp = 0;
        self.keyframe = false;
        self.complete = false;
        self.leading_skip_bits = 0;
        self.trailing_skip_bits = 0;
        self.fragment = None;
        self.missing_packet = false;
    }
}
