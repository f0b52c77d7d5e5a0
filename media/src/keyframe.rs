//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Keyframe requests: the receiving side asks for them, the sending side throttles them.

use std::sync::Arc;

use log::*;
use videophone_common::{Duration, Instant};
use videophone_metrics::{EventCountReporter, Metrics, ValueReporter};

use crate::rtp::{is_later_timestamp, Feedback, Ssrc, TruncatedTimestamp};

pub const KEYFRAME_FAILSAFE_INTERVAL: Duration = Duration::from_secs(3);
pub const ENCODER_KEYFRAME_REQUEST_INTERVAL: Duration = Duration::from_millis(300);

/// How a keyframe request reaches the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyframeRequest {
    Pli,
    Fir { seq: u8 },
    /// Neither PLI nor FIR was negotiated; ask over the signaling channel.
    InBand,
}

impl KeyframeRequest {
    /// The RTCP message to send, or None for an in-band request.
    pub fn to_feedback(self, media_ssrc: Ssrc) -> Option<Feedback> {
        match self {
            Self::Pli => Some(Feedback::Pli { ssrc: media_ssrc }),
            Self::Fir { seq } => Some(Feedback::Fir {
                ssrc: media_ssrc,
                seq,
            }),
            Self::InBand => None,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct KeyframeWaitStats {
    pub min: Duration,
    pub max: Duration,
    pub total: Duration,
    pub count: u32,
}

impl KeyframeWaitStats {
    fn record(&mut self, waited: Duration) {
        if self.count == 0 || waited < self.min {
            self.min = waited;
        }
        self.max = self.max.max(waited);
        self.total += waited;
        self.count += 1;
    }
}

/// Tracks the outstanding need for a keyframe on the receiving side.
///
/// Only one request is in flight at a time. While it is, further needs only raise the
/// timestamp the next keyframe has to reach; the failsafe timer repeats the request until a
/// keyframe arrives.
pub struct KeyframeRequester {
    pli_enabled: bool,
    fir_enabled: bool,
    suppressed: bool,
    needed_for: Option<TruncatedTimestamp>,
    requested_at: Option<Instant>,
    failsafe: Option<Instant>,
    fir_seq: u8,
    failsafe_interval: Duration,
    wait_stats: KeyframeWaitStats,
    requests: Arc<EventCountReporter>,
    receipts: Arc<EventCountReporter>,
    wait_millis: Arc<ValueReporter>,
}

impl KeyframeRequester {
    pub fn new(pli_enabled: bool, fir_enabled: bool, metrics: &Metrics) -> Self {
        Self {
            pli_enabled,
            fir_enabled,
            suppressed: false,
            needed_for: None,
            requested_at: None,
            failsafe: None,
            fir_seq: 0,
            failsafe_interval: KEYFRAME_FAILSAFE_INTERVAL,
            wait_stats: KeyframeWaitStats::default(),
            requests: metrics.event("videophone.receive.keyframes_requested"),
            receipts: metrics.event("videophone.receive.keyframes_received"),
            wait_millis: metrics.value("videophone.receive.keyframe_wait_ms"),
        }
    }

    pub fn with_failsafe_interval(mut self, failsafe_interval: Duration) -> Self {
        self.failsafe_interval = failsafe_interval;
        self
    }

    pub fn set_feedback_enabled(&mut self, pli_enabled: bool, fir_enabled: bool) {
        self.pli_enabled = pli_enabled;
        self.fir_enabled = fir_enabled;
    }

    /// No requests go out while the channel is closed or muted.
    pub fn set_suppressed(&mut self, suppressed: bool) {
        self.suppressed = suppressed;
    }

    pub fn is_requested(&self) -> bool {
        self.requested_at.is_some()
    }

    pub fn needed_for(&self) -> Option<TruncatedTimestamp> {
        self.needed_for
    }

    pub fn failsafe_deadline(&self) -> Option<Instant> {
        self.failsafe
    }

    pub fn wait_stats(&self) -> KeyframeWaitStats {
        self.wait_stats
    }

    /// Forgets the outstanding need, as when a new source starts.
    pub fn reset_need(&mut self) {
        self.needed_for = None;
    }

    /// Cancels the failsafe timer, as on close, hold or mute.
    pub fn stop(&mut self) {
        self.failsafe = None;
        self.requested_at = None;
    }

    /// Notes that a keyframe at or after `timestamp` is needed and returns the request to send,
    /// unless one is already outstanding.
    pub fn request(
        &mut self,
        timestamp: TruncatedTimestamp,
        now: Instant,
    ) -> Option<KeyframeRequest> {
        if timestamp != 0
            && self
                .needed_for
                .map_or(true, |needed| is_later_timestamp(timestamp, needed))
        {
            self.needed_for = Some(timestamp);
        }
        if self.is_requested() {
            return None;
        }
        debug!("requesting keyframe for timestamp {:?}", self.needed_for);
        self.send(now)
    }

    /// Repeats the request when the failsafe timer expires.
    pub fn on_failsafe(&mut self, now: Instant) -> Option<KeyframeRequest> {
        if self.failsafe.is_some_and(|deadline| now >= deadline) {
            debug!("keyframe request timed out, requesting again");
            self.send(now)
        } else {
            None
        }
    }

    fn send(&mut self, now: Instant) -> Option<KeyframeRequest> {
        if self.suppressed {
            return None;
        }
        let request = if self.pli_enabled {
            KeyframeRequest::Pli
        } else if self.fir_enabled {
            let seq = self.fir_seq;
            self.fir_seq = self.fir_seq.wrapping_add(1);
            KeyframeRequest::Fir { seq }
        } else {
            KeyframeRequest::InBand
        };
        self.requests.count();
        self.requested_at = Some(now);
        self.failsafe = Some(now + self.failsafe_interval);
        Some(request)
    }

    /// Clears the outstanding request. If the keyframe is older than what is needed, the
    /// returned request must be sent.
    pub fn received(
        &mut self,
        timestamp: TruncatedTimestamp,
        now: Instant,
    ) -> Option<KeyframeRequest> {
        self.receipts.count();
        if let Some(requested_at) = self.requested_at.take() {
            let waited = now.saturating_duration_since(requested_at);
            self.wait_stats.record(waited);
            self.wait_millis.push(waited.as_millis() as u64);
        }
        self.failsafe = None;

        match self.needed_for {
            Some(needed) if timestamp != 0 && is_later_timestamp(needed, timestamp) => {
                debug!(
                    "keyframe at {} is older than the needed {}",
                    timestamp, needed
                );
                self.request(needed, now)
            }
            _ => None,
        }
    }
}

/// Lets at most one encoder keyframe request through per interval.
#[derive(Debug, Default)]
pub struct KeyframeThrottle {
    last_forwarded: Option<Instant>,
}

impl KeyframeThrottle {
    pub fn should_forward(&mut self, now: Instant) -> bool {
        let ready = self.last_forwarded.map_or(true, |last| {
            now.saturating_duration_since(last) >= ENCODER_KEYFRAME_REQUEST_INTERVAL
        });
        if ready {
            self.last_forwarded = Some(now);
        }
        ready
    }
}
