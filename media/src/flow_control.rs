//
// Copyright 2022 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Rate control for both directions of a call.
//!
//! The sending side runs one [`RateController`], picked once per call: [`TmmbrController`] when
//! the peer limits us with TMMBR, otherwise [`AutospeedController`] driven by receiver reports.
//! The receiving side runs a [`ReceiveRateLimiter`] which produces the TMMBR messages the peer's
//! `TmmbrController` obeys.

use strum_macros::{Display, EnumString};
use videophone_common::{DataRate, Duration, Instant};

use crate::rtp::Feedback;

mod autospeed;
mod max_rate;
mod tmmbr;

pub use autospeed::{AutospeedController, AutospeedStats};
pub use max_rate::{MaxRateEstimator, ReceiveRateLimiter};
pub use tmmbr::TmmbrController;

/// Nothing recommends a rate below this.
pub const MIN_RATE: DataRate = DataRate::from_kbps(256);

/// What a controller wants done after a piece of feedback.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FeedbackOutcome {
    /// Set when the encoder must switch rate now rather than on the next tick.
    pub new_rate: Option<DataRate>,
    pub replies: Vec<Feedback>,
}

/// Decides the encoder's target rate on the sending side.
pub trait RateController: Send {
    fn name(&self) -> &'static str;

    /// The rate the encoder should currently produce.
    fn target_rate(&self) -> DataRate;

    /// The highest rate allowed by negotiation or local configuration.
    fn set_max_rate(&mut self, max_rate: DataRate, now: Instant);

    /// Bandwidth used by other media (audio) that video has to leave room for.
    fn set_reserved_rate(&mut self, _reserved: DataRate) {}

    fn on_feedback(&mut self, feedback: &Feedback, now: Instant) -> FeedbackOutcome;

    /// Runs one control step. Returns the new target rate if it changed.
    fn on_tick(&mut self, average_packet_size: usize, now: Instant) -> Option<DataRate>;

    /// How long to wait before the next call to `on_tick`.
    fn tick_interval(&self) -> Duration;

    /// Video was muted or resumed; loss statistics across the gap are not to be trusted.
    fn on_muted(&mut self) {}
}

/// Picks the controller for a call.
pub fn rate_controller(
    tmmbr_enabled: bool,
    mode: AutospeedMode,
    max_rate: DataRate,
    initial_rate: Option<DataRate>,
    now: Instant,
) -> Box<dyn RateController> {
    if tmmbr_enabled {
        Box::new(TmmbrController::new(max_rate, initial_rate, now))
    } else {
        Box::new(AutospeedController::new(
            mode,
            initial_rate.unwrap_or(autospeed::INITIAL_RATE).min(max_rate),
            max_rate,
        ))
    }
}

/// Which receiver-report algorithm autospeed runs when no REMB is present.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum AutospeedMode {
    /// Loss table with bandwidth limit detection.
    #[default]
    Auto,
    /// Plain proportional reaction to the reported fraction lost.
    Legacy,
}

/// Reception counters for one control interval on the receiving side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowControlStats {
    pub started: Instant,
    pub packets_received: u32,
    pub bytes_received: u64,
    /// Missing once the frame was assembled, after retransmissions.
    pub packets_lost: u32,
    /// Missing on first arrival, whether or not a retransmission filled the hole later.
    pub packets_actually_lost: u32,
}

impl FlowControlStats {
    pub fn new(now: Instant) -> Self {
        Self {
            started: now,
            packets_received: 0,
            bytes_received: 0,
            packets_lost: 0,
            packets_actually_lost: 0,
        }
    }

    pub fn add_received(&mut self, bytes: usize) {
        self.packets_received += 1;
        self.bytes_received += bytes as u64;
    }

    pub fn add_lost(&mut self, lost: u32, retransmitted: u32) {
        self.packets_lost += lost;
        self.packets_actually_lost += lost + retransmitted;
    }

    pub fn average_packet_size(&self) -> usize {
        if self.packets_received == 0 {
            0
        } else {
            (self.bytes_received / self.packets_received as u64) as usize
        }
    }

    pub fn duration(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started)
    }

    pub fn reset(&mut self, now: Instant) {
        *self = Self::new(now);
    }
}

/// Fraction of `part` in `part + rest`, zero when both are zero.
fn ratio(part: u32, total: u32) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}
