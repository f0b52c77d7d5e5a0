//
// Copyright 2022 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::cmp::{max, min};

use log::*;
use videophone_common::{DataRate, Duration, Instant};

use super::{FeedbackOutcome, RateController};
use crate::rtp::Feedback;

const INCREASE_MULTIPLIER: f64 = 0.016;
const MIN_INCREASE: DataRate = DataRate::from_bps(8000);
const MIN_INCREASE_INTERVAL: Duration = Duration::from_secs(2);
const STARTING_RATE: DataRate = DataRate::from_kbps(512);
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Climbs toward the maximum the receiver publishes through TMMBR.
///
/// Loss handling is the receiver's job: it lowers the maximum as soon as it sees loss, and a
/// lower maximum is applied immediately. All this side does is approach the maximum in small,
/// frequent steps.
pub struct TmmbrController {
    /// Negotiated or configured ceiling that TMMBR requests are clamped to.
    channel_max: DataRate,
    max_rate: DataRate,
    reserved: DataRate,
    current: DataRate,
    min_seen: DataRate,
    last_change: Instant,
    rate_seconds: f64,
    seconds: f64,
}

impl TmmbrController {
    pub fn new(max_rate: DataRate, initial_rate: Option<DataRate>, now: Instant) -> Self {
        let current = min(initial_rate.unwrap_or(STARTING_RATE), max_rate);
        Self {
            channel_max: max_rate,
            max_rate,
            reserved: DataRate::ZERO,
            current,
            min_seen: current,
            last_change: now,
            rate_seconds: 0.0,
            seconds: 0.0,
        }
    }

    pub fn max_rate(&self) -> DataRate {
        self.max_rate
    }

    pub fn min_rate_seen(&self) -> DataRate {
        self.min_seen
    }

    /// Time-weighted average of the send rate so far.
    pub fn average_rate(&self, now: Instant) -> DataRate {
        let elapsed = now.saturating_duration_since(self.last_change).as_secs_f64();
        let seconds = self.seconds + elapsed;
        if seconds <= 0.0 {
            return DataRate::ZERO;
        }
        DataRate::from_bps_f64(
            (self.rate_seconds + self.current.as_bps_f64() * elapsed) / seconds,
        )
    }

    fn effective_max(&mut self) -> DataRate {
        if self.reserved >= self.max_rate {
            warn!(
                "reserved rate {} is not below the max rate {}; ignoring it",
                self.reserved, self.max_rate
            );
            self.reserved = DataRate::ZERO;
        }
        self.max_rate.saturating_sub(self.reserved)
    }

    fn accumulate(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_change).as_secs_f64();
        self.rate_seconds += self.current.as_bps_f64() * elapsed;
        self.seconds += elapsed;
    }

    fn apply_max(&mut self, max_rate: DataRate, now: Instant) {
        self.accumulate(now);
        self.max_rate = max_rate;
        self.last_change = now;
        self.min_seen = min(self.min_seen, max_rate);
    }
}

impl RateController for TmmbrController {
    fn name(&self) -> &'static str {
        "tmmbr"
    }

    fn target_rate(&self) -> DataRate {
        self.current
    }

    fn set_max_rate(&mut self, max_rate: DataRate, now: Instant) {
        self.channel_max = max_rate;
        if self.max_rate > max_rate {
            self.apply_max(max_rate, now);
        }
    }

    fn set_reserved_rate(&mut self, reserved: DataRate) {
        self.reserved = reserved;
    }

    fn on_feedback(&mut self, feedback: &Feedback, now: Instant) -> FeedbackOutcome {
        let Feedback::Tmmbr(item) = feedback else {
            return FeedbackOutcome::default();
        };
        let requested = min(item.max_rate, self.channel_max);
        debug!(
            "TMMBR asks for {} (current {}, channel max {})",
            requested, self.current, self.channel_max
        );
        self.apply_max(requested, now);

        let mut new_rate = None;
        if requested < self.current {
            self.current = requested;
            new_rate = Some(requested);
        }
        FeedbackOutcome {
            new_rate,
            replies: vec![Feedback::Tmmbn(vec![*item])],
        }
    }

    fn on_tick(&mut self, _average_packet_size: usize, now: Instant) -> Option<DataRate> {
        let max_rate = self.effective_max();
        if self.current >= max_rate {
            let changed = self.current != max_rate;
            self.current = max_rate;
            return changed.then_some(max_rate);
        }

        if now.saturating_duration_since(self.last_change) < MIN_INCREASE_INTERVAL {
            return None;
        }

        let increase = max(MIN_INCREASE, self.current * INCREASE_MULTIPLIER);
        let increased = min(max_rate, self.current + increase);
        trace!("increasing send rate from {} to {}", self.current, increased);
        self.accumulate(now);
        self.current = increased;
        self.last_change = now;
        Some(increased)
    }

    fn tick_interval(&self) -> Duration {
        TICK_INTERVAL
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::TmmbItem;

    fn tmmbr(kbps: u64) -> Feedback {
        Feedback::Tmmbr(TmmbItem {
            ssrc: 7,
            max_rate: DataRate::from_kbps(kbps),
            overhead: 40,
        })
    }

    #[test]
    fn starts_at_the_lower_of_floor_and_max() {
        let now = Instant::now();
        let controller = TmmbrController::new(DataRate::from_kbps(2000), None, now);
        assert_eq!(DataRate::from_kbps(512), controller.target_rate());
        let controller = TmmbrController::new(DataRate::from_kbps(300), None, now);
        assert_eq!(DataRate::from_kbps(300), controller.target_rate());
        let controller =
            TmmbrController::new(DataRate::from_kbps(2000), Some(DataRate::from_kbps(900)), now);
        assert_eq!(DataRate::from_kbps(900), controller.target_rate());
    }

    #[test]
    fn climbs_in_small_steps() {
        let now = Instant::now();
        let at = |millis| now + Duration::from_millis(millis);
        let mut controller = TmmbrController::new(DataRate::from_kbps(600), None, at(0));

        assert_eq!(None, controller.on_tick(1000, at(1000)));
        // 1.6% of 512k is 8192 bps.
        assert_eq!(
            Some(DataRate::from_bps(520_192)),
            controller.on_tick(1000, at(2000))
        );
        assert_eq!(None, controller.on_tick(1000, at(3000)));

        let mut now = at(2000);
        let mut previous = controller.target_rate();
        for _ in 0..20 {
            now += Duration::from_secs(2);
            controller.on_tick(1000, now);
            assert!(controller.target_rate() >= previous);
            previous = controller.target_rate();
        }
        assert_eq!(DataRate::from_kbps(600), controller.target_rate());
    }

    #[test]
    fn lower_max_applies_immediately_and_is_acknowledged() {
        let now = Instant::now();
        let at = |millis| now + Duration::from_millis(millis);
        let mut controller = TmmbrController::new(DataRate::from_kbps(2000), None, at(0));

        let outcome = controller.on_feedback(&tmmbr(400), at(100));
        assert_eq!(Some(DataRate::from_kbps(400)), outcome.new_rate);
        assert_eq!(
            vec![Feedback::Tmmbn(vec![TmmbItem {
                ssrc: 7,
                max_rate: DataRate::from_kbps(400),
                overhead: 40,
            }])],
            outcome.replies
        );
        assert_eq!(DataRate::from_kbps(400), controller.target_rate());
        assert_eq!(DataRate::from_kbps(400), controller.min_rate_seen());

        // Higher maxima are ramped toward, and clamped to the channel maximum.
        let outcome = controller.on_feedback(&tmmbr(5000), at(200));
        assert_eq!(None, outcome.new_rate);
        assert_eq!(DataRate::from_kbps(2000), controller.max_rate());
    }

    #[test]
    fn reserved_rate_is_left_free() {
        let now = Instant::now();
        let at = |millis| now + Duration::from_millis(millis);
        let mut controller = TmmbrController::new(DataRate::from_kbps(512), None, at(0));
        controller.set_reserved_rate(DataRate::from_kbps(64));
        assert_eq!(
            Some(DataRate::from_kbps(448)),
            controller.on_tick(1000, at(1000))
        );

        controller.set_reserved_rate(DataRate::from_kbps(600));
        controller.on_tick(1000, at(4000));
        assert_eq!(DataRate::from_kbps(512), controller.effective_max());
    }

    #[test]
    fn average_rate_is_time_weighted() {
        let now = Instant::now();
        let at = |millis| now + Duration::from_millis(millis);
        let mut controller = TmmbrController::new(DataRate::from_kbps(2000), None, at(0));
        controller.on_feedback(&tmmbr(256), at(2000));
        assert_eq!(DataRate::from_kbps(384), controller.average_rate(at(4000)));
    }
}
