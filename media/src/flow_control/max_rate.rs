//
// Copyright 2022 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! The receiving side's half of TMMBR flow control: deciding which maximum rate to publish.
//!
//! It behaves like autospeed seen from the other end. A bandwidth limit is established when
//! loss shows up right after the rate climbed, and is only challenged again after a long quiet
//! period; every time the limit has to come down, later increases get smaller.

use std::{cmp::min, collections::VecDeque, sync::Arc};

use log::*;
use videophone_common::{DataRate, Duration, Instant};
use videophone_metrics::{EventCountReporter, Metrics};

use super::{ratio, FlowControlStats, MIN_RATE};
use crate::rtp::{Ssrc, TmmbItem};

const HISTORY_WINDOW: Duration = Duration::from_secs(30);
const RECENT_WINDOW: Duration = Duration::from_secs(15);
const UTILIZATION_FOR_INCREASE: f64 = 0.70;
const INCREASE_DECAY: f64 = 0.75;
const MIN_INCREASE_MULTIPLIER: f64 = 1.02;
const MAX_INCREASE_MULTIPLIER: f64 = 1.08;
const MIN_DECREASE_MULTIPLIER: f64 = 0.60;
const MAX_DECREASE_MULTIPLIER: f64 = 0.95;
const MIN_DECREASE_INTERVAL: Duration = Duration::from_secs(2);
const MIN_INCREASE_INTERVAL: Duration = Duration::from_secs(10);
const MIN_LIMIT_INCREASE_INTERVAL: Duration = Duration::from_secs(60);
const LIMIT_INCREASE_MULTIPLIERS: [f64; 5] = [1.0226, 1.0226, 1.0226, 1.0075, 1.00375];
const LIMIT_FRACTION_OF_RECENT: f64 = 0.80;
/// Losses above this are treated as this much when averaging, so constant loss stands out.
const AVERAGE_LOSS_CAP: f64 = 0.05;
const CONSTANT_LOSS_MARGIN: f64 = 1.25;
const CLIMB_MARGIN: f64 = 1.15;

/// Loss tolerated at a rate, highest rate first. Interpolated in between.
const ACCEPTABLE_LOSS: [(DataRate, f64); 3] = [
    (DataRate::from_kbps(1024), 0.0025),
    (DataRate::from_kbps(512), 0.01),
    (DataRate::from_kbps(256), 0.02),
];

pub(super) fn acceptable_loss(rate: DataRate) -> f64 {
    let (highest_rate, highest_loss) = ACCEPTABLE_LOSS[0];
    if rate > highest_rate {
        return highest_loss;
    }
    for pair in ACCEPTABLE_LOSS.windows(2) {
        let (upper_rate, upper_loss) = pair[0];
        let (lower_rate, lower_loss) = pair[1];
        if rate > lower_rate {
            let position = (rate - lower_rate) / (upper_rate - lower_rate);
            return lower_loss + position * (upper_loss - lower_loss);
        }
    }
    ACCEPTABLE_LOSS[ACCEPTABLE_LOSS.len() - 1].1
}

#[derive(Debug, Clone, Copy)]
struct ReceiveStats {
    duration: Duration,
    received: u32,
    lost: u32,
    actually_lost: u32,
    observed_rate: DataRate,
}

impl ReceiveStats {
    fn loss(&self) -> f64 {
        ratio(self.lost, self.received + self.lost)
    }

    fn actual_loss(&self) -> f64 {
        ratio(self.actually_lost, self.received + self.lost)
    }
}

/// Recommends the maximum rate to publish to the sender.
pub struct MaxRateEstimator {
    absolute_max: DataRate,
    current: DataRate,
    bandwidth_limit: DataRate,
    limit_decreases: u32,
    /// Newest first.
    history: VecDeque<ReceiveStats>,
    average_rate: DataRate,
    average_loss: f64,
    increases: u32,
    decreases: u32,
    last_change: Instant,
    last_decrease: Instant,
    last_limit_change: Instant,
}

impl MaxRateEstimator {
    pub fn new(absolute_max: DataRate, now: Instant) -> Self {
        Self {
            absolute_max,
            current: absolute_max,
            bandwidth_limit: absolute_max,
            limit_decreases: 0,
            history: VecDeque::new(),
            average_rate: DataRate::ZERO,
            average_loss: 0.0,
            increases: 0,
            decreases: 0,
            last_change: now,
            last_decrease: now,
            last_limit_change: now,
        }
    }

    pub fn max_rate(&self) -> DataRate {
        self.current
    }

    pub fn bandwidth_limit(&self) -> DataRate {
        self.bandwidth_limit
    }

    /// Average observed rate over the whole history, once there is enough of it.
    pub fn average_rate(&self) -> DataRate {
        self.average_rate
    }

    pub fn increases(&self) -> u32 {
        self.increases
    }

    pub fn decreases(&self) -> u32 {
        self.decreases
    }

    /// Feeds one interval of reception statistics and returns the maximum rate to publish.
    pub fn calculate(
        &mut self,
        duration: Duration,
        received: u32,
        lost: u32,
        average_packet_size: usize,
        actually_lost: u32,
        now: Instant,
    ) -> DataRate {
        self.update_history(duration, received, lost, average_packet_size, actually_lost);
        if received + lost == 0 {
            return self.current;
        }

        let mut new_rate = self.current;
        let limit = self.next_bandwidth_limit(now);
        if limit != self.bandwidth_limit {
            debug!(
                "bandwidth limit {} -> {} (recent average {})",
                self.bandwidth_limit,
                limit,
                self.recent_average_rate()
            );
            if limit < self.bandwidth_limit {
                self.limit_decreases += 1;
            }
            self.bandwidth_limit = limit;
            self.last_limit_change = now;
            new_rate = min(limit, new_rate);
        }

        if self.should_decrease(now) {
            new_rate = min(new_rate, self.decreased_rate());
            if new_rate < self.current {
                self.decreases += 1;
                self.last_change = now;
                self.last_decrease = now;
            }
        } else if self.should_increase(now) {
            new_rate = self.increased_rate();
            if new_rate > self.current {
                self.increases += 1;
                self.last_change = now;
            }
        }

        if new_rate != self.current {
            debug!("max receive rate {} -> {}", self.current, new_rate);
        }
        self.current = new_rate;
        new_rate
    }

    fn update_history(
        &mut self,
        duration: Duration,
        received: u32,
        lost: u32,
        average_packet_size: usize,
        actually_lost: u32,
    ) {
        if duration.is_zero() {
            return;
        }
        let bits = received as f64 * average_packet_size as f64 * 8.0;
        self.history.push_front(ReceiveStats {
            duration,
            received,
            lost,
            actually_lost,
            observed_rate: DataRate::from_bps_f64(bits / duration.as_secs_f64()),
        });

        let mut total = Duration::ZERO;
        let keep = self
            .history
            .iter()
            .position(|stats| {
                total += stats.duration;
                total > HISTORY_WINDOW
            })
            .unwrap_or(self.history.len());
        self.history.truncate(keep);

        let history_duration = self.history_duration();
        if history_duration >= RECENT_WINDOW {
            self.average_rate = self.average_rate_over(history_duration);
            let loss_sum: f64 = self
                .history
                .iter()
                .map(|stats| stats.loss().min(AVERAGE_LOSS_CAP))
                .sum();
            self.average_loss = loss_sum / self.history.len() as f64;
        }
    }

    fn history_duration(&self) -> Duration {
        self.history.iter().map(|stats| stats.duration).sum()
    }

    /// Mean of the observed rates of the newest entries covering `window`.
    fn average_rate_over(&self, window: Duration) -> DataRate {
        let mut covered = Duration::ZERO;
        let mut sum = 0u64;
        let mut count = 0u64;
        for stats in &self.history {
            sum += stats.observed_rate.as_bps();
            count += 1;
            covered += stats.duration;
            if covered >= window {
                break;
            }
        }
        if count == 0 {
            DataRate::ZERO
        } else {
            DataRate::from_bps(sum / count)
        }
    }

    fn recent_average_rate(&self) -> DataRate {
        self.average_rate_over(RECENT_WINDOW)
    }

    fn next_bandwidth_limit(&self, now: Instant) -> DataRate {
        let Some(latest) = self.history.front() else {
            return self.bandwidth_limit;
        };
        let recent = self.recent_average_rate();
        let acceptable = acceptable_loss(latest.observed_rate);

        if latest.loss() <= acceptable && latest.actual_loss() <= acceptable {
            let quiet_long_enough = now.saturating_duration_since(self.last_limit_change)
                >= MIN_LIMIT_INCREASE_INTERVAL;
            if quiet_long_enough && recent >= self.bandwidth_limit * UTILIZATION_FOR_INCREASE {
                let index =
                    (self.limit_decreases as usize).min(LIMIT_INCREASE_MULTIPLIERS.len() - 1);
                return min(
                    self.absolute_max,
                    self.bandwidth_limit * LIMIT_INCREASE_MULTIPLIERS[index],
                );
            }
        } else if latest.loss() > acceptable && self.history_duration() >= RECENT_WINDOW {
            // Only loss that follows a climb says anything about the bandwidth. Random or
            // constant loss does not.
            let after_climb = latest.observed_rate * CLIMB_MARGIN > recent;
            let above_constant_loss = latest.loss() > self.average_loss * CONSTANT_LOSS_MARGIN;
            if after_climb && above_constant_loss {
                return (recent * LIMIT_FRACTION_OF_RECENT).max(MIN_RATE);
            }
        }
        self.bandwidth_limit
    }

    fn should_decrease(&self, now: Instant) -> bool {
        let Some(latest) = self.history.front() else {
            return false;
        };
        latest.loss() > acceptable_loss(latest.observed_rate)
            && now.saturating_duration_since(self.last_decrease) >= MIN_DECREASE_INTERVAL
    }

    fn decreased_rate(&self) -> DataRate {
        let Some(latest) = self.history.front() else {
            return self.current;
        };
        let multiplier =
            (1.0 - latest.loss()).clamp(MIN_DECREASE_MULTIPLIER, MAX_DECREASE_MULTIPLIER);
        min(self.bandwidth_limit, latest.observed_rate * multiplier).max(MIN_RATE)
    }

    fn should_increase(&self, now: Instant) -> bool {
        let Some(latest) = self.history.front() else {
            return false;
        };
        if self.current >= self.bandwidth_limit || self.history_duration() < RECENT_WINDOW {
            return false;
        }
        let threshold = self.current * UTILIZATION_FOR_INCREASE;
        if self.recent_average_rate() < threshold || latest.observed_rate < threshold {
            trace!(
                "not using enough of {} to raise it ({} observed)",
                self.current,
                latest.observed_rate
            );
            return false;
        }
        if latest.actual_loss() > acceptable_loss(latest.observed_rate) {
            return false;
        }
        now.saturating_duration_since(self.last_change) >= MIN_INCREASE_INTERVAL
    }

    fn increased_rate(&self) -> DataRate {
        let decay = INCREASE_DECAY.powi(self.limit_decreases as i32);
        let multiplier = (MAX_INCREASE_MULTIPLIER * decay).max(MIN_INCREASE_MULTIPLIER);
        min(self.bandwidth_limit, self.current * multiplier)
    }
}

/// Turns the receive statistics of each control interval into TMMBR messages.
pub struct ReceiveRateLimiter {
    estimator: MaxRateEstimator,
    stats: FlowControlStats,
    overhead: u16,
    rate_changes: Arc<EventCountReporter>,
}

impl ReceiveRateLimiter {
    pub fn new(absolute_max: DataRate, overhead: u16, metrics: &Metrics, now: Instant) -> Self {
        Self {
            estimator: MaxRateEstimator::new(absolute_max, now),
            stats: FlowControlStats::new(now),
            overhead,
            rate_changes: metrics.event("videophone.receive.max_rate_changes"),
        }
    }

    pub fn stats_mut(&mut self) -> &mut FlowControlStats {
        &mut self.stats
    }

    pub fn max_rate(&self) -> DataRate {
        self.estimator.max_rate()
    }

    /// Runs the estimator over the interval that just ended and starts a new one. Returns the
    /// TMMBR to send if the published maximum changed.
    pub fn on_tick(&mut self, media_ssrc: Ssrc, now: Instant) -> Option<TmmbItem> {
        let previous = self.estimator.max_rate();
        let stats = self.stats;
        let max_rate = self.estimator.calculate(
            stats.duration(now),
            stats.packets_received,
            stats.packets_lost,
            stats.average_packet_size(),
            stats.packets_actually_lost,
            now,
        );
        self.stats.reset(now);

        if max_rate == previous {
            return None;
        }
        info!("requesting max rate {} (was {})", max_rate, previous);
        self.rate_changes.count();
        Some(TmmbItem {
            ssrc: media_ssrc,
            max_rate,
            overhead: self.overhead,
        })
    }
}
