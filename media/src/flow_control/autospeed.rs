//
// Copyright 2022 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Send rate control from RTCP receiver reports, for peers that do not send TMMBR.
//!
//! Every tick the queued reports are folded into one: the fraction lost is averaged and the
//! counters come from the oldest report. From that the controller works out how much was lost
//! since the previous tick and how much bandwidth actually got through, then either backs off
//! (setting a bandwidth limit if the loss followed a quiet climb) or creeps upward.
//!
//! A REMB from the peer overrides all of that with a simple three-way rule for the tick that
//! follows it.

use std::{
    cmp::{max, min},
    collections::VecDeque,
};

use log::*;
use videophone_common::{DataRate, Duration, Instant};

use super::{AutospeedMode, FeedbackOutcome, RateController, MIN_RATE};
use crate::rtp::{Feedback, ReportBlock};

pub(super) const INITIAL_RATE: DataRate = DataRate::from_kbps(512);
const TICK_INTERVAL: Duration = Duration::from_secs(5);
const TICK_INTERVAL_AFTER_REMB: Duration = Duration::from_secs(2);
const MAX_QUEUED_REPORTS: usize = 100;
const REPORTS_SKIPPED_AFTER_MUTE: u32 = 2;

const PASSED_RATE_HISTORY: usize = 3;
const LOSS_HISTORY: usize = 20;
const AVERAGE_LOSS_CAP: f64 = 0.05;
const FRACTION_LOST_DENOMINATOR: f64 = 256.0;

const FRACTION_OF_BANDWIDTH: f64 = 0.8;
const QUIET_TICKS_BEFORE_LIMIT: u32 = 3;
const QUIET_TICKS_BETWEEN_LIMIT_INCREASES: u32 = 12;
const LIMIT_INCREASE_MULTIPLIERS: [f64; 3] = [1.0226, 1.0075, 1.0037];
const CLIMB_MARGIN: f64 = 1.15;
const CONSTANT_LOSS_MARGIN: f64 = 1.25;
const UTILIZATION_FOR_INCREASE: f64 = 0.85;
const INITIAL_INCREASE_MULTIPLIER: f64 = 0.08;
const MIN_INCREASE_MULTIPLIER: f64 = 0.02;
const INCREASE_DECAY: f64 = 0.75;
const INITIAL_MIN_REDUCTION: f64 = 0.2;
const MIN_REDUCTION: f64 = 0.1;

const REMB_INCREASE_BELOW_LOSS: f64 = 0.02;
const REMB_HOLD_BELOW_LOSS: f64 = 0.10;
const REMB_INCREASE_MULTIPLIER: f64 = 1.05;
const REMB_INCREASE_STEP: DataRate = DataRate::from_bps(1000);

const LEGACY_LOSS_THRESHOLD: f64 = 0.02;
const LEGACY_MIN_CHANGE_BPS: i64 = 10_000;

struct LossLimits {
    rate: DataRate,
    acceptable: f64,
    one_time: f64,
}

/// Highest rate first. Loss limits only grow as the rate falls.
const LOSS_TABLE: [LossLimits; 4] = [
    LossLimits {
        rate: DataRate::from_kbps(1536),
        acceptable: 0.0025,
        one_time: 0.0100,
    },
    LossLimits {
        rate: DataRate::from_kbps(1024),
        acceptable: 0.0025,
        one_time: 0.0175,
    },
    LossLimits {
        rate: DataRate::from_kbps(512),
        acceptable: 0.0100,
        one_time: 0.0250,
    },
    LossLimits {
        rate: DataRate::from_kbps(256),
        acceptable: 0.0200,
        one_time: 0.0350,
    },
];

/// (acceptable, one time) loss at `rate`.
fn loss_limits(rate: DataRate) -> (f64, f64) {
    let first = &LOSS_TABLE[0];
    if rate >= first.rate {
        return (first.acceptable, first.one_time);
    }
    for pair in LOSS_TABLE.windows(2) {
        let (upper, lower) = (&pair[0], &pair[1]);
        if rate >= lower.rate {
            let position = (rate - lower.rate) / (upper.rate - lower.rate);
            return (
                lower.acceptable + position * (upper.acceptable - lower.acceptable),
                lower.one_time + position * (upper.one_time - lower.one_time),
            );
        }
    }
    let last = &LOSS_TABLE[LOSS_TABLE.len() - 1];
    (last.acceptable, last.one_time)
}

/// The highest rate at which `loss` is still acceptable.
fn max_rate_at_loss(loss: f64, max_rate: DataRate) -> DataRate {
    for (index, limits) in LOSS_TABLE.iter().enumerate() {
        if loss <= limits.acceptable {
            if index == 0 {
                return max_rate;
            }
            let upper = &LOSS_TABLE[index - 1];
            let position = (loss - limits.acceptable) / (upper.acceptable - limits.acceptable);
            return limits.rate + (upper.rate - limits.rate) * position;
        }
    }
    MIN_RATE
}

/// The queued receiver reports of one tick, folded into one.
#[derive(Debug, Clone, Copy, Default)]
struct ReportSummary {
    fraction_lost: u8,
    cumulative_lost: u32,
    highest_seqnum: u32,
    last_sender_report: u32,
    delay_since_last_sender_report: u32,
}

impl ReportSummary {
    fn fold(reports: &VecDeque<ReportBlock>) -> Option<Self> {
        let oldest = reports.front()?;
        let fraction_sum: usize = reports.iter().map(|report| report.fraction_lost as usize).sum();
        Some(Self {
            fraction_lost: (fraction_sum / reports.len()) as u8,
            cumulative_lost: oldest.cumulative_lost,
            highest_seqnum: oldest.highest_seqnum,
            last_sender_report: oldest.last_sender_report,
            delay_since_last_sender_report: oldest.delay_since_last_sender_report,
        })
    }
}

/// What autospeed decided over the call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AutospeedStats {
    pub min_sent: Option<DataRate>,
    pub max_sent: DataRate,
    pub max_sent_with_acceptable_loss: DataRate,
    pub average_sent: DataRate,
    pub bandwidth_limit_changes: u32,
    pub min_bandwidth_limit: Option<DataRate>,
    pub max_bandwidth_limit: DataRate,
}

pub struct AutospeedController {
    mode: AutospeedMode,
    current: DataRate,
    max_rate: DataRate,
    reports: VecDeque<ReportBlock>,
    remb: Option<DataRate>,
    next_interval: Duration,
    skip_reports: u32,

    last_seqnum: u32,
    last_cumulative_lost: u32,
    last_ntp_seconds: f64,
    last_lsr_seconds: u16,
    lsr_seconds_upper: u64,

    passed_rates: VecDeque<DataRate>,
    losses: VecDeque<f64>,
    last_loss: f64,
    last_lost_equivalent: bool,
    lost_counter: u32,
    no_loss_counter: u32,
    rate_increased_last: bool,
    bandwidth_limit: Option<DataRate>,
    increase_multiplier: f64,
    limit_increase_multiplier: f64,
    limit_multiplier_changes: usize,
    min_reduction: f64,
    /// Where the legacy algorithm is heading.
    previous_flow: DataRate,

    stats: AutospeedStats,
    sent_kbps_sum: u64,
    sent_count: u64,
}

impl AutospeedController {
    pub fn new(mode: AutospeedMode, initial_rate: DataRate, max_rate: DataRate) -> Self {
        Self {
            mode,
            current: initial_rate,
            max_rate,
            reports: VecDeque::new(),
            remb: None,
            next_interval: TICK_INTERVAL,
            skip_reports: 0,
            last_seqnum: 0,
            last_cumulative_lost: 0,
            last_ntp_seconds: 0.0,
            last_lsr_seconds: 0,
            lsr_seconds_upper: 0,
            passed_rates: std::iter::repeat(DataRate::ZERO)
                .take(PASSED_RATE_HISTORY)
                .collect(),
            losses: std::iter::repeat(0.0).take(LOSS_HISTORY).collect(),
            last_loss: 0.0,
            last_lost_equivalent: false,
            lost_counter: 0,
            no_loss_counter: 0,
            rate_increased_last: false,
            bandwidth_limit: None,
            increase_multiplier: INITIAL_INCREASE_MULTIPLIER,
            limit_increase_multiplier: 1.0,
            limit_multiplier_changes: 0,
            min_reduction: INITIAL_MIN_REDUCTION,
            previous_flow: initial_rate,
            stats: AutospeedStats::default(),
            sent_kbps_sum: 0,
            sent_count: 0,
        }
    }

    pub fn stats(&self) -> AutospeedStats {
        self.stats
    }

    pub fn bandwidth_limit(&self) -> Option<DataRate> {
        self.bandwidth_limit
    }

    pub fn queued_reports(&self) -> usize {
        self.reports.len()
    }

    fn queue_report(&mut self, report: ReportBlock) {
        if self.reports.len() >= MAX_QUEUED_REPORTS {
            error!(
                "{} receiver reports were never consumed; dropping them",
                self.reports.len()
            );
            debug_assert!(false, "receiver reports are not being consumed");
            self.reports.clear();
        }
        self.reports.push_back(report);
    }

    /// NTP time the report was sent at, rebuilt from the 16.16 LSR field and DLSR.
    fn ntp_seconds(&mut self, last_sender_report: u32, delay: u32) -> f64 {
        if last_sender_report == 0 {
            return 0.0;
        }
        let seconds = (last_sender_report >> 16) as u16;
        let step = seconds.wrapping_sub(self.last_lsr_seconds);
        let mut ntp_seconds = 0.0;
        if self.last_ntp_seconds > 0.0 {
            if seconds < self.last_lsr_seconds && step < 0x0fff {
                self.lsr_seconds_upper += 0x10000;
            }
            if step > 0xefff {
                // Out of order, from before the last one.
                ntp_seconds -= 65536.0;
            }
        }
        self.last_lsr_seconds = seconds;
        ntp_seconds += (self.lsr_seconds_upper + seconds as u64) as f64;
        ntp_seconds += (last_sender_report & 0xffff) as f64 / 65536.0;
        ntp_seconds + delay as f64 / 65536.0
    }

    fn recommend(&mut self, report: ReportSummary, average_packet_size: usize) -> DataRate {
        let current = self.current;
        let lost = report
            .cumulative_lost
            .saturating_sub(self.last_cumulative_lost);
        let expected = report.highest_seqnum.wrapping_sub(self.last_seqnum);
        let loss = if self.last_seqnum == 0 || expected == 0 || expected > i32::MAX as u32 {
            report.fraction_lost as f64 / FRACTION_LOST_DENOMINATOR
        } else {
            (lost as f64 / expected as f64).min(1.0)
        };

        let ntp_seconds =
            self.ntp_seconds(report.last_sender_report, report.delay_since_last_sender_report);
        let elapsed = ntp_seconds - self.last_ntp_seconds;
        let passed_rate = if self.last_seqnum > 0 && self.last_ntp_seconds > 0.0 && elapsed > 0.0
        {
            let delivered = expected.saturating_sub(lost) as f64;
            DataRate::from_bps_f64(delivered * average_packet_size as f64 * 8.0 / elapsed)
        } else {
            current
        };

        if self.skip_reports > 0 {
            self.skip_reports -= 1;
            debug!("skipping receiver report after mute ({} left)", self.skip_reports);
            self.last_seqnum = report.highest_seqnum;
            self.last_cumulative_lost = report.cumulative_lost;
            self.last_ntp_seconds = ntp_seconds;
            return current;
        }

        self.passed_rates.pop_back();
        self.passed_rates.push_front(passed_rate);
        let passed_sum = self.passed_rates.iter().map(DataRate::as_bps).sum::<u64>();
        let average_passed = DataRate::from_bps(passed_sum / PASSED_RATE_HISTORY as u64);
        self.losses.pop_back();
        self.losses.push_front(loss.min(AVERAGE_LOSS_CAP));
        let average_loss = self.losses.iter().sum::<f64>() / LOSS_HISTORY as f64;

        let (new_rate, lost_equivalent) = if let Some(remb) = self.remb {
            (self.follow_remb(loss, remb), false)
        } else {
            match self.mode {
                AutospeedMode::Auto => self.autospeed(loss, average_loss, average_passed),
                AutospeedMode::Legacy => (self.legacy(report.fraction_lost), false),
            }
        };

        trace!(
            "autospeed: loss {:.4} (average {:.4}), passed {} (average {}), {} -> {}, limit {:?}",
            loss,
            average_loss,
            passed_rate,
            average_passed,
            current,
            new_rate,
            self.bandwidth_limit
        );

        self.record_sent(new_rate);
        self.last_seqnum = report.highest_seqnum;
        self.last_cumulative_lost = report.cumulative_lost;
        self.last_ntp_seconds = ntp_seconds;
        self.last_loss = loss;
        self.last_lost_equivalent = lost_equivalent;
        new_rate
    }

    fn follow_remb(&self, loss: f64, remb: DataRate) -> DataRate {
        let current = self.current;
        let rate = if loss < REMB_INCREASE_BELOW_LOSS {
            (current + REMB_INCREASE_STEP) * REMB_INCREASE_MULTIPLIER
        } else if loss < REMB_HOLD_BELOW_LOSS {
            current
        } else {
            current * (1.0 - 0.5 * loss)
        };
        // The configured maximum wins over the floor; the floor wins over REMB.
        min(max(min(rate, remb), MIN_RATE), self.max_rate)
    }

    /// Returns the new rate and whether this report counts as lossy.
    fn autospeed(
        &mut self,
        loss: f64,
        average_loss: f64,
        average_passed: DataRate,
    ) -> (DataRate, bool) {
        let current = self.current;
        let max_rate = self.max_rate;
        let (acceptable, one_time) = loss_limits(current);

        let lost_equivalent = loss > acceptable;
        if lost_equivalent {
            self.lost_counter += 1;
        } else if self.last_loss < acceptable {
            // Two acceptable reports in a row.
            self.lost_counter = 0;
        }

        if lost_equivalent {
            if self.lost_counter > 1 || loss > one_time {
                let quiet_before = self.no_loss_counter >= QUIET_TICKS_BEFORE_LIMIT;
                let after_climb = average_passed < current * CLIMB_MARGIN;
                let limit_above_floor = self.bandwidth_limit.map_or(true, |limit| limit > MIN_RATE);
                let above_constant_loss = loss > average_loss * CONSTANT_LOSS_MARGIN;
                if quiet_before && after_climb && limit_above_floor && above_constant_loss {
                    self.set_bandwidth_limit(current);
                }
                self.no_loss_counter = 0;

                if current > MIN_RATE {
                    let reduction = loss.max(self.min_reduction);
                    let mut reduced = current * (1.0 - reduction);
                    if let Some(limit) = self.bandwidth_limit {
                        reduced = min(reduced, limit);
                    }
                    return (min(max(reduced, MIN_RATE), max_rate), true);
                }
            }
            return (min(max(current, MIN_RATE), max_rate), true);
        }

        self.no_loss_counter += 1;
        self.min_reduction = MIN_REDUCTION;
        if current > self.stats.max_sent_with_acceptable_loss && current <= max_rate {
            self.stats.max_sent_with_acceptable_loss = current;
        }

        // Long loss-free stretches push the limit back up.
        if self.no_loss_counter % QUIET_TICKS_BETWEEN_LIMIT_INCREASES == 0
            && self.bandwidth_limit == Some(current)
            && self.limit_multiplier_changes > 0
        {
            let raised = current * self.limit_increase_multiplier;
            debug!("raising bandwidth limit to {}", raised);
            self.bandwidth_limit = Some(raised);
            self.record_limit(raised);
        }

        let ceiling = self
            .bandwidth_limit
            .map_or(max_rate, |limit| min(limit, max_rate));
        let well_used = average_passed > current * UTILIZATION_FOR_INCREASE;
        if !self.last_lost_equivalent && well_used && !self.rate_increased_last && current < ceiling
        {
            self.rate_increased_last = true;
            let increased = min(
                current * (1.0 + self.increase_multiplier),
                max_rate_at_loss(loss, max_rate),
            );
            return (min(increased, ceiling), false);
        }

        self.rate_increased_last = false;
        (min(max(current, MIN_RATE), ceiling), false)
    }

    fn set_bandwidth_limit(&mut self, current: DataRate) {
        let limit = max(
            current * (FRACTION_OF_BANDWIDTH / (1.0 + self.increase_multiplier)),
            MIN_RATE,
        );
        self.increase_multiplier =
            (self.increase_multiplier * INCREASE_DECAY).max(MIN_INCREASE_MULTIPLIER);
        let schedule = self
            .limit_multiplier_changes
            .min(LIMIT_INCREASE_MULTIPLIERS.len() - 1);
        self.limit_increase_multiplier = LIMIT_INCREASE_MULTIPLIERS[schedule];
        self.limit_multiplier_changes += 1;
        info!("bandwidth limit set to {}", limit);
        self.bandwidth_limit = Some(limit);
        self.record_limit(limit);
    }

    fn legacy(&mut self, fraction_lost: u8) -> DataRate {
        let current = self.current;
        let mut new_rate = current;
        let drift = self.previous_flow.as_bps() as i64 - current.as_bps() as i64;
        if drift.abs() > LEGACY_MIN_CHANGE_BPS {
            self.previous_flow = current;
        }

        let loss = fraction_lost as f64 / FRACTION_LOST_DENOMINATOR;
        if loss > LEGACY_LOSS_THRESHOLD {
            self.previous_flow = max(current * (1.0 - loss), MIN_RATE);
            new_rate = self.previous_flow;
        } else {
            if current > self.stats.max_sent_with_acceptable_loss && current <= self.max_rate {
                self.stats.max_sent_with_acceptable_loss = current;
            }
            if current < self.max_rate {
                let headroom = self.max_rate - current;
                self.previous_flow =
                    self.previous_flow + headroom * (LEGACY_LOSS_THRESHOLD - loss);
                let step = self.previous_flow.as_bps() as i64 - current.as_bps() as i64;
                if step > LEGACY_MIN_CHANGE_BPS {
                    new_rate = self.previous_flow;
                }
            }
        }

        if new_rate > self.max_rate {
            new_rate = self.max_rate;
            self.previous_flow = self.max_rate;
        }
        new_rate
    }

    fn record_sent(&mut self, rate: DataRate) {
        self.sent_count += 1;
        self.sent_kbps_sum += (rate.as_bps() + 500) / 1000;
        self.stats.average_sent = DataRate::from_kbps(self.sent_kbps_sum / self.sent_count);
        self.stats.max_sent = max(self.stats.max_sent, rate);
        self.stats.min_sent = Some(
            self.stats
                .min_sent
                .map_or(rate, |min_sent| min(min_sent, rate)),
        );
    }

    fn record_limit(&mut self, limit: DataRate) {
        self.stats.bandwidth_limit_changes += 1;
        self.stats.max_bandwidth_limit = max(self.stats.max_bandwidth_limit, limit);
        self.stats.min_bandwidth_limit = Some(
            self.stats
                .min_bandwidth_limit
                .map_or(limit, |min_limit| min(min_limit, limit)),
        );
    }
}

impl RateController for AutospeedController {
    fn name(&self) -> &'static str {
        "autospeed"
    }

    fn target_rate(&self) -> DataRate {
        self.current
    }

    fn set_max_rate(&mut self, max_rate: DataRate, _now: Instant) {
        self.max_rate = max_rate;
        self.current = min(self.current, max_rate);
    }

    fn on_feedback(&mut self, feedback: &Feedback, _now: Instant) -> FeedbackOutcome {
        match feedback {
            Feedback::ReceiverReport(blocks) => {
                for block in blocks {
                    self.queue_report(block.clone());
                }
            }
            Feedback::Remb(remb) if !remb.max_rate.is_zero() => {
                self.remb = Some(remb.max_rate);
            }
            _ => {}
        }
        FeedbackOutcome::default()
    }

    fn on_tick(&mut self, average_packet_size: usize, _now: Instant) -> Option<DataRate> {
        let changed = ReportSummary::fold(&self.reports).and_then(|report| {
            self.reports.clear();
            let new_rate = self.recommend(report, average_packet_size);
            let previous = std::mem::replace(&mut self.current, new_rate);
            (new_rate != previous).then_some(new_rate)
        });
        self.next_interval = if self.remb.take().is_some() {
            TICK_INTERVAL_AFTER_REMB
        } else {
            TICK_INTERVAL
        };
        changed
    }

    fn tick_interval(&self) -> Duration {
        self.next_interval
    }

    fn on_muted(&mut self) {
        self.lost_counter = 0;
        self.no_loss_counter = 0;
        if self.skip_reports == 0 {
            self.skip_reports = REPORTS_SKIPPED_AFTER_MUTE;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::Remb;

    const PACKET_SIZE: usize = 1000;

    /// Builds receiver reports as the peer would see a stream sent at the controller's rate.
    struct Peer {
        seqnum: u32,
        cumulative_lost: u32,
        lsr_seconds: u32,
    }

    impl Peer {
        fn new() -> Self {
            Self {
                seqnum: 1000,
                cumulative_lost: 0,
                lsr_seconds: 100,
            }
        }

        fn report(&mut self, rate: DataRate, loss: f64) -> Feedback {
            let sent = (rate.as_bps_f64() * 5.0 / (8.0 * PACKET_SIZE as f64)) as u32;
            let lost = (sent as f64 * loss).round() as u32;
            self.seqnum += sent;
            self.cumulative_lost += lost;
            self.lsr_seconds += 5;
            Feedback::ReceiverReport(vec![ReportBlock {
                ssrc: 1,
                fraction_lost: (loss * 256.0) as u8,
                cumulative_lost: self.cumulative_lost,
                highest_seqnum: self.seqnum,
                jitter: 0,
                last_sender_report: self.lsr_seconds << 16,
                delay_since_last_sender_report: 0,
            }])
        }
    }

    fn run_tick(controller: &mut AutospeedController, peer: &mut Peer, loss: f64) -> DataRate {
        let now = Instant::now();
        let report = peer.report(controller.target_rate(), loss);
        controller.on_feedback(&report, now);
        controller.on_tick(PACKET_SIZE, now);
        controller.target_rate()
    }

    #[test]
    fn loss_limits_interpolate() {
        let close = |expected: f64, actual: f64| (expected - actual).abs() < 1e-9;
        let (acceptable, one_time) = loss_limits(DataRate::from_kbps(2000));
        assert!(close(0.0025, acceptable) && close(0.01, one_time));
        let (acceptable, one_time) = loss_limits(DataRate::from_kbps(768));
        assert!(close(0.00625, acceptable) && close(0.02125, one_time));
        let (acceptable, one_time) = loss_limits(DataRate::from_kbps(100));
        assert!(close(0.02, acceptable) && close(0.035, one_time));

        assert_eq!(
            DataRate::from_kbps(900),
            max_rate_at_loss(0.001, DataRate::from_kbps(900))
        );
        assert_eq!(DataRate::from_kbps(512), max_rate_at_loss(0.01, DataRate::from_kbps(900)));
        assert_eq!(DataRate::from_kbps(256), max_rate_at_loss(0.02, DataRate::from_kbps(900)));
        assert_eq!(MIN_RATE, max_rate_at_loss(0.5, DataRate::from_kbps(900)));
    }

    #[test]
    fn no_reports_no_change() {
        let mut controller =
            AutospeedController::new(AutospeedMode::Auto, INITIAL_RATE, DataRate::from_kbps(2000));
        assert_eq!(None, controller.on_tick(PACKET_SIZE, Instant::now()));
        assert_eq!(INITIAL_RATE, controller.target_rate());
    }

    #[test]
    fn zero_loss_never_decreases() {
        let max_rate = DataRate::from_kbps(2000);
        let mut controller = AutospeedController::new(AutospeedMode::Auto, INITIAL_RATE, max_rate);
        let mut peer = Peer::new();
        let mut previous = controller.target_rate();
        for _ in 0..60 {
            let rate = run_tick(&mut controller, &mut peer, 0.0);
            assert!(rate >= previous, "{} dropped below {}", rate, previous);
            previous = rate;
        }
        assert!(previous > INITIAL_RATE);
        assert!(previous <= max_rate);
    }

    #[test]
    fn heavy_loss_decreases_every_tick_to_the_floor() {
        let mut controller = AutospeedController::new(
            AutospeedMode::Auto,
            DataRate::from_kbps(1500),
            DataRate::from_kbps(2000),
        );
        let mut peer = Peer::new();
        let mut previous = controller.target_rate();
        for _ in 0..30 {
            let rate = run_tick(&mut controller, &mut peer, 0.10);
            if previous > MIN_RATE {
                assert!(rate < previous, "{} should be below {}", rate, previous);
            } else {
                assert_eq!(MIN_RATE, rate);
            }
            previous = rate;
        }
        assert_eq!(MIN_RATE, controller.target_rate());
    }

    #[test]
    fn loss_after_a_quiet_climb_sets_a_bandwidth_limit() {
        let mut controller = AutospeedController::new(
            AutospeedMode::Auto,
            DataRate::from_kbps(800),
            DataRate::from_kbps(4000),
        );
        let mut peer = Peer::new();
        for _ in 0..6 {
            run_tick(&mut controller, &mut peer, 0.0);
        }
        assert_eq!(None, controller.bandwidth_limit());
        let before = controller.target_rate();

        let after = run_tick(&mut controller, &mut peer, 0.05);
        let limit = controller.bandwidth_limit().expect("limit is set");
        assert!(limit < before);
        assert!(after <= limit);
        assert_eq!(1, controller.stats().bandwidth_limit_changes);

        // The rate never climbs past the limit afterwards.
        for _ in 0..10 {
            assert!(run_tick(&mut controller, &mut peer, 0.0) <= limit);
        }
    }

    #[test]
    fn a_single_small_loss_is_tolerated() {
        let mut controller = AutospeedController::new(
            AutospeedMode::Auto,
            DataRate::from_kbps(600),
            DataRate::from_kbps(2000),
        );
        let mut peer = Peer::new();
        run_tick(&mut controller, &mut peer, 0.0);
        let before = controller.target_rate();
        // Above the acceptable loss at this rate but below the one-time allowance.
        assert_eq!(before, run_tick(&mut controller, &mut peer, 0.015));
    }

    #[test]
    fn remb_follows_loss_and_caps_the_rate() {
        let now = Instant::now();
        let mut controller = AutospeedController::new(
            AutospeedMode::Auto,
            DataRate::from_kbps(1000),
            DataRate::from_kbps(2000),
        );
        let mut peer = Peer::new();
        let remb = |kbps| {
            Feedback::Remb(Remb {
                max_rate: DataRate::from_kbps(kbps),
                ssrcs: vec![1],
            })
        };

        controller.on_feedback(&remb(3000), now);
        assert_eq!(DataRate::from_bps(1_051_050), run_tick(&mut controller, &mut peer, 0.0));
        assert_eq!(TICK_INTERVAL_AFTER_REMB, controller.tick_interval());

        controller.on_feedback(&remb(3000), now);
        assert_eq!(DataRate::from_bps(1_051_050), run_tick(&mut controller, &mut peer, 0.05));

        controller.on_feedback(&remb(600), now);
        assert_eq!(DataRate::from_kbps(600), run_tick(&mut controller, &mut peer, 0.0));

        controller.on_feedback(&remb(100), now);
        assert_eq!(MIN_RATE, run_tick(&mut controller, &mut peer, 0.0));

        // Without a fresh REMB the normal interval comes back.
        controller.on_tick(PACKET_SIZE, now);
        assert_eq!(TICK_INTERVAL, controller.tick_interval());
    }

    #[test]
    fn legacy_mode_reacts_to_reported_fraction() {
        let max_rate = DataRate::from_kbps(1000);
        let mut controller =
            AutospeedController::new(AutospeedMode::Legacy, DataRate::from_kbps(500), max_rate);
        let mut peer = Peer::new();

        // 2% of the 500k of headroom is 10k, which is not yet worth a change.
        assert_eq!(DataRate::from_kbps(500), run_tick(&mut controller, &mut peer, 0.0));
        // The target keeps accumulating until it is.
        assert_eq!(DataRate::from_kbps(520), run_tick(&mut controller, &mut peer, 0.0));

        let lowered = run_tick(&mut controller, &mut peer, 0.25);
        assert_eq!(DataRate::from_kbps(390), lowered);
    }

    #[test]
    fn reports_after_mute_are_skipped() {
        let mut controller = AutospeedController::new(
            AutospeedMode::Auto,
            DataRate::from_kbps(1000),
            DataRate::from_kbps(2000),
        );
        let mut peer = Peer::new();
        run_tick(&mut controller, &mut peer, 0.0);
        controller.on_muted();
        assert_eq!(DataRate::from_kbps(1000), run_tick(&mut controller, &mut peer, 0.5));
        assert_eq!(DataRate::from_kbps(1000), run_tick(&mut controller, &mut peer, 0.5));
        assert!(run_tick(&mut controller, &mut peer, 0.5) < DataRate::from_kbps(1000));
    }

    #[test]
    fn reports_are_folded_and_drained_each_tick() {
        let now = Instant::now();
        let mut controller =
            AutospeedController::new(AutospeedMode::Auto, INITIAL_RATE, DataRate::from_kbps(2000));
        let mut peer = Peer::new();
        controller.on_feedback(&peer.report(INITIAL_RATE, 0.0), now);
        controller.on_feedback(&peer.report(INITIAL_RATE, 0.0), now);
        assert_eq!(2, controller.queued_reports());
        controller.on_tick(PACKET_SIZE, now);
        assert_eq!(0, controller.queued_reports());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "receiver reports are not being consumed")]
    fn report_backlog_is_a_bug() {
        let now = Instant::now();
        let mut controller =
            AutospeedController::new(AutospeedMode::Auto, INITIAL_RATE, DataRate::from_kbps(2000));
        let mut peer = Peer::new();
        for _ in 0..=MAX_QUEUED_REPORTS {
            controller.on_feedback(&peer.report(INITIAL_RATE, 0.0), now);
        }
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn report_backlog_is_dropped_and_the_controller_keeps_running() {
        let now = Instant::now();
        let mut controller =
            AutospeedController::new(AutospeedMode::Auto, INITIAL_RATE, DataRate::from_kbps(2000));
        let mut peer = Peer::new();
        for _ in 0..MAX_QUEUED_REPORTS {
            controller.on_feedback(&peer.report(INITIAL_RATE, 0.0), now);
        }
        assert_eq!(MAX_QUEUED_REPORTS, controller.queued_reports());

        controller.on_feedback(&peer.report(INITIAL_RATE, 0.0), now);
        assert_eq!(1, controller.queued_reports());
        controller.on_tick(PACKET_SIZE, now);
        assert_eq!(0, controller.queued_reports());
        assert!(run_tick(&mut controller, &mut peer, 0.0) >= INITIAL_RATE);
    }
}
