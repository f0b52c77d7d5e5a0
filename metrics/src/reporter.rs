//
// Copyright 2021 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::{
    mem,
    sync::atomic::{AtomicUsize, Ordering},
};

use parking_lot::Mutex;

pub struct EventCountReporter {
    name: &'static str,
    event_count: AtomicUsize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventReport {
    pub name: &'static str,
    pub event_count: usize,
}

impl EventCountReporter {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            event_count: AtomicUsize::new(0),
        }
    }

    /// This will count n events.
    pub fn count_n(&self, n: usize) {
        self.event_count.fetch_add(n, Ordering::Relaxed);
    }

    /// This will count an event.
    pub fn count(&self) {
        self.count_n(1);
    }

    /// The running count since the last report.
    pub fn get(&self) -> usize {
        self.event_count.load(Ordering::Relaxed)
    }

    /// Grab the event count and reset to zero.
    pub fn report(&self) -> EventReport {
        EventReport {
            name: self.name,
            event_count: self.event_count.swap(0, Ordering::Relaxed),
        }
    }
}

/// Collects arbitrary unit values, e.g. keyframe wait times in milliseconds or bit rates.
pub struct ValueReporter {
    name: &'static str,
    since_last_report: Mutex<SinceLastReport>,
}

#[derive(Default)]
struct SinceLastReport {
    sample_count: usize,
    sum: u64,
    min: Option<u64>,
    max: Option<u64>,
    last: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueReport {
    pub name: &'static str,
    pub sample_count: usize,
    pub sum: u64,
    pub min: Option<u64>,
    pub max: Option<u64>,
    pub last: Option<u64>,
}

impl ValueReport {
    pub fn mean(&self) -> Option<u64> {
        (self.sample_count > 0).then(|| self.sum / self.sample_count as u64)
    }
}

impl ValueReporter {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            since_last_report: Mutex::new(SinceLastReport::default()),
        }
    }

    pub fn push(&self, value: u64) {
        let mut since_last_report = self.since_last_report.lock();
        since_last_report.sample_count += 1;
        since_last_report.sum = since_last_report.sum.saturating_add(value);
        since_last_report.min = Some(since_last_report.min.map_or(value, |min| min.min(value)));
        since_last_report.max = Some(since_last_report.max.map_or(value, |max| max.max(value)));
        since_last_report.last = Some(value);
    }

    /// Creates a report of values and resets the reporter.
    pub fn report(&self) -> ValueReport {
        let since_last_report = mem::take(&mut *self.since_last_report.lock());
        ValueReport {
            name: self.name,
            sample_count: since_last_report.sample_count,
            sum: since_last_report.sum,
            min: since_last_report.min,
            max: since_last_report.max,
            last: since_last_report.last,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_and_reset() {
        let reporter = EventCountReporter::new("test");
        reporter.count();
        reporter.count_n(4);
        assert_eq!(5, reporter.get());
        assert_eq!(
            EventReport {
                name: "test",
                event_count: 5
            },
            reporter.report()
        );
        assert_eq!(0, reporter.report().event_count);
    }

    #[test]
    fn value_min_max_mean() {
        let reporter = ValueReporter::new("wait_ms");
        assert_eq!(None, reporter.report().mean());

        for value in [30, 10, 20] {
            reporter.push(value);
        }
        let report = reporter.report();
        assert_eq!(3, report.sample_count);
        assert_eq!(Some(10), report.min);
        assert_eq!(Some(30), report.max);
        assert_eq!(Some(20), report.mean());
        assert_eq!(Some(20), report.last);
    }
}
