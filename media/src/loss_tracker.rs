//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Remembers which sequence numbers have not arrived and decides when to NACK them.

use log::*;
use videophone_common::{Duration, Instant, KeySortedCache};

use crate::rtp::FullSequenceNumber;

pub const NACK_RETRY_INTERVAL: Duration = Duration::from_millis(120);
pub const MAX_NACK_RETRIES: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MissingPacket {
    noticed: Instant,
    last_nacked: Option<Instant>,
    retries: u8,
}

pub struct LossTracker {
    limit: usize,
    missing: KeySortedCache<FullSequenceNumber, MissingPacket>,
}

impl LossTracker {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            missing: KeySortedCache::new(limit),
        }
    }

    /// Records every sequence number strictly between `last_processed` and `seqnum`.
    pub fn record_gap(
        &mut self,
        last_processed: FullSequenceNumber,
        seqnum: FullSequenceNumber,
        now: Instant,
    ) {
        let mut missing_range = last_processed.saturating_add(1)..seqnum;
        if seqnum.saturating_sub(missing_range.start) > self.limit as u64 {
            // Only the newest ones would survive the cache limit anyway.
            self.missing.clear();
            missing_range = (missing_range.end - self.limit as u64)..missing_range.end;
        }
        for missing_seqnum in missing_range {
            self.missing.insert(
                missing_seqnum,
                MissingPacket {
                    noticed: now,
                    last_nacked: None,
                    retries: 0,
                },
            );
        }
    }

    /// Forgets a sequence number that finally arrived. Returns true if it had been recorded as
    /// missing, which makes the packet a retransmission.
    pub fn remember_arrival(&mut self, seqnum: FullSequenceNumber) -> bool {
        self.missing.remove(&seqnum).is_some()
    }

    /// Returns the sequence numbers to NACK now. Entries below `last_assembled` can no longer
    /// be played and are dropped first; an entry is dropped after its last allowed retry.
    pub fn nacks_due(
        &mut self,
        last_assembled: Option<FullSequenceNumber>,
        now: Instant,
    ) -> Vec<FullSequenceNumber> {
        if let Some(last_assembled) = last_assembled {
            self.missing.remove_below(last_assembled);
        }

        let mut due = vec![];
        self.missing.retain(|seqnum, missing| {
            let ready = missing.last_nacked.map_or(true, |last_nacked| {
                now.saturating_duration_since(last_nacked) > NACK_RETRY_INTERVAL
            });
            if !ready {
                return true;
            }
            due.push(*seqnum);
            missing.last_nacked = Some(now);
            missing.retries += 1;
            if missing.retries >= MAX_NACK_RETRIES {
                trace!(
                    "giving up on {} after {:?}",
                    seqnum,
                    now.saturating_duration_since(missing.noticed)
                );
                false
            } else {
                true
            }
        });
        due
    }

    pub fn is_missing(&self, seqnum: FullSequenceNumber) -> bool {
        self.missing.contains_key(&seqnum)
    }

    pub fn len(&self) -> usize {
        self.missing.len()
    }

    pub fn is_empty(&self) -> bool {
        self.missing.is_empty()
    }

    pub fn clear(&mut self) {
        self.missing.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gap_records_everything_in_between() {
        let now = Instant::now();
        let mut tracker = LossTracker::new(100);
        tracker.record_gap(10, 15, now);
        assert_eq!(4, tracker.len());
        assert!((11..=14).all(|seqnum| tracker.is_missing(seqnum)));
        assert!(!tracker.is_missing(10));
        assert!(!tracker.is_missing(15));

        tracker.record_gap(15, 16, now);
        assert_eq!(4, tracker.len());
    }

    #[test]
    fn arrival_marks_retransmission() {
        let now = Instant::now();
        let mut tracker = LossTracker::new(100);
        tracker.record_gap(1, 4, now);
        assert!(tracker.remember_arrival(2));
        assert!(!tracker.remember_arrival(2));
        assert!(!tracker.remember_arrival(9));
        assert_eq!(vec![3], tracker.nacks_due(None, now));
    }

    #[test]
    fn huge_gap_keeps_newest() {
        let now = Instant::now();
        let mut tracker = LossTracker::new(5);
        tracker.record_gap(0, 1000, now);
        assert_eq!(5, tracker.len());
        assert_eq!(vec![995, 996, 997, 998, 999], tracker.nacks_due(None, now));
    }

    #[test]
    fn retry_schedule() {
        let now = Instant::now();
        let at = |millis| now + Duration::from_millis(millis);
        let mut tracker = LossTracker::new(100);
        tracker.record_gap(100, 103, at(0));

        assert_eq!(vec![101, 102], tracker.nacks_due(None, at(0)));
        assert!(tracker.nacks_due(None, at(20)).is_empty());
        assert!(tracker.nacks_due(None, at(120)).is_empty());

        tracker.record_gap(103, 105, at(100));
        assert_eq!(vec![104], tracker.nacks_due(None, at(100)));

        // Second and last attempt.
        assert_eq!(vec![101, 102], tracker.nacks_due(None, at(121)));
        assert_eq!(1, tracker.len());
        assert_eq!(vec![104], tracker.nacks_due(None, at(221)));
        assert!(tracker.is_empty());
    }

    #[test]
    fn assembled_sequence_expires_entries() {
        let now = Instant::now();
        let mut tracker = LossTracker::new(100);
        tracker.record_gap(0, 10, now);
        assert_eq!(vec![7, 8, 9], tracker.nacks_due(Some(7), now));
        tracker.clear();
        assert!(tracker.is_empty());
    }
}
