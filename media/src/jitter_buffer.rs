//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Groups received packets by timestamp and decides when each group may become a frame.
//!
//! A group is *accumulating* while packets for its timestamp are still arriving. It is
//! *closed* into the ready queue once it is proven complete or once it has to be forced
//! through, and it is *released* to frame assembly on the pacing schedule computed by
//! [`JitterBuffer::release`].
//!
//! RTP timestamps wrap, so the age of a group is always judged by the extended sequence number
//! of its last packet and never by its timestamp.

use std::collections::{BTreeMap, HashMap};

use log::*;
use videophone_common::{Duration, Instant};

use crate::{
    pool::Pool,
    rtp::{FullSequenceNumber, InboundPacket, TruncatedTimestamp, VIDEO_TICKS_PER_MILLISECOND},
};

/// More than this many accumulating groups lets a new timestamp force the oldest through.
const MIN_GROUPS_BEFORE_FORCING: usize = 2;
/// More than this many accumulating groups forces even while NACK recovery is pending.
const MAX_GROUPS_BEFORE_FORCING: usize = 36;
/// More than this many ready groups and the whole queue is dropped.
pub const MAX_READY_GROUPS: usize = 40;
/// The slowest pacing allowed while at or under the target depth (15 frames per second).
const LONGEST_FRAME_INTERVAL: Duration = Duration::from_millis(1000 / 15);
/// Delay before the first release after the ready queue goes from empty to non-empty.
pub const FIRST_RELEASE_DELAY: Duration = Duration::from_millis(5);
/// Delay before looking at the ready queue again after a release.
pub const NEXT_RELEASE_DELAY: Duration = Duration::from_millis(15);

const SLOW_DOWN: f64 = 1.15;
const SPEED_UP: f64 = 0.90;

/// Packets sharing one RTP timestamp, ordered by extended sequence number.
#[derive(Debug)]
pub struct PacketGroup {
    timestamp: TruncatedTimestamp,
    packets: Vec<InboundPacket>,
    marker_seen: bool,
    complete: bool,
}

impl PacketGroup {
    fn new(packet: InboundPacket) -> Self {
        Self {
            timestamp: packet.timestamp,
            marker_seen: packet.marker,
            packets: vec![packet],
            complete: false,
        }
    }

    /// Gives the packet back if its sequence number is already in the group.
    fn insert(&mut self, packet: InboundPacket) -> Result<(), InboundPacket> {
        match self
            .packets
            .binary_search_by_key(&packet.seqnum, |existing| existing.seqnum)
        {
            Ok(_) => Err(packet),
            Err(index) => {
                self.marker_seen |= packet.marker;
                self.packets.insert(index, packet);
                Ok(())
            }
        }
    }

    pub fn timestamp(&self) -> TruncatedTimestamp {
        self.timestamp
    }

    pub fn first_seqnum(&self) -> FullSequenceNumber {
        self.packets[0].seqnum
    }

    pub fn last_seqnum(&self) -> FullSequenceNumber {
        self.packets[self.packets.len() - 1].seqnum
    }

    pub fn has_gap(&self) -> bool {
        self.last_seqnum() - self.first_seqnum() + 1 != self.packets.len() as u64
    }

    pub fn marker_seen(&self) -> bool {
        self.marker_seen
    }

    /// Whether the group was proven complete when it was closed.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn packets(&self) -> &[InboundPacket] {
        &self.packets
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn recycle_into(self, pool: &mut Pool<InboundPacket>) {
        for packet in self.packets {
            pool.give_back(packet);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added {
        /// Groups closed as a side effect, forced or proven complete.
        closed: usize,
    },
    /// The sequence number was already held; the packet went back to the pool.
    Duplicate,
}

#[derive(Debug)]
pub enum Release {
    /// Nothing is ready.
    Idle,
    /// The next group is not due yet.
    Wait(Instant),
    /// Assemble this group now.
    Play(PacketGroup),
    /// The ready queue overflowed and was dropped.
    Dumped {
        dropped_packets: u64,
        last_timestamp: TruncatedTimestamp,
    },
}

pub struct JitterBuffer {
    frames_to_buffer: usize,
    accumulating: HashMap<TruncatedTimestamp, PacketGroup>,
    /// Closed groups keyed by the sequence number of their last packet.
    ready: BTreeMap<FullSequenceNumber, PacketGroup>,
    last_seqnum_in_buffer: Option<FullSequenceNumber>,
    last_released_timestamp: TruncatedTimestamp,
    last_released: Instant,
    next_release: Option<Instant>,
}

impl JitterBuffer {
    pub fn new(frames_to_buffer: usize, now: Instant) -> Self {
        Self {
            frames_to_buffer,
            accumulating: HashMap::new(),
            ready: BTreeMap::new(),
            last_seqnum_in_buffer: None,
            last_released_timestamp: 0,
            last_released: now,
            next_release: None,
        }
    }

    /// Starts pacing afresh from the first packet of a stream.
    pub fn restart(&mut self, timestamp: TruncatedTimestamp, now: Instant) {
        self.last_released = now;
        self.last_released_timestamp = timestamp;
        self.last_seqnum_in_buffer = None;
    }

    pub fn set_frames_to_buffer(&mut self, frames_to_buffer: usize) {
        self.frames_to_buffer = frames_to_buffer;
    }

    pub fn accumulating_len(&self) -> usize {
        self.accumulating.len()
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn last_seqnum_in_buffer(&self) -> Option<FullSequenceNumber> {
        self.last_seqnum_in_buffer
    }

    /// When [`Self::release`] wants to be called next.
    pub fn next_release(&self) -> Option<Instant> {
        self.next_release
    }

    /// The first packet of the oldest accumulating group, if it is older than `seqnum`.
    pub fn oldest_packet_before(&self, seqnum: FullSequenceNumber) -> Option<&InboundPacket> {
        self.oldest_accumulating()
            .and_then(|group| group.packets.first())
            .filter(|packet| packet.seqnum < seqnum)
    }

    fn oldest_accumulating(&self) -> Option<&PacketGroup> {
        self.accumulating.values().min_by_key(|group| group.last_seqnum())
    }

    fn should_force_for_new_timestamp(&self, nack_enabled: bool) -> bool {
        let waiting = self.accumulating.len();
        waiting > MIN_GROUPS_BEFORE_FORCING
            && (!nack_enabled || self.ready.is_empty() || waiting > MAX_GROUPS_BEFORE_FORCING)
    }

    /// Files the packet under its timestamp, closing groups as a side effect: a new timestamp
    /// with too many groups waiting forces the oldest through, and a packet that may have
    /// finished the oldest group triggers a completeness check.
    pub fn add_packet(
        &mut self,
        packet: InboundPacket,
        nack_enabled: bool,
        pool: &mut Pool<InboundPacket>,
        now: Instant,
    ) -> AddOutcome {
        let timestamp = packet.timestamp;
        let seqnum = packet.seqnum;
        let mut closed = 0;

        match self.accumulating.get_mut(&timestamp) {
            Some(group) => {
                if let Err(duplicate) = group.insert(packet) {
                    trace!("duplicate seqnum {}", duplicate.seqnum);
                    pool.give_back(duplicate);
                    return AddOutcome::Duplicate;
                }
            }
            None => {
                if self.should_force_for_new_timestamp(nack_enabled) {
                    debug!(
                        "{} groups waiting, forcing the oldest through",
                        self.accumulating.len()
                    );
                    if self.close_oldest(false, pool, now) {
                        closed += 1;
                    }
                    closed += self.close_complete(pool, now);
                }
                self.accumulating.insert(timestamp, PacketGroup::new(packet));
            }
        }

        let continues_oldest = self.oldest_accumulating().is_some_and(|oldest| {
            oldest.timestamp == timestamp || oldest.last_seqnum() + 1 == seqnum
        });
        if continues_oldest {
            closed += self.close_complete(pool, now);
        } else if pool.is_exhausted() && self.close_oldest(false, pool, now) {
            closed += 1;
        }
        AddOutcome::Added { closed }
    }

    /// A group is complete when it has no internal gap, follows directly on the last group
    /// closed, and either saw the marker bit or is directly followed by another group.
    fn is_complete(&self, group: &PacketGroup) -> bool {
        let first = group.first_seqnum();
        let last = group.last_seqnum();
        let follows_previous = self
            .last_seqnum_in_buffer
            .map_or(true, |previous| previous + 1 == first);
        let ended = group.marker_seen
            || self
                .accumulating
                .values()
                .any(|next| next.first_seqnum() == last + 1);
        !group.has_gap() && follows_previous && ended
    }

    /// Moves the oldest accumulating group into the ready queue, or discards it if something
    /// newer was already closed. Returns true if a group was closed.
    pub fn close_oldest(
        &mut self,
        verified_complete: bool,
        pool: &mut Pool<InboundPacket>,
        now: Instant,
    ) -> bool {
        let Some(oldest) = self.oldest_accumulating() else {
            return false;
        };
        let timestamp = oldest.timestamp;
        let last = oldest.last_seqnum();
        let stale = self
            .last_seqnum_in_buffer
            .is_some_and(|in_buffer| in_buffer >= last);
        let complete = !stale && (verified_complete || self.is_complete(oldest));
        let Some(mut group) = self.accumulating.remove(&timestamp) else {
            return false;
        };
        if stale {
            debug!("discarding stale group for timestamp {}", timestamp);
            group.recycle_into(pool);
            return false;
        }

        group.complete = complete;
        self.last_seqnum_in_buffer = Some(last);
        if self.ready.is_empty() {
            self.next_release = Some(now + FIRST_RELEASE_DELAY);
        }
        if let Some(replaced) = self.ready.insert(last, group) {
            error!("two groups ending in seqnum {}", last);
            replaced.recycle_into(pool);
        }
        true
    }

    /// Closes the oldest group for as long as it is provably complete. Returns how many closed.
    pub fn close_complete(&mut self, pool: &mut Pool<InboundPacket>, now: Instant) -> usize {
        let mut closed = 0;
        while self
            .oldest_accumulating()
            .is_some_and(|oldest| self.is_complete(oldest))
        {
            if !self.close_oldest(true, pool, now) {
                break;
            }
            closed += 1;
        }
        closed
    }

    /// Decides whether the oldest ready group should be played now.
    ///
    /// The wait is the timestamp distance to the last released group, stretched by 15% below
    /// the target depth and shortened by 10% above it. At or below the target the distance is
    /// capped at 1/15 s. An exhausted frame pool releases immediately.
    pub fn release(
        &mut self,
        now: Instant,
        frame_pool_exhausted: bool,
        pool: &mut Pool<InboundPacket>,
    ) -> Release {
        let depth = self.ready.len();
        if depth > MAX_READY_GROUPS {
            return self.dump(pool);
        }
        let Some(timestamp) = self.ready.values().next().map(PacketGroup::timestamp) else {
            self.next_release = None;
            return Release::Idle;
        };

        let ticks = (timestamp.wrapping_sub(self.last_released_timestamp) as i32).max(0) as u64;
        let mut gap = Duration::from_millis(ticks / VIDEO_TICKS_PER_MILLISECOND as u64);
        if depth <= self.frames_to_buffer {
            gap = gap.min(LONGEST_FRAME_INTERVAL);
        }
        let gap = match depth.cmp(&self.frames_to_buffer) {
            std::cmp::Ordering::Less => gap.mul_f64(SLOW_DOWN),
            std::cmp::Ordering::Equal => gap,
            std::cmp::Ordering::Greater => gap.mul_f64(SPEED_UP),
        };
        let due = self.last_released + gap;

        if now < due && !frame_pool_exhausted {
            self.next_release = Some(due);
            return Release::Wait(due);
        }

        let Some((_, group)) = self.ready.pop_first() else {
            return Release::Idle;
        };
        self.last_released = now;
        self.last_released_timestamp = timestamp;
        self.next_release = if self.ready.is_empty() {
            None
        } else {
            Some(now + NEXT_RELEASE_DELAY)
        };
        Release::Play(group)
    }

    fn dump(&mut self, pool: &mut Pool<InboundPacket>) -> Release {
        let first = self.ready.values().next().map(PacketGroup::first_seqnum);
        let last = self.ready.values().next_back().map(|group| {
            (group.last_seqnum(), group.timestamp)
        });
        let (Some(first), Some((last, last_timestamp))) = (first, last) else {
            return Release::Idle;
        };
        let dropped_packets = last - first + 1;
        if dropped_packets >= 1000 {
            warn!(
                "dropping a suspiciously large burst of {} packets ({}..={})",
                dropped_packets, first, last
            );
        }
        for (_, group) in std::mem::take(&mut self.ready) {
            group.recycle_into(pool);
        }
        self.next_release = None;
        Release::Dumped {
            dropped_packets,
            last_timestamp,
        }
    }

    /// Returns every held packet to the pool.
    pub fn flush(&mut self, pool: &mut Pool<InboundPacket>) {
        for (_, group) in self.accumulating.drain() {
            group.recycle_into(pool);
        }
        for (_, group) in std::mem::take(&mut self.ready) {
            group.recycle_into(pool);
        }
        self.last_seqnum_in_buffer = None;
        self.next_release = None;
    }
}
