//
// Copyright 2023 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Picks the encoder's capture size and frame rate for the current send rate.
//!
//! Each table lists one aspect ratio, largest first, with the lowest rate that size is good
//! for. Moving up to a size requires 25% more than that; staying at a size (or moving down to
//! one) only requires the rate itself, so small fluctuations don't flip the resolution back and
//! forth.

use log::*;
use videophone_common::DataRate;

use crate::codec::VideoCodec;

const PIXELS_PER_MACROBLOCK: u32 = 256;
const HD_720P_MACROBLOCKS: u32 = 3600;
const HYSTERESIS: f64 = 1.25;
const TARGET_FPS: u32 = 30;
const MIN_FPS: u32 = 15;
/// Below this many bits per pixel, frame rate is traded for quality at the smallest size.
const BITS_PER_PIXEL_DIVISOR: u64 = 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TableEntry {
    width: u32,
    height: u32,
    min_rate: DataRate,
}

impl TableEntry {
    const fn new(width: u32, height: u32, min_bps: u64) -> Self {
        Self {
            width,
            height,
            min_rate: DataRate::from_bps(min_bps),
        }
    }

    fn macroblocks(&self) -> u32 {
        self.width * self.height / PIXELS_PER_MACROBLOCK
    }
}

const H264_WIDE: [TableEntry; 7] = [
    TableEntry::new(1920, 1072, 1_536_000),
    TableEntry::new(1792, 1008, 1_280_000),
    TableEntry::new(1536, 864, 1_152_000),
    TableEntry::new(1280, 720, 960_000),
    TableEntry::new(1024, 576, 832_000),
    TableEntry::new(768, 432, 640_000),
    TableEntry::new(512, 288, 448_000),
];

const H265_WIDE: [TableEntry; 7] = [
    TableEntry::new(1920, 1072, 1_280_000),
    TableEntry::new(1792, 1008, 1_024_000),
    TableEntry::new(1536, 864, 896_000),
    TableEntry::new(1280, 720, 832_000),
    TableEntry::new(1024, 576, 704_000),
    TableEntry::new(768, 432, 640_000),
    TableEntry::new(512, 288, 448_000),
];

/// The smallest entry must have no minimum.
const STANDARD: [TableEntry; 2] = [
    TableEntry::new(704, 480, 652_000),
    TableEntry::new(352, 240, 0),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSize {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

/// What the peer said it can decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderLimits {
    pub max_frame_size_macroblocks: u32,
    pub max_macroblocks_per_second: u32,
}

impl DecoderLimits {
    fn allow(&self, entry: &TableEntry) -> bool {
        let macroblocks = entry.macroblocks();
        self.max_frame_size_macroblocks >= macroblocks
            && self.max_macroblocks_per_second >= macroblocks * TARGET_FPS
    }
}

/// Remembers the sizes chosen so far in the call.
#[derive(Debug, Default)]
pub struct CaptureSizeSelector {
    wide_index: Option<usize>,
    standard_index: Option<usize>,
    wide_disallowed: bool,
    /// Wide sizes taller than this are never picked.
    max_height: Option<u32>,
}

/// Index of the largest entry `rate` supports, honoring the hysteresis around `current`.
fn pick(
    table: &[TableEntry],
    current: Option<usize>,
    rate: DataRate,
    limits: DecoderLimits,
) -> Option<usize> {
    table.iter().enumerate().position(|(index, entry)| {
        if !limits.allow(entry) {
            return false;
        }
        let move_up = rate > entry.min_rate * HYSTERESIS;
        let stay_or_move_down =
            current.map_or(true, |current| current <= index) && rate >= entry.min_rate;
        move_up || stay_or_move_down
    })
}

impl CaptureSizeSelector {
    pub fn new(max_height: Option<u32>) -> Self {
        Self {
            max_height,
            ..Default::default()
        }
    }

    pub fn wide_disallowed(&self) -> bool {
        self.wide_disallowed
    }

    fn wide_table(&self, codec: VideoCodec) -> Vec<TableEntry> {
        let table = match codec {
            VideoCodec::H265 => &H265_WIDE,
            VideoCodec::H263 | VideoCodec::H264 => &H264_WIDE,
        };
        table
            .iter()
            .filter(|entry| self.max_height.map_or(true, |max| entry.height <= max))
            .copied()
            .collect()
    }

    pub fn select(
        &mut self,
        rate: DataRate,
        limits: DecoderLimits,
        codec: VideoCodec,
    ) -> CaptureSize {
        let mut chosen = None;

        if limits.max_frame_size_macroblocks >= HD_720P_MACROBLOCKS && !self.wide_disallowed {
            let table = self.wide_table(codec);
            match pick(&table, self.wide_index, rate, limits) {
                Some(index) => {
                    self.wide_index = Some(index);
                    self.standard_index = None;
                    chosen = Some((table[index], index + 1 == table.len()));
                }
                None if self.wide_index.is_some() => {
                    // Once 16:9 stops fitting, stay at 4:3 for the rest of the call.
                    debug!("16:9 capture no longer fits {}; disallowing it", rate);
                    self.wide_disallowed = true;
                }
                None => {}
            }
        }

        let (entry, smallest) = chosen.unwrap_or_else(|| {
            match pick(&STANDARD, self.standard_index, rate, limits) {
                Some(index) => {
                    self.standard_index = Some(index);
                    self.wide_index = None;
                    (STANDARD[index], index + 1 == STANDARD.len())
                }
                None => (STANDARD[STANDARD.len() - 1], true),
            }
        });

        let frame_rate = if smallest {
            reduced_frame_rate(&entry, rate, limits)
        } else {
            TARGET_FPS
        };
        let size = CaptureSize {
            width: entry.width,
            height: entry.height,
            frame_rate,
        };
        trace!(
            "max frame size {} max macroblock rate {} at {}: {}x{} @ {} fps",
            limits.max_frame_size_macroblocks,
            limits.max_macroblocks_per_second,
            rate,
            size.width,
            size.height,
            size.frame_rate
        );
        size
    }
}

/// At the smallest size of a table, frame rate is what gives way.
fn reduced_frame_rate(entry: &TableEntry, rate: DataRate, limits: DecoderLimits) -> u32 {
    let macroblocks = entry.macroblocks() as u64;
    let mut frame_rate = (limits.max_macroblocks_per_second as u64 / macroblocks)
        .clamp(MIN_FPS as u64, TARGET_FPS as u64);
    let needed = macroblocks * PIXELS_PER_MACROBLOCK as u64 * frame_rate / BITS_PER_PIXEL_DIVISOR;
    if rate.as_bps() < needed {
        let affordable =
            rate.as_bps() * BITS_PER_PIXEL_DIVISOR / macroblocks / PIXELS_PER_MACROBLOCK as u64;
        frame_rate = affordable.clamp(MIN_FPS as u64, frame_rate);
    }
    frame_rate as u32
}
