//
// Copyright 2021 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::{
    fmt::{self, Display, Formatter},
    ops::{Add, AddAssign, Div, Mul, Sub},
};

use crate::time::Duration;

#[derive(Copy, Clone, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
pub struct DataSize {
    bits: u64,
}

impl DataSize {
    pub const ZERO: Self = Self::from_bits(0);
    const BITS_PER_BYTE: u64 = 8;
    const BITS_PER_KILO_BIT: u64 = 1000;
    const BITS_PER_MEGA_BIT: u64 = Self::BITS_PER_KILO_BIT * Self::BITS_PER_KILO_BIT;

    pub const fn from_bits(bits: u64) -> Self {
        Self { bits }
    }

    pub const fn as_bits(&self) -> u64 {
        self.bits
    }

    pub const fn from_bytes(bytes: u64) -> Self {
        Self::from_bits(bytes * Self::BITS_PER_BYTE)
    }

    pub const fn as_bytes(&self) -> u64 {
        self.bits / Self::BITS_PER_BYTE
    }
}

impl Add<DataSize> for DataSize {
    type Output = DataSize;

    fn add(self, other: DataSize) -> DataSize {
        DataSize::from_bits(self.bits + other.bits)
    }
}

impl AddAssign<DataSize> for DataSize {
    fn add_assign(&mut self, rhs: DataSize) {
        *self = *self + rhs;
    }
}

impl Div<Duration> for DataSize {
    type Output = DataRate;

    /// A zero duration yields a zero rate rather than infinity.
    fn div(self, duration: Duration) -> DataRate {
        let secs = duration.as_secs_f64();
        if secs <= 0.0 {
            return DataRate::ZERO;
        }
        DataRate::from_bps((self.bits as f64 / secs) as u64)
    }
}

/// A bit rate, always carried as whole bits per second.
#[derive(Copy, Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct DataRate {
    bps: u64,
}

impl DataRate {
    pub const ZERO: Self = Self::from_bps(0);

    pub const fn from_bps(bps: u64) -> Self {
        Self { bps }
    }

    pub const fn from_kbps(kbps: u64) -> Self {
        Self::from_bps(kbps * DataSize::BITS_PER_KILO_BIT)
    }

    pub const fn as_bps(&self) -> u64 {
        self.bps
    }

    pub const fn as_kbps(&self) -> u64 {
        self.bps / DataSize::BITS_PER_KILO_BIT
    }

    pub fn as_bps_f64(&self) -> f64 {
        self.bps as f64
    }

    /// Truncates toward zero; negative inputs become zero.
    pub fn from_bps_f64(bps: f64) -> Self {
        Self::from_bps(bps.max(0.0) as u64)
    }

    pub fn saturating_sub(self, other: Self) -> Self {
        Self::from_bps(self.bps.saturating_sub(other.bps))
    }

    pub fn is_zero(&self) -> bool {
        self.bps == 0
    }
}

impl Display for DataRate {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let bits = self.bps;
        if bits < DataSize::BITS_PER_KILO_BIT {
            write!(f, "{} bps", bits)
        } else if bits < DataSize::BITS_PER_MEGA_BIT {
            write!(
                f,
                "{:.1} Kbps",
                (bits * 10 / DataSize::BITS_PER_KILO_BIT) as f64 / 10f64
            )
        } else {
            write!(
                f,
                "{:.1} Mbps",
                (bits * 10 / DataSize::BITS_PER_MEGA_BIT) as f64 / 10f64
            )
        }
    }
}

impl Add<DataRate> for DataRate {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self::from_bps(self.bps + other.bps)
    }
}

impl Sub<DataRate> for DataRate {
    type Output = Self;

    fn sub(self, other: Self) -> Self {
        Self::from_bps(self.bps - other.bps)
    }
}

impl Mul<f64> for DataRate {
    type Output = Self;

    fn mul(self, x: f64) -> Self {
        Self::from_bps_f64(self.bps as f64 * x)
    }
}

impl Div<DataRate> for DataRate {
    type Output = f64;

    fn div(self, other: DataRate) -> f64 {
        self.bps as f64 / other.bps as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        assert_eq!("999 bps", DataRate::from_bps(999).to_string());
        assert_eq!("512.0 Kbps", DataRate::from_kbps(512).to_string());
        assert_eq!("1.5 Mbps", DataRate::from_bps(1_536_000).to_string());
    }

    #[test]
    fn size_over_duration() {
        let size = DataSize::from_bytes(125_000);
        assert_eq!(DataRate::from_kbps(500), size / Duration::from_secs(2));
        assert_eq!(DataRate::ZERO, size / Duration::ZERO);
    }

    #[test]
    fn scaling() {
        let rate = DataRate::from_kbps(1000);
        assert_eq!(DataRate::from_kbps(800), rate * 0.8);
        assert_eq!(DataRate::ZERO, rate * -1.0);
        assert_eq!(DataRate::ZERO, DataRate::from_kbps(1).saturating_sub(rate));
        assert!((rate / DataRate::from_kbps(500) - 2.0).abs() < f64::EPSILON);
    }
}
