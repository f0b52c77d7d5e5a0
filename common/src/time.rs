//
// Copyright 2021 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::{
    fmt::Debug,
    iter::Sum,
    ops::{Add, AddAssign, Div, Mul, Sub},
};

/// A wrapper around [`std::time::Instant`] without the panicking `duration_since` operations.
///
/// Instead of subtraction, use `checked_duration_since` or `saturating_duration_since`.
/// Timer deadlines computed by the media channels are always `Instant`s, so the arithmetic
/// that can go negative (how long until a frame is due) never panics.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Instant(std::time::Instant);

impl Instant {
    pub fn checked_duration_since(&self, earlier: Instant) -> Option<Duration> {
        self.0.checked_duration_since(earlier.0).map(Duration)
    }

    pub fn saturating_duration_since(&self, earlier: Instant) -> Duration {
        Duration(self.0.saturating_duration_since(earlier.0))
    }

    pub fn now() -> Instant {
        Instant(std::time::Instant::now())
    }
}

impl From<std::time::Instant> for Instant {
    fn from(instant: std::time::Instant) -> Self {
        Self(instant)
    }
}

impl From<Instant> for std::time::Instant {
    fn from(instant: Instant) -> Self {
        instant.0
    }
}

impl Debug for Instant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, rhs: Duration) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl AddAssign<Duration> for Instant {
    fn add_assign(&mut self, rhs: Duration) {
        self.0 += rhs.0
    }
}

impl Sub<Duration> for Instant {
    type Output = Instant;

    fn sub(self, rhs: Duration) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

/// A wrapper around [`std::time::Duration`] that does not expose panicking difference operations.
///
/// Instead of subtraction, use `checked_sub` or `saturating_sub`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Duration(std::time::Duration);

impl Duration {
    pub const ZERO: Duration = Duration::from_secs(0);
    pub const MILLISECOND: Duration = Duration::from_millis(1);
    pub const SECOND: Duration = Duration::from_secs(1);

    pub const fn from_secs(secs: u64) -> Duration {
        Duration(std::time::Duration::from_secs(secs))
    }

    pub fn as_secs(&self) -> u64 {
        self.0.as_secs()
    }

    pub fn from_secs_f64(secs: f64) -> Duration {
        Duration(std::time::Duration::from_secs_f64(secs.max(0.0)))
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.0.as_secs_f64()
    }

    pub const fn from_millis(millis: u64) -> Duration {
        Duration(std::time::Duration::from_millis(millis))
    }

    pub const fn as_millis(&self) -> u128 {
        self.0.as_millis()
    }

    pub fn mul_f64(&self, rhs: f64) -> Duration {
        self.0.mul_f64(rhs.max(0.0)).into()
    }

    pub fn checked_sub(&self, rhs: Duration) -> Option<Duration> {
        self.0.checked_sub(rhs.0).map(Duration)
    }

    pub fn saturating_sub(&self, rhs: Duration) -> Duration {
        self.checked_sub(rhs).unwrap_or_default()
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl From<std::time::Duration> for Duration {
    fn from(duration: std::time::Duration) -> Self {
        Self(duration)
    }
}

impl From<Duration> for std::time::Duration {
    fn from(duration: Duration) -> Self {
        duration.0
    }
}

impl Debug for Duration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl Add<Duration> for Duration {
    type Output = Duration;

    fn add(self, rhs: Duration) -> Self::Output {
        Duration(self.0 + rhs.0)
    }
}

impl AddAssign<Duration> for Duration {
    fn add_assign(&mut self, rhs: Duration) {
        self.0 += rhs.0
    }
}

impl Mul<u32> for Duration {
    type Output = Duration;

    fn mul(self, rhs: u32) -> Self::Output {
        Duration(self.0 * rhs)
    }
}

impl Div<u32> for Duration {
    type Output = Duration;

    fn div(self, rhs: u32) -> Self::Output {
        Duration(self.0 / rhs)
    }
}

impl Sum for Duration {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        Duration(iter.map(|x| x.0).sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_unwrap() {
        let now = std::time::Instant::now();
        assert_eq!(now, Instant::from(now).into());

        let duration = std::time::Duration::new(5, 10);
        assert_eq!(duration, Duration::from(duration).into());
    }

    #[test]
    fn duration_arithmetic() {
        let short = Duration::from_millis(2);
        let long = Duration::from_secs(5);
        let sum = Duration::from_millis(5002);

        assert_eq!(sum, short + long);
        assert_eq!(Some(long), sum.checked_sub(short));
        assert_eq!(None, short.checked_sub(sum));
        assert_eq!(Duration::ZERO, short.saturating_sub(sum));
        assert_eq!(sum, vec![short, long].into_iter().sum());
        assert_eq!(long, short * 2500);
        assert_eq!(short, long / 2500);
        assert_eq!(Duration::from_millis(3), short.mul_f64(1.5));
    }

    #[test]
    fn negative_scaling_saturates() {
        assert_eq!(Duration::ZERO, Duration::from_secs(1).mul_f64(-2.0));
        assert_eq!(Duration::ZERO, Duration::from_secs_f64(-0.5));
    }

    #[test]
    fn instant_arithmetic() {
        let now = Instant::now();
        let duration = Duration::from_millis(2);
        let soon = now + duration;

        assert_eq!(now, soon - duration);
        assert_eq!(Some(duration), soon.checked_duration_since(now));
        assert_eq!(None, now.checked_duration_since(soon));
        assert_eq!(Duration::ZERO, now.saturating_duration_since(soon));

        let mut manual_sum = now;
        manual_sum += duration;
        assert_eq!(soon, manual_sum);
    }
}
