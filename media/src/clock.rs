//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Timer helpers for the channel loops. Time comes from tokio so tests can pause it.

use videophone_common::{Duration, Instant};

pub fn now() -> Instant {
    tokio::time::Instant::now().into_std().into()
}

/// Sleeps until the deadline, or forever if there is none.
pub async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline.into())).await
        }
        None => std::future::pending().await,
    }
}

/// A ticking interval whose first tick is one period from now.
pub fn interval(period: Duration) -> tokio::time::Interval {
    let period: std::time::Duration = period.into();
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval
}
