//
// Copyright 2021 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Counters and value samples that are handed to each media component at construction,
//! so that two channels in one process (or two tests) never share statistics by accident.

mod registry;
mod reporter;

pub use registry::{Metrics, Report};
pub use reporter::{EventCountReporter, EventReport, ValueReporter, ValueReport};
