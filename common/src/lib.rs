//
// Copyright 2021 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

mod bits;
mod collections;
mod counters;
mod data_rate;
mod serialize;
mod time;

use std::io::Write;

pub use bits::*;
pub use collections::*;
pub use counters::*;
pub use data_rate::*;
pub use serialize::*;
pub use time::*;

/// The line format shared by every binary in the workspace: timestamp, level, module, message.
pub fn format_log_line(
    buf: &mut env_logger::fmt::Formatter,
    record: &log::Record,
) -> std::io::Result<()> {
    writeln!(
        buf,
        "{} {:<5} {}] {}",
        buf.timestamp_millis(),
        record.level(),
        record.target(),
        record.args()
    )
}
