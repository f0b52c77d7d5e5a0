//
// Copyright 2021 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::{collections::HashMap, sync::Arc};

use log::*;
use parking_lot::Mutex;

use crate::reporter::{EventCountReporter, EventReport, ValueReport, ValueReporter};

/// Contains a map to each of the registered reporters.
///
/// The mutex lock is only taken to register a new reporter and by the report generation.
/// Components keep the returned `Arc`s and update them lock-free.
#[derive(Default)]
pub struct Metrics {
    registry: Mutex<Registry>,
}

#[derive(Default)]
struct Registry {
    event_reporters: HashMap<&'static str, Arc<EventCountReporter>>,
    value_reporters: HashMap<&'static str, Arc<ValueReporter>>,
}

#[derive(Debug, Default)]
pub struct Report {
    pub events: Vec<EventReport>,
    pub values: Vec<ValueReport>,
}

impl Report {
    pub fn event_count(&self, name: &str) -> usize {
        self.events
            .iter()
            .find(|report| report.name == name)
            .map_or(0, |report| report.event_count)
    }

    pub fn value(&self, name: &str) -> Option<&ValueReport> {
        self.values.iter().find(|report| report.name == name)
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the event reporter registered under `name`, registering it on first use.
    pub fn event(&self, name: &'static str) -> Arc<EventCountReporter> {
        let mut registry = self.registry.lock();
        Arc::clone(registry.event_reporters.entry(name).or_insert_with(|| {
            trace!("registering event {}", name);
            Arc::new(EventCountReporter::new(name))
        }))
    }

    /// Returns the value reporter registered under `name`, registering it on first use.
    pub fn value(&self, name: &'static str) -> Arc<ValueReporter> {
        let mut registry = self.registry.lock();
        Arc::clone(registry.value_reporters.entry(name).or_insert_with(|| {
            trace!("registering value {}", name);
            Arc::new(ValueReporter::new(name))
        }))
    }

    /// Returns reports sorted by name and resets every reporter.
    pub fn report(&self) -> Report {
        let registry = self.registry.lock();

        let mut events = registry
            .event_reporters
            .values()
            .map(|reporter| reporter.report())
            .collect::<Vec<_>>();
        events.sort_unstable_by_key(|report| report.name);

        let mut values = registry
            .value_reporters
            .values()
            .map(|reporter| reporter.report())
            .collect::<Vec<_>>();
        values.sort_unstable_by_key(|report| report.name);

        Report { events, values }
    }
}
