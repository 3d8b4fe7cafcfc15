//! Evaluation summarization
//!
//! Instead of one event per evaluation, the dispatcher counts outcomes per
//! `(flag key, version, variation)` with the served value, and a single
//! summary event per flush window carries the counts.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::events::FeatureRequestEvent;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct CounterKey {
    pub version: Option<u64>,
    pub variation: Option<usize>,
}

#[derive(Clone, Debug)]
pub(crate) struct Counter {
    pub value: Value,
    pub count: u64,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct FlagSummary {
    pub default: Value,
    pub context_kinds: HashSet<String>,
    pub counters: HashMap<CounterKey, Counter>,
}

/// Accumulates evaluation outcomes between flushes.
#[derive(Clone, Debug, Default)]
pub struct EventSummarizer {
    start_date: u64,
    end_date: u64,
    flags: HashMap<String, FlagSummary>,
}

impl EventSummarizer {
    pub fn new() -> EventSummarizer {
        EventSummarizer::default()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    /// Counts one evaluation.
    pub fn summarize(&mut self, event: &FeatureRequestEvent) {
        let date = event.base.creation_date;
        if self.start_date == 0 || date < self.start_date {
            self.start_date = date;
        }
        if date > self.end_date {
            self.end_date = date;
        }

        let flag = self
            .flags
            .entry(event.key.clone())
            .or_insert_with(|| FlagSummary {
                default: event.default.clone(),
                ..FlagSummary::default()
            });
        for kind in event.base.context.kinds() {
            flag.context_kinds.insert(kind.as_str().to_string());
        }
        let key = CounterKey {
            version: event.version,
            variation: event.variation,
        };
        flag.counters
            .entry(key)
            .and_modify(|c| c.count += 1)
            .or_insert_with(|| Counter {
                value: event.value.clone(),
                count: 1,
            });
    }

    /// Removes and returns the accumulated state, leaving this empty.
    pub fn take(&mut self) -> EventSummarizer {
        std::mem::take(self)
    }

    /// Folds a previously taken snapshot back in (used when a flush finds
    /// all senders busy and has to return its payload).
    pub fn merge(&mut self, other: EventSummarizer) {
        if other.flags.is_empty() {
            return;
        }
        if self.start_date == 0 || (other.start_date != 0 && other.start_date < self.start_date) {
            self.start_date = other.start_date;
        }
        if other.end_date > self.end_date {
            self.end_date = other.end_date;
        }
        for (key, summary) in other.flags {
            match self.flags.get_mut(&key) {
                None => {
                    self.flags.insert(key, summary);
                }
                Some(existing) => {
                    existing.context_kinds.extend(summary.context_kinds);
                    for (counter_key, counter) in summary.counters {
                        existing
                            .counters
                            .entry(counter_key)
                            .and_modify(|c| c.count += counter.count)
                            .or_insert(counter);
                    }
                }
            }
        }
    }

    pub(crate) fn start_date(&self) -> u64 {
        self.start_date
    }

    pub(crate) fn end_date(&self) -> u64 {
        self.end_date
    }

    pub(crate) fn flags(&self) -> &HashMap<String, FlagSummary> {
        &self.flags
    }
}
