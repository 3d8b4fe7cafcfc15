//! Analytics events
//!
//! Every client operation produces an input event; the
//! [`processor::EventProcessor`] deduplicates contexts, aggregates
//! evaluation counts, and ships batched payloads to the events endpoint.
//! Delivery is at-most-once with bounded memory: producers never block, and
//! overload drops events rather than stalling the application.

pub mod dedup;
pub mod diagnostics;
pub mod output;
pub mod processor;
pub mod sender;
pub mod summarizer;

use std::time::Duration;

use serde_json::Value;

use crate::context::{AttributeRef, Context};
use crate::eval::Reason;

/// Current time in milliseconds since the epoch, the unit all event
/// timestamps use.
pub(crate) fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Fields shared by all input events.
#[derive(Clone, Debug)]
pub struct BaseEvent {
    pub creation_date: u64,
    pub context: Context,
}

impl BaseEvent {
    pub fn new(context: Context) -> BaseEvent {
        BaseEvent {
            creation_date: now_millis(),
            context,
        }
    }
}

/// One flag evaluation, as reported to analytics.
#[derive(Clone, Debug)]
pub struct FeatureRequestEvent {
    pub base: BaseEvent,
    pub key: String,
    /// Flag version; `None` when the flag was not found.
    pub version: Option<u64>,
    pub variation: Option<usize>,
    pub value: Value,
    pub default: Value,
    /// Present when the caller asked for reasons or tracking forced them.
    pub reason: Option<Reason>,
    /// Set on prerequisite evaluations: the key of the flag that required
    /// this one.
    pub prereq_of: Option<String>,
    /// Emit an individual event (not just the summary count).
    pub track_events: bool,
    pub debug_events_until_date: Option<u64>,
    /// 1-in-n sampling for the individual event; 0 suppresses it.
    pub sampling_ratio: u32,
    pub exclude_from_summaries: bool,
}

/// An explicit context registration.
#[derive(Clone, Debug)]
pub struct IdentifyEvent {
    pub base: BaseEvent,
}

/// An application-defined event from `track`.
#[derive(Clone, Debug)]
pub struct CustomEvent {
    pub base: BaseEvent,
    pub key: String,
    pub data: Option<Value>,
    pub metric_value: Option<f64>,
}

/// Everything producers can hand to the event processor.
#[derive(Clone, Debug)]
pub enum InputEvent {
    FeatureRequest(FeatureRequestEvent),
    Identify(IdentifyEvent),
    Custom(CustomEvent),
}

/// Event pipeline tuning. The defaults suit most services; capacity bounds
/// memory, the rest trade freshness against request volume.
#[derive(Clone, Debug)]
pub struct EventsConfig {
    /// Maximum buffered output events between flushes.
    pub capacity: usize,
    /// Maximum queued inbox messages between producer and dispatcher.
    pub inbox_capacity: usize,
    pub flush_interval: Duration,
    /// Size of the context-key deduplication window.
    pub context_keys_capacity: usize,
    /// How often the deduplication window is cleared.
    pub context_keys_flush_interval: Duration,
    pub all_attributes_private: bool,
    pub private_attributes: Vec<AttributeRef>,
    pub diagnostic_recording_interval: Duration,
    /// Number of concurrent delivery workers.
    pub sender_pool_size: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        EventsConfig {
            capacity: 10_000,
            inbox_capacity: 10_000,
            flush_interval: Duration::from_secs(5),
            context_keys_capacity: 1_000,
            context_keys_flush_interval: Duration::from_secs(300),
            all_attributes_private: false,
            private_attributes: Vec::new(),
            diagnostic_recording_interval: Duration::from_secs(900),
            sender_pool_size: 5,
        }
    }
}
