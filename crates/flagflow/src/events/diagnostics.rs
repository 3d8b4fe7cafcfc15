//! SDK diagnostics
//!
//! Two kinds of diagnostic event: an init event describing the SDK build,
//! platform, and configuration, posted once at startup; and a periodic
//! stats event carrying pipeline health counters since the previous one.

use serde_json::{json, Value};

use crate::events::now_millis;

/// Accumulates diagnostic state between periodic events.
pub struct DiagnosticsManager {
    id: Value,
    data_since: u64,
    configuration: Value,
    stream_inits: Vec<Value>,
}

impl DiagnosticsManager {
    /// `configuration` is an opaque summary of the effective client
    /// configuration, assembled by the caller.
    pub fn new(sdk_key: &str, configuration: Value) -> DiagnosticsManager {
        let suffix: String = sdk_key
            .chars()
            .rev()
            .take(6)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        DiagnosticsManager {
            id: json!({
                "diagnosticId": uuid::Uuid::new_v4().to_string(),
                "sdkKeySuffix": suffix,
            }),
            data_since: now_millis(),
            configuration,
            stream_inits: Vec::new(),
        }
    }

    /// The startup event.
    pub fn init_event(&self) -> Value {
        json!({
            "kind": "diagnostic-init",
            "creationDate": self.data_since,
            "id": self.id,
            "sdk": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
            "platform": {
                "name": "rust",
                "osName": std::env::consts::OS,
                "osArch": std::env::consts::ARCH,
            },
            "configuration": self.configuration,
        })
    }

    /// Records one streaming connection attempt.
    pub fn record_stream_init(&mut self, timestamp: u64, failed: bool, duration_ms: u64) {
        self.stream_inits.push(json!({
            "timestamp": timestamp,
            "failed": failed,
            "durationMillis": duration_ms,
        }));
    }

    /// The periodic stats event; resets the accumulation window.
    pub fn periodic_event(
        &mut self,
        dropped_events: u64,
        deduplicated_contexts: u64,
        events_in_last_batch: usize,
    ) -> Value {
        let now = now_millis();
        let event = json!({
            "kind": "diagnostic",
            "creationDate": now,
            "id": self.id,
            "dataSinceDate": self.data_since,
            "droppedEvents": dropped_events,
            "deduplicatedUsers": deduplicated_contexts,
            "eventsInLastBatch": events_in_last_batch,
            "streamInits": std::mem::take(&mut self.stream_inits),
        });
        self.data_since = now;
        event
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_event_shape() {
        let m = DiagnosticsManager::new("sdk-key-123456789", json!({"customBaseURI": false}));
        let event = m.init_event();
        assert_eq!(event["kind"], json!("diagnostic-init"));
        assert_eq!(event["id"]["sdkKeySuffix"], json!("456789"));
        assert_eq!(event["sdk"]["name"], json!("flagflow"));
        assert_eq!(event["configuration"]["customBaseURI"], json!(false));
    }

    #[test]
    fn test_periodic_event_resets_window() {
        let mut m = DiagnosticsManager::new("k", json!({}));
        m.record_stream_init(100, true, 30);
        let first = m.periodic_event(5, 2, 17);
        assert_eq!(first["droppedEvents"], json!(5));
        assert_eq!(first["deduplicatedUsers"], json!(2));
        assert_eq!(first["eventsInLastBatch"], json!(17));
        assert_eq!(first["streamInits"].as_array().unwrap().len(), 1);

        let second = m.periodic_event(0, 0, 0);
        assert!(second["streamInits"].as_array().unwrap().is_empty());
        assert!(second["dataSinceDate"].as_u64() >= first["creationDate"].as_u64());
    }

    #[test]
    fn test_short_sdk_key_suffix() {
        let m = DiagnosticsManager::new("abc", json!({}));
        assert_eq!(m.init_event()["id"]["sdkKeySuffix"], json!("abc"));
    }
}
