//! Event delivery
//!
//! Sender workers take one formatted payload at a time and POST it to the
//! events endpoint. Transient failures get exactly one retry after a short
//! delay; a non-retryable response tells the dispatcher to stop sending for
//! the rest of the process lifetime.

use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, warn};

use crate::datasource::is_http_error_recoverable;

const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Which endpoint a payload goes to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventPayloadKind {
    Analytics,
    Diagnostic,
}

/// Outcome of one delivery attempt (including its retry).
#[derive(Clone, Debug, Default)]
pub struct EventSenderResult {
    pub success: bool,
    /// The service's clock, from the response `Date` header; used to close
    /// debug-event windows against server time.
    pub time_from_server: Option<u64>,
    /// The service refused the payload in a way that will not change;
    /// sending must stop.
    pub must_shutdown: bool,
}

pub struct EventSender {
    http: reqwest::Client,
    bulk_uri: String,
    diagnostic_uri: String,
}

impl EventSender {
    pub fn new(http: reqwest::Client, events_base_uri: &str) -> EventSender {
        let base = events_base_uri.trim_end_matches('/');
        EventSender {
            http,
            bulk_uri: format!("{base}/bulk"),
            diagnostic_uri: format!("{base}/diagnostic"),
        }
    }

    pub async fn send_event_data(
        &self,
        kind: EventPayloadKind,
        payload: &Value,
    ) -> EventSenderResult {
        let uri = match kind {
            EventPayloadKind::Analytics => &self.bulk_uri,
            EventPayloadKind::Diagnostic => &self.diagnostic_uri,
        };
        // The payload id survives the retry so the service can deduplicate.
        let payload_id = uuid::Uuid::new_v4().to_string();

        for attempt in 0..2 {
            if attempt > 0 {
                tokio::time::sleep(RETRY_DELAY).await;
                debug!("retrying event delivery");
            }
            let mut request = self.http.post(uri).json(payload);
            if kind == EventPayloadKind::Analytics {
                request = request
                    .header("X-LaunchDarkly-Event-Schema", "4")
                    .header("X-LaunchDarkly-Payload-ID", &payload_id);
            }
            let response = match request.send().await {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "event delivery failed");
                    continue;
                }
            };
            let status = response.status().as_u16();
            if response.status().is_success() {
                return EventSenderResult {
                    success: true,
                    time_from_server: server_time_millis(&response),
                    must_shutdown: false,
                };
            }
            if is_http_error_recoverable(status) {
                warn!(status, "event delivery rejected; will retry once");
                continue;
            }
            error!(
                status,
                "event delivery rejected permanently; no further events will be sent"
            );
            return EventSenderResult {
                success: false,
                time_from_server: server_time_millis(&response),
                must_shutdown: true,
            };
        }
        EventSenderResult::default()
    }
}

fn server_time_millis(response: &reqwest::Response) -> Option<u64> {
    let date = response.headers().get(reqwest::header::DATE)?.to_str().ok()?;
    let parsed = chrono::DateTime::parse_from_rfc2822(date).ok()?;
    u64::try_from(parsed.timestamp_millis()).ok()
}
