//! Client configuration
//!
//! Plain structs with useful defaults; variant choices (which data source,
//! which store, events or not) are enums. Only the SDK key is mandatory:
//!
//! ```rust
//! use flagflow::config::Config;
//! let config = Config::new("sdk-key");
//! assert!(!config.offline);
//! ```

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::bigsegments::BigSegmentsConfig;
use crate::datasource::polling::PollingConfig;
use crate::datasource::streaming::StreamingConfig;
use crate::errors::{Error, Result};
use crate::events::EventsConfig;
use crate::store::persistent::{PersistentDataStore, PersistentStoreConfig};

/// Base URIs of the three service endpoints. Override all of them together
/// when pointing at a relay proxy or a test double.
#[derive(Clone, Debug)]
pub struct ServiceEndpoints {
    pub streaming_base_uri: String,
    pub polling_base_uri: String,
    pub events_base_uri: String,
}

impl Default for ServiceEndpoints {
    fn default() -> Self {
        ServiceEndpoints {
            streaming_base_uri: "https://stream.flagflow.io".to_string(),
            polling_base_uri: "https://sdk.flagflow.io".to_string(),
            events_base_uri: "https://events.flagflow.io".to_string(),
        }
    }
}

impl ServiceEndpoints {
    /// Points every endpoint at one base URI (relay proxy setups).
    pub fn relay_proxy(uri: &str) -> ServiceEndpoints {
        ServiceEndpoints {
            streaming_base_uri: uri.to_string(),
            polling_base_uri: uri.to_string(),
            events_base_uri: uri.to_string(),
        }
    }
}

/// Builds a data source against the client's update sink. The escape hatch
/// for programmable sources (test fixtures, file-based data, relays).
pub trait DataSourceFactory: Send + Sync {
    fn create(&self, sink: Arc<crate::datasource::UpdateSink>) -> Arc<dyn crate::datasource::DataSource>;
}

/// Which synchronization mode keeps the replica current.
#[derive(Clone)]
pub enum DataSourceConfig {
    /// Server-sent events (the default).
    Streaming(StreamingConfig),
    /// Periodic full-dataset polling.
    Polling(PollingConfig),
    /// No synchronization: another process populates the (persistent)
    /// store, or the SDK runs offline.
    External,
    /// A caller-supplied source.
    Custom(Arc<dyn DataSourceFactory>),
}

impl Default for DataSourceConfig {
    fn default() -> Self {
        DataSourceConfig::Streaming(StreamingConfig::default())
    }
}

impl std::fmt::Debug for DataSourceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataSourceConfig::Streaming(c) => f.debug_tuple("Streaming").field(c).finish(),
            DataSourceConfig::Polling(c) => f.debug_tuple("Polling").field(c).finish(),
            DataSourceConfig::External => f.write_str("External"),
            DataSourceConfig::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// Where the replica lives.
#[derive(Clone)]
pub enum DataStoreConfig {
    InMemory,
    Persistent {
        backend: Arc<dyn PersistentDataStore>,
        config: PersistentStoreConfig,
    },
}

impl Default for DataStoreConfig {
    fn default() -> Self {
        DataStoreConfig::InMemory
    }
}

impl std::fmt::Debug for DataStoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataStoreConfig::InMemory => f.write_str("InMemory"),
            DataStoreConfig::Persistent { config, .. } => {
                f.debug_struct("Persistent").field("config", config).finish()
            }
        }
    }
}

/// Identifies the application for service-side tagging.
#[derive(Clone, Debug, Default)]
pub struct ApplicationInfo {
    pub application_id: Option<String>,
    pub application_version: Option<String>,
}

/// Set by wrapper SDKs built on top of this one.
#[derive(Clone, Debug)]
pub struct WrapperInfo {
    pub name: String,
    pub version: Option<String>,
}

/// HTTP transport options shared by all components.
#[derive(Clone, Debug)]
pub struct HttpConfig {
    pub connect_timeout: Duration,
    /// Per-request timeout for polling and event delivery. Never applied to
    /// the streaming connection, which is long-lived by design.
    pub response_timeout: Duration,
    pub application_info: Option<ApplicationInfo>,
    pub wrapper_info: Option<WrapperInfo>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            connect_timeout: Duration::from_secs(2),
            response_timeout: Duration::from_secs(10),
            application_info: None,
            wrapper_info: None,
        }
    }
}

impl HttpConfig {
    // Tag values share the header charset of kind names; anything else is
    // dropped rather than producing a malformed header.
    fn valid_tag(value: &str) -> bool {
        !value.is_empty()
            && value.len() <= 64
            && value
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_')
    }

    pub(crate) fn base_headers(&self, sdk_key: &str) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::AUTHORIZATION,
            HeaderValue::from_str(sdk_key)
                .map_err(|_| Error::InvalidConfig("SDK key contains invalid characters".into()))?,
        );
        headers.insert(
            reqwest::header::USER_AGENT,
            HeaderValue::from_static(concat!(
                env!("CARGO_PKG_NAME"),
                "/",
                env!("CARGO_PKG_VERSION")
            )),
        );
        if let Some(info) = &self.application_info {
            let mut tags: Vec<String> = Vec::new();
            if let Some(id) = info.application_id.as_deref().filter(|v| Self::valid_tag(v)) {
                tags.push(format!("application-id/{id}"));
            }
            if let Some(version) = info
                .application_version
                .as_deref()
                .filter(|v| Self::valid_tag(v))
            {
                tags.push(format!("application-version/{version}"));
            }
            if !tags.is_empty() {
                if let Ok(value) = HeaderValue::from_str(&tags.join(" ")) {
                    headers.insert(HeaderName::from_static("x-launchdarkly-tags"), value);
                }
            }
        }
        if let Some(wrapper) = &self.wrapper_info {
            let value = match &wrapper.version {
                Some(version) => format!("{}/{}", wrapper.name, version),
                None => wrapper.name.clone(),
            };
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.insert(HeaderName::from_static("x-launchdarkly-wrapper"), value);
            }
        }
        Ok(headers)
    }

    /// Client for the streaming connection: connect timeout only, since the
    /// response body is intentionally endless.
    pub(crate) fn build_client(&self, sdk_key: &str) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .default_headers(self.base_headers(sdk_key)?)
            .build()
            .map_err(|e| Error::Transport(e.to_string()))
    }

    /// Client for request/response traffic (polling, events), with the full
    /// response timeout applied.
    pub(crate) fn build_timed_client(&self, sdk_key: &str) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .timeout(self.response_timeout)
            .default_headers(self.base_headers(sdk_key)?)
            .build()
            .map_err(|e| Error::Transport(e.to_string()))
    }
}

/// Everything the client needs. Construct with [`Config::new`] and override
/// fields as needed.
#[derive(Clone, Debug)]
pub struct Config {
    pub sdk_key: String,
    pub service_endpoints: ServiceEndpoints,
    pub data_source: DataSourceConfig,
    pub data_store: DataStoreConfig,
    /// `None` disables analytics entirely.
    pub events: Option<EventsConfig>,
    pub big_segments: Option<BigSegmentsConfig>,
    pub http: HttpConfig,
    /// Offline mode: no network at all. Overrides the data source to
    /// external and events to none.
    pub offline: bool,
    /// How long construction blocks waiting for the first dataset. Zero
    /// returns immediately; initialization continues in the background.
    pub start_wait: Duration,
    pub diagnostic_opt_out: bool,
    /// Optional payload filter key, forwarded as a query parameter.
    pub payload_filter: Option<String>,
}

impl Config {
    pub fn new(sdk_key: impl Into<String>) -> Config {
        Config {
            sdk_key: sdk_key.into(),
            service_endpoints: ServiceEndpoints::default(),
            data_source: DataSourceConfig::default(),
            data_store: DataStoreConfig::default(),
            events: Some(EventsConfig::default()),
            big_segments: None,
            http: HttpConfig::default(),
            offline: false,
            start_wait: Duration::from_secs(5),
            diagnostic_opt_out: false,
            payload_filter: None,
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::new("key");
        assert!(matches!(config.data_source, DataSourceConfig::Streaming(_)));
        assert!(matches!(config.data_store, DataStoreConfig::InMemory));
        assert!(config.events.is_some());
        assert!(!config.offline);
    }

    #[test]
    fn test_base_headers() {
        let http = HttpConfig {
            application_info: Some(ApplicationInfo {
                application_id: Some("acct-svc".to_string()),
                application_version: Some("1.2.3".to_string()),
            }),
            wrapper_info: Some(WrapperInfo {
                name: "galaxy".to_string(),
                version: Some("9".to_string()),
            }),
            ..HttpConfig::default()
        };
        let headers = http.base_headers("my-sdk-key").unwrap();
        assert_eq!(headers["authorization"], "my-sdk-key");
        assert_eq!(
            headers["x-launchdarkly-tags"],
            "application-id/acct-svc application-version/1.2.3"
        );
        assert_eq!(headers["x-launchdarkly-wrapper"], "galaxy/9");
        assert!(headers["user-agent"]
            .to_str()
            .unwrap()
            .starts_with("flagflow/"));
    }

    #[test]
    fn test_invalid_tag_values_are_dropped() {
        let http = HttpConfig {
            application_info: Some(ApplicationInfo {
                application_id: Some("has spaces!".to_string()),
                application_version: None,
            }),
            ..HttpConfig::default()
        };
        let headers = http.base_headers("k").unwrap();
        assert!(headers.get("x-launchdarkly-tags").is_none());
    }

    #[test]
    fn test_invalid_sdk_key_is_an_error() {
        let http = HttpConfig::default();
        assert!(http.base_headers("bad\nkey").is_err());
    }
}
