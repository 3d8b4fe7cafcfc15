// Allow unwrap in testing utilities - test code should panic on errors
#![allow(clippy::unwrap_used)]

//! Testing utilities for FlagFlow
//!
//! - [`TestData`]: a programmable data source. Configure flags and segments
//!   with builders, attach it to a client, and update flags at runtime;
//!   every attached client sees the change immediately, no network needed.
//! - [`MockPersistentStore`]: an in-memory persistence backend with fault
//!   injection, for exercising the persistent store wrapper.
//!
//! # Example
//!
//! ```rust,no_run
//! use flagflow::{Client, Config, ContextBuilder};
//! use flagflow_testing::TestData;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let td = TestData::new();
//!     td.update(td.flag("new-checkout").variation_for_all(true));
//!
//!     let mut config = Config::new("sdk-key");
//!     config.data_source = td.data_source_config();
//!     config.events = None;
//!     let client = Client::build(config).await?;
//!
//!     let context = ContextBuilder::new("u1").build();
//!     assert!(client.bool_variation(&context, "new-checkout", false));
//!
//!     // Flip it live; the client picks it up synchronously.
//!     td.update(td.flag("new-checkout").variation_for_all(false));
//!     assert!(!client.bool_variation(&context, "new-checkout", false));
//!     Ok(())
//! }
//! ```

mod mock_store;
mod test_data;

pub use mock_store::MockPersistentStore;
pub use test_data::{FlagBuilder, SegmentBuilder, TestData};
