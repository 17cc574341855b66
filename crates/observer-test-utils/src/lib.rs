//! # Observer Test Utilities
//!
//! Shared test utilities for the observer service.
//!
//! This crate provides:
//! - Server test harness (`TestObserverServer` for E2E tests)
//! - Scrape helpers re-exported from `observer_service::observability::testing`
//!
//! ## Usage
//!
//! ```rust,ignore
//! use observer_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() -> Result<(), anyhow::Error> {
//!     let server = TestObserverServer::spawn().await?;
//!
//!     let response = reqwest::get(format!("{}/health", server.url())).await?;
//!
//!     assert_eq!(response.status(), 200);
//!     Ok(())
//! }
//! ```

pub mod server_harness;

// Re-export commonly used items
pub use observer_service::observability::testing::{count_series, sample_value};
pub use server_harness::*;
