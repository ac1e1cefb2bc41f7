//! Issue-tracker adapters.

pub mod http;

pub use http::HttpTrackerClient;
