//! Configuration loading: figment-layered environment variables onto
//! [`crate::domain::models::config::Config`]'s defaults, validated eagerly
//! at startup.

pub mod loader;

pub use loader::{ConfigError, ConfigLoader};
