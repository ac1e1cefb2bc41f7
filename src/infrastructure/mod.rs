//! Infrastructure layer: process-wide concerns that sit outside the
//! hexagon's ports (config loading, logging/tracing setup). Database
//! connectivity lives under `adapters::sqlite` alongside the `Store`
//! implementation it backs.

pub mod config;
pub mod logging;
