//! Coding-agent subprocess adapters.

pub mod process;

pub use process::ProcessAgentSubstrate;
