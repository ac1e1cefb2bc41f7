//! Display framework for CLI output formatting.
//!
//! Provides shared primitives for colors and detail views used across CLI
//! command output. Orca's CLI surface is just `start`/`add`/`status` with no
//! list-style command, so the table/format helpers the teacher carries for
//! its larger subcommand tree are not reused here.

pub mod colors;
pub mod detail;

pub use colors::*;
pub use detail::*;

/// Render a success action result.
pub fn action_success(message: &str) -> String {
    use colored::Colorize;
    format!("{} {}", "\u{2713}".green().bold(), message)
}

/// Render a failure action result.
pub fn action_failure(message: &str) -> String {
    use colored::Colorize;
    format!("{} {}", "\u{2717}".red().bold(), message)
}
