//! Status color mapping for CLI output.
//!
//! All coloring respects `NO_COLOR` env var automatically via the `colored` crate.

use colored::Colorize;

/// Returns a colored string for a task phase or invocation status value.
///
/// Color scheme:
/// - Green:  done, completed
/// - Yellow: running, dispatched, deploying
/// - Blue:   ready, backlog
/// - Cyan:   in_review, awaiting_ci
/// - Red:    failed, timed_out
/// - Dim:    changes_requested
/// - White:  unknown/default
pub fn colorize_status(status: &str) -> colored::ColoredString {
    match status.to_lowercase().as_str() {
        "done" | "completed" => status.green().bold(),
        "running" | "dispatched" | "deploying" => status.yellow(),
        "ready" | "backlog" => status.blue(),
        "in_review" | "awaiting_ci" => status.cyan(),
        "failed" | "timed_out" => status.red().bold(),
        "changes_requested" => status.dimmed(),
        _ => status.white(),
    }
}

/// Styled label for detail views (bold + dimmed colon).
pub fn label(name: &str) -> String {
    format!("{}{}", name.bold(), ":".dimmed())
}

/// Section header with underline.
pub fn section_header(title: &str) -> String {
    format!("\n{}", title.bold().underline())
}
