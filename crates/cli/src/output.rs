//! Terminal output helpers for the fleet binary: colored status lines,
//! aligned stat rows, and elapsed-time formatting.

use std::time::Duration;

use anyhow::Context;
use owo_colors::{OwoColorize, Stream, Style};

pub mod symbols {
  pub const SUCCESS: &str = "✓";
  pub const ERROR: &str = "✗";
  pub const WARNING: &str = "⚠";
  pub const INFO: &str = "•";
  pub const CURRENT: &str = "*";
}

/// Age of an epoch-millisecond timestamp, rendered like `2m 5s ago`.
pub fn format_age(created_at_ms: u64, now_ms: u64) -> String {
  let secs = now_ms.saturating_sub(created_at_ms) / 1_000;
  format!("{} ago", humantime::format_duration(Duration::from_secs(secs)))
}

pub fn format_duration(duration: Duration) -> String {
  let secs = duration.as_secs();
  let millis = duration.subsec_millis();

  if secs >= 60 {
    let mins = secs / 60;
    let remaining_secs = secs % 60;
    format!("{}m {}s", mins, remaining_secs)
  } else if secs > 0 {
    format!("{}.{:02}s", secs, millis / 10)
  } else {
    format!("{}ms", millis)
  }
}

// Progress lines color only the marker; alerts color the whole line so they
// stand out in interleaved stage logs.
fn progress(symbol: &str, style: Style, message: &str) {
  println!(
    "{} {}",
    symbol.if_supports_color(Stream::Stdout, |s| s.style(style)),
    message
  );
}

fn alert(symbol: &str, style: Style, message: &str) {
  eprintln!(
    "{} {}",
    symbol.if_supports_color(Stream::Stderr, |s| s.style(style)),
    message.if_supports_color(Stream::Stderr, |s| s.style(style))
  );
}

pub fn print_success(message: &str) {
  progress(symbols::SUCCESS, Style::new().green(), message);
}

pub fn print_error(message: &str) {
  alert(symbols::ERROR, Style::new().red(), message);
}

pub fn print_warning(message: &str) {
  alert(symbols::WARNING, Style::new().yellow(), message);
}

pub fn print_info(message: &str) {
  progress(symbols::INFO, Style::new().blue(), message);
}

/// Print an indented label/value row. Labels pad to a common column so the
/// host tables in `up` and `status --verbose` line up.
pub fn print_stat(label: &str, value: &str) {
  let label = format!("{label}:");
  println!(
    "  {} {}",
    format!("{label:<14}").if_supports_color(Stream::Stdout, |s| s.dimmed()),
    value
  );
}

pub fn print_json(value: &serde_json::Value) -> anyhow::Result<()> {
  println!(
    "{}",
    serde_json::to_string_pretty(value).context("Failed to serialize to JSON")?
  );
  Ok(())
}
