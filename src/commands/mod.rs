// ABOUTME: Command implementations behind the replica-router CLI
// ABOUTME: Each command prints its result as JSON on stdout

pub mod analytics;
pub mod sales;
pub mod status;

pub use analytics::{analytics, wait_visible, WaitArgs};
pub use sales::{create, delete, list, show, update, CreateArgs, ListArgs, UpdateArgs};
pub use status::{schema, status};

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;

/// Pretty-print `value` as JSON on stdout.
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("Failed to render JSON output")?;
    println!("{}", rendered);
    Ok(())
}

/// Accepts `YYYY-MM-DDTHH:MM:SS`, `YYYY-MM-DD HH:MM:SS` or a bare date
/// (midnight).
pub fn parse_timestamp(value: &str) -> Result<NaiveDateTime, String> {
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(ts);
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .ok_or_else(|| format!("invalid timestamp '{}': expected YYYY-MM-DD[THH:MM:SS]", value))
}
