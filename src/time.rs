//! Wall-clock timestamps for creation stamps, log entries and violation
//! records.

use chrono::Local;

/// Formats the current local time as `MM/DD/YYYY HH:MM:SSAM`.
pub fn timestamp() -> String {
    Local::now().format("%m/%d/%Y %I:%M:%S%p").to_string()
}
