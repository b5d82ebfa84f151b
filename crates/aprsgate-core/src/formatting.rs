//! Formatting utilities for Telegram HTML replies.

use chrono::{DateTime, Utc};

/// Escape HTML special characters for Telegram HTML parse mode.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// `dd/mm/YYYY HH:MM:SS` in UTC, as shown to users.
pub fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.format("%d/%m/%Y %H:%M:%S").to_string()
}

pub fn format_duration(seconds: i64) -> String {
    let seconds = seconds.max(0);
    let hours = seconds / 3600;
    let mins = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if hours > 0 {
        return format!("{hours}h {mins}m {secs}s");
    }
    if mins > 0 {
        return format!("{mins}m {secs}s");
    }
    format!("{secs}s")
}

/// aprs.fi map link showing the last hour of a station's track.
pub fn aprs_fi_link(source: &str) -> String {
    format!("https://aprs.fi/#!call=a%2F{source}&timerange=3600&tail=3600")
}
