//! Device command formatting.
//!
//! Commands are returned without the line terminator; senders append CRLF
//! via [`IoProviderExt::device_send_line`](crate::io::IoProviderExt::device_send_line).

/// Request a single output of a log: `LOG <name> ONCE`
pub fn format_log_once(log: &str) -> String {
    format!("LOG {} ONCE", log)
}

/// Schedule a periodic log: `LOG <name> ONTIME <period>`
pub fn format_log_ontime(log: &str, period_s: f64) -> String {
    format!("LOG {} ONTIME {}", log, format_period(period_s))
}

/// Stop a log: `UNLOG <name>`
pub fn format_unlog(log: &str) -> String {
    format!("UNLOG {}", log)
}

/// Render a period without trailing zeros ("1", "0.05")
fn format_period(period_s: f64) -> String {
    let text = format!("{:.3}", period_s);
    let text = text.trim_end_matches('0').trim_end_matches('.');
    if text.is_empty() {
        "0".to_string()
    } else {
        text.to_string()
    }
}
