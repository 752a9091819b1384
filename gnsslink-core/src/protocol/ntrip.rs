//! NTRIP v1 wire format: requests, status lines and source tables.

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};

/// Default caster port
pub const DEFAULT_PORT: u16 = 2101;

/// Terminator of the response header section
pub const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Largest header section accepted before giving up on the caster
pub const MAX_HEADER_LEN: usize = 8 * 1024;

/// Build a caster request for `path` (a mountpoint, or empty for the source table).
pub fn format_request(
    host: &str,
    path: &str,
    user_agent: &str,
    credentials: Option<(&str, &str)>,
) -> String {
    let mut request = format!(
        "GET /{} HTTP/1.0\r\nHost: {}\r\nNtrip-Version: Ntrip/1.0\r\nUser-Agent: {}\r\n",
        path, host, user_agent
    );
    if let Some((user, password)) = credentials {
        let token = general_purpose::STANDARD.encode(format!("{}:{}", user, password));
        request.push_str(&format!("Authorization: Basic {}\r\n", token));
    }
    request.push_str("\r\n");
    request
}

/// Locate the end of the header section.
///
/// Returns the offset of the first byte after the terminator.
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|w| w == HEADER_TERMINATOR)
        .map(|pos| pos + HEADER_TERMINATOR.len())
}

/// First line of a response header
pub fn status_line(header: &[u8]) -> String {
    let text = String::from_utf8_lossy(header);
    text.lines().next().unwrap_or("").trim().to_string()
}

/// Whether a status line accepts a stream request.
///
/// Only `ICY 200` and `HTTP/1.x 200` qualify. `SOURCETABLE 200 OK` means
/// the mountpoint does not exist.
pub fn is_stream_accepted(status: &str) -> bool {
    if status.starts_with("ICY 200") {
        return true;
    }
    let mut parts = status.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(version), Some(code)) => version.starts_with("HTTP/1.") && code == "200",
        _ => false,
    }
}

/// Whether a status line precedes a source table
pub fn is_source_table_status(status: &str) -> bool {
    status.starts_with("SOURCETABLE 200") || is_stream_accepted(status)
}

/// One `STR;` record from a caster source table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountPoint {
    pub name: String,
    pub identifier: String,
    pub format: String,
    pub format_details: String,
    pub carrier: u8,
    pub nav_system: String,
    pub network: String,
    pub country: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Caster expects GGA sentences from the client
    pub nmea: bool,
    /// 0 = single base, 1 = network
    pub solution: u8,
    pub generator: String,
    pub compression: String,
    /// N (none), B (basic) or D (digest)
    pub authentication: String,
    pub fee: bool,
    pub bitrate: u32,
}

/// Parse a single `STR;` line
pub fn parse_str_line(line: &str) -> Option<MountPoint> {
    let fields: Vec<&str> = line.trim().split(';').collect();
    if fields.first() != Some(&"STR") || fields.len() < 18 {
        return None;
    }
    let text = |i: usize| fields[i].trim().to_string();
    Some(MountPoint {
        name: text(1),
        identifier: text(2),
        format: text(3),
        format_details: text(4),
        carrier: fields[5].trim().parse().unwrap_or(0),
        nav_system: text(6),
        network: text(7),
        country: text(8),
        latitude: fields[9].trim().parse().unwrap_or(0.0),
        longitude: fields[10].trim().parse().unwrap_or(0.0),
        nmea: fields[11].trim() == "1",
        solution: fields[12].trim().parse().unwrap_or(0),
        generator: text(13),
        compression: text(14),
        authentication: text(15),
        fee: fields[16].trim().eq_ignore_ascii_case("Y"),
        bitrate: fields[17].trim().parse().unwrap_or(0),
    })
}

/// Parse every `STR;` line of a source table body
pub fn parse_source_table(body: &str) -> Vec<MountPoint> {
    body.lines().filter_map(parse_str_line).collect()
}
