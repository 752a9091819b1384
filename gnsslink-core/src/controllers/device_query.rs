//! Device configuration queries.
//!
//! Issues `LOG COMCONFIG ONCE`, `LOG ICOMCONFIG ONCE` and `LOG LOGLISTA ONCE`
//! and collects the matching response lines from the shared text stream.
//!
//! # Lifecycle of one query
//!
//! 1. The command is sent; a hard timeout starts (`InFlight`).
//! 2. Every line accepted by the kind's predicate is buffered and restarts
//!    the settle timer (`Settling`).
//! 3. Settle expiry or the hard timeout parses the buffer.
//! 4. An empty result with retries left schedules a resend (`Retrying`);
//!    otherwise every waiting caller resolves and the next queued kind starts.
//!
//! Requests of a kind that is already queued or running are coalesced: no
//! second command is sent and all callers receive the same result.
//!
//! Line classification is best-effort: predicates match on token shape
//! after stripping abbreviated (`<`) and full (`#...;`) ASCII framing, so
//! an unrelated line of the same shape arriving during a query is
//! collected too.

use futures::channel::oneshot;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::error::QueryError;
use crate::io::{IoProvider, IoProviderExt};
use crate::protocol::command::format_log_once;

// =============================================================================
// Public types
// =============================================================================

/// Query kinds understood by the receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryKind {
    Comconfig,
    Icomconfig,
    Loglist,
}

impl QueryKind {
    /// Log requested with `LOG <name> ONCE`
    pub fn log_name(&self) -> &'static str {
        match self {
            QueryKind::Comconfig => "COMCONFIG",
            QueryKind::Icomconfig => "ICOMCONFIG",
            QueryKind::Loglist => "LOGLISTA",
        }
    }

    /// Tag of the full ASCII form of the response
    fn ascii_tag(&self) -> &'static str {
        match self {
            QueryKind::Comconfig => "COMCONFIGA",
            QueryKind::Icomconfig => "ICOMCONFIGA",
            QueryKind::Loglist => "LOGLISTA",
        }
    }
}

/// Observable state of the query engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Idle,
    InFlight(QueryKind),
    Settling(QueryKind),
    Retrying(QueryKind),
}

/// Timer configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryTimings {
    /// Quiet period after the last matching line
    pub settle_ms: u64,
    /// Upper bound for one attempt, from the send time
    pub hard_timeout_ms: u64,
    /// Delay before resending after an empty result
    pub retry_delay_ms: u64,
    /// How long a non-empty LOGLISTA result is served from cache
    pub loglist_cooldown_ms: u64,
}

impl Default for QueryTimings {
    fn default() -> Self {
        Self {
            settle_ms: 300,
            hard_timeout_ms: 3000,
            retry_delay_ms: 500,
            loglist_cooldown_ms: 10_000,
        }
    }
}

/// One serial or network port from COMCONFIG/ICOMCONFIG
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortConfig {
    pub name: String,
    /// Empty for ICOM ports
    pub baud: String,
    pub in_mode: String,
    pub out_mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

/// One active log from LOGLISTA
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub port: String,
    pub message: String,
    pub mode: String,
    pub period: String,
    pub extra: String,
    pub hold: String,
}

/// Parsed result of one query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryResult {
    Ports(Vec<PortConfig>),
    Logs(Vec<LogEntry>),
}

impl QueryResult {
    fn empty(kind: QueryKind) -> Self {
        match kind {
            QueryKind::Loglist => QueryResult::Logs(Vec::new()),
            _ => QueryResult::Ports(Vec::new()),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            QueryResult::Ports(p) => p.is_empty(),
            QueryResult::Logs(l) => l.is_empty(),
        }
    }

    fn into_ports(self) -> Vec<PortConfig> {
        match self {
            QueryResult::Ports(p) => p,
            QueryResult::Logs(_) => Vec::new(),
        }
    }

    fn into_logs(self) -> Vec<LogEntry> {
        match self {
            QueryResult::Logs(l) => l,
            QueryResult::Ports(_) => Vec::new(),
        }
    }
}

type Reply = Result<QueryResult, QueryError>;

/// Future resolved when a query completes
pub struct PendingQuery<T> {
    rx: oneshot::Receiver<Reply>,
    extract: fn(QueryResult) -> T,
}

impl<T> Future for PendingQuery<T> {
    type Output = Result<T, QueryError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let extract = self.extract;
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(reply)) => Poll::Ready(reply.map(extract)),
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(QueryError::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

// =============================================================================
// Line classification and parsing
// =============================================================================

static PROMPT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[[A-Z0-9_]+\]\s*").expect("valid regex"));
static CHECKSUM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\*[0-9A-Fa-f]{8}$").expect("valid regex"));
static ERROR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^<?\s*ERROR\b:?\s*(.*?)>?$").expect("valid regex"));

/// A serial/USB/BT port followed by a baud rate
static COM_LINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^|[\s,])(?:[A-Z]*COM|USB|BT)\d+[\s,]+\d{3,7}(?:[\s,]|$)").expect("valid regex")
});
/// A network port followed by its transport
static ICOM_LINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^|[\s,])ICOM\d+[\s,]+(?:TCP|UDP|DISABLED)\b").expect("valid regex")
});
/// port, message, trigger, period
static LOG_LINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^|[\s,])[A-Z]+\d*[\s,]+[A-Z0-9_]+[\s,]+ON[A-Z]+[\s,]+[\d.]+").expect("valid regex")
});
static COM_PORT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:[A-Z]*COM|USB|BT)\d+$").expect("valid regex"));
static ICOM_PORT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^ICOM\d+$").expect("valid regex"));

/// Strip prompt, ASCII framing and checksum.
///
/// Returns `None` for lines that can never be part of a `kind` response:
/// NMEA sentences, other `#` logs and the abbreviated header line.
fn strip_line(kind: QueryKind, line: &str) -> Option<String> {
    let line = PROMPT_RE.replace(line.trim(), "");
    let line = CHECKSUM_RE.replace(line.trim(), "");
    let line = line.trim();

    if line.starts_with('$') {
        return None;
    }
    if let Some(full) = line.strip_prefix('#') {
        let (header, body) = full.split_once(';')?;
        let tag = header.split(',').next().unwrap_or("");
        if !tag.eq_ignore_ascii_case(kind.ascii_tag()) {
            return None;
        }
        return Some(body.trim().to_string());
    }
    let body = line.strip_prefix('<').unwrap_or(line).trim();
    if body.to_ascii_uppercase().starts_with(kind.log_name()) {
        // Abbreviated header: "<COMCONFIG COM1 0 72.0 FINESTEERING ..."
        return None;
    }
    Some(body.to_string())
}

/// Whether a line belongs to the response of `kind`
fn classify(kind: QueryKind, line: &str) -> Option<String> {
    let body = strip_line(kind, line)?;
    let upper = body.to_ascii_uppercase();
    let matched = match kind {
        QueryKind::Comconfig => COM_LINE_RE.is_match(&upper),
        QueryKind::Icomconfig => ICOM_LINE_RE.is_match(&upper),
        QueryKind::Loglist => LOG_LINE_RE.is_match(&upper),
    };
    matched.then_some(body)
}

/// Error text of a `<ERROR:...>` / `ERROR:` line
fn device_error(line: &str) -> Option<String> {
    let line = PROMPT_RE.replace(line.trim(), "");
    ERROR_RE
        .captures(line.trim())
        .map(|c| c.get(1).map_or("", |m| m.as_str()).trim().to_string())
}

/// Tokens of every buffered line, without leading count tokens
fn tokens(lines: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    for line in lines {
        let mut parts: Vec<String> = line
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|t| !t.is_empty())
            .map(|t| t.trim_matches('"').to_string())
            .collect();
        if parts.first().map_or(false, |t| t.chars().all(|c| c.is_ascii_digit())) {
            parts.remove(0);
        }
        out.extend(parts);
    }
    out
}

fn apply_mode_prefixes(port: &mut PortConfig, group: &[String]) -> bool {
    let mut found = false;
    for token in group {
        let upper = token.to_ascii_uppercase();
        if let Some(mode) = upper.strip_prefix("IN:") {
            port.in_mode = mode.to_string();
            found = true;
        } else if let Some(mode) = upper.strip_prefix("OUT:") {
            port.out_mode = mode.to_string();
            found = true;
        }
    }
    found
}

/// Split tokens into groups, each starting at a token accepted by `is_start`
fn group_tokens<F>(tokens: &[String], is_start: F) -> Vec<&[String]>
where
    F: Fn(&[String], usize) -> bool,
{
    let starts: Vec<usize> = (0..tokens.len()).filter(|&i| is_start(tokens, i)).collect();
    starts
        .iter()
        .enumerate()
        .map(|(n, &start)| {
            let end = starts.get(n + 1).copied().unwrap_or(tokens.len());
            &tokens[start..end]
        })
        .collect()
}

/// Parse a COM port line such as `COM1 115200 N 8 1 N CTS ON IN:AUTO OUT:BYNAV`
pub fn parse_com_ports(lines: &[String]) -> Vec<PortConfig> {
    let tokens = tokens(lines);
    group_tokens(&tokens, |t, i| {
        COM_PORT_RE.is_match(&t[i].to_ascii_uppercase())
            && t.get(i + 1).map_or(false, |b| b.len() >= 3 && b.chars().all(|c| c.is_ascii_digit()))
    })
    .into_iter()
    .map(|group| {
        let mut port = PortConfig {
            name: group[0].clone(),
            baud: group[1].clone(),
            ..Default::default()
        };
        if !apply_mode_prefixes(&mut port, group) {
            // Positional form: name baud parity data stop handshake echo break in out
            port.in_mode = group.get(8).cloned().unwrap_or_default();
            port.out_mode = group.get(9).cloned().unwrap_or_default();
        }
        port
    })
    .collect()
}

/// Parse an ICOM line such as `ICOM1 TCP :2000 IN:AUTO OUT:NOVATEL`
pub fn parse_icom_ports(lines: &[String]) -> Vec<PortConfig> {
    let tokens = tokens(lines);
    group_tokens(&tokens, |t, i| ICOM_PORT_RE.is_match(&t[i].to_ascii_uppercase()))
        .into_iter()
        .map(|group| {
            let mut port = PortConfig {
                name: group[0].clone(),
                protocol: group.get(1).cloned(),
                endpoint: group
                    .get(2)
                    .filter(|t| t.contains(':') && !t.contains("IN:") && !t.contains("OUT:"))
                    .cloned(),
                ..Default::default()
            };
            apply_mode_prefixes(&mut port, group);
            port
        })
        .collect()
}

/// Parse LOGLISTA as repeating groups of port, message, mode, period, extra, hold
pub fn parse_log_list(lines: &[String]) -> Vec<LogEntry> {
    tokens(lines)
        .chunks_exact(6)
        .filter(|g| g[2].to_ascii_uppercase().starts_with("ON"))
        .map(|g| LogEntry {
            port: g[0].clone(),
            message: g[1].clone(),
            mode: g[2].clone(),
            period: g[3].clone(),
            extra: g[4].clone(),
            hold: g[5].clone(),
        })
        .collect()
}

fn parse_result(kind: QueryKind, lines: &[String]) -> QueryResult {
    match kind {
        QueryKind::Comconfig => QueryResult::Ports(parse_com_ports(lines)),
        QueryKind::Icomconfig => QueryResult::Ports(parse_icom_ports(lines)),
        QueryKind::Loglist => QueryResult::Logs(parse_log_list(lines)),
    }
}

// =============================================================================
// State machine
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    InFlight,
    Settling,
    Retrying,
}

#[derive(Debug)]
struct ActiveQuery {
    kind: QueryKind,
    phase: Phase,
    lines: Vec<String>,
    retries: u32,
    device_error: Option<String>,
    settle_deadline: Option<u64>,
    hard_deadline: Option<u64>,
    retry_deadline: Option<u64>,
}

/// Queued request/response engine for device configuration queries
pub struct DeviceQuery {
    timings: QueryTimings,
    waiters: HashMap<QueryKind, Vec<oneshot::Sender<Reply>>>,
    queue: VecDeque<QueryKind>,
    active: Option<ActiveQuery>,
    loglist_cache: Option<(Vec<LogEntry>, u64)>,
}

impl Default for DeviceQuery {
    fn default() -> Self {
        Self::new(QueryTimings::default())
    }
}

impl DeviceQuery {
    /// Resends after an empty result
    pub const MAX_RETRIES: u32 = 2;

    pub fn new(timings: QueryTimings) -> Self {
        Self {
            timings,
            waiters: HashMap::new(),
            queue: VecDeque::new(),
            active: None,
            loglist_cache: None,
        }
    }

    pub fn state(&self) -> QueryState {
        match &self.active {
            None => QueryState::Idle,
            Some(a) => match a.phase {
                Phase::InFlight => QueryState::InFlight(a.kind),
                Phase::Settling => QueryState::Settling(a.kind),
                Phase::Retrying => QueryState::Retrying(a.kind),
            },
        }
    }

    pub fn request_comconfig<I: IoProvider>(&mut self, io: &mut I) -> PendingQuery<Vec<PortConfig>> {
        PendingQuery {
            rx: self.request(io, QueryKind::Comconfig),
            extract: QueryResult::into_ports,
        }
    }

    pub fn request_icomconfig<I: IoProvider>(
        &mut self,
        io: &mut I,
    ) -> PendingQuery<Vec<PortConfig>> {
        PendingQuery {
            rx: self.request(io, QueryKind::Icomconfig),
            extract: QueryResult::into_ports,
        }
    }

    pub fn request_loglist<I: IoProvider>(&mut self, io: &mut I) -> PendingQuery<Vec<LogEntry>> {
        PendingQuery {
            rx: self.request(io, QueryKind::Loglist),
            extract: QueryResult::into_logs,
        }
    }

    fn request<I: IoProvider>(&mut self, io: &mut I, kind: QueryKind) -> oneshot::Receiver<Reply> {
        let (tx, rx) = oneshot::channel();

        if kind == QueryKind::Loglist {
            if let Some((logs, expires)) = &self.loglist_cache {
                if !logs.is_empty() && io.current_time_ms() < *expires {
                    io.debug("[query] LOGLISTA served from cache");
                    let _ = tx.send(Ok(QueryResult::Logs(logs.clone())));
                    return rx;
                }
            }
        }

        let running = self.active.as_ref().map(|a| a.kind) == Some(kind);
        let queued = self.queue.contains(&kind);
        self.waiters.entry(kind).or_default().push(tx);
        if running || queued {
            io.debug(&format!("[query] {} coalesced", kind.log_name()));
            return rx;
        }

        self.queue.push_back(kind);
        self.start_next(io);
        rx
    }

    /// Start the next queued query if nothing is running
    fn start_next<I: IoProvider>(&mut self, io: &mut I) {
        while self.active.is_none() {
            let Some(kind) = self.queue.pop_front() else {
                return;
            };
            let mut query = ActiveQuery {
                kind,
                phase: Phase::InFlight,
                lines: Vec::new(),
                retries: 0,
                device_error: None,
                settle_deadline: None,
                hard_deadline: None,
                retry_deadline: None,
            };
            match Self::send(io, &mut query, self.timings) {
                Ok(()) => self.active = Some(query),
                Err(e) => self.resolve(kind, Err(e)),
            }
        }
    }

    fn send<I: IoProvider>(
        io: &mut I,
        query: &mut ActiveQuery,
        timings: QueryTimings,
    ) -> Result<(), QueryError> {
        let command = format_log_once(query.kind.log_name());
        io.debug(&format!("[query] Sending: {}", command));
        io.device_send_line(&command)
            .map_err(|e| QueryError::Io(e.to_string()))?;
        let now = io.current_time_ms();
        query.phase = Phase::InFlight;
        query.lines.clear();
        query.settle_deadline = None;
        query.retry_deadline = None;
        query.hard_deadline = Some(now + timings.hard_timeout_ms);
        Ok(())
    }

    /// Feed one text line from the device stream
    pub fn on_line<I: IoProvider>(&mut self, io: &mut I, line: &str) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if active.phase == Phase::Retrying {
            return;
        }
        if let Some(message) = device_error(line) {
            io.info(&format!(
                "[query] {} rejected: {}",
                active.kind.log_name(),
                message
            ));
            active.device_error = Some(message);
            self.finish_attempt(io);
            return;
        }
        if let Some(body) = classify(active.kind, line) {
            active.lines.push(body);
            active.phase = Phase::Settling;
            active.settle_deadline = Some(io.current_time_ms() + self.timings.settle_ms);
        }
    }

    /// Advance timers
    pub fn poll<I: IoProvider>(&mut self, io: &mut I) {
        let now = io.current_time_ms();
        let Some(active) = self.active.as_mut() else {
            return;
        };
        match active.phase {
            Phase::Retrying => {
                if active.retry_deadline.map_or(false, |d| now >= d) {
                    io.debug(&format!(
                        "[query] Retry {} of {} for {}",
                        active.retries,
                        Self::MAX_RETRIES,
                        active.kind.log_name()
                    ));
                    if let Err(e) = Self::send(io, active, self.timings) {
                        let kind = active.kind;
                        self.active = None;
                        self.resolve(kind, Err(e));
                        self.start_next(io);
                    }
                }
            }
            Phase::InFlight | Phase::Settling => {
                let settled = active.settle_deadline.map_or(false, |d| now >= d);
                let expired = active.hard_deadline.map_or(false, |d| now >= d);
                if expired && !settled {
                    io.debug(&format!(
                        "[query] {} hard timeout with {} lines",
                        active.kind.log_name(),
                        active.lines.len()
                    ));
                }
                if settled || expired {
                    self.finish_attempt(io);
                }
            }
        }
    }

    /// Parse the collected lines and either retry or resolve
    fn finish_attempt<I: IoProvider>(&mut self, io: &mut I) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        active.settle_deadline = None;
        active.hard_deadline = None;

        if let Some(message) = active.device_error.take() {
            self.resolve(active.kind, Err(QueryError::Device(message)));
            self.start_next(io);
            return;
        }

        let result = parse_result(active.kind, &active.lines);
        if result.is_empty() && active.retries < Self::MAX_RETRIES {
            active.retries += 1;
            active.phase = Phase::Retrying;
            active.retry_deadline = Some(io.current_time_ms() + self.timings.retry_delay_ms);
            self.active = Some(active);
            return;
        }

        if let QueryResult::Logs(logs) = &result {
            if !logs.is_empty() {
                let expires = io.current_time_ms() + self.timings.loglist_cooldown_ms;
                self.loglist_cache = Some((logs.clone(), expires));
            }
        }
        io.debug(&format!(
            "[query] {} complete ({} lines)",
            active.kind.log_name(),
            active.lines.len()
        ));
        self.resolve(active.kind, Ok(result));
        self.start_next(io);
    }

    fn resolve(&mut self, kind: QueryKind, reply: Reply) {
        for tx in self.waiters.remove(&kind).unwrap_or_default() {
            let _ = tx.send(reply.clone());
        }
    }

    /// Drop the cached LOGLISTA result (after LOG/UNLOG changes)
    pub fn invalidate_loglist(&mut self) {
        self.loglist_cache = None;
    }

    /// Cancel everything; pending callers resolve with [`QueryError::Cancelled`]
    pub fn shutdown<I: IoProvider>(&mut self, io: &I) {
        io.debug("[query] Shutting down");
        self.active = None;
        self.queue.clear();
        for (_, senders) in self.waiters.drain() {
            for tx in senders {
                let _ = tx.send(Err(QueryError::Cancelled));
            }
        }
    }
}
