//! NTRIP v1 correction client
//!
//! Platform-independent caster client using the [`IoProvider`] trait.
//!
//! # Connection sequence
//!
//! 1. Open a TCP connection to the caster (`Connecting`)
//! 2. Send `GET /<mountpoint>` and buffer the reply up to `\r\n\r\n` (`Handshaking`)
//! 3. `ICY 200` / `HTTP/1.x 200` starts the stream (`Streaming`); any other
//!    status is terminal
//!
//! While streaming every inbound chunk is written unchanged to the receiver
//! with [`IoProvider::device_send`] and scanned for RTCM frames to keep
//! statistics. Bytes the receiver link does not take wait in a bounded
//! backlog and are written, in order, before any newer data. The last GGA sentence is sent back to the caster every second.
//! A dropped connection is retried after [`NtripClient::RECONNECT_DELAY_MS`]
//! while auto-reconnect is on.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut client = NtripClient::new();
//! let connected = client.connect(io, config);
//! loop {
//!     for event in client.poll(io) {
//!         // NtripEvent::Connected, NtripEvent::Stats(..), ...
//!     }
//! }
//! ```

use bytes::{Buf, BytesMut};
use futures::channel::oneshot;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::error::NtripError;
use crate::io::{IoProvider, IoProviderExt, TcpRead, TcpSocketHandle};
use crate::protocol::ntrip::{
    find_header_end, format_request, is_source_table_status, is_stream_accepted,
    parse_source_table, status_line, MountPoint, DEFAULT_PORT, MAX_HEADER_LEN,
};
use crate::protocol::rtcm::{scan_frame, ScanResult, PREAMBLE};

/// Client state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NtripState {
    /// Idle; no socket
    Disconnected,
    /// TCP connection opening
    Connecting,
    /// Request sent, waiting for the status line
    Handshaking,
    /// Corrections flowing
    Streaming,
    /// Waiting for the reconnect timer
    Reconnecting,
}

/// Caster connection parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NtripConfig {
    pub host: String,
    pub port: u16,
    pub mountpoint: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub user_agent: String,
    /// Feed GGA sentences seen on the device stream to the caster
    pub auto_gga: bool,
    /// Reconnect after the connection drops
    pub auto_reconnect: bool,
}

impl NtripConfig {
    pub fn new(host: impl Into<String>, mountpoint: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            mountpoint: mountpoint.into(),
            username: None,
            password: None,
            user_agent: format!("NTRIP gnsslink/{}", env!("CARGO_PKG_VERSION")),
            auto_gga: false,
            auto_reconnect: true,
        }
    }

    fn credentials(&self) -> Option<(&str, &str)> {
        self.username
            .as_deref()
            .map(|user| (user, self.password.as_deref().unwrap_or("")))
    }

    fn request(&self, path: &str) -> String {
        format_request(&self.host, path, &self.user_agent, self.credentials())
    }
}

/// Session statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NtripStats {
    pub state: NtripState,
    /// Time since the stream was accepted
    pub duration_ms: u64,
    pub bytes_received: u64,
    /// Corrections discarded because the device backlog was full
    pub bytes_dropped: u64,
    /// Corrections waiting for the receiver link
    pub backlog_bytes: usize,
    pub message_count: u64,
    pub crc_failures: u64,
    /// Bytes per second over the last stats interval
    pub data_rate: f64,
    pub message_types: BTreeMap<u16, u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_gga: Option<String>,
}

/// Events emitted by [`NtripClient::poll`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum NtripEvent {
    /// The caster accepted the stream
    Connected { mountpoint: String },
    /// The session ended and no reconnect is scheduled
    Disconnected,
    /// A reconnect attempt is scheduled
    Reconnecting { delay_ms: u64 },
    /// A failure; `transient` errors are followed by a reconnect
    Error { message: String, transient: bool },
    /// Periodic statistics
    Stats(NtripStats),
}

/// Future resolved by the client from a later [`NtripClient::poll`]
pub struct NtripFuture<T> {
    rx: oneshot::Receiver<Result<T, NtripError>>,
}

impl<T> NtripFuture<T> {
    fn ready(result: Result<T, NtripError>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }
}

impl<T> Future for NtripFuture<T> {
    type Output = Result<T, NtripError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(NtripError::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Resolves when the caster accepts or rejects the stream
pub type PendingConnect = NtripFuture<()>;
/// Resolves with the parsed caster source table
pub type PendingSourceTable = NtripFuture<Vec<MountPoint>>;

/// Counters of one streaming session
#[derive(Debug, Default)]
struct Session {
    connected_at: Option<u64>,
    bytes_received: u64,
    bytes_dropped: u64,
    message_count: u64,
    crc_failures: u64,
    message_types: BTreeMap<u16, u64>,
    rate_mark_at: u64,
    rate_mark_bytes: u64,
    data_rate: f64,
}

/// One-shot source table download on its own socket
struct SourceTableFetch {
    socket: TcpSocketHandle,
    request: String,
    request_sent: bool,
    body: Vec<u8>,
    deadline: u64,
    tx: oneshot::Sender<Result<Vec<MountPoint>, NtripError>>,
}

/// NTRIP caster client
pub struct NtripClient {
    state: NtripState,
    config: Option<NtripConfig>,
    socket: Option<TcpSocketHandle>,
    auto_reconnect: bool,
    /// Response header bytes collected while handshaking
    header: BytesMut,
    /// Incomplete RTCM frame carried between chunks (statistics only)
    carry: BytesMut,
    /// Corrections not yet accepted by the receiver link
    backlog: BytesMut,
    session: Session,
    gga: Option<String>,
    pending_connect: Option<oneshot::Sender<Result<(), NtripError>>>,
    handshake_deadline: Option<u64>,
    gga_deadline: Option<u64>,
    stats_deadline: Option<u64>,
    reconnect_deadline: Option<u64>,
    source_table: Option<SourceTableFetch>,
    events: Vec<NtripEvent>,
}

impl Default for NtripClient {
    fn default() -> Self {
        Self::new()
    }
}

impl NtripClient {
    pub const HANDSHAKE_TIMEOUT_MS: u64 = 10_000;
    pub const SOURCE_TABLE_TIMEOUT_MS: u64 = 15_000;
    pub const RECONNECT_DELAY_MS: u64 = 5_000;
    pub const GGA_INTERVAL_MS: u64 = 1_000;
    pub const STATS_INTERVAL_MS: u64 = 1_000;
    /// Upper bound of corrections held for a slow receiver link
    pub const MAX_DEVICE_BACKLOG: usize = 64 * 1024;
    const RECV_BUFFER_LEN: usize = 4096;

    pub fn new() -> Self {
        Self {
            state: NtripState::Disconnected,
            config: None,
            socket: None,
            auto_reconnect: false,
            header: BytesMut::new(),
            carry: BytesMut::new(),
            backlog: BytesMut::new(),
            session: Session::default(),
            gga: None,
            pending_connect: None,
            handshake_deadline: None,
            gga_deadline: None,
            stats_deadline: None,
            reconnect_deadline: None,
            source_table: None,
            events: Vec::new(),
        }
    }

    pub fn state(&self) -> NtripState {
        self.state
    }

    pub fn config(&self) -> Option<&NtripConfig> {
        self.config.as_ref()
    }

    /// Whether GGA sentences from the device should be passed to [`Self::set_gga`]
    pub fn wants_gga(&self) -> bool {
        self.state != NtripState::Disconnected && self.config.as_ref().map_or(false, |c| c.auto_gga)
    }

    /// Start a session
    pub fn connect<I: IoProvider>(&mut self, io: &mut I, config: NtripConfig) -> PendingConnect {
        if self.state != NtripState::Disconnected {
            return NtripFuture::ready(Err(NtripError::Busy));
        }
        io.info(&format!(
            "[ntrip] Connecting to {}:{}/{}",
            config.host, config.port, config.mountpoint
        ));
        let (tx, rx) = oneshot::channel();
        self.auto_reconnect = config.auto_reconnect;
        self.config = Some(config);
        self.pending_connect = Some(tx);
        self.open(io);
        NtripFuture { rx }
    }

    /// Latest GGA sentence to report to the caster
    pub fn set_gga(&mut self, sentence: &str) {
        let sentence = sentence.trim();
        if !sentence.is_empty() {
            self.gga = Some(sentence.to_string());
        }
    }

    /// End the session without reconnecting
    pub fn disconnect<I: IoProvider>(&mut self, io: &mut I) {
        self.auto_reconnect = false;
        let was_active = self.state != NtripState::Disconnected;
        self.close_socket(io);
        self.reconnect_deadline = None;
        self.state = NtripState::Disconnected;
        if let Some(tx) = self.pending_connect.take() {
            let _ = tx.send(Err(NtripError::Cancelled));
        }
        if was_active {
            io.info("[ntrip] Disconnected");
            self.events.push(NtripEvent::Disconnected);
        }
    }

    /// Disconnect and abandon a running source-table fetch
    pub fn shutdown<I: IoProvider>(&mut self, io: &mut I) {
        self.disconnect(io);
        self.backlog.clear();
        if let Some(fetch) = self.source_table.take() {
            io.tcp_close(fetch.socket);
            let _ = fetch.tx.send(Err(NtripError::Cancelled));
        }
    }

    pub fn stats(&self, now: u64) -> NtripStats {
        NtripStats {
            state: self.state,
            duration_ms: self
                .session
                .connected_at
                .map_or(0, |at| now.saturating_sub(at)),
            bytes_received: self.session.bytes_received,
            bytes_dropped: self.session.bytes_dropped,
            backlog_bytes: self.backlog.len(),
            message_count: self.session.message_count,
            crc_failures: self.session.crc_failures,
            data_rate: self.session.data_rate,
            message_types: self.session.message_types.clone(),
            last_gga: self.gga.clone(),
        }
    }

    /// Download the caster source table on a separate connection
    pub fn fetch_source_table<I: IoProvider>(
        &mut self,
        io: &mut I,
        config: &NtripConfig,
    ) -> PendingSourceTable {
        if self.source_table.is_some() {
            return NtripFuture::ready(Err(NtripError::Busy));
        }
        let socket = match io.tcp_create() {
            Ok(socket) => socket,
            Err(e) => return NtripFuture::ready(Err(NtripError::Network(e.to_string()))),
        };
        if let Err(e) = io.tcp_connect(&socket, &config.host, config.port) {
            io.tcp_close(socket);
            return NtripFuture::ready(Err(NtripError::Network(e.to_string())));
        }
        io.debug(&format!(
            "[ntrip] Fetching source table from {}:{}",
            config.host, config.port
        ));
        let (tx, rx) = oneshot::channel();
        self.source_table = Some(SourceTableFetch {
            socket,
            request: config.request(""),
            request_sent: false,
            body: Vec::new(),
            deadline: io.current_time_ms() + Self::SOURCE_TABLE_TIMEOUT_MS,
            tx,
        });
        NtripFuture { rx }
    }

    /// Drive sockets and timers
    pub fn poll<I: IoProvider>(&mut self, io: &mut I) -> Vec<NtripEvent> {
        self.poll_source_table(io);
        self.flush_backlog(io);

        let now = io.current_time_ms();
        if self.state == NtripState::Reconnecting
            && self.reconnect_deadline.map_or(false, |d| now >= d)
        {
            self.reconnect_deadline = None;
            io.info("[ntrip] Reconnecting");
            self.open(io);
        }
        if self.state == NtripState::Connecting {
            self.poll_connecting(io);
        }
        if self.state == NtripState::Handshaking {
            self.poll_handshake(io);
        }
        if self.state == NtripState::Streaming {
            self.poll_streaming(io);
        }

        std::mem::take(&mut self.events)
    }

    // =========================================================================
    // Session
    // =========================================================================

    fn open<I: IoProvider>(&mut self, io: &mut I) {
        let Some(config) = self.config.as_ref() else {
            self.state = NtripState::Disconnected;
            return;
        };
        let (host, port) = (config.host.clone(), config.port);

        let socket = match io.tcp_create() {
            Ok(socket) => socket,
            Err(e) => {
                self.connection_lost(io, NtripError::Network(e.to_string()));
                return;
            }
        };
        if let Err(e) = io.tcp_connect(&socket, &host, port) {
            io.tcp_close(socket);
            self.connection_lost(io, NtripError::Network(e.to_string()));
            return;
        }
        self.socket = Some(socket);
        self.header.clear();
        self.carry.clear();
        self.state = NtripState::Connecting;
        self.handshake_deadline = Some(io.current_time_ms() + Self::HANDSHAKE_TIMEOUT_MS);
    }

    fn poll_connecting<I: IoProvider>(&mut self, io: &mut I) {
        if self.handshake_timed_out(io) {
            return;
        }
        let (Some(socket), Some(config)) = (self.socket.as_ref(), self.config.as_ref()) else {
            return;
        };
        if !io.tcp_is_valid(socket) {
            self.connection_lost(io, NtripError::Network("connect failed".into()));
            return;
        }
        if !io.tcp_is_connected(socket) {
            return;
        }
        let request = config.request(&config.mountpoint);
        if let Err(e) = io.tcp_send(socket, request.as_bytes()) {
            self.connection_lost(io, NtripError::Network(e.to_string()));
            return;
        }
        io.debug("[ntrip] Request sent");
        self.state = NtripState::Handshaking;
    }

    fn handshake_timed_out<I: IoProvider>(&mut self, io: &mut I) -> bool {
        if self
            .handshake_deadline
            .map_or(false, |d| io.current_time_ms() >= d)
        {
            self.connection_lost(io, NtripError::Network("handshake timed out".into()));
            return true;
        }
        false
    }

    fn poll_handshake<I: IoProvider>(&mut self, io: &mut I) {
        let Some(socket) = self.socket else {
            return;
        };
        let mut buf = [0u8; Self::RECV_BUFFER_LEN];
        loop {
            match io.tcp_recv(&socket, &mut buf) {
                TcpRead::Data(n) => {
                    self.header.extend_from_slice(&buf[..n]);
                    if let Some(end) = find_header_end(&self.header) {
                        let rest = self.header.split_off(end);
                        let status = status_line(&self.header);
                        self.header.clear();
                        self.on_status(io, status, &rest);
                        return;
                    }
                    if self.header.len() > MAX_HEADER_LEN {
                        self.terminate(
                            io,
                            NtripError::Protocol(format!(
                                "no header terminator within {} bytes",
                                MAX_HEADER_LEN
                            )),
                        );
                        return;
                    }
                }
                TcpRead::Empty => break,
                TcpRead::Closed => {
                    self.connection_lost(io, NtripError::Network("closed during handshake".into()));
                    return;
                }
            }
        }
        self.handshake_timed_out(io);
    }

    fn on_status<I: IoProvider>(&mut self, io: &mut I, status: String, rest: &[u8]) {
        if !is_stream_accepted(&status) {
            self.terminate(io, NtripError::Rejected(status));
            return;
        }

        let now = io.current_time_ms();
        let mountpoint = self
            .config
            .as_ref()
            .map(|c| c.mountpoint.clone())
            .unwrap_or_default();
        io.info(&format!("[ntrip] Streaming {} ({})", mountpoint, status));

        self.state = NtripState::Streaming;
        self.handshake_deadline = None;
        self.session = Session {
            connected_at: Some(now),
            rate_mark_at: now,
            ..Default::default()
        };
        self.gga_deadline = Some(now + Self::GGA_INTERVAL_MS);
        self.stats_deadline = Some(now + Self::STATS_INTERVAL_MS);
        if let Some(tx) = self.pending_connect.take() {
            let _ = tx.send(Ok(()));
        }
        self.events.push(NtripEvent::Connected { mountpoint });

        if !rest.is_empty() {
            self.on_stream_data(io, rest);
        }
    }

    fn poll_streaming<I: IoProvider>(&mut self, io: &mut I) {
        let Some(socket) = self.socket else {
            return;
        };
        let mut buf = [0u8; Self::RECV_BUFFER_LEN];
        loop {
            match io.tcp_recv(&socket, &mut buf) {
                TcpRead::Data(n) => self.on_stream_data(io, &buf[..n]),
                TcpRead::Empty => break,
                TcpRead::Closed => {
                    self.connection_lost(io, NtripError::Network("closed by caster".into()));
                    return;
                }
            }
        }

        let now = io.current_time_ms();
        if self.gga_deadline.map_or(false, |d| now >= d) {
            self.gga_deadline = Some(now + Self::GGA_INTERVAL_MS);
            if let Some(gga) = self.gga.as_deref() {
                if let Err(e) = io.tcp_send_line(&socket, gga) {
                    self.connection_lost(io, NtripError::Network(e.to_string()));
                    return;
                }
            }
        }
        if self.stats_deadline.map_or(false, |d| now >= d) {
            self.stats_deadline = Some(now + Self::STATS_INTERVAL_MS);
            let elapsed = now.saturating_sub(self.session.rate_mark_at);
            if elapsed > 0 {
                let bytes = self.session.bytes_received - self.session.rate_mark_bytes;
                self.session.data_rate = bytes as f64 * 1000.0 / elapsed as f64;
            }
            self.session.rate_mark_at = now;
            self.session.rate_mark_bytes = self.session.bytes_received;
            self.events.push(NtripEvent::Stats(self.stats(now)));
        }
    }

    /// Forward a chunk to the receiver and count the RTCM frames in it
    fn on_stream_data<I: IoProvider>(&mut self, io: &mut I, data: &[u8]) {
        self.session.bytes_received += data.len() as u64;
        self.forward(io, data);

        self.carry.extend_from_slice(data);
        loop {
            match self.carry.iter().position(|&b| b == PREAMBLE) {
                Some(start) => self.carry.advance(start),
                None => {
                    self.carry.clear();
                    break;
                }
            }
            match scan_frame(&self.carry) {
                ScanResult::Frame { header, frame_len } => {
                    self.session.message_count += 1;
                    if !header.crc_ok {
                        self.session.crc_failures += 1;
                    }
                    *self
                        .session
                        .message_types
                        .entry(header.message_id)
                        .or_insert(0) += 1;
                    self.carry.advance(frame_len);
                }
                ScanResult::NeedMore => break,
                ScanResult::Invalid => self.carry.advance(1),
            }
        }
    }

    /// Write to the receiver behind any earlier backlog
    fn forward<I: IoProvider>(&mut self, io: &mut I, data: &[u8]) {
        self.flush_backlog(io);
        let rest = if self.backlog.is_empty() {
            match io.device_send(data) {
                Ok(n) => &data[n.min(data.len())..],
                Err(e) => {
                    if !e.is_would_block() {
                        io.debug(&format!("[ntrip] Forward to device failed: {}", e));
                    }
                    data
                }
            }
        } else {
            data
        };
        if rest.is_empty() {
            return;
        }

        let room = Self::MAX_DEVICE_BACKLOG.saturating_sub(self.backlog.len());
        let kept = rest.len().min(room);
        self.backlog.extend_from_slice(&rest[..kept]);
        let dropped = rest.len() - kept;
        if dropped > 0 {
            self.session.bytes_dropped += dropped as u64;
            io.debug(&format!("[ntrip] Device backlog full, dropped {} bytes", dropped));
        }
    }

    fn flush_backlog<I: IoProvider>(&mut self, io: &mut I) {
        while !self.backlog.is_empty() {
            match io.device_send(&self.backlog) {
                Ok(0) => break,
                Ok(n) => self.backlog.advance(n.min(self.backlog.len())),
                Err(e) => {
                    if !e.is_would_block() {
                        io.debug(&format!("[ntrip] Forward to device failed: {}", e));
                    }
                    break;
                }
            }
        }
    }

    fn close_socket<I: IoProvider>(&mut self, io: &mut I) {
        if let Some(socket) = self.socket.take() {
            io.tcp_close(socket);
        }
        self.handshake_deadline = None;
        self.gga_deadline = None;
        self.stats_deadline = None;
        self.header.clear();
        self.carry.clear();
    }

    /// Transient failure: reconnect if enabled
    fn connection_lost<I: IoProvider>(&mut self, io: &mut I, error: NtripError) {
        io.info(&format!("[ntrip] {}", error));
        self.close_socket(io);
        if let Some(tx) = self.pending_connect.take() {
            let _ = tx.send(Err(error.clone()));
        }
        self.events.push(NtripEvent::Error {
            message: error.to_string(),
            transient: self.auto_reconnect,
        });
        if self.auto_reconnect {
            self.state = NtripState::Reconnecting;
            self.reconnect_deadline = Some(io.current_time_ms() + Self::RECONNECT_DELAY_MS);
            self.events.push(NtripEvent::Reconnecting {
                delay_ms: Self::RECONNECT_DELAY_MS,
            });
        } else {
            self.state = NtripState::Disconnected;
            self.events.push(NtripEvent::Disconnected);
        }
    }

    /// Terminal failure: no reconnect
    fn terminate<I: IoProvider>(&mut self, io: &mut I, error: NtripError) {
        self.auto_reconnect = false;
        self.connection_lost(io, error);
    }

    // =========================================================================
    // Source table
    // =========================================================================

    fn poll_source_table<I: IoProvider>(&mut self, io: &mut I) {
        let Some(fetch) = self.source_table.as_mut() else {
            return;
        };

        if !fetch.request_sent && !io.tcp_is_valid(&fetch.socket) {
            let error = NtripError::Network("connect failed".into());
            self.finish_source_table(io, Err(error));
            return;
        }
        if !fetch.request_sent && io.tcp_is_connected(&fetch.socket) {
            if let Err(e) = io.tcp_send(&fetch.socket, fetch.request.as_bytes()) {
                let error = NtripError::Network(e.to_string());
                self.finish_source_table(io, Err(error));
                return;
            }
            fetch.request_sent = true;
        }

        let mut buf = [0u8; Self::RECV_BUFFER_LEN];
        let mut complete = false;
        if fetch.request_sent {
            loop {
                match io.tcp_recv(&fetch.socket, &mut buf) {
                    TcpRead::Data(n) => fetch.body.extend_from_slice(&buf[..n]),
                    TcpRead::Empty => break,
                    TcpRead::Closed => {
                        complete = true;
                        break;
                    }
                }
            }
        }
        let complete = complete || contains(&fetch.body, b"ENDSOURCETABLE");

        if complete {
            let result = parse_source_table_response(&fetch.body);
            self.finish_source_table(io, result);
        } else if io.current_time_ms() >= fetch.deadline {
            self.finish_source_table(io, Err(NtripError::Network("source table timed out".into())));
        }
    }

    fn finish_source_table<I: IoProvider>(
        &mut self,
        io: &mut I,
        result: Result<Vec<MountPoint>, NtripError>,
    ) {
        if let Some(fetch) = self.source_table.take() {
            io.tcp_close(fetch.socket);
            match &result {
                Ok(mounts) => io.debug(&format!("[ntrip] Source table: {} mountpoints", mounts.len())),
                Err(e) => io.info(&format!("[ntrip] Source table failed: {}", e)),
            }
            let _ = fetch.tx.send(result);
        }
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn parse_source_table_response(response: &[u8]) -> Result<Vec<MountPoint>, NtripError> {
    let body = match find_header_end(response) {
        Some(end) => {
            let status = status_line(&response[..end]);
            if !is_source_table_status(&status) {
                return Err(NtripError::Rejected(status));
            }
            &response[end..]
        }
        None => response,
    };
    Ok(parse_source_table(&String::from_utf8_lossy(body)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::mock::MockIo;
    use crate::protocol::crc::tests::hex;
    use futures::FutureExt;

    const RTCM_1005: &str = "D300133ED7D30202980EDEEF34B4BD62AC0941986F33360B98";
    const GGA: &str = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47";

    fn config() -> NtripConfig {
        let mut config = NtripConfig::new("caster.example", "MOUNT");
        config.username = Some("user".into());
        config.password = Some("pass".into());
        config.user_agent = "NTRIP test".into();
        config
    }

    /// Connect and complete the handshake; returns the socket handle
    fn streaming(io: &mut MockIo, client: &mut NtripClient) -> i32 {
        let mut pending = client.connect(io, config());
        client.poll(io);
        assert_eq!(client.state(), NtripState::Handshaking);
        let socket = io.last_socket();
        io.push_inbound(socket, b"ICY 200 OK\r\n\r\n");
        let events = client.poll(io);
        assert_eq!(
            events,
            vec![NtripEvent::Connected {
                mountpoint: "MOUNT".into()
            }]
        );
        assert_eq!((&mut pending).now_or_never(), Some(Ok(())));
        socket
    }

    #[test]
    fn test_request_sent_after_connect() {
        let mut io = MockIo::new();
        let mut client = NtripClient::new();
        let _pending = client.connect(&mut io, config());
        assert_eq!(client.state(), NtripState::Connecting);
        client.poll(&mut io);

        let socket = io.last_socket();
        assert_eq!(io.socket(socket).host, "caster.example");
        assert_eq!(io.socket(socket).port, 2101);
        let request = io.sent_text(socket);
        assert!(request.starts_with("GET /MOUNT HTTP/1.0\r\n"));
        assert!(request.contains("Authorization: Basic dXNlcjpwYXNz\r\n"));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_unauthorized_is_terminal() {
        let mut io = MockIo::new();
        let mut client = NtripClient::new();
        let pending = client.connect(&mut io, config());
        client.poll(&mut io);
        let socket = io.last_socket();
        io.push_inbound(socket, b"HTTP/1.0 401 Unauthorized\r\n\r\n");

        let events = client.poll(&mut io);
        assert_eq!(
            pending.now_or_never(),
            Some(Err(NtripError::Rejected("HTTP/1.0 401 Unauthorized".into())))
        );
        assert!(events.contains(&NtripEvent::Error {
            message: "Caster rejected request: HTTP/1.0 401 Unauthorized".into(),
            transient: false,
        }));
        assert_eq!(client.state(), NtripState::Disconnected);
        assert!(io.socket(socket).closed);

        io.advance(NtripClient::RECONNECT_DELAY_MS * 2);
        client.poll(&mut io);
        assert_eq!(io.last_socket(), socket);
        assert_eq!(client.state(), NtripState::Disconnected);
    }

    #[test]
    fn test_source_table_status_rejects_mountpoint() {
        let mut io = MockIo::new();
        let mut client = NtripClient::new();
        let pending = client.connect(&mut io, config());
        client.poll(&mut io);
        io.push_inbound(io.last_socket(), b"SOURCETABLE 200 OK\r\nServer: x\r\n\r\nSTR;...");
        client.poll(&mut io);
        assert_eq!(
            pending.now_or_never(),
            Some(Err(NtripError::Rejected("SOURCETABLE 200 OK".into())))
        );
    }

    #[test]
    fn test_gga_sent_once_per_interval() {
        let mut io = MockIo::new();
        let mut client = NtripClient::new();
        let socket = streaming(&mut io, &mut client);
        let before = io.sent_text(socket).len();

        client.set_gga(GGA);
        io.advance(1000);
        client.poll(&mut io);

        let sent = io.sent_text(socket)[before..].to_string();
        assert_eq!(sent, format!("{}\r\n", GGA));
    }

    #[test]
    fn test_no_gga_without_sentence() {
        let mut io = MockIo::new();
        let mut client = NtripClient::new();
        let socket = streaming(&mut io, &mut client);
        let before = io.sent_text(socket).len();
        io.advance(3000);
        client.poll(&mut io);
        assert_eq!(io.sent_text(socket).len(), before);
    }

    #[test]
    fn test_stream_forwarded_and_counted() {
        let mut io = MockIo::new();
        let mut client = NtripClient::new();
        let _pending = client.connect(&mut io, config());
        client.poll(&mut io);
        let socket = io.last_socket();

        let frame = hex(RTCM_1005);
        let mut first = b"ICY 200 OK\r\n\r\n".to_vec();
        first.extend_from_slice(&frame);
        first.extend_from_slice(&frame[..10]);
        io.push_inbound(socket, &first);
        client.poll(&mut io);

        assert_eq!(io.device_writes.concat(), [&frame[..], &frame[..10]].concat());
        assert_eq!(client.stats(0).message_count, 1);

        io.push_inbound(socket, &frame[10..]);
        client.poll(&mut io);
        let stats = client.stats(0);
        assert_eq!(stats.message_count, 2);
        assert_eq!(stats.message_types.get(&1005), Some(&2));
        assert_eq!(stats.bytes_received, 50);
        assert_eq!(stats.crc_failures, 0);
        assert_eq!(io.device_writes.concat(), [&frame[..], &frame[..]].concat());
    }

    #[test]
    fn test_short_device_writes_are_retried_in_order() {
        let mut io = MockIo::new();
        let mut client = NtripClient::new();
        let socket = streaming(&mut io, &mut client);
        let frame = hex(RTCM_1005);

        io.device_accept = Some(30);
        io.push_inbound(socket, &[&frame[..], &frame[..]].concat());
        client.poll(&mut io);
        let stats = client.stats(0);
        assert_eq!(io.device_writes.concat().len(), 30);
        assert_eq!(stats.backlog_bytes, 20);
        assert_eq!(stats.bytes_received, 50);

        // Newer data queues behind the backlog
        io.push_inbound(socket, &frame[..5]);
        client.poll(&mut io);
        assert_eq!(client.stats(0).backlog_bytes, 25);

        io.device_accept = None;
        client.poll(&mut io);
        assert_eq!(
            io.device_writes.concat(),
            [&frame[..], &frame[..], &frame[..5]].concat()
        );
        let stats = client.stats(0);
        assert_eq!(stats.backlog_bytes, 0);
        assert_eq!(stats.bytes_dropped, 0);
        assert_eq!(stats.message_count, 2);
    }

    #[test]
    fn test_device_backlog_is_bounded() {
        let mut io = MockIo::new();
        let mut client = NtripClient::new();
        let socket = streaming(&mut io, &mut client);

        io.device_accept = Some(0);
        io.push_inbound(socket, &vec![0x55u8; NtripClient::MAX_DEVICE_BACKLOG + 100]);
        client.poll(&mut io);
        let stats = client.stats(0);
        assert_eq!(stats.backlog_bytes, NtripClient::MAX_DEVICE_BACKLOG);
        assert_eq!(stats.bytes_dropped, 100);
        assert!(io.device_writes.is_empty());

        io.device_accept = None;
        client.poll(&mut io);
        assert_eq!(io.device_writes.concat().len(), NtripClient::MAX_DEVICE_BACKLOG);
        assert_eq!(client.stats(0).backlog_bytes, 0);
    }

    #[test]
    fn test_failed_connect_attempt_schedules_reconnect() {
        let mut io = MockIo::new();
        io.connect_pending = true;
        let mut client = NtripClient::new();
        let pending = client.connect(&mut io, config());
        client.poll(&mut io);
        assert_eq!(client.state(), NtripState::Connecting);

        let socket = io.last_socket();
        io.socket(socket).closed = true;
        let events = client.poll(&mut io);
        assert_eq!(client.state(), NtripState::Reconnecting);
        assert!(events.contains(&NtripEvent::Error {
            message: "Connection failed: connect failed".into(),
            transient: true,
        }));
        assert!(matches!(pending.now_or_never(), Some(Err(NtripError::Network(_)))));
    }

    #[test]
    fn test_stats_event_and_rate() {
        let mut io = MockIo::new();
        let mut client = NtripClient::new();
        let socket = streaming(&mut io, &mut client);
        io.push_inbound(socket, &hex(RTCM_1005));
        io.advance(1000);
        let events = client.poll(&mut io);
        let Some(NtripEvent::Stats(stats)) = events.last() else {
            panic!("expected stats event, got {:?}", events);
        };
        assert_eq!(stats.state, NtripState::Streaming);
        assert_eq!(stats.duration_ms, 1000);
        assert_eq!(stats.bytes_received, 25);
        assert_eq!(stats.data_rate, 25.0);
    }

    #[test]
    fn test_close_schedules_reconnect() {
        let mut io = MockIo::new();
        let mut client = NtripClient::new();
        let socket = streaming(&mut io, &mut client);
        io.socket(socket).eof = true;

        let events = client.poll(&mut io);
        assert_eq!(client.state(), NtripState::Reconnecting);
        assert!(events.contains(&NtripEvent::Error {
            message: "Connection failed: closed by caster".into(),
            transient: true,
        }));

        io.advance(4999);
        client.poll(&mut io);
        assert_eq!(io.last_socket(), socket);

        io.advance(1);
        client.poll(&mut io);
        assert_eq!(io.last_socket(), socket + 1);
        assert_eq!(client.state(), NtripState::Handshaking);
    }

    #[test]
    fn test_initial_connect_failure_resolves_network_error() {
        let mut io = MockIo::new();
        io.connect_fail = true;
        let mut client = NtripClient::new();
        let pending = client.connect(&mut io, config());
        assert!(matches!(pending.now_or_never(), Some(Err(NtripError::Network(_)))));
        assert_eq!(client.state(), NtripState::Reconnecting);
    }

    #[test]
    fn test_handshake_timeout() {
        let mut io = MockIo::new();
        let mut client = NtripClient::new();
        let pending = client.connect(&mut io, config());
        client.poll(&mut io);
        io.advance(NtripClient::HANDSHAKE_TIMEOUT_MS);
        client.poll(&mut io);
        assert_eq!(
            pending.now_or_never(),
            Some(Err(NtripError::Network("handshake timed out".into())))
        );
        assert_eq!(client.state(), NtripState::Reconnecting);
    }

    #[test]
    fn test_oversized_header_is_protocol_error() {
        let mut io = MockIo::new();
        let mut client = NtripClient::new();
        let pending = client.connect(&mut io, config());
        client.poll(&mut io);
        io.push_inbound(io.last_socket(), &vec![b'x'; MAX_HEADER_LEN + 1]);
        client.poll(&mut io);
        assert!(matches!(pending.now_or_never(), Some(Err(NtripError::Protocol(_)))));
        assert_eq!(client.state(), NtripState::Disconnected);
    }

    #[test]
    fn test_disconnect_cancels_without_error() {
        let mut io = MockIo::new();
        let mut client = NtripClient::new();
        let pending = client.connect(&mut io, config());
        client.disconnect(&mut io);
        assert_eq!(pending.now_or_never(), Some(Err(NtripError::Cancelled)));
        let events = client.poll(&mut io);
        assert_eq!(events, vec![NtripEvent::Disconnected]);
        assert_eq!(client.state(), NtripState::Disconnected);
    }

    #[test]
    fn test_connect_while_active_is_busy() {
        let mut io = MockIo::new();
        let mut client = NtripClient::new();
        let _first = client.connect(&mut io, config());
        let second = client.connect(&mut io, config());
        assert_eq!(second.now_or_never(), Some(Err(NtripError::Busy)));
    }

    #[test]
    fn test_fetch_source_table() {
        let mut io = MockIo::new();
        let mut client = NtripClient::new();
        let mut pending = client.fetch_source_table(&mut io, &config());
        let socket = io.last_socket();
        client.poll(&mut io);
        assert!(io.sent_text(socket).starts_with("GET / HTTP/1.0\r\n"));

        io.push_inbound(
            socket,
            b"SOURCETABLE 200 OK\r\nContent-Type: text/plain\r\n\r\n\
STR;RTCM3;Downtown;RTCM 3.2;1005(10),1077(1);2;GPS+GLO;NET;USA;37.77;-122.42;1;0;sNTRIP;none;B;N;9600;\r\n",
        );
        client.poll(&mut io);
        assert!((&mut pending).now_or_never().is_none());

        io.socket(socket).eof = true;
        client.poll(&mut io);
        let mounts = pending.now_or_never().unwrap().unwrap();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].name, "RTCM3");
        assert!(io.socket(socket).closed);
    }

    #[test]
    fn test_source_table_timeout() {
        let mut io = MockIo::new();
        let mut client = NtripClient::new();
        let pending = client.fetch_source_table(&mut io, &config());
        client.poll(&mut io);
        io.advance(NtripClient::SOURCE_TABLE_TIMEOUT_MS);
        client.poll(&mut io);
        assert!(matches!(pending.now_or_never(), Some(Err(NtripError::Network(_)))));
    }
}
