//! I/O abstraction for platform-independent receiver code.
//!
//! This module defines the trait that abstracts the receiver transport and
//! the TCP sockets used for NTRIP, allowing the same query and correction
//! logic to run against tokio sockets, a serial port shim, or a test mock.
//!
//! # Design
//!
//! The trait uses a **poll-based** interface (not async) because:
//! - the core has no async runtime
//! - native code can easily adapt async to poll with `try_read`/`try_write`
//!
//! Every timer in the core is a deadline compared against
//! [`IoProvider::current_time_ms`], so a mock clock drives the whole
//! state machine deterministically in tests.
//!
//! # Example
//!
//! ```rust,ignore
//! use gnsslink_core::io::{IoProvider, IoProviderExt};
//!
//! fn ask_for_ports<I: IoProvider>(io: &mut I) {
//!     io.device_send_line("LOG COMCONFIG ONCE").unwrap();
//! }
//! ```

use core::fmt;

// =============================================================================
// Error Types
// =============================================================================

/// I/O error type for cross-platform socket operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoError {
    /// Error code (negative values indicate errors, specific meaning varies by platform)
    pub code: i32,
    /// Human-readable error message
    pub message: String,
}

impl IoError {
    /// Create a new I/O error with a code and message.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Create a "would block" error (no data available, non-blocking).
    pub fn would_block() -> Self {
        Self::new(-11, "Operation would block")
    }

    /// Create a "not connected" error.
    pub fn not_connected() -> Self {
        Self::new(-1, "Not connected")
    }

    /// Check if this is a "would block" error.
    pub fn is_would_block(&self) -> bool {
        self.code == -11
    }
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

impl std::error::Error for IoError {}

// =============================================================================
// Socket Handle Types
// =============================================================================

/// Opaque handle to a TCP socket.
///
/// The actual socket implementation is platform-specific.
/// This is just an identifier used by the IoProvider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TcpSocketHandle(pub i32);

/// Result of a non-blocking TCP read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpRead {
    /// `n` bytes were written into the buffer
    Data(usize),
    /// Nothing available right now
    Empty,
    /// The peer closed the connection or the socket failed
    Closed,
}

// =============================================================================
// IoProvider Trait
// =============================================================================

/// Platform-independent I/O provider.
///
/// The receiver transport itself (serial, TCP or UDP) is owned by the
/// caller; the core only ever writes commands and corrections into it via
/// [`IoProvider::device_send`]. Inbound device bytes are pushed into the
/// engine by the caller.
pub trait IoProvider {
    // -------------------------------------------------------------------------
    // Receiver transport
    // -------------------------------------------------------------------------

    /// Write raw bytes to the receiver.
    ///
    /// Returns the number of bytes written.
    fn device_send(&mut self, data: &[u8]) -> Result<usize, IoError>;

    // -------------------------------------------------------------------------
    // TCP Operations (NTRIP)
    // -------------------------------------------------------------------------

    /// Create a new TCP socket.
    fn tcp_create(&mut self) -> Result<TcpSocketHandle, IoError>;

    /// Initiate a TCP connection (non-blocking).
    ///
    /// This starts the connection process. Use `tcp_is_connected()` to check
    /// when the connection is established.
    fn tcp_connect(&mut self, socket: &TcpSocketHandle, host: &str, port: u16)
        -> Result<(), IoError>;

    /// Check if a TCP socket is connected.
    fn tcp_is_connected(&self, socket: &TcpSocketHandle) -> bool;

    /// Check if a TCP socket is still valid (not closed due to error).
    fn tcp_is_valid(&self, socket: &TcpSocketHandle) -> bool;

    /// Send data over a TCP connection.
    fn tcp_send(&mut self, socket: &TcpSocketHandle, data: &[u8]) -> Result<usize, IoError>;

    /// Receive raw data from a TCP socket (non-blocking).
    fn tcp_recv(&mut self, socket: &TcpSocketHandle, buf: &mut [u8]) -> TcpRead;

    /// Close a TCP socket.
    fn tcp_close(&mut self, socket: TcpSocketHandle);

    // -------------------------------------------------------------------------
    // Utility
    // -------------------------------------------------------------------------

    /// Get current timestamp in milliseconds since some epoch.
    ///
    /// The epoch doesn't matter as long as it's consistent within the session.
    fn current_time_ms(&self) -> u64;

    /// Log a debug message.
    fn debug(&self, msg: &str);

    /// Log an info message.
    fn info(&self, msg: &str);
}

// =============================================================================
// Helper Methods
// =============================================================================

/// Extension methods for IoProvider.
pub trait IoProviderExt: IoProvider {
    /// Send a command line to the receiver with CRLF terminator.
    fn device_send_line(&mut self, line: &str) -> Result<usize, IoError> {
        let data = format!("{}\r\n", line);
        self.device_send(data.as_bytes())
    }

    /// Send a line over TCP with CRLF terminator.
    fn tcp_send_line(&mut self, socket: &TcpSocketHandle, line: &str) -> Result<usize, IoError> {
        let data = format!("{}\r\n", line);
        self.tcp_send(socket, data.as_bytes())
    }
}

// Blanket implementation for all IoProvider types
impl<T: IoProvider> IoProviderExt for T {}

// =============================================================================
// Test Support
// =============================================================================


// =============================================================================
// Tests
// =============================================================================
