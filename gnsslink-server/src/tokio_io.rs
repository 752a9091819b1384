//! Tokio implementation of IoProvider for the native server.
//!
//! `TokioIoProvider` implements `gnsslink_core::IoProvider` with tokio
//! sockets used in non-blocking mode (`try_read`/`try_write`), matching the
//! poll-based interface of the core. It also owns the receiver link, which
//! is read by the adapter loop with [`TokioIoProvider::device_recv`].
//!
//! Caster connects run on a spawned task; a socket reports not connected
//! until [`TokioIoProvider::poll_connects`] picks up the finished stream.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use gnsslink_core::io::{IoError, IoProvider, TcpRead, TcpSocketHandle};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::DeviceAddress;

/// Connect timeout for caster sockets
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Receiver transport
enum DeviceLink {
    Tcp(TcpStream),
    Udp {
        socket: UdpSocket,
        /// Last datagram sender; commands are sent back to it
        peer: Option<SocketAddr>,
    },
}

/// Internal state for a TCP socket
enum TcpSocketState {
    Idle,
    Connecting {
        result: oneshot::Receiver<Result<TcpStream, String>>,
        task: JoinHandle<()>,
    },
    Connected(TcpStream),
    Failed,
}

impl TcpSocketState {
    fn stream(&self) -> Option<&TcpStream> {
        match self {
            TcpSocketState::Connected(stream) => Some(stream),
            _ => None,
        }
    }
}

/// Tokio implementation of IoProvider for the native server.
///
/// # Usage
///
/// ```rust,ignore
/// use gnsslink_core::ReceiverEngine;
/// use gnsslink_server::tokio_io::TokioIoProvider;
///
/// let mut io = TokioIoProvider::new();
/// io.open_device(&address).await?;
///
/// // In your main loop:
/// let events = engine.poll(&mut io);
/// ```
pub struct TokioIoProvider {
    /// Next socket handle ID
    next_handle: i32,
    device: Option<DeviceLink>,
    /// TCP sockets by handle
    tcp_sockets: HashMap<i32, TcpSocketState>,
    /// Start time for current_time_ms calculation
    start_time: Instant,
}

impl TokioIoProvider {
    /// Create a new Tokio I/O provider.
    pub fn new() -> Self {
        Self {
            next_handle: 1,
            device: None,
            tcp_sockets: HashMap::new(),
            start_time: Instant::now(),
        }
    }

    fn alloc_handle(&mut self) -> i32 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    /// Move finished connect attempts to connected or failed
    pub fn poll_connects(&mut self) {
        for (handle, state) in self.tcp_sockets.iter_mut() {
            let TcpSocketState::Connecting { result, .. } = state else {
                continue;
            };
            let next = match result.try_recv() {
                Err(oneshot::error::TryRecvError::Empty) => continue,
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    log::debug!("Socket {} connected", handle);
                    TcpSocketState::Connected(stream)
                }
                Ok(Err(e)) => {
                    log::debug!("Socket {} connect failed: {}", handle, e);
                    TcpSocketState::Failed
                }
                Err(oneshot::error::TryRecvError::Closed) => TcpSocketState::Failed,
            };
            *state = next;
        }
    }

    /// Connect or bind the receiver link
    pub async fn open_device(&mut self, address: &DeviceAddress) -> Result<(), IoError> {
        let link = match address {
            DeviceAddress::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port))
                    .await
                    .map_err(|e| IoError::new(-1, format!("Connect to {}:{} failed: {}", host, port, e)))?;
                let _ = stream.set_nodelay(true);
                log::info!("Connected to receiver at {}:{}", host, port);
                DeviceLink::Tcp(stream)
            }
            DeviceAddress::Udp { bind } => {
                let socket = UdpSocket::bind(bind)
                    .await
                    .map_err(|e| IoError::new(-1, format!("Bind to {} failed: {}", bind, e)))?;
                log::info!("Listening for receiver datagrams on {}", bind);
                DeviceLink::Udp { socket, peer: None }
            }
        };
        self.device = Some(link);
        Ok(())
    }

    pub fn has_device(&self) -> bool {
        self.device.is_some()
    }

    /// Commands can be sent: always for TCP, after the first datagram for UDP
    pub fn device_ready(&self) -> bool {
        match &self.device {
            Some(DeviceLink::Tcp(_)) => true,
            Some(DeviceLink::Udp { peer, .. }) => peer.is_some(),
            None => false,
        }
    }

    /// Local address of the receiver link
    pub fn device_local_addr(&self) -> Option<SocketAddr> {
        match self.device.as_ref()? {
            DeviceLink::Tcp(stream) => stream.local_addr().ok(),
            DeviceLink::Udp { socket, .. } => socket.local_addr().ok(),
        }
    }

    /// Non-blocking read from the receiver link
    pub fn device_recv(&mut self, buf: &mut [u8]) -> TcpRead {
        match self.device.as_mut() {
            None => TcpRead::Closed,
            Some(DeviceLink::Tcp(stream)) => match stream.try_read(buf) {
                Ok(0) => TcpRead::Closed,
                Ok(n) => TcpRead::Data(n),
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => TcpRead::Empty,
                Err(e) => {
                    log::debug!("device_recv: {}", e);
                    TcpRead::Closed
                }
            },
            Some(DeviceLink::Udp { socket, peer }) => match socket.try_recv_from(buf) {
                Ok((n, from)) => {
                    *peer = Some(from);
                    TcpRead::Data(n)
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => TcpRead::Empty,
                Err(e) => {
                    log::debug!("device_recv: {}", e);
                    TcpRead::Empty
                }
            },
        }
    }
}

impl Default for TokioIoProvider {
    fn default() -> Self {
        Self::new()
    }
}

/// Write as much as the socket accepts without blocking
fn try_write_all(stream: &TcpStream, data: &[u8]) -> Result<usize, IoError> {
    let mut written = 0;
    while written < data.len() {
        match stream.try_write(&data[written..]) {
            Ok(0) => return Err(IoError::not_connected()),
            Ok(n) => written += n,
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                if written == 0 {
                    return Err(IoError::would_block());
                }
                log::debug!("Short write: {} of {} bytes", written, data.len());
                break;
            }
            Err(e) => return Err(IoError::new(-1, format!("Write failed: {}", e))),
        }
    }
    Ok(written)
}

impl IoProvider for TokioIoProvider {
    // -------------------------------------------------------------------------
    // Device Operations
    // -------------------------------------------------------------------------

    fn device_send(&mut self, data: &[u8]) -> Result<usize, IoError> {
        match self.device.as_ref() {
            None => Err(IoError::not_connected()),
            Some(DeviceLink::Tcp(stream)) => try_write_all(stream, data),
            Some(DeviceLink::Udp { socket, peer }) => {
                let peer = peer.ok_or_else(IoError::not_connected)?;
                socket
                    .try_send_to(data, peer)
                    .map_err(|e| IoError::new(-1, format!("Send to {} failed: {}", peer, e)))
            }
        }
    }

    // -------------------------------------------------------------------------
    // TCP Operations
    // -------------------------------------------------------------------------

    fn tcp_create(&mut self) -> Result<TcpSocketHandle, IoError> {
        let handle = self.alloc_handle();
        self.tcp_sockets.insert(handle, TcpSocketState::Idle);
        Ok(TcpSocketHandle(handle))
    }

    fn tcp_connect(
        &mut self,
        socket: &TcpSocketHandle,
        host: &str,
        port: u16,
    ) -> Result<(), IoError> {
        let state = self
            .tcp_sockets
            .get_mut(&socket.0)
            .ok_or_else(|| IoError::new(-1, "Invalid socket handle"))?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| IoError::new(-1, format!("No runtime for connect: {}", e)))?;

        let (tx, rx) = oneshot::channel();
        let host = host.to_string();
        let task = runtime.spawn(async move {
            let attempt = tokio::time::timeout(
                CONNECT_TIMEOUT,
                TcpStream::connect((host.as_str(), port)),
            )
            .await;
            let result = match attempt {
                Ok(Ok(stream)) => Ok(stream),
                Ok(Err(e)) => Err(format!("{}:{}: {}", host, port, e)),
                Err(_) => Err(format!("{}:{}: timed out", host, port)),
            };
            let _ = tx.send(result);
        });
        if let TcpSocketState::Connecting { task: previous, .. } = std::mem::replace(
            state,
            TcpSocketState::Connecting { result: rx, task },
        ) {
            previous.abort();
        }
        Ok(())
    }

    fn tcp_is_connected(&self, socket: &TcpSocketHandle) -> bool {
        self.tcp_sockets
            .get(&socket.0)
            .map(|s| s.stream().is_some())
            .unwrap_or(false)
    }

    fn tcp_is_valid(&self, socket: &TcpSocketHandle) -> bool {
        self.tcp_sockets
            .get(&socket.0)
            .map(|s| !matches!(s, TcpSocketState::Failed))
            .unwrap_or(false)
    }

    fn tcp_send(&mut self, socket: &TcpSocketHandle, data: &[u8]) -> Result<usize, IoError> {
        self.poll_connects();
        let stream = self
            .tcp_sockets
            .get(&socket.0)
            .and_then(TcpSocketState::stream)
            .ok_or_else(IoError::not_connected)?;
        try_write_all(stream, data)
    }

    fn tcp_recv(&mut self, socket: &TcpSocketHandle, buf: &mut [u8]) -> TcpRead {
        let Some(state) = self.tcp_sockets.get(&socket.0) else {
            return TcpRead::Closed;
        };
        let stream = match state {
            TcpSocketState::Connected(stream) => stream,
            TcpSocketState::Idle | TcpSocketState::Connecting { .. } => return TcpRead::Empty,
            TcpSocketState::Failed => return TcpRead::Closed,
        };

        match stream.try_read(buf) {
            Ok(0) => TcpRead::Closed,
            Ok(n) => TcpRead::Data(n),
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => TcpRead::Empty,
            Err(e) => {
                log::debug!("tcp_recv: {}", e);
                TcpRead::Closed
            }
        }
    }

    fn tcp_close(&mut self, socket: TcpSocketHandle) {
        if let Some(TcpSocketState::Connecting { task, .. }) = self.tcp_sockets.remove(&socket.0) {
            task.abort();
        }
    }

    // -------------------------------------------------------------------------
    // Utility
    // -------------------------------------------------------------------------

    fn current_time_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    fn debug(&self, msg: &str) {
        log::debug!("{}", msg);
    }

    fn info(&self, msg: &str) {
        log::info!("{}", msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn recv_all<F>(mut read: F, len: usize) -> Vec<u8>
    where
        F: FnMut(&mut [u8]) -> TcpRead,
    {
        let mut got = Vec::new();
        let mut buf = [0u8; 64];
        for _ in 0..200 {
            match read(&mut buf) {
                TcpRead::Data(n) => {
                    got.extend_from_slice(&buf[..n]);
                    if got.len() >= len {
                        break;
                    }
                }
                TcpRead::Empty => tokio::time::sleep(Duration::from_millis(10)).await,
                TcpRead::Closed => break,
            }
        }
        got
    }

    /// Wait until the connect attempt resolves; true when it succeeded
    async fn wait_connected(io: &mut TokioIoProvider, handle: &TcpSocketHandle) -> bool {
        for _ in 0..200 {
            io.poll_connects();
            if io.tcp_is_connected(handle) {
                return true;
            }
            if !io.tcp_is_valid(handle) {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_tcp_round_trip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut io = TokioIoProvider::new();
        let handle = io.tcp_create().unwrap();
        assert!(io.tcp_is_valid(&handle));
        assert!(!io.tcp_is_connected(&handle));
        io.tcp_connect(&handle, "127.0.0.1", port).unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();
        assert!(wait_connected(&mut io, &handle).await);
        assert_eq!(io.tcp_send(&handle, b"GET /\r\n\r\n").unwrap(), 9);
        let mut request = [0u8; 9];
        peer.read_exact(&mut request).await.unwrap();
        assert_eq!(&request, b"GET /\r\n\r\n");

        peer.write_all(b"ICY 200 OK\r\n\r\n").await.unwrap();
        let reply = recv_all(|buf| io.tcp_recv(&handle, buf), 14).await;
        assert_eq!(reply, b"ICY 200 OK\r\n\r\n");

        drop(peer);
        let rest = recv_all(|buf| io.tcp_recv(&handle, buf), 1).await;
        assert!(rest.is_empty());

        io.tcp_close(handle);
        assert!(!io.tcp_is_valid(&handle));
        assert_eq!(io.tcp_recv(&handle, &mut [0u8; 4]), TcpRead::Closed);
    }

    #[tokio::test]
    async fn test_tcp_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut io = TokioIoProvider::new();
        let handle = io.tcp_create().unwrap();
        io.tcp_connect(&handle, "127.0.0.1", port).unwrap();
        assert!(!wait_connected(&mut io, &handle).await);
        assert!(!io.tcp_is_valid(&handle));
        assert_eq!(io.tcp_recv(&handle, &mut [0u8; 4]), TcpRead::Closed);
    }

    #[tokio::test]
    async fn test_tcp_connect_does_not_block() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut io = TokioIoProvider::new();
        let handle = io.tcp_create().unwrap();
        io.tcp_connect(&handle, "127.0.0.1", port).unwrap();

        // The connect task has not run yet on this single-threaded runtime
        assert!(!io.tcp_is_connected(&handle));
        assert!(io.tcp_is_valid(&handle));
        assert_eq!(io.tcp_recv(&handle, &mut [0u8; 4]), TcpRead::Empty);
        assert!(io.tcp_send(&handle, b"x").is_err());

        let _peer = listener.accept().await.unwrap();
        assert!(wait_connected(&mut io, &handle).await);
        io.tcp_close(handle);
        assert!(!io.tcp_is_valid(&handle));
    }

    #[tokio::test]
    async fn test_udp_device_replies_to_sender() {
        let mut io = TokioIoProvider::new();
        assert!(io.device_send(b"LOG COMCONFIG ONCE\r\n").is_err());

        io.open_device(&DeviceAddress::Udp {
            bind: "127.0.0.1:0".parse().unwrap(),
        })
        .await
        .unwrap();
        let device_addr = io.device_local_addr().unwrap();

        // No datagram seen yet, so there is nobody to answer
        assert!(!io.device_ready());
        assert!(io.device_send(b"LOG COMCONFIG ONCE\r\n").is_err());

        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        receiver.send_to(b"$GPGGA,1*00\r\n", device_addr).await.unwrap();
        let data = recv_all(|buf| io.device_recv(buf), 13).await;
        assert_eq!(data, b"$GPGGA,1*00\r\n");
        assert!(io.device_ready());

        io.device_send(b"LOG COMCONFIG ONCE\r\n").unwrap();
        let mut buf = [0u8; 64];
        let (n, _) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"LOG COMCONFIG ONCE\r\n");
    }

    #[tokio::test]
    async fn test_tcp_device_link() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut io = TokioIoProvider::new();
        io.open_device(&DeviceAddress::Tcp {
            host: "127.0.0.1".into(),
            port,
        })
        .await
        .unwrap();
        let (mut receiver, _) = listener.accept().await.unwrap();

        io.device_send(b"UNLOG BESTPOSB\r\n").unwrap();
        let mut command = [0u8; 16];
        receiver.read_exact(&mut command).await.unwrap();
        assert_eq!(&command, b"UNLOG BESTPOSB\r\n");

        drop(receiver);
        let rest = recv_all(|buf| io.device_recv(buf), 1).await;
        assert!(rest.is_empty());
        assert_eq!(io.device_recv(&mut [0u8; 4]), TcpRead::Closed);
    }
}
