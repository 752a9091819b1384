//! # gnsslink Core
//!
//! Platform-independent ingestion library for GNSS/INS receivers.
//!
//! This crate contains pure parsing, decoding and protocol state machines with
//! **zero I/O dependencies**. All platform-specific I/O is abstracted through
//! the [`IoProvider`] trait, and time is read from
//! [`IoProvider::current_time_ms`], so every timer-driven component can be
//! tested with a scripted clock.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  gnsslink-core (platform-independent, no tokio/async deps)   │
//! │  ├── protocol/     (wire formats: CRC, binary, RTCM, NMEA)   │
//! │  ├── demux         (byte stream -> frames)                   │
//! │  ├── decoder/      (schema-driven payload decoding)          │
//! │  ├── router/       (capability subscriptions, normalizing)   │
//! │  ├── controllers/  (device queries, NTRIP client)            │
//! │  ├── engine/       (ReceiverEngine wiring)                   │
//! │  └── IoProvider    (abstracts device and TCP I/O)            │
//! └──────────────────────────────────────────────────────────────┘
//!                 ▲
//!    ┌────────────┴────────────┐
//!    │  gnsslink-server        │
//!    │  (TokioIoProvider)      │
//!    └─────────────────────────┘
//! ```
//!
//! ## Key Modules
//!
//! - [`protocol`] - Wire formats and command formatting
//! - [`demux`] - Stream demultiplexer for interleaved binary/RTCM/text
//! - [`decoder`] - Binary payload decoding driven by a [`schema`]
//! - [`router`] - Capability pub/sub with reference-counted subscriptions
//! - [`controllers`] - Device query engine and NTRIP correction client
//! - [`engine`] - [`ReceiverEngine`] combining all of the above
//! - [`io`] - Platform-agnostic I/O trait ([`IoProvider`])
//!
//! ## Example: Demultiplexing a stream
//!
//! ```rust
//! use gnsslink_core::demux::{Frame, StreamDemux};
//!
//! let mut demux = StreamDemux::new();
//! let frames = demux.feed(b"$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47\r\n");
//! assert_eq!(frames.len(), 1);
//! assert!(matches!(&frames[0], Frame::Text(_)));
//! ```
//!
//! ## Example: CRC helpers
//!
//! ```rust
//! use gnsslink_core::protocol::crc::{crc24q, crc32_block};
//!
//! assert_eq!(crc32_block(b"123456789"), 0x2DFD2D88);
//! assert_eq!(crc24q(b"123456789"), 0xCDE703);
//! ```

pub mod capabilities;
pub mod controllers;
pub mod decoder;
pub mod demux;
pub mod engine;
pub mod error;
pub mod io;
pub mod protocol;
pub mod router;
pub mod schema;

// Re-export commonly used types
pub use capabilities::Capability;
pub use controllers::{
    DeviceQuery, LogEntry, NtripClient, NtripConfig, NtripEvent, NtripState, NtripStats,
    PortConfig, QueryKind, QueryState,
};
pub use demux::{DemuxStats, Frame, StreamDemux};
pub use engine::{EngineConfig, EngineEvent, ReceiverEngine};
pub use error::{NtripError, ParseError, QueryError, SchemaError};
pub use io::{IoError, IoProvider, IoProviderExt, TcpRead, TcpSocketHandle};
pub use router::{CapabilityEvent, MessageSelector, Router, SubscriptionChange};
pub use schema::{SchemaCatalog, SchemaProvider};
