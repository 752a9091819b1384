//! Stateful protocol controllers driven through [`IoProvider`](crate::IoProvider)
//!
//! Both controllers share the receiver's command channel and follow the same
//! poll-based design: inputs arrive through method calls (`on_line`, `poll`),
//! timers are deadlines compared against
//! [`IoProvider::current_time_ms`](crate::IoProvider::current_time_ms), and
//! results are delivered through futures resolved from a later poll.
//!
//! | Controller | Channel | Role |
//! |------------|---------|------|
//! | [`DeviceQuery`] | device commands + text lines | COMCONFIG / ICOMCONFIG / LOGLISTA queries |
//! | [`NtripClient`] | caster TCP socket, device writes | RTCM corrections with GGA upkeep |
//!
//! ```rust,ignore
//! use gnsslink_core::controllers::{DeviceQuery, NtripClient};
//!
//! fn main_loop<I: IoProvider>(io: &mut I, query: &mut DeviceQuery, ntrip: &mut NtripClient) {
//!     let ports = query.request_comconfig(io);
//!     loop {
//!         query.poll(io);
//!         for event in ntrip.poll(io) {
//!             // Shell-specific handling
//!         }
//!     }
//! }
//! ```

pub mod device_query;
pub mod ntrip;

pub use device_query::{
    DeviceQuery, LogEntry, PendingQuery, PortConfig, QueryKind, QueryResult, QueryState,
    QueryTimings,
};
pub use ntrip::{
    NtripClient, NtripConfig, NtripEvent, NtripFuture, NtripState, NtripStats, PendingConnect,
    PendingSourceTable,
};
