//! ReceiverEngine - single entry point for one receiver connection
//!
//! Owns one instance of every stream consumer and wires them together:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │  ReceiverEngine                                            │
//! │                                                            │
//! │  device bytes ─► StreamDemux ─┬─► Router ─► CapabilityEvent │
//! │                               ├─► DeviceQuery (text lines)  │
//! │                               └─► NtripClient (GGA lines)   │
//! │                                                            │
//! │  NtripClient ─► corrections ─► IoProvider::device_send     │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Shells feed received bytes to [`ReceiverEngine::on_device_data`] and call
//! [`ReceiverEngine::poll`] at a fixed interval; both return the events for
//! the shell to publish.

use serde::Serialize;
use std::sync::Arc;

use crate::capabilities::Capability;
use crate::controllers::{DeviceQuery, NtripClient, NtripEvent, QueryTimings};
use crate::demux::{DemuxStats, Frame, StreamDemux};
use crate::io::{IoError, IoProvider, IoProviderExt};
use crate::protocol::command::{format_log_ontime, format_unlog};
use crate::protocol::nmea;
use crate::router::{CapabilityEvent, MessageSelector, Router, SubscriptionChange};
use crate::schema::SchemaProvider;

/// Engine settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineConfig {
    /// Period of `LOG <source> ONTIME` commands issued for new subscriptions
    pub ontime_period_s: f64,
    pub query_timings: QueryTimings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ontime_period_s: 1.0,
            query_timings: QueryTimings::default(),
        }
    }
}

/// Events for the shell
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum EngineEvent {
    /// A demultiplexed frame
    Frame(Frame),
    /// A normalized capability update
    Capability(CapabilityEvent),
    /// A subscribed frame could not be decoded
    DecodeFailed { message: String },
    Ntrip(NtripEvent),
}

/// Ingestion pipeline for one receiver
pub struct ReceiverEngine {
    config: EngineConfig,
    demux: StreamDemux,
    router: Router,
    query: DeviceQuery,
    ntrip: NtripClient,
}

impl ReceiverEngine {
    pub fn new(schema: Arc<dyn SchemaProvider + Send + Sync>, config: EngineConfig) -> Self {
        Self {
            config,
            demux: StreamDemux::new(),
            router: Router::new(schema),
            query: DeviceQuery::new(config.query_timings),
            ntrip: NtripClient::new(),
        }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn query(&mut self) -> &mut DeviceQuery {
        &mut self.query
    }

    pub fn ntrip(&mut self) -> &mut NtripClient {
        &mut self.ntrip
    }

    pub fn demux_stats(&self) -> DemuxStats {
        self.demux.stats()
    }

    /// Process bytes received from the device
    pub fn on_device_data<I: IoProvider>(&mut self, io: &mut I, data: &[u8]) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        for frame in self.demux.feed(data) {
            if let Frame::Text(line) = &frame {
                self.query.on_line(io, line);
                if self.ntrip.wants_gga() && nmea::is_gga(line) {
                    self.ntrip.set_gga(line);
                }
            }
            let routed = self.router.route(&frame);
            events.push(EngineEvent::Frame(frame));
            match routed {
                Ok(capabilities) => {
                    events.extend(capabilities.into_iter().map(EngineEvent::Capability))
                }
                Err(e) => {
                    io.debug(&format!("[engine] Decode failed: {}", e));
                    events.push(EngineEvent::DecodeFailed {
                        message: e.to_string(),
                    });
                }
            }
        }
        events
    }

    /// Advance controller timers
    pub fn poll<I: IoProvider>(&mut self, io: &mut I) -> Vec<EngineEvent> {
        self.query.poll(io);
        self.ntrip
            .poll(io)
            .into_iter()
            .map(EngineEvent::Ntrip)
            .collect()
    }

    /// Subscribe a capability; the first subscriber of a source enables its log
    pub fn subscribe<I: IoProvider>(
        &mut self,
        io: &mut I,
        capability: Capability,
        selector: impl Into<MessageSelector>,
        source: &str,
    ) -> Result<SubscriptionChange, IoError> {
        let selector = selector.into();
        let change = self.router.subscribe(capability, selector.clone(), source);
        if change == SubscriptionChange::Activated {
            let command = format_log_ontime(source, self.config.ontime_period_s);
            io.info(&format!("[engine] {} -> {}", capability, command));
            if let Err(e) = io.device_send_line(&command) {
                self.router.unsubscribe(capability, selector, source);
                return Err(e);
            }
            self.query.invalidate_loglist();
        }
        Ok(change)
    }

    /// Drop a subscription; the last subscriber of a source disables its log
    pub fn unsubscribe<I: IoProvider>(
        &mut self,
        io: &mut I,
        capability: Capability,
        selector: impl Into<MessageSelector>,
        source: &str,
    ) -> Result<SubscriptionChange, IoError> {
        let selector = selector.into();
        let change = self.router.unsubscribe(capability, selector.clone(), source);
        if change == SubscriptionChange::Deactivated {
            let command = format_unlog(source);
            io.info(&format!("[engine] {} -> {}", capability, command));
            if let Err(e) = io.device_send_line(&command) {
                // The log is still enabled on the receiver
                self.router.subscribe(capability, selector, source);
                return Err(e);
            }
            self.query.invalidate_loglist();
        }
        Ok(change)
    }

    /// Cancel pending queries and close the caster session
    pub fn shutdown<I: IoProvider>(&mut self, io: &mut I) {
        self.query.shutdown(io);
        self.ntrip.shutdown(io);
        self.demux.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::NtripConfig;
    use crate::decoder::tests::bestpos_payload;
    use crate::decoder::FieldValue;
    use crate::io::mock::MockIo;
    use crate::protocol::binary::build_frame;
    use crate::schema::catalog::tests::TEST_CATALOG;
    use crate::schema::SchemaCatalog;
    use futures::FutureExt;

    const GGA: &str = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47";

    fn engine() -> ReceiverEngine {
        let catalog = SchemaCatalog::from_json(TEST_CATALOG).unwrap();
        ReceiverEngine::new(Arc::new(catalog), EngineConfig::default())
    }

    #[test]
    fn test_subscribe_sends_log_on_first_subscriber_only() {
        let mut io = MockIo::new();
        let mut engine = engine();
        assert_eq!(
            engine.subscribe(&mut io, Capability::Position, 42u16, "BESTPOSB"),
            Ok(SubscriptionChange::Activated)
        );
        assert_eq!(
            engine.subscribe(&mut io, Capability::Time, 42u16, "BESTPOSB"),
            Ok(SubscriptionChange::Unchanged)
        );
        assert_eq!(io.device_lines(), vec!["LOG BESTPOSB ONTIME 1"]);

        engine
            .unsubscribe(&mut io, Capability::Time, 42u16, "BESTPOSB")
            .unwrap();
        assert_eq!(io.device_writes.len(), 1);
        assert_eq!(
            engine.unsubscribe(&mut io, Capability::Position, 42u16, "BESTPOSB"),
            Ok(SubscriptionChange::Deactivated)
        );
        assert_eq!(io.device_lines()[1], "UNLOG BESTPOSB");
        assert_eq!(engine.router().active_count(), 0);
    }

    #[test]
    fn test_subscribe_rolls_back_on_send_failure() {
        let mut io = MockIo::new();
        io.device_fail = true;
        let mut engine = engine();
        assert!(engine
            .subscribe(&mut io, Capability::Position, 42u16, "BESTPOSB")
            .is_err());
        assert_eq!(engine.router().ref_count(42u16, "BESTPOSB"), 0);
    }

    #[test]
    fn test_unsubscribe_restores_count_on_send_failure() {
        let mut io = MockIo::new();
        let mut engine = engine();
        engine
            .subscribe(&mut io, Capability::Position, 42u16, "BESTPOSB")
            .unwrap();

        io.device_fail = true;
        assert!(engine
            .unsubscribe(&mut io, Capability::Position, 42u16, "BESTPOSB")
            .is_err());
        assert_eq!(engine.router().ref_count(42u16, "BESTPOSB"), 1);
        assert_eq!(engine.router().active_count(), 1);

        io.device_fail = false;
        assert_eq!(
            engine.unsubscribe(&mut io, Capability::Position, 42u16, "BESTPOSB"),
            Ok(SubscriptionChange::Deactivated)
        );
        assert_eq!(io.device_lines(), vec!["LOG BESTPOSB ONTIME 1", "UNLOG BESTPOSB"]);
    }

    #[test]
    fn test_binary_frame_routed_to_capability() {
        let mut io = MockIo::new();
        let mut engine = engine();
        engine
            .subscribe(&mut io, Capability::Position, 42u16, "BESTPOS")
            .unwrap();

        let events = engine.on_device_data(&mut io, &build_frame(42, &bestpos_payload()));
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], EngineEvent::Frame(Frame::Binary(f)) if f.id == 42 && f.crc_ok));
        let EngineEvent::Capability(position) = &events[1] else {
            panic!("expected capability event, got {:?}", events[1]);
        };
        assert_eq!(position.capability, Capability::Position);
        assert_eq!(position.fields["status"], FieldValue::Text("SOL_COMPUTED".into()));
    }

    #[test]
    fn test_decode_failure_reported() {
        let mut io = MockIo::new();
        let mut engine = engine();
        engine
            .subscribe(&mut io, Capability::Position, 42u16, "BESTPOS")
            .unwrap();
        let events = engine.on_device_data(&mut io, &build_frame(42, &[0u8; 8]));
        assert!(matches!(events.last(), Some(EngineEvent::DecodeFailed { .. })));
    }

    #[test]
    fn test_text_lines_reach_device_query() {
        let mut io = MockIo::new();
        let mut engine = engine();
        let pending = engine.query().request_comconfig(&mut io);
        engine.on_device_data(&mut io, b"<OK\r\n[COM1]COM1 115200 N 8 1 N CTS ON IN:AUTO OUT:BYNAV\r\n");
        io.advance(300);
        engine.poll(&mut io);
        let ports = pending.now_or_never().unwrap().unwrap();
        assert_eq!(ports[0].name, "COM1");
        assert_eq!(ports[0].out_mode, "BYNAV");
    }

    #[test]
    fn test_gga_harvested_for_caster() {
        let mut io = MockIo::new();
        let mut engine = engine();
        let mut config = NtripConfig::new("caster.example", "MOUNT");
        config.auto_gga = true;
        let _connected = engine.ntrip().connect(&mut io, config);
        engine.poll(&mut io);
        let socket = io.last_socket();
        io.push_inbound(socket, b"ICY 200 OK\r\n\r\n");
        let events = engine.poll(&mut io);
        assert!(matches!(events[0], EngineEvent::Ntrip(NtripEvent::Connected { .. })));

        engine.on_device_data(&mut io, format!("{}\r\n", GGA).as_bytes());
        let before = io.sent_text(socket).len();
        io.advance(1000);
        engine.poll(&mut io);
        assert_eq!(&io.sent_text(socket)[before..], format!("{}\r\n", GGA));
    }

    #[test]
    fn test_gga_not_harvested_without_auto_gga() {
        let mut io = MockIo::new();
        let mut engine = engine();
        let _connected = engine
            .ntrip()
            .connect(&mut io, NtripConfig::new("caster.example", "MOUNT"));
        engine.on_device_data(&mut io, format!("{}\r\n", GGA).as_bytes());
        assert_eq!(engine.ntrip().stats(0).last_gga, None);
    }

    #[test]
    fn test_shutdown_cancels_query() {
        let mut io = MockIo::new();
        let mut engine = engine();
        let pending = engine.query().request_loglist(&mut io);
        engine.shutdown(&mut io);
        assert_eq!(
            pending.now_or_never(),
            Some(Err(crate::error::QueryError::Cancelled))
        );
    }
}
