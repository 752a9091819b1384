//! Receiver adapter: async shell around [`ReceiverEngine`].
//!
//! Feeds bytes from the receiver link into the engine, polls its timers at a
//! fixed interval and writes every event through [`EventOutput`]. Runs as a
//! tokio-graceful-shutdown subsystem.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  ReceiverAdapter (async)                     │
//! │  ┌────────────────────────────────────────┐  │
//! │  │  ReceiverEngine (sync, poll-based)     │  │
//! │  └────────────────────────────────────────┘  │
//! │                    │                         │
//! │                    ▼                         │
//! │  ┌────────────────────────────────────────┐  │
//! │  │  TokioIoProvider                       │  │
//! │  └────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────┘
//! ```

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use gnsslink_core::controllers::{NtripState, QueryKind};
use gnsslink_core::io::TcpRead;
use gnsslink_core::{EngineConfig, NtripError, ReceiverEngine, SchemaCatalog};
use std::io::{Stdout, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_graceful_shutdown::SubsystemHandle;

use crate::output::{EventOutput, QueryOutput};
use crate::tokio_io::TokioIoProvider;
use crate::Cli;

const RECV_BUFFER_SIZE: usize = 4096;

/// Outcome of a request issued at startup
enum Completion {
    Output(QueryOutput),
    Connect(Result<(), NtripError>),
}

type Pending = FuturesUnordered<BoxFuture<'static, Completion>>;

/// Drives one receiver and its correction stream
pub struct ReceiverAdapter<W: Write = Stdout> {
    engine: ReceiverEngine,
    io: TokioIoProvider,
    args: Cli,
    output: EventOutput<W>,
    pending: Pending,
    /// Subscriptions and queries have been sent to the receiver
    commands_issued: bool,
    poll_interval: Duration,
    buf: Vec<u8>,
}

impl ReceiverAdapter {
    pub fn new(args: Cli, schema: SchemaCatalog) -> Self {
        let output = EventOutput::stdout(args.output);
        Self::with_output(args, schema, output)
    }
}

impl<W: Write> ReceiverAdapter<W> {
    pub fn with_output(args: Cli, schema: SchemaCatalog, output: EventOutput<W>) -> Self {
        let config = EngineConfig {
            ontime_period_s: args.log_period,
            ..EngineConfig::default()
        };
        Self {
            engine: ReceiverEngine::new(Arc::new(schema), config),
            io: TokioIoProvider::new(),
            poll_interval: Duration::from_millis(args.poll_ms.max(1)),
            args,
            output,
            pending: FuturesUnordered::new(),
            commands_issued: false,
            buf: vec![0u8; RECV_BUFFER_SIZE],
        }
    }

    pub fn output(&self) -> &EventOutput<W> {
        &self.output
    }

    /// Open the receiver link and start the caster requests
    pub async fn start(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if let Some(address) = self.args.device.clone() {
            self.io.open_device(&address).await?;
        } else {
            log::info!("No receiver configured");
        }

        let Some(config) = self.args.ntrip_config() else {
            return Ok(());
        };
        if self.args.sourcetable {
            let table = self.engine.ntrip().fetch_source_table(&mut self.io, &config);
            self.pending.push(
                async move {
                    Completion::Output(match table.await {
                        Ok(mountpoints) => QueryOutput::SourceTable { mountpoints },
                        Err(e) => QueryOutput::QueryFailed {
                            query: "SOURCETABLE".to_string(),
                            message: e.to_string(),
                        },
                    })
                }
                .boxed(),
            );
        }
        if config.mountpoint.is_empty() {
            if !self.args.sourcetable {
                log::warn!("Caster given without --mountpoint; not streaming corrections");
            }
            return Ok(());
        }
        log::info!(
            "Connecting to caster {}:{} mountpoint '{}'",
            config.host,
            config.port,
            config.mountpoint
        );
        let connect = self.engine.ntrip().connect(&mut self.io, config);
        self.pending
            .push(async move { Completion::Connect(connect.await) }.boxed());
        Ok(())
    }

    /// Send subscriptions and queries once the receiver can take commands
    fn issue_commands(&mut self) {
        for spec in self.args.subscribe.clone() {
            match self.engine.subscribe(
                &mut self.io,
                spec.capability,
                spec.selector.clone(),
                &spec.source,
            ) {
                Ok(change) => log::info!(
                    "Subscribed {} to {} from {}: {:?}",
                    spec.capability,
                    spec.selector,
                    spec.source,
                    change
                ),
                Err(e) => log::warn!(
                    "Cannot enable {} for {}: {}",
                    spec.source,
                    spec.capability,
                    e
                ),
            }
        }

        for kind in self.args.query.clone().into_iter().map(QueryKind::from) {
            let query = self.engine.query();
            let future = match kind {
                QueryKind::Comconfig => query
                    .request_comconfig(&mut self.io)
                    .map(move |r| ports_output(kind, r))
                    .boxed(),
                QueryKind::Icomconfig => query
                    .request_icomconfig(&mut self.io)
                    .map(move |r| ports_output(kind, r))
                    .boxed(),
                QueryKind::Loglist => query
                    .request_loglist(&mut self.io)
                    .map(move |r| match r {
                        Ok(logs) => Completion::Output(QueryOutput::Logs { logs }),
                        Err(e) => Completion::Output(QueryOutput::failed(kind, e)),
                    })
                    .boxed(),
            };
            self.pending.push(future);
        }
        self.commands_issued = true;
    }

    /// Read everything the receiver has sent; false once the link is closed
    fn receive(&mut self) -> bool {
        if !self.io.has_device() {
            return true;
        }
        loop {
            match self.io.device_recv(&mut self.buf) {
                TcpRead::Data(n) => {
                    let events = self.engine.on_device_data(&mut self.io, &self.buf[..n]);
                    for event in &events {
                        self.output.emit(event);
                    }
                }
                TcpRead::Empty => return true,
                TcpRead::Closed => return false,
            }
        }
    }

    /// One poll cycle; false when the receiver link was lost
    pub fn step(&mut self) -> bool {
        if !self.receive() {
            return false;
        }
        if !self.commands_issued && self.io.device_ready() {
            self.issue_commands();
        }
        self.io.poll_connects();
        for event in self.engine.poll(&mut self.io) {
            self.output.emit(&event);
        }
        true
    }

    fn on_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Output(output) => self.output.emit(&output),
            Completion::Connect(Ok(())) => log::info!("Caster accepted the stream"),
            Completion::Connect(Err(e)) => log::warn!("Caster connection failed: {}", e),
        }
    }

    /// Nothing left to do without a receiver link
    fn is_idle(&mut self) -> bool {
        !self.io.has_device()
            && self.pending.is_empty()
            && self.engine.ntrip().state() == NtripState::Disconnected
    }

    fn shutdown(&mut self) {
        self.engine.shutdown(&mut self.io);
        let stats = self.engine.demux_stats();
        log::info!(
            "Receiver stream: {} binary, {} RTCM, {} text frames, {} CRC failures, {} bytes discarded",
            stats.binary_frames,
            stats.rtcm_frames,
            stats.text_lines,
            stats.crc_failures,
            stats.discarded_bytes
        );
    }

    /// Run the adapter until shutdown is requested or the receiver goes away
    pub async fn run(
        mut self,
        subsys: SubsystemHandle,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        W: Send,
    {
        log::info!("ReceiverAdapter: Starting");
        self.start().await?;

        let mut poll_timer = interval(self.poll_interval);
        poll_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = subsys.on_shutdown_requested() => {
                    log::info!("ReceiverAdapter: Shutdown requested");
                    break;
                }
                _ = poll_timer.tick() => {
                    if !self.step() {
                        log::warn!("ReceiverAdapter: Receiver closed the connection");
                        subsys.request_shutdown();
                        break;
                    }
                }
                Some(completion) = self.pending.next(), if !self.pending.is_empty() => {
                    self.on_completion(completion);
                }
            }
            if self.is_idle() {
                log::info!("ReceiverAdapter: Nothing left to do");
                subsys.request_shutdown();
                break;
            }
        }

        self.shutdown();
        log::info!("ReceiverAdapter: Finished");
        Ok(())
    }
}

fn ports_output(
    kind: QueryKind,
    result: Result<Vec<gnsslink_core::PortConfig>, gnsslink_core::QueryError>,
) -> Completion {
    Completion::Output(match result {
        Ok(ports) => QueryOutput::Ports {
            query: kind.log_name().to_string(),
            ports,
        },
        Err(e) => QueryOutput::failed(kind, e),
    })
}
