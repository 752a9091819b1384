//! # gnsslink Server
//!
//! Native shell around [`gnsslink_core`]: owns the receiver transport and
//! the caster socket, drives a [`ReceiverEngine`](gnsslink_core::ReceiverEngine)
//! at a fixed poll interval and prints events as JSON lines.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    gnsslink-server                      │
//! │  ┌─────────────────────────────────────────────────────┐│
//! │  │  ReceiverAdapter (tokio-graceful-shutdown subsystem) ││
//! │  │  - subscriptions and queries from the CLI           ││
//! │  │  - JSON line output                                 ││
//! │  └─────────────────────────────────────────────────────┘│
//! │         │                                               │
//! │         ▼                                               │
//! │  ┌─────────────────────────────────────────────────────┐│
//! │  │              TokioIoProvider                        ││
//! │  │  - device link (TCP or UDP)                         ││
//! │  │  - caster TCP sockets                               ││
//! │  │  - Implements gnsslink_core::IoProvider             ││
//! │  └─────────────────────────────────────────────────────┘│
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Command-Line Interface
//!
//! See [`Cli`] for all available options. Key options:
//!
//! - `-d, --device` - Receiver address (`tcp:host:port` or `udp:bind:port`)
//! - `--caster`, `--mountpoint` - NTRIP correction source
//! - `-s, --subscribe` - `capability:selector:source`, repeatable
//! - `-q, --query` - Device configuration query, repeatable
//! - `-v` - Increase verbosity (use multiple times)

use clap::Parser;
use gnsslink_core::capabilities::Capability;
use gnsslink_core::controllers::{NtripConfig, QueryKind};
use gnsslink_core::protocol::ntrip::DEFAULT_PORT;
use gnsslink_core::router::MessageSelector;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

pub mod config;
pub mod output;
pub mod receiver;
pub mod tokio_io;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Receiver transport
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceAddress {
    /// Connect to a TCP port of the receiver
    Tcp { host: String, port: u16 },
    /// Bind locally; the receiver sends datagrams to this address
    Udp { bind: SocketAddr },
}

impl FromStr for DeviceAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once(':')
            .ok_or_else(|| format!("expected tcp:host:port or udp:address:port, got '{}'", s))?;
        match scheme.to_ascii_lowercase().as_str() {
            "tcp" => {
                let (host, port) = rest
                    .rsplit_once(':')
                    .ok_or_else(|| format!("missing port in '{}'", s))?;
                let port = port
                    .parse()
                    .map_err(|e| format!("invalid port '{}': {}", port, e))?;
                if host.is_empty() {
                    return Err(format!("missing host in '{}'", s));
                }
                Ok(DeviceAddress::Tcp {
                    host: host.to_string(),
                    port,
                })
            }
            "udp" => rest
                .parse()
                .map(|bind| DeviceAddress::Udp { bind })
                .map_err(|e| format!("invalid bind address '{}': {}", rest, e)),
            other => Err(format!("unknown transport '{}'", other)),
        }
    }
}

/// `capability:selector:source` from the command line
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionSpec {
    pub capability: Capability,
    pub selector: MessageSelector,
    pub source: String,
}

impl FromStr for SubscriptionSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        let [capability, selector, source] = parts[..] else {
            return Err(format!("expected capability:selector:source, got '{}'", s));
        };
        if selector.trim().is_empty() || source.trim().is_empty() {
            return Err(format!("empty selector or source in '{}'", s));
        }
        Ok(SubscriptionSpec {
            capability: capability.parse()?,
            selector: MessageSelector::parse(selector),
            source: source.trim().to_string(),
        })
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryArg {
    Comconfig,
    Icomconfig,
    Loglist,
}

impl From<QueryArg> for QueryKind {
    fn from(arg: QueryArg) -> Self {
        match arg {
            QueryArg::Comconfig => QueryKind::Comconfig,
            QueryArg::Icomconfig => QueryKind::Icomconfig,
            QueryArg::Loglist => QueryKind::Loglist,
        }
    }
}

#[derive(Parser, Clone, Debug)]
#[command(version, about)]
pub struct Cli {
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,

    /// Receiver address: `tcp:host:port` or `udp:bind-address:port`
    #[arg(short, long)]
    pub device: Option<DeviceAddress>,

    /// NTRIP caster as `host` or `host:port`
    #[arg(long)]
    pub caster: Option<String>,

    /// NTRIP mountpoint to stream corrections from
    #[arg(long)]
    pub mountpoint: Option<String>,

    /// NTRIP user name
    #[arg(long, env = "GNSSLINK_NTRIP_USER")]
    pub ntrip_user: Option<String>,

    /// NTRIP password
    #[arg(long, env = "GNSSLINK_NTRIP_PASSWORD", hide_env_values = true)]
    pub ntrip_password: Option<String>,

    /// Send GGA sentences from the receiver to the caster
    #[arg(long, default_value_t = false)]
    pub auto_gga: bool,

    /// Subscribe `capability:selector:source`, e.g. `position:GGA:GPGGA`
    #[arg(short, long)]
    pub subscribe: Vec<SubscriptionSpec>,

    /// Query the receiver configuration at startup
    #[arg(short, long, value_enum)]
    pub query: Vec<QueryArg>,

    /// Print the caster source table
    #[arg(long, default_value_t = false)]
    pub sourcetable: bool,

    /// Schema catalog JSON (default: schema.json in the config directory)
    #[arg(long)]
    pub schema: Option<PathBuf>,

    /// Write events as JSON lines to stdout
    #[arg(long, default_value_t = false)]
    pub output: bool,

    /// Engine poll interval in milliseconds
    #[arg(long, default_value_t = 50)]
    pub poll_ms: u64,

    /// Period in seconds of logs enabled by subscriptions
    #[arg(long, default_value_t = 1.0)]
    pub log_period: f64,
}

impl Cli {
    /// Caster settings, if a caster was given
    pub fn ntrip_config(&self) -> Option<NtripConfig> {
        let caster = self.caster.as_deref()?;
        let (host, port) = match caster.rsplit_once(':') {
            Some((host, port)) => match port.parse() {
                Ok(port) => (host, port),
                Err(_) => (caster, DEFAULT_PORT),
            },
            None => (caster, DEFAULT_PORT),
        };
        let mut config = NtripConfig::new(host, self.mountpoint.clone().unwrap_or_default());
        config.port = port;
        config.username = self.ntrip_user.clone();
        config.password = self.ntrip_password.clone();
        config.auto_gga = self.auto_gga;
        Some(config)
    }
}
