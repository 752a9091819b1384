//! JSON line output of engine events and query results

use gnsslink_core::controllers::{LogEntry, PortConfig, QueryKind};
use gnsslink_core::protocol::ntrip::MountPoint;
use serde::Serialize;
use std::io::Write;

/// Results of one-shot requests issued from the command line
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum QueryOutput {
    Ports {
        query: String,
        ports: Vec<PortConfig>,
    },
    Logs {
        logs: Vec<LogEntry>,
    },
    #[serde(rename_all = "camelCase")]
    QueryFailed {
        query: String,
        message: String,
    },
    SourceTable {
        mountpoints: Vec<MountPoint>,
    },
}

impl QueryOutput {
    pub fn failed(kind: QueryKind, message: impl ToString) -> Self {
        QueryOutput::QueryFailed {
            query: kind.log_name().to_string(),
            message: message.to_string(),
        }
    }
}

/// Writes one JSON document per line
pub struct EventOutput<W: Write = std::io::Stdout> {
    enabled: bool,
    writer: W,
}

impl EventOutput {
    pub fn stdout(enabled: bool) -> Self {
        Self {
            enabled,
            writer: std::io::stdout(),
        }
    }
}

impl<W: Write> EventOutput<W> {
    pub fn new(enabled: bool, writer: W) -> Self {
        Self { enabled, writer }
    }

    pub fn emit<T: Serialize>(&mut self, value: &T) {
        let json = match serde_json::to_string(value) {
            Ok(json) => json,
            Err(e) => {
                log::warn!("Cannot serialize event: {}", e);
                return;
            }
        };
        if !self.enabled {
            log::debug!("{}", json);
            return;
        }
        if let Err(e) = writeln!(self.writer, "{}", json) {
            log::warn!("Cannot write event: {}", e);
        }
    }

    pub fn get_ref(&self) -> &W {
        &self.writer
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}
