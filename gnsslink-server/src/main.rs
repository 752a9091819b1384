use clap::Parser;
use gnsslink_server::config;
use gnsslink_server::receiver::ReceiverAdapter;
use gnsslink_server::{Cli, VERSION};
use miette::{IntoDiagnostic, Result};
use std::time::Duration;
use tokio_graceful_shutdown::{SubsystemBuilder, Toplevel};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    env_logger::Builder::new()
        .filter_level(args.verbose.log_level_filter())
        .format_timestamp_millis()
        .init();

    log::info!("gnsslink {} starting", VERSION);

    let schema = config::load_schema(args.schema.as_deref()).into_diagnostic()?;
    let adapter = ReceiverAdapter::new(args, schema);

    Toplevel::new(|s| async move {
        s.start(SubsystemBuilder::new("receiver", |subsys| adapter.run(subsys)));
    })
    .catch_signals()
    .handle_shutdown_requests(Duration::from_secs(5))
    .await
    .map_err(Into::into)
}
