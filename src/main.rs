//! # vendlink
//!
//! Vending fleet device channel server: wires settings, telemetry, the
//! record store and the direct transport together, then serves until Ctrl-C.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use vendlink_core::SystemClock;
use vendlink_server::{InMemoryMachineStore, MachineStore, ReqwestTransport, Services, VendServer};
use vendlink_settings::{LogFormat, VendlinkSettings};

/// Bound on waiting for in-flight dispense attempts at shutdown.
const DISPATCH_DRAIN_TIMEOUT: Duration = Duration::from_secs(6);

/// Vending fleet device health and command channel.
#[derive(Parser, Debug)]
#[command(name = "vendlink", version, about = "Vending fleet device channel server")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file. Defaults to `~/.vendlink/settings.json` when present.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Log level or `tracing` filter directive.
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format: `compact` or `json`.
    #[arg(long)]
    log_format: Option<String>,

    /// JSON file seeding the machine record store.
    #[arg(long)]
    machines_file: Option<PathBuf>,
}

impl Cli {
    /// Apply flags on top of loaded settings.
    fn apply(&self, settings: &mut VendlinkSettings) -> Result<()> {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        if let Some(format) = &self.log_format {
            settings.logging.format = LogFormat::parse(format)
                .with_context(|| format!("unknown log format '{format}'"))?;
        }
        if let Some(path) = &self.machines_file {
            settings.store.machines_file = Some(path.clone());
        }
        Ok(())
    }
}

fn open_store(settings: &VendlinkSettings) -> Result<Arc<dyn MachineStore>> {
    let store = match &settings.store.machines_file {
        Some(path) => InMemoryMachineStore::from_file(path)
            .with_context(|| format!("Failed to load machines from {}", path.display()))?,
        None => {
            tracing::warn!("no machines file configured; dispatch will reject every machine");
            InMemoryMachineStore::new()
        }
    };
    Ok(Arc::new(store.with_event_capacity(settings.events.capacity)))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let mut settings = vendlink_settings::load_settings(args.config.as_deref())
        .context("Failed to load settings")?;
    args.apply(&mut settings)?;
    settings.validate().context("Invalid settings")?;

    vendlink_telemetry::init_subscriber(&settings.logging.level, settings.logging.format);

    let metrics = match vendlink_telemetry::metrics::install_recorder() {
        Ok(handle) => handle,
        Err(e) => {
            tracing::warn!(error = %e, "metrics recorder unavailable, /metrics will be empty");
            vendlink_telemetry::metrics::detached_handle()
        }
    };

    let store = open_store(&settings)?;
    let transport = Arc::new(ReqwestTransport::new(&settings.dispatch));
    let services = Services::build(&settings, store, transport, Arc::new(SystemClock));
    let server = VendServer::new(settings.server.clone(), services, metrics);

    let heartbeat = server
        .services()
        .heartbeat(&settings.heartbeat)
        .spawn(server.shutdown().token());

    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    tracing::info!("vendlink listening on http://{addr} (ws://{addr}/ws)");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("shutting down");
    server.shutdown().shutdown();
    if !server.services().dispatcher.drain(DISPATCH_DRAIN_TIMEOUT).await {
        tracing::warn!("some dispense attempts were still running at shutdown");
    }
    let _ = server
        .shutdown()
        .graceful_shutdown(vec![heartbeat, handle], None)
        .await;

    tracing::info!("shutdown complete");
    Ok(())
}
