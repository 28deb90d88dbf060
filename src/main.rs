//! meshcheck - Mesh Network Diagnostic Dashboard
//!
//! Runs ping and CoAP diagnostic batches against a roster of mesh devices, streams the
//! results to the browser as they arrive, and writes a report when each batch ends.

mod catalog;
mod config;
mod probe;
mod report;
mod roster;
mod run;
mod web;

use config::ServerConfig;
use probe::{CommandProbe, ProbeCommands};
use report::FsReportStore;
use roster::{default_devices, MeshRoster, TopologySource};
use run::{spawn_run_log_writer, ControllerSettings, EventBus, RunController, RunLogs};
use web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("meshcheck=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting meshcheck on port {}...", cfg.http_port);
    tracing::info!("Writing reports to {}", cfg.reports_dir.display());

    // Device roster
    let devices = match &cfg.roster_path {
        Some(path) => {
            tracing::info!("Loading roster from {}", path.display());
            MeshRoster::load_devices(path)?
        }
        None => default_devices(),
    };
    let topology = TopologySource::new(&cfg.topology_cmd, cfg.topology_timeout);
    let roster = Arc::new(MeshRoster::new(devices, Some(topology.clone()))?);
    tracing::info!("Roster has {} devices", roster.devices().len());

    let probe = Arc::new(CommandProbe::new(ProbeCommands {
        ping: cfg.ping_cmd.clone(),
        coap_client: cfg.coap_cmd.clone(),
    }));
    let reports = Arc::new(FsReportStore::new(&cfg.reports_dir));

    // Events fan out to the browser and to the run logs
    let bus = EventBus::new();
    let logs = Arc::new(RunLogs::new(&cfg.logs_dir));
    spawn_run_log_writer(bus.subscribe(), logs.clone());

    let controller = RunController::new(
        roster,
        probe,
        reports,
        Arc::new(bus.clone()),
        ControllerSettings {
            pause_poll: cfg.pause_poll,
            report_formats: cfg.report_formats.clone(),
            exclusive: cfg.exclusive_runs,
        },
    );

    // Start web server
    let server = Server::new(cfg, controller, bus, logs, topology);
    server.start().await?;

    Ok(())
}
