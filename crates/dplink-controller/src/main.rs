//! dplink-sim: drives the connection controller against simulated hardware.
//!
//! Loads the controller configuration, attaches a number of simulated links
//! and walks each one through a full plug cycle:
//!
//! ```text
//! main()
//!  └─ HotplugDispatcher::new()   -- registry, ledger, queue worker
//!  └─ per connection
//!       ├─ hpd high + configure  -- connect task, notification
//!       ├─ enable_stream         -- ledger admission, HDCP poll
//!       ├─ hdcp_status_changed   -- engine reports Authenticated
//!       └─ simulate(HpdLow)      -- synchronous teardown
//! ```
//!
//! Status is printed after the streams are up and again after unplug.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use dplink_controller::application::connection::StreamRequest;
use dplink_controller::application::dispatcher::{
    ControllerStatus, HotplugDispatcher, SimulatedEvent,
};
use dplink_controller::application::registry::ConnectionRegistry;
use dplink_controller::infrastructure::simulated::{AckPolicy, SimulatedHardware};
use dplink_controller::infrastructure::storage::config::{self, ControllerConfig};
use dplink_core::{ConnectionId, HdcpState, ResourceLedger, ResourceRequest, StreamId};

#[derive(Debug, Parser)]
#[command(name = "dplink-sim", version, about = "Simulated display-link plug cycles")]
struct Args {
    /// Config file.  Defaults to the platform config directory.
    #[arg(long, env = "DPLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Number of simulated links to attach.
    #[arg(long, default_value_t = 1)]
    connections: usize,

    /// Delay before the simulated compositor acknowledges a hotplug event.
    #[arg(long)]
    ack_delay_ms: Option<u64>,

    /// Attach MST-capable links with an MST sink.
    #[arg(long)]
    mst: bool,

    /// Print status as JSON instead of text.
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct Report {
    streaming: ControllerStatus,
    unplugged: ControllerStatus,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut cfg = match &args.config {
        Some(path) => config::load_config_from(path)?,
        None => config::load_config().unwrap_or_else(|e| {
            eprintln!("config unavailable ({e}); using defaults");
            ControllerConfig::default()
        }),
    };
    if args.mst {
        cfg.mst.enabled = true;
    }

    // Level is overridden by `RUST_LOG`.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&cfg.controller.log_level)),
        )
        .init();

    info!("dplink-sim starting");

    let timing = cfg.timing();
    let ledger = Arc::new(ResourceLedger::new(cfg.capacity()));
    let dispatcher = HotplugDispatcher::new(Arc::new(ConnectionRegistry::new()), ledger, timing);
    let options = cfg.connection_options();

    let mut links = Vec::new();
    for _ in 0..args.connections {
        let sim = if options.mst_capable {
            SimulatedHardware::with_mst()
        } else {
            SimulatedHardware::new()
        };
        if let Some(ms) = args.ack_delay_ms {
            sim.compositor
                .set_policy(AckPolicy::Delayed(Duration::from_millis(ms)));
        }
        let id = ConnectionId::new();
        let connection = dispatcher.attach(id, sim.hardware(), options);
        connection.set_hpd(true, false);
        links.push((id, sim));
    }

    // ── Plug ──────────────────────────────────────────────────────────────────
    for (id, _) in &links {
        dispatcher.configure(*id).await?;
    }
    dispatcher.settle().await;

    // ── Streams ───────────────────────────────────────────────────────────────
    let request = StreamRequest {
        id: StreamId(0),
        panel: 0,
        resources: ResourceRequest {
            mixers: 1,
            compression_blocks: 0,
            compression_capable: true,
            merge_capable: false,
        },
        slot_count: if options.mst_capable { 8 } else { 0 },
    };
    for (id, _) in &links {
        match dispatcher.enable_stream(*id, request).await {
            Ok(grant) => info!(conn = %id, ?grant, "stream admitted"),
            Err(e) => warn!(conn = %id, "stream rejected: {e}"),
        }
    }

    // Let the first HDCP poll run, then report the engine's verdict.
    tokio::time::sleep(timing.hdcp_poll_after_enable()).await;
    dispatcher.settle().await;
    for (id, _) in &links {
        dispatcher
            .hdcp_status_changed(*id, HdcpState::Authenticated)
            .await?;
    }
    let streaming = dispatcher.status_all().await;

    // ── Unplug ────────────────────────────────────────────────────────────────
    for (id, _) in &links {
        dispatcher.simulate(*id, SimulatedEvent::HpdLow).await?;
    }
    dispatcher.settle().await;
    let unplugged = dispatcher.status_all().await;

    for (id, sim) in &links {
        info!(conn = %id, events = ?sim.compositor.events(), "compositor events");
    }
    dispatcher.shutdown().await;

    if args.json {
        let report = Report {
            streaming,
            unplugged,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_status("streaming", &streaming);
        print_status("unplugged", &unplugged);
    }

    info!("dplink-sim stopped");
    Ok(())
}

fn print_status(title: &str, status: &ControllerStatus) {
    println!("== {title} ==");
    for conn in &status.connections {
        println!("{}  [{}]", conn.id, conn.facets);
        println!("    hdcp    {}", conn.hdcp);
        println!(
            "    mst     {}  free slots {}",
            conn.mst_active, conn.mst_free_slots
        );
        for stream in &conn.streams {
            println!(
                "    {}  vc={} slots={}+{}",
                stream.id, stream.virtual_channel, stream.start_slot, stream.slot_count
            );
        }
    }
    println!(
        "ledger  mixers {}/{}  compression {}/{}",
        status.ledger.in_use.mixers,
        status.ledger.capacity.mixers,
        status.ledger.in_use.compression_blocks,
        status.ledger.capacity.compression_blocks,
    );
}
