//! driftd: the node daemon. Binds the UDP transport, assembles the core
//! (peer registry, RPC client, stream tables, log store), and runs the
//! dispatch loop, the background pinger, and the periodic checkpointer.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use drift_config::logging::{init_logging, LogLevel};
use drift_config::Config;
use drift_daemon::server::Service;
use drift_daemon::transport::UdpTransport;
use drift_lfs::{Geometry, Lfs, LfsTuning};
use drift_proto::{FileId, HandleKind, PrefixAnswer};
use drift_recov::{run_pinger, PeerRegistry, RegistryTuning};
use drift_rpc::{ClientProbe, RpcClient, RpcTuning};
use drift_stream::{IoHandleTable, ServerStreamTable};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "driftd")]
#[command(version, about = "drift node daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (default)
    Start,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging(LogLevel::Info);

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Start) {
        Commands::Start => start_daemon().await?,
    }
    Ok(())
}

/// Our boot generation: the boot timestamp, so every restart advances it.
fn boot_gen_from_clock() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(1)
        .max(1)
}

async fn start_daemon() -> Result<()> {
    let config = Config::load().context("loading configuration")?;
    let local_host = config.host_id();
    let boot_gen = boot_gen_from_clock();
    info!(component = "DAEMON", host = local_host, boot_gen, "driftd starting");

    // Transport first: everything else hangs off the socket.
    let socket = Arc::new(
        UdpSocket::bind(&config.node.bind)
            .await
            .with_context(|| format!("binding {}", config.node.bind))?,
    );
    let mut peer_addrs: HashMap<u32, SocketAddr> = HashMap::new();
    for peer in &config.node.peers {
        let addr = peer
            .addr
            .parse()
            .with_context(|| format!("peer {} address {}", peer.id, peer.addr))?;
        peer_addrs.insert(peer.id, addr);
    }
    let transport = UdpTransport::new(Arc::clone(&socket), peer_addrs);

    // The registry and the RPC client reference each other through the
    // probe seam; bind it after both exist.
    let probe = ClientProbe::unbound();
    let registry = PeerRegistry::new(
        RegistryTuning::from_config(&config),
        probe.clone() as Arc<dyn drift_recov::Probe>,
    );
    let client = RpcClient::new(
        RpcTuning::from_config(&config),
        transport,
        registry.clone(),
        boot_gen,
    );
    probe.bind(client.clone());

    // Storage. A missing store directory is formatted on first start.
    let store_dir = config.store_path().to_path_buf();
    let lfs_tuning = LfsTuning {
        dirty_threshold: config.lfs.dirty_threshold(),
        clean_range_low: config.lfs.clean_range_low,
        max_desc: 1024,
    };
    let lfs = if store_dir.join("superblock.bin").exists() {
        Arc::new(Lfs::attach(&store_dir, lfs_tuning).context("attaching store")?)
    } else {
        info!(component = "DAEMON", dir = %store_dir.display(), "formatting new store");
        Arc::new(
            Lfs::format(
                &store_dir,
                Geometry {
                    segment_count: config.lfs.segment_count,
                    segment_size: config.lfs.segment_size,
                    block_size: config.lfs.block_size,
                },
                lfs_tuning,
            )
            .context("formatting store")?,
        )
    };

    // The I/O-server role: handle and stream bookkeeping plus the
    // prefixes this node serves.
    let handles = Arc::new(IoHandleTable::new());
    let server_streams = Arc::new(ServerStreamTable::new());
    let mut prefixes = HashMap::new();
    prefixes.insert(
        "/".to_string(),
        PrefixAnswer {
            prefix: "/".to_string(),
            server: local_host,
            root: FileId {
                server: local_host,
                kind: HandleKind::LocalFile,
                major: 0,
                minor: 0,
            },
        },
    );

    let service = Service::new(
        local_host,
        boot_gen,
        registry.clone(),
        client.clone(),
        handles,
        server_streams,
        prefixes,
    );

    // Background work: the dispatch loop, the pinger, the checkpointer.
    let dispatch = tokio::spawn(Arc::clone(&service).run(Arc::clone(&socket)));
    let pinger = tokio::spawn(run_pinger(registry.clone()));
    let checkpointer = {
        let lfs = Arc::clone(&lfs);
        let registry = registry.clone();
        let interval = config.lfs.checkpoint_interval();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if registry.is_shutting_down() {
                    return;
                }
                if let Err(e) = lfs.checkpoint() {
                    warn!(component = "DAEMON", error = %e, "periodic checkpoint failed");
                }
            }
        })
    };

    service.enabled.store(true, Ordering::SeqCst);
    drift_config::log_daemon_info!("service enabled");

    signal::ctrl_c().await.context("waiting for shutdown signal")?;
    drift_config::log_daemon_info!("shutting down");
    registry.shutdown();

    // Clean shutdown takes a final checkpoint.
    if let Err(e) = lfs.checkpoint() {
        warn!(component = "DAEMON", error = %e, "shutdown checkpoint failed");
    }

    dispatch.abort();
    pinger.abort();
    checkpointer.abort();
    Ok(())
}
