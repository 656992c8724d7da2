//! Nocturne relay daemon.
//!
//! Wires the transport and relay layers together with a minimal p2p
//! command set: a height-exchange handshake plus transaction
//! notifications. Everything consensus-shaped stays outside this binary.

use clap::Parser;
use nocturne::net::{
    CommandsHandler, ConnectionContext, ConnectionManager, NetworkZone, Registry, SslMode,
    COMMAND_HANDSHAKE,
};
use nocturne::relay::{parse_tx_payload, CoreEvents, RelayNotifier, NOTIFY_NEW_TRANSACTIONS};
use nocturne::{NetConfig, RelayConfig, RelayMethod, TxBlob};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "nocturne", version, about = "Nocturne: privacy-preserving tx relay")]
struct Args {
    /// Listen port
    #[arg(short, long, default_value = "28080")]
    port: u16,

    /// Data directory (persists the TLS keypair)
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Peers to connect to (comma-separated host:port)
    #[arg(long)]
    peers: Option<String>,

    /// TLS mode: disabled, autodetect, enabled
    #[arg(long, default_value = "autodetect")]
    ssl: SslMode,

    /// Upload limit in bytes/sec (0 = unlimited)
    #[arg(long, default_value = "0")]
    rate_up: i64,

    /// Download limit in bytes/sec (0 = unlimited)
    #[arg(long, default_value = "0")]
    rate_down: i64,

    /// Pad fluffed tx messages to a 1 KiB boundary
    #[arg(long)]
    pad_txs: bool,
}

/// Events crossing from synchronous command dispatch into async relay
enum NodeEvent {
    HandshakeComplete { id: Uuid, is_incoming: bool },
    ConnectionClosed { id: Uuid },
    Transactions { txs: Vec<TxBlob>, source: Uuid, fluff: bool },
}

/// Minimal command set: handshake (height exchange) + tx notifications
struct RelayCommands {
    events: mpsc::UnboundedSender<NodeEvent>,
    handshaken: Mutex<HashSet<Uuid>>,
    local_height: AtomicU64,
}

impl RelayCommands {
    fn new(events: mpsc::UnboundedSender<NodeEvent>) -> Self {
        Self {
            events,
            handshaken: Mutex::new(HashSet::new()),
            local_height: AtomicU64::new(0),
        }
    }

    fn mark_handshaken(&self, ctx: &ConnectionContext) {
        self.handshaken.lock().unwrap().insert(ctx.id);
        let _ = self.events.send(NodeEvent::HandshakeComplete {
            id: ctx.id,
            is_incoming: ctx.is_incoming,
        });
    }
}

impl CommandsHandler for RelayCommands {
    fn invoke(&self, command: u32, payload: &[u8], ctx: &mut ConnectionContext) -> (i32, Vec<u8>) {
        if command != COMMAND_HANDSHAKE {
            debug!("unknown invoke command {command} from {}", ctx.remote_addr);
            return (-1, Vec::new());
        }
        if let Ok(height) = postcard::from_bytes::<u64>(payload) {
            ctx.remote_height = height;
        }
        self.mark_handshaken(ctx);
        let ours = self.local_height.load(Ordering::Relaxed);
        (1, postcard::to_allocvec(&ours).unwrap_or_default())
    }

    fn notify(&self, command: u32, payload: &[u8], ctx: &mut ConnectionContext) {
        if command != NOTIFY_NEW_TRANSACTIONS {
            debug!("unknown notify command {command} from {}", ctx.remote_addr);
            return;
        }
        match parse_tx_payload(payload) {
            Ok(message) => {
                let _ = self.events.send(NodeEvent::Transactions {
                    txs: message.txs.into_inner(),
                    source: ctx.id,
                    fluff: message.dandelionpp_fluff,
                });
            }
            Err(err) => warn!("undecodable tx notification from {}: {err}", ctx.remote_addr),
        }
    }

    fn on_connection_new(&self, ctx: &ConnectionContext) {
        info!(
            "{} connection from {}",
            if ctx.is_incoming { "inbound" } else { "outbound" },
            ctx.remote_addr
        );
    }

    fn on_connection_close(&self, ctx: &ConnectionContext) {
        info!("connection closed: {}", ctx.remote_addr);
        self.handshaken.lock().unwrap().remove(&ctx.id);
        let _ = self.events.send(NodeEvent::ConnectionClosed { id: ctx.id });
    }

    fn handshake_complete(&self, ctx: &ConnectionContext) -> bool {
        self.handshaken.lock().unwrap().contains(&ctx.id)
    }

    fn max_bytes(&self, command: u32) -> u64 {
        match command {
            COMMAND_HANDSHAKE => 1024,
            _ => 100_000_000,
        }
    }
}

/// The daemon carries no chain; report synchronized at height zero so
/// every outbound peer qualifies as a stem candidate.
struct NullCore;

impl CoreEvents for NullCore {
    fn is_synchronized(&self) -> bool {
        true
    }

    fn get_current_blockchain_height(&self) -> u64 {
        0
    }

    fn on_transactions_relayed(&self, txs: &[TxBlob], method: RelayMethod) {
        debug!("{} transaction(s) relayed as {:?}", txs.len(), method);
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("nocturne=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    let net_config = NetConfig {
        listen_port: args.port,
        data_dir: args.data_dir.clone(),
        ssl_mode: args.ssl,
        rate_up: args.rate_up,
        rate_down: args.rate_down,
        ..Default::default()
    };
    let relay_config = RelayConfig {
        pad_txs: args.pad_txs,
        ..Default::default()
    };

    info!("Nocturne v{VERSION} starting on port {}", args.port);

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let commands = Arc::new(RelayCommands::new(event_tx));
    let registry = Registry::new(commands.clone(), net_config);

    let manager = match ConnectionManager::new(registry.clone()) {
        Ok(manager) => manager,
        Err(err) => {
            error!("failed to initialize network: {err}");
            return;
        }
    };
    if let Err(err) = manager.listen().await {
        error!("failed to bind listeners: {err}");
        return;
    }

    let notifier = Arc::new(RelayNotifier::new(
        registry.clone(),
        Arc::new(NullCore),
        NetworkZone::Public,
        false,
        relay_config,
    ));

    // command dispatch runs sync, relay calls are async; bridge here
    let relay = notifier.clone();
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                NodeEvent::HandshakeComplete { id, is_incoming } => {
                    relay.on_handshake_complete(id, is_incoming).await;
                    if !is_incoming {
                        relay.new_out_connection().await;
                    }
                }
                NodeEvent::ConnectionClosed { id } => relay.on_connection_close(id).await,
                NodeEvent::Transactions { txs, source, fluff } => {
                    if let Some(first) = txs.first() {
                        debug!(
                            "relaying {} tx(s), head {}",
                            txs.len(),
                            hex::encode(&first[..first.len().min(8)])
                        );
                    }
                    let method = if fluff { RelayMethod::Fluff } else { RelayMethod::Stem };
                    relay.send_txs(txs, source, method).await;
                }
            }
        }
    });

    // outbound peers: connect, then handshake
    let seeds: Vec<SocketAddr> = args
        .peers
        .map(|list| {
            list.split(',')
                .filter_map(|peer| peer.trim().parse().ok())
                .collect()
        })
        .unwrap_or_default();
    for addr in seeds {
        let manager = manager.clone();
        let registry = registry.clone();
        let commands = commands.clone();
        tokio::spawn(async move {
            match manager.connect(addr, Duration::from_secs(10), None, false).await {
                Ok(id) => {
                    let height = commands.local_height.load(Ordering::Relaxed);
                    let mut writer = nocturne::net::MessageWriter::new();
                    writer.write(&postcard::to_allocvec(&height).unwrap_or_default());
                    match registry.invoke(&id, COMMAND_HANDSHAKE, writer, None).await {
                        Ok((_code, payload)) => {
                            if let Ok(height) = postcard::from_bytes::<u64>(&payload) {
                                if let Some(mut ctx) = snapshot_context(&registry, &id) {
                                    ctx.remote_height = height;
                                    registry.update_context(ctx);
                                }
                            }
                            if let Some(ctx) = snapshot_context(&registry, &id) {
                                commands.mark_handshaken(&ctx);
                            }
                        }
                        Err(err) => warn!("handshake with {addr} failed: {err}"),
                    }
                }
                Err(err) => warn!("connect to {addr} failed: {err}"),
            }
        });
    }

    // status printer
    {
        let registry = registry.clone();
        manager.add_idle_task("status", Duration::from_secs(30), move || {
            info!(
                "status: {} peers ({} in / {} out)",
                registry.connection_count(),
                registry.incoming_count(),
                registry.outgoing_count()
            );
            true
        });
    }

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down...");
    notifier.stop();
    manager.send_stop_signal();
    if !manager.timed_wait_server_stop(Duration::from_secs(10)).await {
        warn!("shutdown deadline expired with tasks still running");
    }
}

fn snapshot_context(registry: &Registry, id: &Uuid) -> Option<ConnectionContext> {
    let mut found = None;
    registry.for_connection(id, |ctx| {
        found = Some(ctx.clone());
        true
    });
    found
}
