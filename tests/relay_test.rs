//! Relay engine scenarios: fluff fan-out, stem forwarding, mapping
//! stability, and covert noise channels, driven through a real registry
//! with capturing endpoints.

use nocturne::bytes::ByteSlice;
use nocturne::net::{
    CommandsHandler, ConnectionContext, Endpoint, Header, LevinHandler, NetworkZone, Registry,
    HEADER_SIZE, PACKET_BEGIN,
};
use nocturne::relay::{parse_tx_payload, CoreEvents, RelayNotifier, NOTIFY_NEW_TRANSACTIONS};
use nocturne::{NetConfig, RelayConfig, RelayMethod, TxBlob};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

struct SinkEndpoint {
    sent: Mutex<Vec<ByteSlice>>,
    fail_sends: AtomicBool,
}

impl SinkEndpoint {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
        })
    }

    fn take_sent(&self) -> Vec<ByteSlice> {
        std::mem::take(&mut self.sent.lock().unwrap())
    }

    fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

impl Endpoint for SinkEndpoint {
    fn queue_send(&self, message: ByteSlice) -> bool {
        if self.fail_sends.load(Ordering::Acquire) {
            return false;
        }
        self.sent.lock().unwrap().push(message);
        true
    }

    fn close(&self) {}

    fn request_callback(&self) {}
}

struct NullCommands;

impl CommandsHandler for NullCommands {
    fn invoke(&self, _command: u32, _payload: &[u8], _ctx: &mut ConnectionContext) -> (i32, Vec<u8>) {
        (1, Vec::new())
    }

    fn notify(&self, _command: u32, _payload: &[u8], _ctx: &mut ConnectionContext) {}

    fn on_connection_new(&self, _ctx: &ConnectionContext) {}

    fn on_connection_close(&self, _ctx: &ConnectionContext) {}

    fn handshake_complete(&self, _ctx: &ConnectionContext) -> bool {
        true
    }
}

#[derive(Default)]
struct TestCore {
    relayed: Mutex<Vec<(usize, RelayMethod)>>,
}

impl CoreEvents for TestCore {
    fn is_synchronized(&self) -> bool {
        true
    }

    fn get_current_blockchain_height(&self) -> u64 {
        0
    }

    fn on_transactions_relayed(&self, txs: &[TxBlob], method: RelayMethod) {
        self.relayed.lock().unwrap().push((txs.len(), method));
    }
}

struct Peer {
    id: Uuid,
    endpoint: Arc<SinkEndpoint>,
    // keeps the registry's weak reference alive
    _handler: Arc<LevinHandler>,
}

fn add_peer(registry: &Arc<Registry>, incoming: bool) -> Peer {
    let ctx = ConnectionContext::new("5.6.7.8:18080".parse().unwrap(), incoming);
    let endpoint = SinkEndpoint::new();
    let handler = LevinHandler::new(registry.clone(), endpoint.clone(), ctx);
    assert!(registry.register(&handler));
    Peer {
        id: handler.connection_id(),
        endpoint,
        _handler: handler,
    }
}

fn test_registry() -> Arc<Registry> {
    Registry::new(Arc::new(NullCommands), NetConfig::default())
}

/// Let spawned relay tasks (epoch rotation, flush, noise) run
async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

fn decode_notify(message: &ByteSlice) -> nocturne::relay::NewTransactions {
    let header = Header::parse(message.as_bytes()).unwrap();
    assert_eq!(header.command, NOTIFY_NEW_TRANSACTIONS);
    parse_tx_payload(&message.as_bytes()[HEADER_SIZE..]).unwrap()
}

async fn notifier_with(
    registry: &Arc<Registry>,
    core: &Arc<TestCore>,
    zone: NetworkZone,
    noise: bool,
    config: RelayConfig,
    peers: &[Peer],
) -> RelayNotifier {
    let notifier = RelayNotifier::new(registry.clone(), core.clone(), zone, noise, config);
    for peer in peers {
        let incoming = peer
            ._handler
            .context_snapshot()
            .is_incoming;
        notifier.on_handshake_complete(peer.id, incoming).await;
    }
    // pick up the first epoch (map + channel bindings)
    notifier.run_epoch();
    settle().await;
    notifier
}

#[tokio::test(start_paused = true)]
async fn fluff_fans_out_sorted_to_everyone_but_the_source() {
    let registry = test_registry();
    let core = Arc::new(TestCore::default());
    let peers: Vec<Peer> = (0..10).map(|i| add_peer(&registry, i < 5)).collect();

    let config = RelayConfig {
        pad_txs: false,
        ..Default::default()
    };
    let notifier =
        notifier_with(&registry, &core, NetworkZone::Public, false, config, &peers).await;

    let tx_a = vec![0xbbu8; 40];
    let tx_b = vec![0xaau8; 40];
    let source = peers[0].id;
    assert!(
        notifier
            .send_txs(vec![tx_a.clone(), tx_b.clone()], source, RelayMethod::Fluff)
            .await
    );

    notifier.run_fluff();
    settle().await;

    for (index, peer) in peers.iter().enumerate() {
        let sent = peer.endpoint.take_sent();
        if peer.id == source {
            assert!(sent.is_empty(), "source must not receive its own txs");
            continue;
        }
        assert_eq!(sent.len(), 1, "peer {index} got {} messages", sent.len());
        let decoded = decode_notify(&sent[0]);
        // sorted ascending so receive order does not leak
        assert_eq!(
            decoded.txs.clone().into_inner(),
            vec![tx_b.clone(), tx_a.clone()]
        );
        assert!(decoded.dandelionpp_fluff);
        assert!(decoded.padding.is_empty());
    }

    let relayed = core.relayed.lock().unwrap();
    assert_eq!(relayed.as_slice(), &[(2, RelayMethod::Fluff)]);
}

#[tokio::test(start_paused = true)]
async fn stem_forwards_to_exactly_one_outbound_peer() {
    let registry = test_registry();
    let core = Arc::new(TestCore::default());
    let peers: Vec<Peer> = (0..10).map(|i| add_peer(&registry, i < 5)).collect();

    // probability zero: every epoch is a stem epoch
    let config = RelayConfig {
        fluff_probability: 0,
        ..Default::default()
    };
    let notifier =
        notifier_with(&registry, &core, NetworkZone::Public, false, config, &peers).await;

    let tx = vec![0x42u8; 64];
    let source = peers[0].id;
    assert!(notifier.send_txs(vec![tx.clone()], source, RelayMethod::Stem).await);
    settle().await;

    let mut receivers = Vec::new();
    for peer in &peers {
        let sent = peer.endpoint.take_sent();
        if !sent.is_empty() {
            assert_eq!(sent.len(), 1);
            let decoded = decode_notify(&sent[0]);
            assert_eq!(decoded.txs.clone().into_inner(), vec![tx.clone()]);
            assert!(!decoded.dandelionpp_fluff, "stem sends are not fluff");
            receivers.push(peer);
        }
    }
    assert_eq!(receivers.len(), 1, "stem must reach exactly one peer");
    let receiver = receivers[0];
    assert_ne!(receiver.id, source);
    assert!(!receiver._handler.context_snapshot().is_incoming);

    assert_eq!(
        core.relayed.lock().unwrap().as_slice(),
        &[(1, RelayMethod::Stem)]
    );
}

#[tokio::test(start_paused = true)]
async fn stem_mapping_is_stable_within_an_epoch() {
    let registry = test_registry();
    let core = Arc::new(TestCore::default());
    let peers: Vec<Peer> = (0..10).map(|i| add_peer(&registry, i < 5)).collect();

    let config = RelayConfig {
        fluff_probability: 0,
        ..Default::default()
    };
    let notifier =
        notifier_with(&registry, &core, NetworkZone::Public, false, config, &peers).await;

    let source = peers[0].id;
    notifier.send_txs(vec![vec![1u8; 32]], source, RelayMethod::Stem).await;
    notifier.send_txs(vec![vec![2u8; 32]], source, RelayMethod::Stem).await;
    settle().await;

    let receivers: Vec<usize> = peers
        .iter()
        .enumerate()
        .filter_map(|(index, peer)| {
            let count = peer.endpoint.sent_count();
            (count > 0).then_some((index, count))
        })
        .map(|(index, count)| {
            assert_eq!(count, 2, "both txs must ride the same stem");
            index
        })
        .collect();
    assert_eq!(receivers.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn stem_falls_back_to_fluff_when_no_outbound_peers() {
    let registry = test_registry();
    let core = Arc::new(TestCore::default());
    // incoming connections only: no stem candidates
    let peers: Vec<Peer> = (0..4).map(|_| add_peer(&registry, true)).collect();

    let config = RelayConfig {
        fluff_probability: 0,
        ..Default::default()
    };
    let notifier =
        notifier_with(&registry, &core, NetworkZone::Public, false, config, &peers).await;

    let source = peers[0].id;
    notifier.send_txs(vec![vec![7u8; 16]], source, RelayMethod::Stem).await;
    notifier.run_fluff();
    settle().await;

    // stem marked first, then the fallback fluff
    let relayed = core.relayed.lock().unwrap().clone();
    assert_eq!(
        relayed.as_slice(),
        &[(1, RelayMethod::Stem), (1, RelayMethod::Fluff)]
    );
    let delivered = peers.iter().filter(|p| p.endpoint.sent_count() > 0).count();
    assert_eq!(delivered, 3, "fluffed to everyone but the source");
}

#[tokio::test(start_paused = true)]
async fn non_public_zone_fluffs_outbound_only() {
    let registry = test_registry();
    let core = Arc::new(TestCore::default());
    let peers: Vec<Peer> = (0..6).map(|i| add_peer(&registry, i < 3)).collect();

    let notifier = notifier_with(
        &registry,
        &core,
        NetworkZone::Tor,
        false,
        RelayConfig::default(),
        &peers,
    )
    .await;

    let source = peers[5].id;
    notifier
        .send_txs(vec![vec![9u8; 24]], source, RelayMethod::Fluff)
        .await;
    notifier.run_fluff();
    settle().await;

    for (index, peer) in peers.iter().enumerate() {
        let expect = index >= 3 && peer.id != source;
        assert_eq!(
            peer.endpoint.sent_count() > 0,
            expect,
            "peer {index} direction/source filtering"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn noise_channels_mask_real_traffic() {
    let registry = test_registry();
    let core = Arc::new(TestCore::default());
    let peers: Vec<Peer> = (0..2).map(|_| add_peer(&registry, false)).collect();

    let config = RelayConfig {
        noise_channels: 2,
        noise_bytes: 2048,
        ..Default::default()
    };
    let notifier = notifier_with(
        &registry,
        &core,
        NetworkZone::Tor,
        true,
        config,
        &peers,
    )
    .await;
    let (has_noise, filled) = notifier.get_status();
    assert!(has_noise);
    assert!(filled, "both channels should have a connection bound");

    // idle channels emit pure noise frames
    notifier.run_stems();
    settle().await;
    for peer in &peers {
        let sent = peer.endpoint.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].len(), 2048);
        let header = Header::parse(sent[0].as_bytes()).unwrap();
        assert!(header.is_noise());
    }

    // queue a real batch large enough to need several fragments
    let tx = vec![0x5au8; 4000];
    assert!(
        notifier
            .send_txs(vec![tx], Uuid::new_v4(), RelayMethod::Local)
            .await
    );
    assert_eq!(
        core.relayed.lock().unwrap().as_slice(),
        &[(1, RelayMethod::Local)]
    );

    // the next frame on every channel is the chain start, same size as noise
    notifier.run_stems();
    settle().await;
    for peer in &peers {
        let sent = peer.endpoint.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].len(), 2048, "covert frames match the noise size");
        let header = Header::parse(sent[0].as_bytes()).unwrap();
        assert_eq!(header.flags, PACKET_BEGIN);
        assert_eq!(header.command, 0);
    }

    // remaining fragments drain on the following intervals
    notifier.run_stems();
    settle().await;
    for peer in &peers {
        let sent = peer.endpoint.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].len(), 2048);
    }
}

#[tokio::test(start_paused = true)]
async fn oversized_covert_batch_is_refused() {
    let registry = test_registry();
    let core = Arc::new(TestCore::default());
    let peers: Vec<Peer> = (0..2).map(|_| add_peer(&registry, false)).collect();

    let config = RelayConfig {
        noise_bytes: 2048,
        max_fragments: 2,
        ..Default::default()
    };
    let notifier = notifier_with(
        &registry,
        &core,
        NetworkZone::Tor,
        true,
        config,
        &peers,
    )
    .await;

    // two fragments of 2048 cannot carry 8 KiB of tx data
    let ok = notifier
        .send_txs(vec![vec![1u8; 8192]], Uuid::new_v4(), RelayMethod::Fluff)
        .await;
    assert!(!ok);
}

#[tokio::test(start_paused = true)]
async fn epoch_rotation_can_move_the_stem() {
    let registry = test_registry();
    let core = Arc::new(TestCore::default());
    let peers: Vec<Peer> = (0..8).map(|i| add_peer(&registry, i < 4)).collect();

    let config = RelayConfig {
        fluff_probability: 0,
        stem_count: 1,
        ..Default::default()
    };
    let notifier =
        notifier_with(&registry, &core, NetworkZone::Public, false, config, &peers).await;

    let source = peers[0].id;
    // stem destinations across epochs must always be outbound peers
    for _ in 0..5 {
        notifier.send_txs(vec![vec![3u8; 16]], source, RelayMethod::Stem).await;
        notifier.run_epoch();
        settle().await;
    }
    for (index, peer) in peers.iter().enumerate() {
        if peer.endpoint.sent_count() > 0 {
            assert!(index >= 4, "stem landed on an incoming peer");
        }
    }
}
