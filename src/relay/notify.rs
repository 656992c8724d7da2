// Nocturne Relay — Dandelion++ and covert noise channels
// Distributed under the MIT software license.

//! Per-zone transaction relay.
//!
//! Public zones run Dandelion++: each epoch is either a stem epoch
//! (forward to one mapped peer) or a fluff epoch (queue on every
//! connection behind a Poisson delay). Zones with noise enabled instead
//! emit fixed-size frames on a randomized cadence per channel; real
//! messages ride inside those frames, so path observers see a constant
//! shape either way.
//!
//! Zone state lives behind one async mutex (the zone "strand"); each
//! noise channel has its own. Timer tasks take the relevant lock when
//! they fire, so no two mutations of the same state ever run in
//! parallel.

use crate::bytes::ByteSlice;
use crate::config::RelayConfig;
use crate::net::levin::{make_fragmented_notify, make_noise_notify};
use crate::net::registry::Registry;
use crate::net::types::NetworkZone;
use crate::relay::dandelion::ConnectionMap;
use crate::relay::message::{make_tx_payload, NOTIFY_NEW_TRANSACTIONS};
use crate::relay::timing::{epoch_duration, random_duration, PoissonQuarters};
use crate::relay::CoreEvents;
use crate::types::{RelayMethod, TxBlob};
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Per-connection fluff queue
struct FluffContext {
    txs: Vec<TxBlob>,
    flush_time: Option<Instant>,
    is_incoming: bool,
}

/// State mutated only under the zone lock
struct ZoneState {
    contexts: HashMap<Uuid, FluffContext>,
    map: ConnectionMap,
    /// Current epoch is a fluff epoch
    fluffing: bool,
    /// Deadline of the armed flush task, with a generation stamp so a
    /// superseded task can recognize itself and bail
    flush_armed: Option<(u64, Instant)>,
    flush_generation: u64,
}

/// One covert channel; only touched under its own lock
struct ChannelState {
    /// Remainder of a message currently leaving in noise-size pieces
    active: ByteSlice,
    queue: VecDeque<ByteSlice>,
    connection: Option<Uuid>,
}

struct NoiseChannel {
    state: Mutex<ChannelState>,
    /// Fires the next noise send immediately
    kick: Notify,
}

struct Zone {
    p2p: Arc<Registry>,
    core: Arc<dyn CoreEvents>,
    /// Non-empty enables covert noise for this zone
    noise: ByteSlice,
    state: Mutex<ZoneState>,
    channels: Vec<NoiseChannel>,
    /// Live stem slots after the last map change; readable anywhere
    connection_count: AtomicUsize,
    kind: NetworkZone,
    pad_txs: bool,
    config: RelayConfig,
    epoch_kick: Notify,
    fluff_kick: Notify,
    stop_rx: watch::Receiver<bool>,
}

/// Relay driver for one zone. Dropping the stop handle does not abort
/// in-flight sends; use [`RelayNotifier::stop`].
pub struct RelayNotifier {
    zone: Arc<Zone>,
    stop_tx: watch::Sender<bool>,
}

impl RelayNotifier {
    /// Spawns the epoch task and, when `enable_noise` is set, one send
    /// task per channel. Noise normally runs in tor/i2p zones only, but
    /// nothing here requires that.
    pub fn new(
        p2p: Arc<Registry>,
        core: Arc<dyn CoreEvents>,
        kind: NetworkZone,
        enable_noise: bool,
        config: RelayConfig,
    ) -> Self {
        let noise = if enable_noise {
            // a bad noise_bytes is a configuration error, fatal at init
            make_noise_notify(config.noise_bytes).expect("noise_bytes must fit a levin header")
        } else {
            ByteSlice::new()
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        let channel_count = if noise.is_empty() { 0 } else { config.noise_channels };
        let channels = (0..channel_count)
            .map(|_| NoiseChannel {
                state: Mutex::new(ChannelState {
                    active: ByteSlice::new(),
                    queue: VecDeque::new(),
                    connection: None,
                }),
                kick: Notify::new(),
            })
            .collect();

        let zone = Arc::new(Zone {
            p2p,
            core,
            noise,
            state: Mutex::new(ZoneState {
                contexts: HashMap::new(),
                map: ConnectionMap::default(),
                fluffing: false,
                flush_armed: None,
                flush_generation: 0,
            }),
            channels,
            connection_count: AtomicUsize::new(0),
            kind,
            pad_txs: config.pad_txs,
            config,
            epoch_kick: Notify::new(),
            fluff_kick: Notify::new(),
            stop_rx,
        });

        let noise_enabled = !zone.noise.is_empty();
        if noise_enabled || kind == NetworkZone::Public {
            tokio::spawn(epoch_task(zone.clone()));
            for index in 0..zone.channels.len() {
                tokio::spawn(noise_task(zone.clone(), index));
            }
        }

        Self { zone, stop_tx }
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// (noise enabled, enough live channel connections)
    pub fn get_status(&self) -> (bool, bool) {
        let has_noise = !self.zone.noise.is_empty();
        let filled =
            self.zone.config.noise_channels <= self.zone.connection_count.load(Ordering::Acquire);
        (has_noise, filled)
    }

    /// Called by the owner when an outbound connection completes; fills
    /// empty noise channels without waiting for the next epoch.
    pub async fn new_out_connection(&self) {
        let zone = &self.zone;
        if zone.noise.is_empty()
            || zone.config.noise_channels <= zone.connection_count.load(Ordering::Acquire)
        {
            return;
        }
        let outs = get_out_connections(&zone.p2p, &*zone.core);
        let mut state = zone.state.lock().await;
        update_channels(zone, &mut state, outs).await;
    }

    /// Track a connection that finished its handshake
    pub async fn on_handshake_complete(&self, id: Uuid, is_incoming: bool) {
        let mut state = self.zone.state.lock().await;
        state.contexts.insert(
            id,
            FluffContext {
                txs: Vec::new(),
                flush_time: None,
                is_incoming,
            },
        );
    }

    pub async fn on_connection_close(&self, id: Uuid) {
        let mut state = self.zone.state.lock().await;
        state.contexts.remove(&id);
    }

    /// Force the next epoch rotation now
    pub fn run_epoch(&self) {
        self.zone.epoch_kick.notify_one();
    }

    /// Force every noise channel to send now
    pub fn run_stems(&self) {
        for channel in &self.zone.channels {
            channel.kick.notify_one();
        }
    }

    /// Flush every pending fluff queue now, regardless of deadlines
    pub fn run_fluff(&self) {
        self.zone.fluff_kick.notify_one();
    }

    /// Relay `txs` from `source` (nil-less: the local node passes a fresh
    /// uuid). Returns false when the batch cannot be relayed at all.
    pub async fn send_txs(
        &self,
        txs: Vec<TxBlob>,
        source: Uuid,
        tx_relay: RelayMethod,
    ) -> bool {
        if txs.is_empty() {
            return true;
        }
        let zone = &self.zone;

        /* Noise, when enabled, takes precedence: it defeats path
           observers, and the zones it runs in (tor/i2p) already resist
           sybil adversaries because only outbound connections are used.
           Dandelion++ covers the public zone. */

        if !zone.noise.is_empty() && !zone.channels.is_empty() {
            let tx_relay = if tx_relay == RelayMethod::Stem {
                warn!("stem relay not supported over noise channels");
                RelayMethod::Local
            } else {
                tx_relay
            };
            zone.core.on_transactions_relayed(&txs, tx_relay);

            // padding is pointless here: every frame is noise-sized.
            // Sent as non-fluff so the receiver forwards in stem mode.
            let payload = make_tx_payload(txs, false, false);
            let message = match make_fragmented_notify(
                zone.noise.len(),
                NOTIFY_NEW_TRANSACTIONS,
                payload,
            ) {
                Ok(message) => message,
                Err(err) => {
                    error!("failed to build covert notify: {err}");
                    return false;
                }
            };
            if zone.config.max_fragments * zone.noise.len() < message.len() {
                error!("tx batch too large for the covert fragment cap");
                return false;
            }

            for (index, channel) in zone.channels.iter().enumerate() {
                let mut chan = channel.state.lock().await;
                if chan.connection.is_some() {
                    chan.queue.push_back(message.clone());
                } else if index == 0 && zone.connection_count.load(Ordering::Acquire) == 0 {
                    warn!(
                        "unable to send transaction(s) to {} - no available outbound connections",
                        zone.kind.as_str()
                    );
                }
            }
            return true;
        }

        match tx_relay {
            RelayMethod::None | RelayMethod::Block => false,
            RelayMethod::Stem | RelayMethod::Forward | RelayMethod::Local
                if zone.kind == NetworkZone::Public =>
            {
                let mut state = zone.state.lock().await;
                dandelionpp_notify(zone, &mut state, txs, source, tx_relay).await;
                true
            }
            relay => {
                /* A non-public zone keeps the original relay method even
                   though it uses the fluff routine: marking it fluff here
                   would make the tx externally visible immediately. */
                zone.core.on_transactions_relayed(&txs, relay);
                let mut state = zone.state.lock().await;
                fluff_notify(zone, &mut state, &txs, source).await;
                true
            }
        }
    }
}

// =============================================================================
// OUT-CONNECTION SNAPSHOTS
// =============================================================================

fn median_remote_height(p2p: &Registry) -> u64 {
    let mut heights = Vec::with_capacity(100);
    p2p.foreach_connection(|ctx| {
        if !ctx.is_incoming {
            heights.push(ctx.remote_height);
        }
        true
    });
    if heights.is_empty() {
        return 0;
    }
    heights.sort_unstable();
    let mid = heights.len() / 2;
    if heights.len() % 2 != 0 {
        heights[mid]
    } else {
        heights[mid - 1]
    }
}

fn blockchain_height(p2p: &Registry, core: &dyn CoreEvents) -> u64 {
    let local = core.get_current_blockchain_height();
    if core.is_synchronized() {
        return local;
    }
    local.max(median_remote_height(p2p))
}

/// Outbound connections eligible as stem/channel peers: a candidate must
/// be at least at our blockchain height or it would stall the relay.
fn get_out_connections(p2p: &Registry, core: &dyn CoreEvents) -> Vec<Uuid> {
    let height = blockchain_height(p2p, core);
    let mut outs = Vec::with_capacity(100);
    p2p.foreach_connection(|ctx| {
        if !ctx.is_incoming && ctx.remote_height >= height {
            outs.push(ctx.id);
        }
        true
    });
    debug!("found {} out connections at height >= {height}", outs.len());
    outs
}

fn send_tx_payload(
    p2p: &Registry,
    txs: Vec<TxBlob>,
    destination: &Uuid,
    pad: bool,
    fluff: bool,
) -> bool {
    let message = make_tx_payload(txs, pad, fluff).finalize_notify(NOTIFY_NEW_TRANSACTIONS);
    p2p.send(message, destination)
}

// =============================================================================
// ZONE STRAND OPERATIONS
// =============================================================================

/// Rebind every noise channel to its slot in the current map. A channel
/// whose peer changed drops its in-flight message: resuming the
/// remaining fragments on a new peer would reveal that the previous
/// frames carried a real notify.
async fn update_channel_bindings(zone: &Zone, state: &ZoneState) {
    zone.connection_count.store(state.map.size(), Ordering::Release);
    if zone.noise.is_empty() {
        return;
    }
    for (index, channel) in zone.channels.iter().enumerate() {
        let connection = state.map.slot(index);
        let mut chan = channel.state.lock().await;
        if chan.connection != connection {
            chan.connection = connection;
            chan.active = ByteSlice::new();
            if connection.is_none() {
                chan.queue.clear();
            }
        }
    }
}

/// Merge a fresh outbound snapshot into the zone map
async fn update_channels(zone: &Zone, state: &mut ZoneState, outs: Vec<Uuid>) {
    if state.map.update(outs) {
        update_channel_bindings(zone, state).await;
    }
}

/// Stem-or-fluff decision for a public-zone batch
async fn dandelionpp_notify(
    zone: &Arc<Zone>,
    state: &mut ZoneState,
    txs: Vec<TxBlob>,
    source: Uuid,
    tx_relay: RelayMethod,
) {
    if !state.fluffing || tx_relay == RelayMethod::Local {
        zone.core.on_transactions_relayed(&txs, RelayMethod::Stem);
        for _ in 0..2 {
            if let Some(destination) = state.map.get_stem(source) {
                if send_tx_payload(&zone.p2p, txs.clone(), &destination, zone.pad_txs, false) {
                    // source omitted from the log on purpose
                    debug!("sent {} transaction(s) to {destination} using stem", txs.len());
                    return;
                }
            }
            // connection list may be outdated, refresh and retry
            let outs = get_out_connections(&zone.p2p, &*zone.core);
            update_channels(zone, state, outs).await;
        }
        error!("unable to send transaction(s) via Dandelion++ stem");
    }

    zone.core.on_transactions_relayed(&txs, RelayMethod::Fluff);
    fluff_notify(zone, state, &txs, source).await;
}

/// Queue `txs` on every eligible connection and make sure a flush task
/// is armed for the earliest deadline.
async fn fluff_notify(zone: &Arc<Zone>, state: &mut ZoneState, txs: &[TxBlob], source: Uuid) {
    let now = Instant::now();
    let mut next_flush: Option<Instant> = None;

    let in_duration = PoissonQuarters::new(zone.config.fluff_average_in);
    let out_duration = PoissonQuarters::new(zone.config.fluff_average_out);
    let mut rng = rand::thread_rng();

    debug!("queueing {} transaction(s) for fluffing", txs.len());
    for (id, context) in state.contexts.iter_mut() {
        // over tor/i2p only outbound connections are fluffed
        if *id != source && (zone.kind == NetworkZone::Public || !context.is_incoming) {
            if context.txs.is_empty() {
                let delay = if context.is_incoming {
                    in_duration.sample(&mut rng)
                } else {
                    out_duration.sample(&mut rng)
                };
                context.flush_time = Some(now + delay);
            }
            if let Some(flush_time) = context.flush_time {
                next_flush = Some(next_flush.map_or(flush_time, |t| t.min(flush_time)));
            }
            context.txs.extend_from_slice(txs);
        }
    }

    match next_flush {
        None => warn!("unable to send transaction(s), no available connections"),
        Some(deadline) => {
            let earlier = match state.flush_armed {
                None => true,
                Some((_, armed)) => deadline < armed,
            };
            if earlier {
                arm_flush(zone, state, deadline);
            }
        }
    }
}

/// Arm (or re-arm) the single zone-wide flush task
fn arm_flush(zone: &Arc<Zone>, state: &mut ZoneState, deadline: Instant) {
    state.flush_generation += 1;
    let generation = state.flush_generation;
    state.flush_armed = Some((generation, deadline));
    tokio::spawn(flush_task(zone.clone(), generation, deadline));
}

async fn flush_task(zone: Arc<Zone>, generation: u64, deadline: Instant) {
    let mut stop = zone.stop_rx.clone();
    let forced = tokio::select! {
        _ = tokio::time::sleep_until(deadline) => false,
        _ = zone.fluff_kick.notified() => true,
        _ = stop.changed() => return,
    };

    let mut state = zone.state.lock().await;
    match state.flush_armed {
        Some((armed, _)) if armed == generation => state.flush_armed = None,
        // a newer task took over while this one slept
        _ if !forced => return,
        _ => state.flush_armed = None,
    }

    let now = Instant::now();
    let mut next_flush: Option<Instant> = None;
    let mut batches: Vec<(Vec<TxBlob>, Uuid)> = Vec::new();
    for (id, context) in state.contexts.iter_mut() {
        if context.txs.is_empty() {
            context.flush_time = None;
            continue;
        }
        match context.flush_time {
            // flush everything when triggered manually
            Some(flush_time) if flush_time <= now || forced => {
                context.flush_time = None;
                batches.push((std::mem::take(&mut context.txs), *id));
            }
            Some(flush_time) => {
                next_flush = Some(next_flush.map_or(flush_time, |t| t.min(flush_time)));
            }
            None => {}
        }
    }

    /* Always sent with the fluff flag, even over tor/i2p: the receiving
       hidden service skips its own forwarding delay and fluffs at once,
       the anonymity network replacing Dandelion++'s sybil protection. */
    for (mut txs, destination) in batches {
        txs.sort_unstable(); // don't leak receive order
        send_tx_payload(&zone.p2p, txs, &destination, zone.pad_txs, true);
    }

    if let Some(deadline) = next_flush {
        arm_flush(&zone, &mut state, deadline);
    }
}

// =============================================================================
// TIMER TASKS
// =============================================================================

/// Rotates zone state on a randomized schedule: a fresh stem map, a new
/// stem-vs-fluff coin flip, and rebound noise channels.
async fn epoch_task(zone: Arc<Zone>) {
    let mut stop = zone.stop_rx.clone();
    let noise_enabled = !zone.noise.is_empty();
    let (min_epoch, epoch_range, out_count) = if noise_enabled {
        (
            zone.config.noise_min_epoch,
            zone.config.noise_epoch_range,
            zone.config.noise_channels,
        )
    } else {
        (
            zone.config.dandelion_min_epoch,
            zone.config.dandelion_epoch_range,
            zone.config.stem_count,
        )
    };

    loop {
        let fluffing = {
            let mut rng = rand::thread_rng();
            rng.gen_range(0..100u32) < zone.config.fluff_probability
        };
        let outs = get_out_connections(&zone.p2p, &*zone.core);
        {
            let mut state = zone.state.lock().await;
            if zone.kind == NetworkZone::Public {
                debug!(
                    "starting new Dandelion++ epoch: {}",
                    if fluffing { "fluff" } else { "stem" }
                );
            }
            state.map = ConnectionMap::new(outs, out_count);
            state.fluffing = fluffing;
            update_channel_bindings(&zone, &state).await;
        }

        let wait = {
            let mut rng = rand::thread_rng();
            epoch_duration(&mut rng, min_epoch, epoch_range)
        };
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = zone.epoch_kick.notified() => {}
            _ = stop.changed() => return,
        }
    }
}

/// Emits exactly one noise-sized frame per interval on one channel:
/// a piece of the active message, the front of the queue, or pure noise.
async fn noise_task(zone: Arc<Zone>, index: usize) {
    let mut stop = zone.stop_rx.clone();
    loop {
        let wait = {
            let mut rng = rand::thread_rng();
            zone.config.noise_min_delay + random_duration(&mut rng, zone.config.noise_delay_range)
        };
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = zone.channels[index].kick.notified() => {}
            _ = stop.changed() => return,
        }

        send_noise(&zone, index).await;
    }
}

async fn send_noise(zone: &Arc<Zone>, index: usize) {
    let channel = &zone.channels[index];
    let mut chan = channel.state.lock().await;
    let Some(connection) = chan.connection else {
        return;
    };

    let message = if !chan.active.is_empty() {
        chan.active.take_prefix(zone.noise.len())
    } else if let Some(front) = chan.queue.front() {
        chan.active = front.clone();
        chan.active.take_prefix(zone.noise.len())
    } else {
        zone.noise.clone()
    };

    if zone.p2p.send(message, &connection) {
        if !chan.queue.is_empty() && chan.active.is_empty() {
            chan.queue.pop_front();
        }
    } else {
        chan.active = ByteSlice::new();
        chan.connection = None;

        let outs = get_out_connections(&zone.p2p, &*zone.core);
        if outs.is_empty() {
            warn!(
                "unable to send transaction(s) to {} - no suitable outbound connections",
                zone.kind.as_str()
            );
        }
        // posted, not run inline: the zone lock nests outside channel locks
        let zone = zone.clone();
        tokio::spawn(async move {
            let mut state = zone.state.lock().await;
            update_channels(&zone, &mut state, outs).await;
        });
    }
}
