// Nocturne Network Layer — Constants and Types
// Distributed under the MIT software license.

//! Transport constants and per-connection metadata.
//!
//! # Design goals
//!
//! 1. **Bounded memory usage** — packet sizes, queues and reassembly
//!    buffers all have explicit limits; the pre-handshake limit is much
//!    lower than the post-handshake one.
//!
//! 2. **No cross-connection blast radius** — protocol violations terminate
//!    the offending connection only; errors never propagate to peers.

use std::net::{IpAddr, SocketAddr};
use uuid::Uuid;

// =============================================================================
// PROTOCOL IDENTIFICATION
// =============================================================================

/// Base id for p2p commands; the handshake is the first of the pool.
pub const P2P_COMMANDS_POOL_BASE: u32 = 1000;

/// Handshake command id. Completing it raises the packet-size limit.
pub const COMMAND_HANDSHAKE: u32 = P2P_COMMANDS_POOL_BASE + 1;

// =============================================================================
// FLOW CONTROL
// =============================================================================

/// Bytes read from a socket per pass before yielding back to the runtime.
pub const READ_CHUNK_SIZE: usize = 8192;

/// Grace period for draining the in-flight write when a close is requested.
pub const SHUTDOWN_GRACE_SECS: u64 = 5;

/// A partial invoke response only resets the front waiter's timer when the
/// newly arrived chunk is at least this large. Smaller drips from an idle
/// peer keep the timeout ticking.
pub const MIN_BYTES_WANTED: usize = 512;

// =============================================================================
// ZONES
// =============================================================================

/// Network plane a connection belongs to. Each zone has its own connection
/// set and its own relay state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkZone {
    /// Clearnet ipv4/ipv6
    Public,
    /// Tor hidden service
    Tor,
    /// I2P
    I2p,
}

impl NetworkZone {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkZone::Public => "public",
            NetworkZone::Tor => "tor",
            NetworkZone::I2p => "i2p",
        }
    }
}

// =============================================================================
// CONNECTION CONTEXT
// =============================================================================

/// Lifecycle of a connection as visible to the commands handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket open, handshake not yet completed
    Init,
    /// Handshake completed
    Ready,
    /// Close requested, draining
    Closing,
    /// Socket gone, handler released
    Terminated,
}

/// Per-connection metadata passed to commands-handler callbacks and used
/// as the key throughout the registry and relay layers.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub id: Uuid,
    pub remote_addr: SocketAddr,
    pub is_incoming: bool,
    pub state: ConnectionState,
    /// Unix seconds when the connection was established
    pub started: u64,
    pub recv_bytes: u64,
    pub sent_bytes: u64,
    pub recv_count: u64,
    pub sent_count: u64,
    /// Blockchain height the peer last reported; stem candidates must be
    /// at least at our own height
    pub remote_height: u64,
}

impl ConnectionContext {
    pub fn new(remote_addr: SocketAddr, is_incoming: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            remote_addr,
            is_incoming,
            state: ConnectionState::Init,
            started: crate::types::now(),
            recv_bytes: 0,
            sent_bytes: 0,
            recv_count: 0,
            sent_count: 0,
            remote_height: 0,
        }
    }

    /// Placeholder context for a connection id that is no longer resolvable
    pub fn unknown(id: Uuid) -> Self {
        let mut ctx = Self::new(SocketAddr::from(([0, 0, 0, 0], 0)), false);
        ctx.id = id;
        ctx
    }

    pub fn on_recv(&mut self, bytes: usize) {
        self.recv_bytes = self.recv_bytes.saturating_add(bytes as u64);
        self.recv_count += 1;
    }

    pub fn on_sent(&mut self, bytes: usize) {
        self.sent_bytes = self.sent_bytes.saturating_add(bytes as u64);
        self.sent_count += 1;
    }

    pub fn ip(&self) -> IpAddr {
        self.remote_addr.ip()
    }
}
