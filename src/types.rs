//! Shared types used across the transport and relay layers

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix time in seconds
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Raw transaction bytes, opaque to the transport
pub type TxBlob = Vec<u8>;

/// How a transaction entered (or should leave) this node.
///
/// The relay engine only distinguishes these on the send side; the mempool
/// (outside this crate) uses them to track embargo state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayMethod {
    /// Do not relay
    None,
    /// Created locally, never seen on the wire
    Local,
    /// Received from a stem peer, forward in stem phase
    Forward,
    /// Stem phase relay
    Stem,
    /// Broadcast to all peers
    Fluff,
    /// Seen only in a block, do not relay
    Block,
}
