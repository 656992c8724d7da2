//! Privacy-preserving transaction relay (Dandelion++ and noise channels)

pub mod dandelion;
pub mod message;
pub mod notify;
pub mod timing;

use crate::types::{RelayMethod, TxBlob};

/// Hooks into the node core consumed by the relay engine
pub trait CoreEvents: Send + Sync {
    fn is_synchronized(&self) -> bool;
    fn get_current_blockchain_height(&self) -> u64;
    /// Observe a relay decision; the mempool uses this to track embargo
    /// state for stem transactions
    fn on_transactions_relayed(&self, txs: &[TxBlob], method: RelayMethod);
}

// Re-exports
pub use dandelion::ConnectionMap;
pub use message::{
    make_tx_payload, parse_tx_payload, NewTransactions, Padding, TxList, MAX_TXS_PER_MESSAGE,
    NOTIFY_NEW_TRANSACTIONS,
};
pub use notify::RelayNotifier;
pub use timing::PoissonQuarters;
