pub mod bytes;
pub mod config;
pub mod net;
pub mod relay;
pub mod types;

pub use bytes::{ByteSlice, ByteStream};
pub use config::{NetConfig, RelayConfig};
pub use net::{
    CommandsHandler, ConnectionContext, ConnectionManager, NetworkZone, Registry,
};
pub use relay::{CoreEvents, RelayNotifier};
pub use types::{RelayMethod, TxBlob};
