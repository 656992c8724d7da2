//! Levin transport: framing, per-connection protocol handlers, the
//! connection registry, and the TCP/TLS server tier

pub mod buffer;
pub mod handler;
pub mod levin;
pub mod registry;
pub mod server;
pub mod throttle;
pub mod tls;
pub mod types;

// Re-exports
pub use buffer::Buffer;
pub use handler::{
    CommandsHandler, Endpoint, InvokeCallback, InvokeError, InvokeResult, LevinHandler,
    ProtocolError,
};
pub use levin::{
    make_fragmented_notify, make_noise_notify, Header, MessageWriter, HEADER_SIZE,
    LEVIN_PROTOCOL_VERSION, LEVIN_SIGNATURE, PACKET_BEGIN, PACKET_END, PACKET_REQUEST,
    PACKET_RESPONSE,
};
pub use registry::Registry;
pub use server::{ConnectionManager, NetError};
pub use throttle::{RateLimits, Throttle};
pub use tls::{SslMode, TlsContext};
pub use types::{
    ConnectionContext, ConnectionState, NetworkZone, COMMAND_HANDSHAKE, MIN_BYTES_WANTED,
};
