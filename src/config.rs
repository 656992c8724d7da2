//! Daemon configuration for the transport and relay layers

use crate::net::tls::SslMode;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Levin wire header size, repeated here for packet-size sanity bounds
const HEADER_SIZE: u64 = 33;

/// Transport-layer configuration
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// IPv4 listen address
    pub listen_ip: IpAddr,
    /// Optional IPv6 listen address
    pub listen_ip_v6: Option<IpAddr>,
    /// Listen port (both families)
    pub listen_port: u16,
    /// Directory for the persisted TLS keypair
    pub data_dir: PathBuf,
    /// TLS policy for inbound and outbound connections
    pub ssl_mode: SslMode,
    /// Per-message cap before the handshake command completes.
    /// Kept low so a peer cannot stage large allocations pre-handshake.
    pub initial_max_packet_size: u64,
    /// Per-message cap after a completed handshake
    pub max_packet_size: u64,
    /// Default deadline for async invokes
    pub invoke_timeout: Duration,
    /// Hard cap on the per-connection outbound queue; a full queue fails
    /// the send rather than buffering without bound
    pub send_queue_max: usize,
    /// An open fragment chain older than this terminates the connection
    pub fragment_timeout: Duration,
    /// Global upload limit in bytes/sec; <= 0 disables
    pub rate_up: i64,
    /// Global download limit in bytes/sec; <= 0 disables
    pub rate_down: i64,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::from([0u8, 0, 0, 0]),
            listen_ip_v6: None,
            listen_port: 28080,
            data_dir: PathBuf::from("./data"),
            ssl_mode: SslMode::Autodetect,
            initial_max_packet_size: 256 * 1024,
            max_packet_size: 100_000_000,
            invoke_timeout: Duration::from_secs(60),
            send_queue_max: 1000,
            fragment_timeout: Duration::from_secs(60),
            rate_up: 0,
            rate_down: 0,
        }
    }
}

impl NetConfig {
    /// A packet-size cap below one header would deadlock the decoder.
    pub fn validate(&self) -> Result<(), String> {
        if self.initial_max_packet_size < HEADER_SIZE {
            return Err("initial_max_packet_size below levin header size".into());
        }
        if self.max_packet_size < self.initial_max_packet_size {
            return Err("max_packet_size below initial_max_packet_size".into());
        }
        if self.send_queue_max == 0 {
            return Err("send_queue_max must be at least 1".into());
        }
        Ok(())
    }
}

/// Dandelion++ / noise relay configuration, per zone
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Stem fan-out per epoch (public zones)
    pub stem_count: usize,
    /// Covert channel count (noise zones)
    pub noise_channels: usize,
    /// Size of one noise/covert fragment frame
    pub noise_bytes: usize,
    /// Epoch duration distribution for noise zones: min + uniform[0, range]
    pub noise_min_epoch: Duration,
    pub noise_epoch_range: Duration,
    /// Epoch duration distribution for the public zone
    pub dandelion_min_epoch: Duration,
    pub dandelion_epoch_range: Duration,
    /// Poisson mean of the fluff delay on incoming connections
    pub fluff_average_in: Duration,
    /// Poisson mean on outgoing connections. Outgoing peers are operator
    /// selected, so half the incoming average is used.
    pub fluff_average_out: Duration,
    /// Per-channel noise send interval: min + uniform[0, range]
    pub noise_min_delay: Duration,
    pub noise_delay_range: Duration,
    /// Percent chance an epoch is a global fluff epoch (public zone)
    pub fluff_probability: u32,
    /// Upper bound of fragments per covert tx message
    pub max_fragments: usize,
    /// Pad fluffed tx messages to a 1 KiB boundary
    pub pad_txs: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        let fluff_average_in = Duration::from_secs(5);
        Self {
            stem_count: 2,
            noise_channels: 2,
            noise_bytes: 3072,
            noise_min_epoch: Duration::from_secs(5 * 60),
            noise_epoch_range: Duration::from_secs(30),
            dandelion_min_epoch: Duration::from_secs(10 * 60),
            dandelion_epoch_range: Duration::from_secs(30),
            fluff_average_in,
            fluff_average_out: fluff_average_in / 2,
            noise_min_delay: Duration::from_secs(10),
            noise_delay_range: Duration::from_secs(5),
            fluff_probability: 20,
            max_fragments: 20,
            pad_txs: false,
        }
    }
}
