//! TCP accept/connect tier and the per-connection read/write pumps.
//!
//! Each connection runs two tasks: the read pump feeds the protocol
//! handler and the write pump drains a bounded outbound queue. The
//! handler's receive path, deferred callbacks, and heartbeat all run on
//! the read pump, so per-connection work is serialized without locks
//! beyond the handler's own.

use crate::bytes::ByteSlice;
use crate::config::NetConfig;
use crate::net::handler::{Endpoint, LevinHandler};
use crate::net::registry::Registry;
use crate::net::throttle::RateLimits;
use crate::net::tls::{SslMode, TlsContext, TlsError, TLS_HANDSHAKE_BYTE};
use crate::net::types::{ConnectionContext, READ_CHUNK_SIZE, SHUTDOWN_GRACE_SECS};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_rustls::rustls::pki_types::ServerName;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error("connect timed out")]
    Timeout,
    #[error("server is stopping")]
    Stopped,
    #[error("bad configuration: {0}")]
    Config(String),
}

/// Socket stream regardless of TLS wrapping
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

type IoStream = Box<dyn AsyncStream>;

/// Owns listeners, the global throttles, and every connection task.
pub struct ConnectionManager {
    registry: Arc<Registry>,
    limits: Arc<RateLimits>,
    tls: Option<TlsContext>,
    config: NetConfig,
    stop_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(registry: Arc<Registry>) -> Result<Arc<Self>, NetError> {
        let config = registry.net_config().clone();
        config.validate().map_err(NetError::Config)?;

        let tls = match config.ssl_mode {
            SslMode::Disabled => None,
            _ => Some(TlsContext::init(&config.data_dir)?),
        };
        let (stop_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            registry,
            limits: Arc::new(RateLimits::new(config.rate_up, config.rate_down)),
            tls,
            config,
            stop_tx,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn limits(&self) -> &Arc<RateLimits> {
        &self.limits
    }

    /// Bind the configured listeners and start accepting
    pub async fn listen(self: &Arc<Self>) -> Result<(), NetError> {
        let addr = SocketAddr::new(self.config.listen_ip, self.config.listen_port);
        let listener = TcpListener::bind(addr).await?;
        info!("listening on {}", listener.local_addr()?);
        self.spawn_accept_loop(listener);

        if let Some(ip_v6) = self.config.listen_ip_v6 {
            let listener = TcpListener::bind(SocketAddr::new(ip_v6, self.config.listen_port)).await?;
            info!("listening on {}", listener.local_addr()?);
            self.spawn_accept_loop(listener);
        }
        Ok(())
    }

    fn spawn_accept_loop(self: &Arc<Self>, listener: TcpListener) {
        let manager = self.clone();
        let mut stop = self.stop_tx.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            let manager = manager.clone();
                            tokio::spawn(async move {
                                if let Err(err) = manager.handle_incoming(stream, addr).await {
                                    debug!("inbound connection from {addr} failed: {err}");
                                }
                            });
                        }
                        Err(err) => {
                            // transient accept errors (EMFILE etc.) must not kill the loop
                            warn!("accept failed: {err}");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    },
                }
            }
        });
        self.tasks.lock().unwrap().push(handle);
    }

    async fn handle_incoming(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), NetError> {
        stream.set_nodelay(true).ok();
        let io: IoStream = match self.config.ssl_mode {
            SslMode::Disabled => Box::new(stream),
            SslMode::Enabled => {
                let tls = self.tls.as_ref().expect("tls context exists when enabled");
                Box::new(tls.acceptor.accept(stream).await?)
            }
            SslMode::Autodetect => {
                let mut first = [0u8; 1];
                let peeked = stream.peek(&mut first).await?;
                if peeked == 1 && first[0] == TLS_HANDSHAKE_BYTE {
                    let tls = self.tls.as_ref().expect("tls context exists when autodetect");
                    Box::new(tls.acceptor.accept(stream).await?)
                } else {
                    Box::new(stream)
                }
            }
        };
        self.spawn_connection(io, addr, true);
        Ok(())
    }

    /// Establish an outbound connection; returns its connection id
    pub async fn connect(
        self: &Arc<Self>,
        addr: SocketAddr,
        timeout: Duration,
        bind_ip: Option<IpAddr>,
        ssl: bool,
    ) -> Result<Uuid, NetError> {
        if *self.stop_tx.subscribe().borrow() {
            return Err(NetError::Stopped);
        }

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if let Some(ip) = bind_ip {
            socket.bind(SocketAddr::new(ip, 0))?;
        }

        let stream = tokio::time::timeout(timeout, socket.connect(addr))
            .await
            .map_err(|_| NetError::Timeout)??;
        stream.set_nodelay(true).ok();

        let use_tls = match self.config.ssl_mode {
            SslMode::Disabled => false,
            SslMode::Enabled => true,
            SslMode::Autodetect => ssl,
        };
        let io: IoStream = if use_tls {
            let tls = self.tls.as_ref().ok_or(NetError::Config("ssl disabled".into()))?;
            let name = ServerName::IpAddress(addr.ip().into());
            Box::new(tls.connector.connect(name, stream).await?)
        } else {
            Box::new(stream)
        };

        Ok(self.spawn_connection(io, addr, false))
    }

    fn spawn_connection(self: &Arc<Self>, io: IoStream, addr: SocketAddr, incoming: bool) -> Uuid {
        let ctx = ConnectionContext::new(addr, incoming);
        let id = ctx.id;

        let (send_tx, send_rx) = mpsc::channel(self.config.send_queue_max);
        let (callback_tx, callback_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = watch::channel(false);
        let endpoint = Arc::new(ConnEndpoint {
            send_tx,
            callback_tx,
            closed: AtomicBool::new(false),
            close_tx,
        });

        let handler = LevinHandler::new(self.registry.clone(), endpoint.clone(), ctx);
        if !self.registry.register(&handler) {
            // duplicate uuid; practically unreachable
            warn!("connection id collision, dropping {addr}");
            return id;
        }
        debug!(
            "{} connection established: {addr} ({id})",
            if incoming { "inbound" } else { "outbound" }
        );

        let (read_half, write_half) = tokio::io::split(io);
        let stop = self.stop_tx.subscribe();
        tokio::spawn(write_pump(
            write_half,
            send_rx,
            endpoint.clone(),
            close_rx.clone(),
            self.limits.clone(),
            stop.clone(),
        ));
        tokio::spawn(read_pump(
            read_half,
            handler,
            endpoint,
            callback_rx,
            close_rx,
            self.limits.clone(),
            self.registry.clone(),
            stop,
        ));
        id
    }

    /// Register a periodic job on the shared pool. The job stops when it
    /// returns false or the stop signal fires.
    pub fn add_idle_task(
        self: &Arc<Self>,
        name: &'static str,
        period: Duration,
        mut job: impl FnMut() -> bool + Send + 'static,
    ) {
        let mut stop = self.stop_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = ticker.tick() => {
                        if !job() {
                            debug!("idle task {name} finished");
                            break;
                        }
                    }
                }
            }
        });
        self.tasks.lock().unwrap().push(handle);
    }

    /// Break accept loops and signal every pump to wind down
    pub fn send_stop_signal(&self) {
        info!("stop signal sent");
        let _ = self.stop_tx.send(true);
    }

    /// Wait for the owned tasks to finish, with a deadline.
    /// Returns false when the deadline expired first.
    pub async fn timed_wait_server_stop(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().unwrap());
        for handle in handles {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, handle).await.is_err() {
                return false;
            }
        }
        true
    }
}

/// Connection-facing endpoint handed to the protocol handler
struct ConnEndpoint {
    send_tx: mpsc::Sender<ByteSlice>,
    callback_tx: mpsc::UnboundedSender<()>,
    closed: AtomicBool,
    close_tx: watch::Sender<bool>,
}

impl Endpoint for ConnEndpoint {
    fn queue_send(&self, message: ByteSlice) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        // a full queue fails the send instead of buffering without bound
        self.send_tx.try_send(message).is_ok()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _ = self.close_tx.send(true);
    }

    fn request_callback(&self) {
        let _ = self.callback_tx.send(());
    }
}

async fn read_pump(
    mut reader: tokio::io::ReadHalf<IoStream>,
    handler: Arc<LevinHandler>,
    endpoint: Arc<ConnEndpoint>,
    mut callback_rx: mpsc::UnboundedReceiver<()>,
    mut close_rx: watch::Receiver<bool>,
    limits: Arc<RateLimits>,
    registry: Arc<Registry>,
    mut stop: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    let mut heartbeat = tokio::time::interval(Duration::from_secs(10));
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = close_rx.changed() => break,
            Some(()) = callback_rx.recv() => handler.run_callback(),
            _ = heartbeat.tick() => {
                if handler.fragment_deadline_exceeded() {
                    warn!("fragment assembly deadline exceeded, closing connection");
                    break;
                }
            }
            read = reader.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => {
                    let delay = limits.down.compute_sleep(n);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    handler.note_received(n);
                    if let Err(err) = handler.on_receive(&buf[..n]) {
                        warn!("protocol error, closing connection: {err}");
                        break;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!("read failed: {err}");
                    break;
                }
            },
        }
    }

    // terminal transition: stop accepting sends, drain pending invokes,
    // drop the registry entry. The handler's self-pinning strong
    // reference (held by this task) dies here.
    endpoint.close();
    handler.release_protocol();
    registry.unregister(&handler);
}

async fn write_pump(
    mut writer: tokio::io::WriteHalf<IoStream>,
    mut send_rx: mpsc::Receiver<ByteSlice>,
    endpoint: Arc<ConnEndpoint>,
    mut close_rx: watch::Receiver<bool>,
    limits: Arc<RateLimits>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = close_rx.changed() => break,
            message = send_rx.recv() => match message {
                None => break,
                Some(message) => {
                    let delay = limits.up.compute_sleep(message.len());
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    let grace = Duration::from_secs(SHUTDOWN_GRACE_SECS);
                    match tokio::time::timeout(grace, writer.write_all(message.as_bytes())).await {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            debug!("write failed: {err}");
                            break;
                        }
                        Err(_) => {
                            debug!("write stalled past grace period");
                            break;
                        }
                    }
                }
            },
        }
    }
    endpoint.close();
    let _ = writer.shutdown().await;
}
