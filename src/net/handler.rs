//! Per-connection levin protocol handler.
//!
//! Decodes the inbound byte stream into messages, dispatches them to the
//! commands handler, and tracks pending invokes with their timeout
//! timers. One handler exists per connection; the read pump owns the
//! receive path, so the receive state mutex is uncontended in practice.

use crate::bytes::ByteSlice;
use crate::net::buffer::Buffer;
use crate::net::levin::{
    CodecError, Header, MessageWriter, HEADER_SIZE, PACKET_BEGIN, PACKET_END,
};
use crate::net::registry::Registry;
use crate::net::types::{ConnectionContext, ConnectionState, COMMAND_HANDSHAKE, MIN_BYTES_WANTED};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Fatal protocol violations; any of these terminates the connection
/// without notifying the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("levin signature mismatch")]
    BadSignature,
    #[error("unsupported levin protocol version")]
    BadVersion,
    #[error("packet exceeds size limit")]
    Oversize,
    #[error("response received with no pending invoke")]
    UnexpectedResponse,
    #[error("reassembled fragment smaller than a levin header")]
    FragmentUnderflow,
    #[error("fragment chain open past the assembly deadline")]
    FragmentTimeout,
    #[error("failed to queue outbound message")]
    SendFailed,
    #[error("connection is closing")]
    Closing,
}

impl From<CodecError> for ProtocolError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::BadSignature => ProtocolError::BadSignature,
            _ => ProtocolError::BadVersion,
        }
    }
}

/// Per-operation invoke failures delivered through the callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvokeError {
    #[error("invoke timed out")]
    TimedOut,
    #[error("connection destroyed before the response arrived")]
    Destroyed,
    #[error("failed to queue the invoke message")]
    SendFailed,
    #[error("connection not found")]
    NotFound,
}

pub type InvokeResult<'a> = Result<(i32, &'a [u8]), InvokeError>;

/// Fires exactly once with the response, a timeout, or a destroy notice
pub type InvokeCallback =
    Box<dyn for<'a> FnOnce(InvokeResult<'a>, &ConnectionContext) + Send + 'static>;

/// The socket-facing side of a connection as seen by the handler
pub trait Endpoint: Send + Sync + 'static {
    /// Enqueue an already-framed message; false when the queue is full
    /// or the connection is gone
    fn queue_send(&self, message: ByteSlice) -> bool;
    /// Request connection teardown; idempotent
    fn close(&self);
    /// Ask the connection to run `commands.callback` on its own executor
    fn request_callback(&self);
}

/// Application hooks driven by the handler
pub trait CommandsHandler: Send + Sync {
    /// Handle an invoke; returns (return_code, response_payload)
    fn invoke(&self, command: u32, payload: &[u8], ctx: &mut ConnectionContext) -> (i32, Vec<u8>);
    /// Handle a one-way notification
    fn notify(&self, command: u32, payload: &[u8], ctx: &mut ConnectionContext);
    /// Deferred per-connection callback, see [`Endpoint::request_callback`]
    fn callback(&self, _ctx: &mut ConnectionContext) {}
    fn on_connection_new(&self, ctx: &ConnectionContext);
    fn on_connection_close(&self, ctx: &ConnectionContext);
    /// Command whose completion lifts the packet-size limit
    fn handshake_command(&self) -> u32 {
        COMMAND_HANDSHAKE
    }
    /// Whether the handshake has completed for this connection
    fn handshake_complete(&self, ctx: &ConnectionContext) -> bool;
    /// Per-command payload cap; combined with the connection-level cap
    fn max_bytes(&self, _command: u32) -> u64 {
        u64::MAX
    }
}

#[derive(Clone, Copy)]
enum StreamState {
    Head,
    Body(Header),
}

struct RecvState {
    buffer: Buffer,
    state: StreamState,
    fragment: Vec<u8>,
    fragment_since: Option<Instant>,
}

struct Waiter {
    id: u64,
    command: u32,
    callback: Option<InvokeCallback>,
    deadline: Instant,
    timeout: Duration,
}

/// Pending invokes in send order.
///
/// The wire protocol has no correlation id: a response is matched to the
/// OLDEST pending invoke. A peer answering out of order hands the wrong
/// payload to the front waiter; this is an inherited trusted-peer
/// assumption and is deliberately not "fixed" here.
#[derive(Default)]
struct PendingInvokes {
    waiters: VecDeque<Waiter>,
    next_id: u64,
}

pub struct LevinHandler {
    registry: Arc<Registry>,
    endpoint: Arc<dyn Endpoint>,
    context: Mutex<ConnectionContext>,
    recv: Mutex<RecvState>,
    invokes: Mutex<PendingInvokes>,
    max_packet_size: AtomicU64,
    released: AtomicBool,
    close_called: AtomicBool,
}

impl LevinHandler {
    pub fn new(
        registry: Arc<Registry>,
        endpoint: Arc<dyn Endpoint>,
        context: ConnectionContext,
    ) -> Arc<Self> {
        let initial_max = registry.net_config().initial_max_packet_size;
        Arc::new(Self {
            registry,
            endpoint,
            context: Mutex::new(context),
            recv: Mutex::new(RecvState {
                buffer: Buffer::with_capacity(4 * 1024),
                state: StreamState::Head,
                fragment: Vec::new(),
                fragment_since: None,
            }),
            invokes: Mutex::new(PendingInvokes::default()),
            max_packet_size: AtomicU64::new(initial_max),
            released: AtomicBool::new(false),
            close_called: AtomicBool::new(false),
        })
    }

    pub fn connection_id(&self) -> Uuid {
        self.context.lock().unwrap().id
    }

    pub fn context_snapshot(&self) -> ConnectionContext {
        self.context.lock().unwrap().clone()
    }

    pub fn update_context(&self, ctx: ConnectionContext) {
        *self.context.lock().unwrap() = ctx;
    }

    pub fn set_remote_height(&self, height: u64) {
        self.context.lock().unwrap().remote_height = height;
    }

    pub(crate) fn note_received(&self, bytes: usize) {
        self.context.lock().unwrap().on_recv(bytes);
    }

    /// Advance the state machine with freshly received bytes.
    /// Any error is fatal to the connection.
    pub fn on_receive(&self, data: &[u8]) -> Result<(), ProtocolError> {
        if self.close_called.load(Ordering::Acquire) {
            return Err(ProtocolError::Closing);
        }

        let max_packet_size = self.max_packet_size.load(Ordering::Acquire);
        let mut recv = self.recv.lock().unwrap();

        // prevent a peer from staging more than one packet's worth of data
        let staged = recv.buffer.size() as u64 + recv.fragment.len() as u64;
        if (data.len() as u64) > max_packet_size.saturating_sub(staged) {
            warn!(
                "packet limit exceeded: staged {} + received {} > {}",
                staged,
                data.len(),
                max_packet_size
            );
            return Err(ProtocolError::Oversize);
        }
        recv.buffer.append(data);

        loop {
            match recv.state {
                StreamState::Head => {
                    if recv.buffer.size() < HEADER_SIZE {
                        // fail fast on a bad signature before the full header arrives
                        if recv.buffer.size() >= 8 {
                            let peek = recv.buffer.span(8);
                            let sig = u64::from_le_bytes(peek.try_into().unwrap());
                            if sig != crate::net::levin::LEVIN_SIGNATURE {
                                return Err(ProtocolError::BadSignature);
                            }
                        }
                        break;
                    }
                    let header = Header::parse(recv.buffer.span(HEADER_SIZE))?;
                    recv.buffer.erase(HEADER_SIZE).expect("span checked");
                    self.check_payload_len(&header, max_packet_size)?;
                    recv.state = StreamState::Body(header);
                }
                StreamState::Body(head) => {
                    let need = head.payload_len as usize;
                    if recv.buffer.size() < need {
                        if data.len() >= MIN_BYTES_WANTED {
                            self.reset_front_timer();
                            debug!(
                                "partial message: {}/{} bytes buffered",
                                recv.buffer.size(),
                                need
                            );
                        }
                        self.check_fragment_deadline(&recv)?;
                        break;
                    }
                    recv.state = StreamState::Head;

                    if head.is_fragment() {
                        if head.is_noise() {
                            recv.buffer.erase(need).expect("size checked");
                            continue;
                        }
                        if head.flags & PACKET_BEGIN != 0 {
                            recv.fragment.clear();
                            recv.fragment_since = Some(Instant::now());
                        }
                        let RecvState {
                            buffer, fragment, ..
                        } = &mut *recv;
                        let chunk = buffer.carve(need).expect("size checked");
                        fragment.extend_from_slice(chunk);
                        if head.flags & PACKET_END == 0 {
                            self.check_fragment_deadline(&recv)?;
                            continue;
                        }
                        if recv.fragment.len() < HEADER_SIZE {
                            return Err(ProtocolError::FragmentUnderflow);
                        }
                        let inner = Header::parse(&recv.fragment[..HEADER_SIZE])?;
                        self.check_payload_len(&inner, max_packet_size)?;
                        let fragment = std::mem::take(&mut recv.fragment);
                        recv.fragment_since = None;
                        self.dispatch(&inner, &fragment[HEADER_SIZE..])?;
                        // reuse small reassembly allocations
                        let mut fragment = fragment;
                        if fragment.capacity() <= 64 * 1024 {
                            fragment.clear();
                            recv.fragment = fragment;
                        }
                    } else {
                        let payload = recv.buffer.carve(need).expect("size checked");
                        self.dispatch(&head, payload)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn check_payload_len(&self, header: &Header, max_packet_size: u64) -> Result<(), ProtocolError> {
        let command_max = self.registry.commands().max_bytes(header.command);
        if header.payload_len > max_packet_size.min(command_max) {
            warn!(
                "oversize packet: len {} command {} limit {}",
                header.payload_len,
                header.command,
                max_packet_size.min(command_max)
            );
            return Err(ProtocolError::Oversize);
        }
        Ok(())
    }

    /// A fragment chain held open past the deadline is an attack on the
    /// reassembly buffer, not a slow peer.
    fn check_fragment_deadline(&self, recv: &RecvState) -> Result<(), ProtocolError> {
        if let Some(since) = recv.fragment_since {
            if since.elapsed() > self.registry.net_config().fragment_timeout {
                return Err(ProtocolError::FragmentTimeout);
            }
        }
        Ok(())
    }

    /// True when an open fragment chain has outlived the assembly
    /// deadline; polled by the connection heartbeat.
    pub fn fragment_deadline_exceeded(&self) -> bool {
        let recv = self.recv.lock().unwrap();
        self.check_fragment_deadline(&recv).is_err()
    }

    fn dispatch(&self, header: &Header, payload: &[u8]) -> Result<(), ProtocolError> {
        debug!(
            "levin packet received: len={} flags={} r={} cmd={}",
            header.payload_len, header.flags, header.return_data, header.command
        );

        if header.is_response() {
            let (callback, ctx) = {
                let mut invokes = self.invokes.lock().unwrap();
                let Some(mut waiter) = invokes.waiters.pop_front() else {
                    warn!("levin response with no pending invoke");
                    return Err(ProtocolError::UnexpectedResponse);
                };
                let callback = waiter.callback.take().expect("armed waiter has callback");
                drop(invokes);
                (callback, self.context_snapshot())
            };
            callback(Ok((header.return_code, payload)), &ctx);
            return Ok(());
        }

        let commands = self.registry.commands();
        if header.return_data {
            let (return_code, response) =
                self.with_context(|ctx| commands.invoke(header.command, payload, ctx));

            if header.command == commands.handshake_command()
                && commands.handshake_complete(&self.context_snapshot())
            {
                self.raise_packet_limit();
            }

            let mut writer = MessageWriter::with_capacity(response.len());
            writer.write(&response);
            if !self.send_message(writer.finalize_response(header.command, return_code)) {
                return Err(ProtocolError::SendFailed);
            }
        } else {
            self.with_context(|ctx| commands.notify(header.command, payload, ctx));
        }
        Ok(())
    }

    /// Run a commands callback against the connection context WITHOUT
    /// holding the context lock: the callback may re-enter the handler
    /// (send, close), which touches the context itself. Only the fields
    /// a commands handler legitimately owns are written back; traffic
    /// counters keep updating concurrently in the live context.
    fn with_context<R>(&self, f: impl FnOnce(&mut ConnectionContext) -> R) -> R {
        let mut snapshot = self.context.lock().unwrap().clone();
        let result = f(&mut snapshot);
        let mut ctx = self.context.lock().unwrap();
        ctx.remote_height = snapshot.remote_height;
        ctx.state = snapshot.state;
        result
    }

    fn raise_packet_limit(&self) {
        let max = self.registry.net_config().max_packet_size;
        self.max_packet_size.store(max, Ordering::Release);
        let mut ctx = self.context.lock().unwrap();
        if ctx.state == ConnectionState::Init {
            ctx.state = ConnectionState::Ready;
        }
    }

    /// Issue an invoke and register a waiter for its response. The
    /// callback fires exactly once: response, timeout, or destroy.
    pub fn async_invoke(
        self: &Arc<Self>,
        command: u32,
        message: MessageWriter,
        timeout: Option<Duration>,
        callback: InvokeCallback,
    ) -> bool {
        let timeout = timeout.unwrap_or_else(|| self.registry.net_config().invoke_timeout);

        let mut invokes = self.invokes.lock().unwrap();
        if self.released.load(Ordering::Acquire) {
            drop(invokes);
            callback(Err(InvokeError::Destroyed), &self.context_snapshot());
            return false;
        }

        // the initiator lifts its own limit before the handshake response
        if command == self.registry.commands().handshake_command() {
            self.raise_packet_limit();
        }

        if !self.send_message(message.finalize_invoke(command)) {
            drop(invokes);
            callback(Err(InvokeError::SendFailed), &self.context_snapshot());
            return false;
        }

        let id = invokes.next_id;
        invokes.next_id += 1;
        let deadline = Instant::now() + timeout;
        invokes.waiters.push_back(Waiter {
            id,
            command,
            callback: Some(callback),
            deadline,
            timeout,
        });
        drop(invokes);

        Self::spawn_invoke_timer(self, id, deadline);
        true
    }

    /// The waiter slot is the arbitration point: whichever of the
    /// response path and the timer removes it first fires the callback.
    fn spawn_invoke_timer(handler: &Arc<Self>, waiter_id: u64, mut deadline: Instant) {
        let weak: Weak<LevinHandler> = Arc::downgrade(handler);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep_until(deadline).await;
                let Some(handler) = weak.upgrade() else { return };

                let waiter = {
                    let mut invokes = handler.invokes.lock().unwrap();
                    let Some(pos) = invokes.waiters.iter().position(|w| w.id == waiter_id)
                    else {
                        return; // response already handled
                    };
                    let now = Instant::now();
                    if invokes.waiters[pos].deadline > now {
                        deadline = invokes.waiters[pos].deadline;
                        None // timer was reset, keep waiting
                    } else {
                        invokes.waiters.remove(pos)
                    }
                };

                let Some(mut waiter) = waiter else { continue };
                let callback = waiter.callback.take().expect("armed waiter has callback");
                let ctx = handler.context_snapshot();
                info!(
                    "invoke timed out: command {} after {:?}",
                    waiter.command, waiter.timeout
                );
                callback(Err(InvokeError::TimedOut), &ctx);
                handler.close();
                return;
            }
        });
    }

    /// Push the front waiter's deadline out; called while a large
    /// response body is still streaming in.
    fn reset_front_timer(&self) {
        let mut invokes = self.invokes.lock().unwrap();
        if let Some(front) = invokes.waiters.front_mut() {
            front.deadline = Instant::now() + front.timeout;
        }
    }

    /// Send an already-framed message
    pub fn send(&self, message: ByteSlice) -> bool {
        if !self.send_message(message) {
            warn!("failed to queue message, dropping it");
            return false;
        }
        true
    }

    fn send_message(&self, message: ByteSlice) -> bool {
        if message.len() < HEADER_SIZE {
            return false;
        }
        let header = Header::parse(message.as_bytes()).ok();
        if !self.endpoint.queue_send(message) {
            return false;
        }
        if let Some(head) = header {
            let mut ctx = self.context.lock().unwrap();
            ctx.on_sent(HEADER_SIZE + head.payload_len as usize);
            debug!(
                "levin packet sent: len={} flags={} r={} cmd={}",
                head.payload_len, head.flags, head.return_data, head.command
            );
        }
        true
    }

    /// Idempotent close request; pending invokes drain on release
    pub fn close(&self) {
        self.close_called.store(true, Ordering::Release);
        self.context.lock().unwrap().state = ConnectionState::Closing;
        self.endpoint.close();
    }

    pub fn request_callback(&self) {
        self.endpoint.request_callback();
    }

    /// Run the deferred commands callback on behalf of the connection
    pub fn run_callback(&self) {
        let commands = self.registry.commands();
        self.with_context(|ctx| commands.callback(ctx));
    }

    /// Terminal teardown: swap out the waiter list under the lock, then
    /// fire every callback outside it (a callback may re-enter the
    /// handler; holding the lock would deadlock).
    pub fn release_protocol(&self) {
        let drained: Vec<Waiter> = {
            let mut invokes = self.invokes.lock().unwrap();
            self.released.store(true, Ordering::Release);
            invokes.waiters.drain(..).collect()
        };
        if !drained.is_empty() {
            let ctx = self.context_snapshot();
            for mut waiter in drained {
                if let Some(callback) = waiter.callback.take() {
                    callback(Err(InvokeError::Destroyed), &ctx);
                }
            }
        }
        self.context.lock().unwrap().state = ConnectionState::Terminated;
    }
}
