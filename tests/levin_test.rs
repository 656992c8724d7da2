//! Protocol handler integration tests: framing, dispatch, invoke
//! timeouts, and the packet-size handshake policy, all driven through a
//! capturing endpoint instead of a socket.

use nocturne::bytes::ByteSlice;
use nocturne::net::{
    make_fragmented_notify, make_noise_notify, CommandsHandler, ConnectionContext,
    ConnectionState, Endpoint, Header, InvokeError, LevinHandler, MessageWriter, ProtocolError,
    Registry, COMMAND_HANDSHAKE, HEADER_SIZE, PACKET_BEGIN, PACKET_END,
};
use nocturne::NetConfig;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

struct TestEndpoint {
    sent: Mutex<Vec<ByteSlice>>,
    accept_sends: AtomicBool,
    closed: AtomicBool,
}

impl TestEndpoint {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            accept_sends: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        })
    }

    fn take_sent(&self) -> Vec<ByteSlice> {
        std::mem::take(&mut self.sent.lock().unwrap())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Endpoint for TestEndpoint {
    fn queue_send(&self, message: ByteSlice) -> bool {
        if !self.accept_sends.load(Ordering::Acquire) {
            return false;
        }
        self.sent.lock().unwrap().push(message);
        true
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn request_callback(&self) {}
}

#[derive(Default)]
struct TestCommands {
    invokes: Mutex<Vec<(u32, Vec<u8>)>>,
    notifies: Mutex<Vec<(u32, Vec<u8>)>>,
    opened: AtomicUsize,
    closed: AtomicUsize,
    handshaken: Mutex<HashSet<Uuid>>,
}

impl CommandsHandler for TestCommands {
    fn invoke(&self, command: u32, payload: &[u8], ctx: &mut ConnectionContext) -> (i32, Vec<u8>) {
        self.invokes.lock().unwrap().push((command, payload.to_vec()));
        if command == COMMAND_HANDSHAKE {
            self.handshaken.lock().unwrap().insert(ctx.id);
        }
        (1, b"pong".to_vec())
    }

    fn notify(&self, command: u32, payload: &[u8], _ctx: &mut ConnectionContext) {
        self.notifies.lock().unwrap().push((command, payload.to_vec()));
    }

    fn on_connection_new(&self, _ctx: &ConnectionContext) {
        self.opened.fetch_add(1, Ordering::SeqCst);
    }

    fn on_connection_close(&self, _ctx: &ConnectionContext) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn handshake_complete(&self, ctx: &ConnectionContext) -> bool {
        self.handshaken.lock().unwrap().contains(&ctx.id)
    }
}

struct Fixture {
    handler: Arc<LevinHandler>,
    endpoint: Arc<TestEndpoint>,
    commands: Arc<TestCommands>,
    registry: Arc<Registry>,
}

fn fixture_with(config: NetConfig) -> Fixture {
    let commands = Arc::new(TestCommands::default());
    let registry = Registry::new(commands.clone(), config);
    let endpoint = TestEndpoint::new();
    let ctx = ConnectionContext::new("1.2.3.4:5000".parse().unwrap(), true);
    let handler = LevinHandler::new(registry.clone(), endpoint.clone(), ctx);
    assert!(registry.register(&handler));
    Fixture {
        handler,
        endpoint,
        commands,
        registry,
    }
}

fn fixture() -> Fixture {
    fixture_with(NetConfig::default())
}

fn notify_frame(command: u32, payload: &[u8]) -> ByteSlice {
    let mut writer = MessageWriter::new();
    writer.write(payload);
    writer.finalize_notify(command)
}

fn response_frame(command: u32, return_code: i32, payload: &[u8]) -> ByteSlice {
    let mut writer = MessageWriter::new();
    writer.write(payload);
    writer.finalize_response(command, return_code)
}

#[test]
fn notify_round_trip() {
    let fix = fixture();
    let payload = vec![0xabu8; 2000];
    let frame = notify_frame(2002, &payload);

    fix.handler.on_receive(frame.as_bytes()).unwrap();

    let notifies = fix.commands.notifies.lock().unwrap();
    assert_eq!(notifies.as_slice(), &[(2002, payload)]);
    assert!(fix.commands.invokes.lock().unwrap().is_empty());
}

#[test]
fn notify_split_across_reads() {
    let fix = fixture();
    let payload = vec![0x11u8; 700];
    let frame = notify_frame(77, &payload);

    // drip the frame one odd-sized chunk at a time
    for chunk in frame.as_bytes().chunks(13) {
        fix.handler.on_receive(chunk).unwrap();
    }
    assert_eq!(fix.commands.notifies.lock().unwrap().len(), 1);
}

#[test]
fn invoke_dispatch_sends_response() {
    let fix = fixture();
    let mut writer = MessageWriter::new();
    writer.write(b"ping");
    fix.handler.on_receive(writer.finalize_invoke(321).as_bytes()).unwrap();

    assert_eq!(
        fix.commands.invokes.lock().unwrap().as_slice(),
        &[(321, b"ping".to_vec())]
    );

    let sent = fix.endpoint.take_sent();
    assert_eq!(sent.len(), 1);
    let header = Header::parse(sent[0].as_bytes()).unwrap();
    assert!(header.is_response());
    assert_eq!(header.command, 321);
    assert_eq!(header.return_code, 1);
    assert_eq!(&sent[0].as_bytes()[HEADER_SIZE..], b"pong");
}

#[test]
fn handshake_raises_packet_limit() {
    let config = NetConfig {
        initial_max_packet_size: 1024,
        ..Default::default()
    };
    let fix = fixture_with(config);

    // a 2000-byte message is rejected pre-handshake
    let big = notify_frame(60, &vec![1u8; 2000]);
    assert_eq!(
        fix.handler.on_receive(big.as_bytes()),
        Err(ProtocolError::Oversize)
    );

    // a fresh connection completes the handshake, then the same message passes
    let fix = fixture_with(NetConfig {
        initial_max_packet_size: 1024,
        ..Default::default()
    });
    fix.handler
        .on_receive(MessageWriter::new().finalize_invoke(COMMAND_HANDSHAKE).as_bytes())
        .unwrap();

    let big = notify_frame(60, &vec![1u8; 2000]);
    fix.handler.on_receive(big.as_bytes()).unwrap();
    assert_eq!(fix.commands.notifies.lock().unwrap().len(), 1);
}

#[test]
fn oversize_packet_is_fatal() {
    let fix = fixture();
    let max = fix.registry.net_config().max_packet_size;
    let header = Header::new(99, max + 1, nocturne::net::PACKET_REQUEST, false);
    assert_eq!(
        fix.handler.on_receive(&header.to_bytes()),
        Err(ProtocolError::Oversize)
    );
}

#[test]
fn boundary_size_accepted() {
    let limit = 1024u64;
    let fix = fixture_with(NetConfig {
        initial_max_packet_size: limit,
        ..Default::default()
    });

    // payload right at the limit passes; one past it is fatal
    let exact = notify_frame(5, &vec![0u8; limit as usize - HEADER_SIZE]);
    fix.handler.on_receive(exact.as_bytes()).unwrap();
    assert_eq!(fix.commands.notifies.lock().unwrap().len(), 1);

    let over = Header::new(5, limit + 1, nocturne::net::PACKET_REQUEST, false);
    assert_eq!(
        fix.handler.on_receive(&over.to_bytes()),
        Err(ProtocolError::Oversize)
    );
}

#[test]
fn early_signature_check_fails_fast() {
    let fix = fixture();
    // eight bytes of garbage: fatal before a full header is buffered
    assert_eq!(
        fix.handler.on_receive(&[0xde, 0xad, 0xbe, 0xef, 0, 1, 2, 3]),
        Err(ProtocolError::BadSignature)
    );
}

#[test]
fn bad_version_is_fatal() {
    let fix = fixture();
    let mut bytes = notify_frame(1, b"x").as_bytes().to_vec();
    bytes[29] = 9;
    assert_eq!(
        fix.handler.on_receive(&bytes),
        Err(ProtocolError::BadVersion)
    );
}

#[test]
fn noise_frames_are_skipped() {
    let fix = fixture();
    let noise = make_noise_notify(1024).unwrap();
    fix.handler.on_receive(noise.as_bytes()).unwrap();
    fix.handler.on_receive(noise.as_bytes()).unwrap();

    assert!(fix.commands.notifies.lock().unwrap().is_empty());
    assert!(fix.commands.invokes.lock().unwrap().is_empty());

    // a real message right after noise still decodes
    fix.handler.on_receive(notify_frame(8, b"real").as_bytes()).unwrap();
    assert_eq!(fix.commands.notifies.lock().unwrap().len(), 1);
}

#[test]
fn fragmented_notify_reassembles() {
    let fix = fixture();
    let payload: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
    let mut writer = MessageWriter::new();
    writer.write(&payload);
    let message = make_fragmented_notify(1024, 2002, writer).unwrap();

    fix.handler.on_receive(message.as_bytes()).unwrap();

    let notifies = fix.commands.notifies.lock().unwrap();
    assert_eq!(notifies.len(), 1);
    assert_eq!(notifies[0].0, 2002);
    // the reassembled payload keeps the chain's trailing zero padding
    assert!(notifies[0].1.starts_with(&payload));
    assert!(notifies[0].1[payload.len()..].iter().all(|&b| b == 0));
}

#[test]
fn fragment_chain_interleaves_with_noise() {
    let fix = fixture();
    let payload = vec![0x55u8; 2500];
    let mut writer = MessageWriter::new();
    writer.write(&payload);
    let message = make_fragmented_notify(1024, 7, writer).unwrap();
    let noise = make_noise_notify(1024).unwrap();

    // noise frames may land between fragments of one chain
    let frames: Vec<&[u8]> = message.as_bytes().chunks(1024).collect();
    fix.handler.on_receive(frames[0]).unwrap();
    fix.handler.on_receive(noise.as_bytes()).unwrap();
    for frame in &frames[1..] {
        fix.handler.on_receive(frame).unwrap();
    }
    assert_eq!(fix.commands.notifies.lock().unwrap().len(), 1);
}

#[test]
fn undersized_fragment_chain_is_fatal() {
    let fix = fixture();
    let begin = Header::new(0, 4, PACKET_BEGIN, false);
    let end = Header::new(0, 4, PACKET_END, false);

    fix.handler.on_receive(&begin.to_bytes()).unwrap();
    fix.handler.on_receive(&[1, 2, 3, 4]).unwrap();
    let mut last = end.to_bytes().to_vec();
    last.extend_from_slice(&[5, 6, 7, 8]);
    assert_eq!(
        fix.handler.on_receive(&last),
        Err(ProtocolError::FragmentUnderflow)
    );
}

#[test]
fn unexpected_response_is_fatal() {
    let fix = fixture();
    let frame = response_frame(10, 0, b"orphan");
    assert_eq!(
        fix.handler.on_receive(frame.as_bytes()),
        Err(ProtocolError::UnexpectedResponse)
    );
}

#[tokio::test]
async fn responses_correlate_by_fifo_order() {
    let fix = fixture();
    let results: Arc<Mutex<Vec<(u32, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));

    for tag in [1u32, 2] {
        let results = results.clone();
        let ok = fix.handler.async_invoke(
            100 + tag,
            MessageWriter::new(),
            Some(Duration::from_secs(60)),
            Box::new(move |result, _ctx| {
                let (_code, payload) = result.unwrap();
                results.lock().unwrap().push((tag, payload.to_vec()));
            }),
        );
        assert!(ok);
    }
    assert_eq!(fix.endpoint.take_sent().len(), 2);

    // the peer answers in order; each response pops the oldest waiter
    fix.handler
        .on_receive(response_frame(101, 0, b"first").as_bytes())
        .unwrap();
    fix.handler
        .on_receive(response_frame(102, 0, b"second").as_bytes())
        .unwrap();

    let results = results.lock().unwrap();
    assert_eq!(
        results.as_slice(),
        &[(1, b"first".to_vec()), (2, b"second".to_vec())]
    );
}

#[tokio::test(start_paused = true)]
async fn invoke_times_out_and_closes() {
    let fix = fixture();
    let fired = Arc::new(Mutex::new(Vec::new()));
    let sink = fired.clone();
    fix.handler.async_invoke(
        55,
        MessageWriter::new(),
        Some(Duration::from_millis(100)),
        Box::new(move |result, _ctx| {
            sink.lock().unwrap().push(result.map(|(code, _)| code));
        }),
    );

    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(fired.lock().unwrap().as_slice(), &[Err(InvokeError::TimedOut)]);
    assert!(fix.endpoint.is_closed());

    // a late response now has no waiter
    let late = response_frame(55, 0, b"late");
    assert!(fix.handler.on_receive(late.as_bytes()).is_err());
}

#[tokio::test(start_paused = true)]
async fn partial_response_resets_the_timer() {
    let fix = fixture();
    let fired = Arc::new(Mutex::new(Vec::new()));
    let sink = fired.clone();
    fix.handler.async_invoke(
        55,
        MessageWriter::new(),
        Some(Duration::from_secs(1)),
        Box::new(move |result, _ctx| {
            sink.lock().unwrap().push(result.map(|(_, p)| p.to_vec()));
        }),
    );

    // a response body larger than the reset threshold, streamed slowly
    let body = vec![0x77u8; 2048];
    let frame = response_frame(55, 0, &body);
    let bytes = frame.as_bytes();

    tokio::time::sleep(Duration::from_millis(900)).await;
    fix.handler.on_receive(&bytes[..800]).unwrap();

    // past the original deadline, but the partial chunk reset the timer
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(fired.lock().unwrap().is_empty());
    assert!(!fix.endpoint.is_closed());

    fix.handler.on_receive(&bytes[800..]).unwrap();
    assert_eq!(fired.lock().unwrap().as_slice(), &[Ok(body)]);
}

#[tokio::test(start_paused = true)]
async fn release_fires_destroyed_exactly_once() {
    let fix = fixture();
    let fired = Arc::new(Mutex::new(Vec::new()));
    let sink = fired.clone();
    fix.handler.async_invoke(
        55,
        MessageWriter::new(),
        Some(Duration::from_millis(100)),
        Box::new(move |result, _ctx| {
            sink.lock().unwrap().push(result.map(|(code, _)| code));
        }),
    );

    fix.handler.release_protocol();
    assert_eq!(
        fired.lock().unwrap().as_slice(),
        &[Err(InvokeError::Destroyed)]
    );

    // the timer finds no waiter and must not fire a second result
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(fired.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn failed_send_reports_immediately() {
    let fix = fixture();
    fix.endpoint.accept_sends.store(false, Ordering::Release);

    let fired = Arc::new(Mutex::new(Vec::new()));
    let sink = fired.clone();
    let ok = fix.handler.async_invoke(
        55,
        MessageWriter::new(),
        None,
        Box::new(move |result, _ctx| {
            sink.lock().unwrap().push(result.map(|(code, _)| code));
        }),
    );
    assert!(!ok);
    assert_eq!(
        fired.lock().unwrap().as_slice(),
        &[Err(InvokeError::SendFailed)]
    );
}

#[test]
fn close_is_idempotent_and_marks_context() {
    let fix = fixture();
    fix.handler.close();
    fix.handler.close();
    assert!(fix.endpoint.is_closed());
    assert_eq!(fix.handler.context_snapshot().state, ConnectionState::Closing);
    // further receives are refused
    assert_eq!(
        fix.handler.on_receive(b"anything"),
        Err(ProtocolError::Closing)
    );
}

#[test]
fn registry_tracks_connections() {
    let commands = Arc::new(TestCommands::default());
    let registry = Registry::new(commands.clone(), NetConfig::default());

    let mut handlers = Vec::new();
    for i in 0..4 {
        let ctx = ConnectionContext::new("9.9.9.9:1000".parse().unwrap(), i % 2 == 0);
        let handler = LevinHandler::new(registry.clone(), TestEndpoint::new(), ctx);
        assert!(registry.register(&handler));
        handlers.push(handler);
    }
    assert_eq!(registry.connection_count(), 4);
    assert_eq!(registry.incoming_count(), 2);
    assert_eq!(registry.outgoing_count(), 2);
    assert_eq!(commands.opened.load(Ordering::SeqCst), 4);

    let mut seen = 0;
    registry.foreach_connection(|_ctx| {
        seen += 1;
        true
    });
    assert_eq!(seen, 4);

    let id = handlers[0].connection_id();
    assert!(registry.send(notify_frame(1, b"hi"), &id));
    assert!(!registry.send(notify_frame(1, b"hi"), &Uuid::new_v4()));

    registry.unregister(&handlers[0]);
    assert_eq!(registry.connection_count(), 3);
    assert_eq!(commands.closed.load(Ordering::SeqCst), 1);
    // double unregister fires no second close
    registry.unregister(&handlers[0]);
    assert_eq!(commands.closed.load(Ordering::SeqCst), 1);
}

#[test]
fn delete_connections_closes_by_direction() {
    let commands = Arc::new(TestCommands::default());
    let registry = Registry::new(commands, NetConfig::default());

    let mut incoming_endpoints = Vec::new();
    let mut outgoing_endpoints = Vec::new();
    let mut handlers = Vec::new();
    for i in 0..6 {
        let is_incoming = i < 3;
        let ctx = ConnectionContext::new("9.9.9.9:1000".parse().unwrap(), is_incoming);
        let endpoint = TestEndpoint::new();
        if is_incoming {
            incoming_endpoints.push(endpoint.clone());
        } else {
            outgoing_endpoints.push(endpoint.clone());
        }
        let handler = LevinHandler::new(registry.clone(), endpoint, ctx);
        registry.register(&handler);
        handlers.push(handler);
    }

    registry.delete_in_connections(2);
    let closed_in = incoming_endpoints.iter().filter(|e| e.is_closed()).count();
    let closed_out = outgoing_endpoints.iter().filter(|e| e.is_closed()).count();
    assert_eq!(closed_in, 2);
    assert_eq!(closed_out, 0);
}
