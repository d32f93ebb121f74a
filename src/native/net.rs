//! Socket engine built on synchronous tungstenite.
//!
//! Each context owns its sockets outright and only ever touches them from
//! the polling engine thread that services it. Sockets are non-blocking;
//! [`NativeEngine::service`] sweeps all of them and, when nothing happened,
//! sleeps on the context's [`ServiceSignal`] in short ticks until the
//! caller's timeout.
//!
//! # Socket Lifecycle
//!
//! | Phase | Work per service step |
//! |-------|-----------------------|
//! | Dialing | Poll the resolver thread for a connected TCP stream |
//! | Handshaking | Resume the TLS and HTTP upgrade handshake |
//! | Open | Read messages, flush, emit writable |
//!
//! DNS resolution and TCP connect block, so they run on a short-lived
//! helper thread per connection that wakes the context when done.
//!
//! Incoming messages are reassembled by tungstenite and re-chunked here so
//! that no receive event carries more than the connection's frame size.
//! Messages tungstenite rejects (bad UTF-8, over the size limit, framing
//! errors) are reported as [`NativeEvent::ProtocolViolation`] and the socket
//! is closed with the matching code. permessage-deflate is never negotiated
//! by this engine.

// ============================================================================
// Imports
// ============================================================================

use std::collections::BTreeMap;
use std::io::{self, ErrorKind};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::handshake::MidHandshake;
use tokio_tungstenite::tungstenite::handshake::client::{ClientHandshake, Response};
use tokio_tungstenite::tungstenite::http::header::{HOST, ORIGIN, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::http::{HeaderMap, HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::protocol::frame::Frame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::{
    CloseCode as WireCloseCode, Data as OpData, OpCode,
};
use tokio_tungstenite::tungstenite::stream::MaybeTlsStream;
use tokio_tungstenite::tungstenite::{
    self, Error as WsError, HandshakeError, Message, WebSocket,
};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::SocketHandle;
use crate::protocol::{CloseCode, Opcode};

use super::{
    CallbackAction, ConnectRequest, EngineOptions, HeaderSink, NativeCallback, NativeEngine,
    NativeEngineFactory, NativeEvent, NativeSocket, ServiceSignal,
};

// ============================================================================
// Constants
// ============================================================================

/// Longest sleep between two sweeps of an idle context.
const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Messages read from one socket per sweep.
const READS_PER_STEP: usize = 16;

// ============================================================================
// Types
// ============================================================================

type Stream = MaybeTlsStream<TcpStream>;

type HandshakeResult =
    std::result::Result<(WebSocket<Stream>, Response), HandshakeError<ClientHandshake<Stream>>>;

// ============================================================================
// TungsteniteFactory
// ============================================================================

/// Creates socket engine contexts.
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteFactory;

impl TungsteniteFactory {
    /// Creates the factory.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl NativeEngineFactory for TungsteniteFactory {
    fn create(
        &self,
        options: &EngineOptions,
        signal: Arc<ServiceSignal>,
    ) -> Result<Box<dyn NativeEngine>> {
        if options.protocol_name.is_empty() {
            return Err(Error::engine_creation("protocol name must not be empty"));
        }
        if options.rx_buffer_size == 0 {
            return Err(Error::engine_creation("rx buffer size must be positive"));
        }

        debug!(
            protocol = %options.protocol_name,
            rx_buffer_size = options.rx_buffer_size,
            "Socket engine context created"
        );

        Ok(Box::new(TungsteniteEngine {
            options: options.clone(),
            signal,
            sockets: BTreeMap::new(),
            next_handle: 1,
            deflate_warned: false,
        }))
    }
}

// ============================================================================
// TungsteniteEngine
// ============================================================================

enum Phase {
    Dialing(oneshot::Receiver<io::Result<TcpStream>>),
    Handshaking(Box<MidHandshake<ClientHandshake<Stream>>>),
    Open(Box<WebSocket<Stream>>),
    Gone,
}

struct NetSocket {
    request: ConnectRequest,
    deadline: Instant,
    rx_chunk: usize,
    phase: Phase,
    writable_requested: bool,
    closing: Option<CloseCode>,
}

#[derive(Debug, Clone, Copy)]
struct Step {
    progressed: bool,
    finished: bool,
}

impl Step {
    const IDLE: Self = Self {
        progressed: false,
        finished: false,
    };
    const PROGRESSED: Self = Self {
        progressed: true,
        finished: false,
    };
    const FINISHED: Self = Self {
        progressed: true,
        finished: true,
    };
}

struct TungsteniteEngine {
    options: EngineOptions,
    signal: Arc<ServiceSignal>,
    sockets: BTreeMap<SocketHandle, NetSocket>,
    next_handle: u64,
    deflate_warned: bool,
}

impl NativeEngine for TungsteniteEngine {
    fn connect(&mut self, request: &ConnectRequest) -> Result<SocketHandle> {
        if request.host.is_empty() {
            return Err(Error::connection("empty host"));
        }

        if request.compression && !self.options.extensions.is_empty() && !self.deflate_warned {
            warn!("permessage-deflate is not supported by the socket engine, continuing uncompressed");
            self.deflate_warned = true;
        }

        let handle = SocketHandle::from_raw(self.next_handle);
        self.next_handle += 1;

        let rx = spawn_dialer(
            request.host.clone(),
            request.port,
            request.connect_timeout,
            Arc::clone(&self.signal),
        )?;

        self.sockets.insert(
            handle,
            NetSocket {
                request: request.clone(),
                deadline: Instant::now() + request.connect_timeout,
                rx_chunk: request.max_frame_size.min(self.options.rx_buffer_size).max(1),
                phase: Phase::Dialing(rx),
                writable_requested: false,
                closing: None,
            },
        );

        debug!(socket = %handle, url = %request.url(), "Dialing");
        Ok(handle)
    }

    fn service(&mut self, timeout: Duration, callback: &mut dyn NativeCallback) {
        let deadline = Instant::now() + timeout;

        loop {
            let mut progressed = false;
            let mut finished = Vec::new();

            for (handle, socket) in &mut self.sockets {
                let step = drive(*handle, socket, callback);
                progressed |= step.progressed;
                if step.finished {
                    finished.push(*handle);
                }
            }

            for handle in finished {
                self.sockets.remove(&handle);
            }

            if progressed {
                return;
            }

            let now = Instant::now();
            if now >= deadline || self.signal.wait((deadline - now).min(POLL_INTERVAL)) {
                return;
            }
        }
    }

    fn request_writable(&mut self, socket: SocketHandle) {
        if let Some(socket) = self.sockets.get_mut(&socket) {
            socket.writable_requested = true;
        }
    }

    fn close(&mut self, socket: SocketHandle, code: CloseCode) {
        if let Some(socket) = self.sockets.get_mut(&socket) {
            socket.closing.get_or_insert(code);
        }
    }
}

// ============================================================================
// Dialing
// ============================================================================

fn spawn_dialer(
    host: String,
    port: u16,
    timeout: Duration,
    signal: Arc<ServiceSignal>,
) -> Result<oneshot::Receiver<io::Result<TcpStream>>> {
    let (tx, rx) = oneshot::channel();

    thread::Builder::new()
        .name("lws-dial".into())
        .spawn(move || {
            let result = dial(&host, port, timeout);
            // The socket may have been closed while dialing.
            let _ = tx.send(result);
            signal.wake();
        })?;

    Ok(rx)
}

fn dial(host: &str, port: u16, timeout: Duration) -> io::Result<TcpStream> {
    let mut last_error = None;

    for addr in (host, port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = Some(e),
        }
    }

    Err(last_error.unwrap_or_else(|| {
        io::Error::new(ErrorKind::NotFound, format!("{host} did not resolve"))
    }))
}

// ============================================================================
// Socket Driver
// ============================================================================

fn drive(handle: SocketHandle, socket: &mut NetSocket, callback: &mut dyn NativeCallback) -> Step {
    if let Some(code) = socket.closing {
        if let Phase::Open(ws) = &mut socket.phase {
            shutdown(ws, code);
        }
        socket.phase = Phase::Gone;
        callback.on_event(&mut view(handle, socket), NativeEvent::Closed);
        return Step::FINISHED;
    }

    match std::mem::replace(&mut socket.phase, Phase::Gone) {
        Phase::Dialing(mut rx) => match rx.try_recv() {
            Err(TryRecvError::Empty) if Instant::now() >= socket.deadline => {
                fail(handle, socket, callback, "connect timed out")
            }
            Err(TryRecvError::Empty) => {
                socket.phase = Phase::Dialing(rx);
                Step::IDLE
            }
            Err(TryRecvError::Closed) => fail(handle, socket, callback, "dialer exited"),
            Ok(Err(e)) => fail(handle, socket, callback, &Error::from(e).to_string()),
            Ok(Ok(stream)) => start_handshake(handle, socket, stream, callback),
        },

        Phase::Handshaking(_) if Instant::now() >= socket.deadline => {
            fail(handle, socket, callback, "handshake timed out")
        }
        Phase::Handshaking(mid) => {
            let result = (*mid).handshake();
            finish_handshake(handle, socket, result, callback)
        }

        Phase::Open(ws) => {
            socket.phase = Phase::Open(ws);
            drive_open(handle, socket, callback)
        }

        Phase::Gone => Step::FINISHED,
    }
}

fn start_handshake(
    handle: SocketHandle,
    socket: &mut NetSocket,
    stream: TcpStream,
    callback: &mut dyn NativeCallback,
) -> Step {
    if let Err(e) = stream.set_nonblocking(true) {
        return fail(handle, socket, callback, &e.to_string());
    }
    let _ = stream.set_nodelay(true);

    let mut request = match socket.request.url().into_client_request() {
        Ok(request) => request,
        Err(e) => return fail(handle, socket, callback, &e.to_string()),
    };

    let mut sink = RequestSink {
        headers: request.headers_mut(),
    };
    let mut fixed = sink
        .append(HOST.as_str(), &socket.request.host_header)
        .and_then(|()| sink.append(ORIGIN.as_str(), &socket.request.origin));
    if socket.request.offer_protocol {
        fixed = fixed
            .and_then(|()| sink.append(SEC_WEBSOCKET_PROTOCOL.as_str(), &socket.request.protocol));
    }
    if let Err(e) = fixed {
        return fail(handle, socket, callback, &e.to_string());
    }

    let action = callback.on_event(
        &mut view(handle, socket),
        NativeEvent::AppendHandshakeHeaders { sink: &mut sink },
    );
    if action == CallbackAction::Close {
        return fail(handle, socket, callback, "handshake header injection failed");
    }

    let config = WebSocketConfig::default().max_message_size(socket.request.max_message_size);

    trace!(socket = %handle, "Starting handshake");
    let result = tungstenite::client_tls_with_config(request, stream, Some(config), None);
    finish_handshake(handle, socket, result, callback)
}

fn finish_handshake(
    handle: SocketHandle,
    socket: &mut NetSocket,
    result: HandshakeResult,
    callback: &mut dyn NativeCallback,
) -> Step {
    match result {
        Ok((ws, _response)) => {
            socket.phase = Phase::Open(Box::new(ws));
            debug!(socket = %handle, "Handshake complete");

            if callback.on_event(&mut view(handle, socket), NativeEvent::Established)
                == CallbackAction::Close
            {
                socket.closing = Some(CloseCode::GoingAway);
            }
            Step::PROGRESSED
        }
        Err(HandshakeError::Interrupted(mid)) => {
            socket.phase = Phase::Handshaking(Box::new(mid));
            Step::IDLE
        }
        Err(HandshakeError::Failure(e)) => fail(handle, socket, callback, &e.to_string()),
    }
}

fn drive_open(handle: SocketHandle, socket: &mut NetSocket, callback: &mut dyn NativeCallback) -> Step {
    let mut step = Step::IDLE;

    for _ in 0..READS_PER_STEP {
        let Phase::Open(ws) = &mut socket.phase else {
            break;
        };

        let message = match ws.read() {
            Ok(message) => message,
            Err(WsError::Io(e)) if e.kind() == ErrorKind::WouldBlock => break,
            Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => {
                callback.on_event(&mut view(handle, socket), NativeEvent::Closed);
                return Step::FINISHED;
            }
            Err(e) => {
                return match violation_code(&e) {
                    Some(code) => reject(handle, socket, callback, code, &e.to_string()),
                    None => fail(handle, socket, callback, &e.to_string()),
                };
            }
        };

        step = Step::PROGRESSED;
        let chunk = socket.rx_chunk;
        if deliver(&mut view(handle, socket), message, chunk, callback) == CallbackAction::Close {
            socket.closing = Some(CloseCode::GoingAway);
            return step;
        }
    }

    if let Phase::Open(ws) = &mut socket.phase {
        match ws.flush() {
            Ok(()) => {}
            Err(WsError::Io(e)) if e.kind() == ErrorKind::WouldBlock => {}
            Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => {
                callback.on_event(&mut view(handle, socket), NativeEvent::Closed);
                return Step::FINISHED;
            }
            Err(e) => return fail(handle, socket, callback, &e.to_string()),
        }
    }

    if socket.writable_requested && socket.closing.is_none() {
        socket.writable_requested = false;
        step = Step::PROGRESSED;

        if callback.on_event(&mut view(handle, socket), NativeEvent::Writable)
            == CallbackAction::Close
        {
            socket.closing = Some(CloseCode::GoingAway);
        }
    }

    step
}

/// Turns one tungstenite message into receive, pong or close events.
fn deliver(
    view: &mut NetView<'_>,
    message: Message,
    chunk: usize,
    callback: &mut dyn NativeCallback,
) -> CallbackAction {
    match message {
        Message::Text(text) => emit_chunks(view, text.as_bytes(), false, chunk, callback),
        Message::Binary(data) => emit_chunks(view, &data, true, chunk, callback),
        Message::Pong(payload) => callback.on_event(view, NativeEvent::Pong { payload: &payload }),
        Message::Close(frame) => {
            let payload = frame
                .map(|frame| {
                    let mut payload = u16::from(frame.code).to_be_bytes().to_vec();
                    payload.extend_from_slice(frame.reason.as_bytes());
                    payload
                })
                .unwrap_or_default();
            callback.on_event(view, NativeEvent::PeerInitiatedClose { payload: &payload })
        }
        // Pings are answered by tungstenite.
        Message::Ping(_) | Message::Frame(_) => CallbackAction::Continue,
    }
}

fn emit_chunks(
    view: &mut NetView<'_>,
    data: &[u8],
    is_binary: bool,
    chunk: usize,
    callback: &mut dyn NativeCallback,
) -> CallbackAction {
    if data.is_empty() {
        return callback.on_event(
            view,
            NativeEvent::Receive {
                data,
                is_first: true,
                is_final: true,
                is_binary,
            },
        );
    }

    let count = data.len().div_ceil(chunk);
    for (index, piece) in data.chunks(chunk).enumerate() {
        let action = callback.on_event(
            view,
            NativeEvent::Receive {
                data: piece,
                is_first: index == 0,
                is_final: index + 1 == count,
                is_binary,
            },
        );
        if action == CallbackAction::Close {
            return action;
        }
    }

    CallbackAction::Continue
}

fn fail(
    handle: SocketHandle,
    socket: &mut NetSocket,
    callback: &mut dyn NativeCallback,
    description: &str,
) -> Step {
    debug!(socket = %handle, error = %description, "Socket failed");
    socket.phase = Phase::Gone;
    callback.on_event(
        &mut view(handle, socket),
        NativeEvent::ConnectionError { description },
    );
    Step::FINISHED
}

/// Reports unacceptable incoming data and closes the socket with `code`.
fn reject(
    handle: SocketHandle,
    socket: &mut NetSocket,
    callback: &mut dyn NativeCallback,
    code: CloseCode,
    description: &str,
) -> Step {
    debug!(socket = %handle, code = code.as_u16(), error = %description, "Rejecting incoming data");
    callback.on_event(
        &mut view(handle, socket),
        NativeEvent::ProtocolViolation { code, description },
    );
    socket.closing.get_or_insert(code);
    Step::PROGRESSED
}

/// Close code for a read error caused by what the peer sent.
fn violation_code(error: &WsError) -> Option<CloseCode> {
    match error {
        WsError::Utf8(_) => Some(CloseCode::InvalidPayload),
        WsError::Capacity(_) => Some(CloseCode::MessageTooLarge),
        WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => None,
        WsError::Protocol(_) => Some(CloseCode::ProtocolError),
        _ => None,
    }
}

/// Best-effort close frame, then the stream is dropped with the socket.
fn shutdown(ws: &mut WebSocket<Stream>, code: CloseCode) {
    let frame = code.is_sendable().then(|| close_frame(code));
    let _ = ws.close(frame);
    let _ = ws.flush();
}

fn close_frame(code: CloseCode) -> CloseFrame {
    CloseFrame {
        code: WireCloseCode::from(code.as_u16()),
        reason: "".into(),
    }
}

fn is_would_block(error: &WsError) -> bool {
    matches!(error, WsError::Io(e) if e.kind() == ErrorKind::WouldBlock)
}

// ============================================================================
// Socket View
// ============================================================================

fn view(handle: SocketHandle, socket: &mut NetSocket) -> NetView<'_> {
    let NetSocket {
        phase,
        writable_requested,
        closing,
        ..
    } = socket;

    NetView {
        handle,
        ws: match phase {
            Phase::Open(ws) => Some(ws.as_mut()),
            _ => None,
        },
        writable_requested,
        closing,
    }
}

struct NetView<'a> {
    handle: SocketHandle,
    ws: Option<&'a mut WebSocket<Stream>>,
    writable_requested: &'a mut bool,
    closing: &'a mut Option<CloseCode>,
}

impl NativeSocket for NetView<'_> {
    fn handle(&self) -> SocketHandle {
        self.handle
    }

    fn write(&mut self, opcode: Opcode, payload: &[u8], fin: bool) -> Result<()> {
        if self.closing.is_some() {
            return Err(Error::write_failed("socket is closing"));
        }
        let Some(ws) = self.ws.as_deref_mut() else {
            return Err(Error::write_failed("socket is not open"));
        };

        let data = |code| Message::Frame(Frame::message(payload.to_vec(), OpCode::Data(code), fin));
        let written = match opcode {
            Opcode::Text => ws.write(data(OpData::Text)),
            Opcode::Binary => ws.write(data(OpData::Binary)),
            Opcode::Continuation => ws.write(data(OpData::Continue)),
            Opcode::Ping => ws.write(Message::Ping(payload.to_vec().into())),
            Opcode::Close(code) => ws.close(code.is_sendable().then(|| close_frame(code))),
        };

        match written.and_then(|()| ws.flush()) {
            Ok(()) => Ok(()),
            Err(e) if is_would_block(&e) => Ok(()),
            Err(e) => Err(Error::write_failed(e.to_string())),
        }
    }

    fn request_writable(&mut self) {
        *self.writable_requested = true;
    }

    fn close(&mut self, code: CloseCode) {
        self.closing.get_or_insert(code);
    }
}

// ============================================================================
// Header Sink
// ============================================================================

struct RequestSink<'a> {
    headers: &'a mut HeaderMap,
}

impl HeaderSink for RequestSink<'_> {
    fn append(&mut self, name: &str, value: &str) -> Result<()> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::connection(format!("invalid header name {name:?}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::connection(format!("invalid value for header {name}: {e}")))?;
        self.headers.insert(name, value);
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::TcpListener as StdTcpListener;
    use std::sync::Mutex as StdMutex;

    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{Request, Response as ServerResponse};

    use crate::protocol::Scheme;

    #[derive(Default)]
    struct Recorder {
        received: Vec<u8>,
        outgoing: Vec<(Opcode, Vec<u8>, bool)>,
        established: bool,
        violation: Option<CloseCode>,
        closed: bool,
    }

    impl NativeCallback for Recorder {
        fn on_event(
            &mut self,
            socket: &mut dyn NativeSocket,
            event: NativeEvent<'_>,
        ) -> CallbackAction {
            match event {
                NativeEvent::Receive { data, .. } => self.received.extend_from_slice(data),
                NativeEvent::AppendHandshakeHeaders { sink } => {
                    if sink.append("X-Token", "abc").is_err() {
                        return CallbackAction::Close;
                    }
                }
                NativeEvent::Established => {
                    self.established = true;
                    socket.request_writable();
                }
                NativeEvent::ProtocolViolation { code, .. } => self.violation = Some(code),
                NativeEvent::Closed | NativeEvent::ConnectionError { .. } => self.closed = true,
                NativeEvent::Writable if !self.outgoing.is_empty() => {
                    let (opcode, data, fin) = self.outgoing.remove(0);
                    socket.write(opcode, &data, fin).expect("write");
                    socket.request_writable();
                }
                _ => {}
            }
            CallbackAction::Continue
        }
    }

    fn options() -> EngineOptions {
        EngineOptions {
            protocol_name: "libwebsockets-protocol".into(),
            extensions: Vec::new(),
            rx_buffer_size: 3000,
        }
    }

    fn request(port: u16) -> ConnectRequest {
        ConnectRequest {
            scheme: Scheme::Ws,
            host: "127.0.0.1".into(),
            port,
            resource: "/echo".into(),
            host_header: format!("127.0.0.1:{port}"),
            origin: "localhost".into(),
            protocol: "libwebsockets-protocol".into(),
            offer_protocol: false,
            compression: false,
            connect_timeout: Duration::from_secs(5),
            max_frame_size: 2,
            max_message_size: None,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_echo_round_trip_in_chunks() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let seen_token = Arc::new(StdMutex::new(None));

        let token = Arc::clone(&seen_token);
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let ws = tokio_tungstenite::accept_hdr_async(
                stream,
                move |request: &Request, response: ServerResponse| {
                    let value = request
                        .headers()
                        .get("x-token")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    *token.lock().expect("token lock") = value;
                    Ok(response)
                },
            )
            .await
            .expect("upgrade");
            let (write, read) = ws.split();
            let _ = read.forward(write).await;
        });

        let recorder = tokio::task::spawn_blocking(move || {
            let mut engine = TungsteniteFactory::new()
                .create(&options(), Arc::new(ServiceSignal::new()))
                .expect("create");
            engine.connect(&request(port)).expect("connect");

            let mut recorder = Recorder {
                outgoing: vec![
                    (Opcode::Text, b"HEL".to_vec(), false),
                    (Opcode::Continuation, b"LO".to_vec(), true),
                ],
                ..Recorder::default()
            };

            let started = Instant::now();
            while recorder.received.len() < 5 && started.elapsed() < Duration::from_secs(5) {
                engine.service(Duration::from_millis(20), &mut recorder);
            }
            recorder
        })
        .await
        .expect("engine thread");

        assert_eq!(recorder.received, b"HELLO");
        assert_eq!(seen_token.lock().expect("token lock").as_deref(), Some("abc"));
    }

    /// What a one-shot server saw from the client.
    #[derive(Debug, Default)]
    struct ServerView {
        protocol: Option<String>,
        close_code: Option<u16>,
    }

    /// Accepts one client, echoes any offered protocol, sends `greeting`
    /// and waits for the client's close frame.
    async fn serve_once(greeting: Option<Message>) -> (u16, oneshot::Receiver<ServerView>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let offered = Arc::new(StdMutex::new(None));

            let seen = Arc::clone(&offered);
            let mut ws = tokio_tungstenite::accept_hdr_async(
                stream,
                move |request: &Request, mut response: ServerResponse| {
                    if let Some(protocol) = request.headers().get(SEC_WEBSOCKET_PROTOCOL) {
                        *seen.lock().expect("protocol lock") =
                            protocol.to_str().ok().map(str::to_string);
                        response
                            .headers_mut()
                            .insert(SEC_WEBSOCKET_PROTOCOL, protocol.clone());
                    }
                    Ok(response)
                },
            )
            .await
            .expect("upgrade");

            if let Some(greeting) = greeting {
                ws.send(greeting).await.expect("greeting");
            }

            let mut view = ServerView {
                protocol: offered.lock().expect("protocol lock").take(),
                close_code: None,
            };
            while let Some(Ok(message)) = ws.next().await {
                if let Message::Close(frame) = message {
                    view.close_code = frame.map(|frame| u16::from(frame.code));
                    break;
                }
            }
            let _ = tx.send(view);
        });

        (port, rx)
    }

    /// Services one connection until it is gone or five seconds passed.
    async fn run_until_closed(request: ConnectRequest) -> Recorder {
        tokio::task::spawn_blocking(move || {
            let mut engine = TungsteniteFactory::new()
                .create(&options(), Arc::new(ServiceSignal::new()))
                .expect("create");
            engine.connect(&request).expect("connect");

            let mut recorder = Recorder::default();
            let started = Instant::now();
            while !recorder.closed && started.elapsed() < Duration::from_secs(5) {
                engine.service(Duration::from_millis(20), &mut recorder);
            }
            recorder
        })
        .await
        .expect("engine thread")
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_invalid_utf8_closes_with_invalid_payload() {
        let frame = Frame::message(vec![0xff, 0xfe, 0xfd], OpCode::Data(OpData::Text), true);
        let (port, server) = serve_once(Some(Message::Frame(frame))).await;

        let recorder = run_until_closed(request(port)).await;

        assert!(recorder.established);
        assert_eq!(recorder.violation, Some(CloseCode::InvalidPayload));
        assert!(recorder.closed);
        assert!(recorder.received.is_empty());

        let view = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("server timed out")
            .expect("server view");
        assert_eq!(view.close_code, Some(1007));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_oversized_message_closes_with_message_too_large() {
        let (port, server) = serve_once(Some(Message::text("HELLO"))).await;
        let mut request = request(port);
        request.max_message_size = Some(4);

        let recorder = run_until_closed(request).await;

        assert_eq!(recorder.violation, Some(CloseCode::MessageTooLarge));
        assert!(recorder.received.is_empty());

        let view = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("server timed out")
            .expect("server view");
        assert_eq!(view.close_code, Some(1009));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_offered_protocol_sent_in_handshake() {
        let (port, server) = serve_once(Some(Message::Close(None))).await;
        let mut request = request(port);
        request.offer_protocol = true;

        let recorder = run_until_closed(request).await;
        assert!(recorder.established);
        assert_eq!(recorder.violation, None);

        let view = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("server timed out")
            .expect("server view");
        assert_eq!(view.protocol.as_deref(), Some("libwebsockets-protocol"));
    }

    #[test]
    fn test_violation_codes() {
        assert_eq!(
            violation_code(&WsError::Utf8("bad".into())),
            Some(CloseCode::InvalidPayload)
        );
        assert_eq!(
            violation_code(&WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake)),
            None
        );
        assert_eq!(
            violation_code(&WsError::Protocol(ProtocolError::UnmaskedFrameFromClient)),
            Some(CloseCode::ProtocolError)
        );
        assert_eq!(violation_code(&WsError::ConnectionClosed), None);
    }

    #[test]
    fn test_refused_port_reports_connection_error() {
        let port = {
            let listener = StdTcpListener::bind("127.0.0.1:0").expect("bind");
            listener.local_addr().expect("addr").port()
        };

        struct Outcome(Option<String>);
        impl NativeCallback for Outcome {
            fn on_event(
                &mut self,
                _: &mut dyn NativeSocket,
                event: NativeEvent<'_>,
            ) -> CallbackAction {
                if let NativeEvent::ConnectionError { description } = event {
                    self.0 = Some(description.to_string());
                }
                CallbackAction::Continue
            }
        }

        let mut engine = TungsteniteFactory::new()
            .create(&options(), Arc::new(ServiceSignal::new()))
            .expect("create");
        engine.connect(&request(port)).expect("connect");

        let mut outcome = Outcome(None);
        let started = Instant::now();
        while outcome.0.is_none() && started.elapsed() < Duration::from_secs(5) {
            engine.service(Duration::from_millis(20), &mut outcome);
        }
        assert!(outcome.0.is_some());
    }

    #[test]
    fn test_invalid_header_rejected_by_sink() {
        let mut headers = HeaderMap::new();
        let mut sink = RequestSink {
            headers: &mut headers,
        };
        assert!(sink.append("X-Ok", "yes").is_ok());
        assert!(sink.append("Bad Name", "x").is_err());
        assert!(sink.append("X-Bad", "line\nbreak").is_err());
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn test_factory_rejects_empty_protocol() {
        let mut options = options();
        options.protocol_name.clear();
        let result = TungsteniteFactory::new().create(&options, Arc::new(ServiceSignal::new()));
        assert!(matches!(result, Err(Error::EngineCreationFailed { .. })));
    }
}
