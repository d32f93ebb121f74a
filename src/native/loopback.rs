//! In-memory native engine.
//!
//! Every socket talks to an echo peer living inside the engine: data frames
//! come back as received frames with the same first/final flags, pings are
//! answered with pongs, and a close frame is answered with a close frame
//! followed by socket teardown. No sockets or threads are involved.
//!
//! Tests steer the peer through [`LoopbackPeer`] and inspect what the client
//! did through [`LoopbackJournal`].
//!
//! # Example
//!
//! ```ignore
//! let factory = LoopbackFactory::new().answer_pings(false);
//! let journal = factory.journal();
//! let pool = EnginePool::new(factory);
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::identifiers::SocketHandle;
use crate::protocol::{CloseCode, Opcode};

use super::{
    CallbackAction, ConnectRequest, EngineOptions, HeaderSink, NativeCallback, NativeEngine,
    NativeEngineFactory, NativeEvent, NativeSocket, ServiceSignal,
};

// ============================================================================
// Types
// ============================================================================

/// How the echo peer answers the opening handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum HandshakeBehavior {
    /// Complete the handshake.
    #[default]
    Accept,
    /// Fail the connection with the given description.
    Refuse(String),
    /// Never answer.
    Silent,
}

/// A frame the client handed to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenFrame {
    /// Socket the frame was written to.
    pub socket: SocketHandle,
    /// Frame opcode.
    pub opcode: Opcode,
    /// Frame payload.
    pub payload: Vec<u8>,
    /// Final frame of its message.
    pub fin: bool,
}

/// Something the peer does to every open socket.
#[derive(Debug, Clone)]
enum PeerAction {
    Frame {
        data: Vec<u8>,
        is_first: bool,
        is_final: bool,
        is_binary: bool,
    },
    Close(Vec<u8>),
    Pong(Vec<u8>),
    Disconnect(String),
}

// ============================================================================
// LoopbackJournal
// ============================================================================

#[derive(Debug, Default)]
struct JournalState {
    requests: Vec<ConnectRequest>,
    headers: Vec<(SocketHandle, String, String)>,
    frames: Vec<WrittenFrame>,
    closes: Vec<(SocketHandle, CloseCode)>,
}

/// Record of everything the client did, shared by all contexts of a factory.
#[derive(Debug, Clone, Default)]
pub struct LoopbackJournal {
    state: Arc<Mutex<JournalState>>,
}

impl LoopbackJournal {
    /// Connect requests, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<ConnectRequest> {
        self.state.lock().requests.clone()
    }

    /// Handshake headers appended through the header sink.
    #[must_use]
    pub fn headers(&self) -> Vec<(String, String)> {
        self.state
            .lock()
            .headers
            .iter()
            .map(|(_, name, value)| (name.clone(), value.clone()))
            .collect()
    }

    /// Frames written by the client, in order.
    #[must_use]
    pub fn frames(&self) -> Vec<WrittenFrame> {
        self.state.lock().frames.clone()
    }

    /// Sockets closed by the client without a closing handshake.
    #[must_use]
    pub fn closes(&self) -> Vec<(SocketHandle, CloseCode)> {
        self.state.lock().closes.clone()
    }

    fn record_request(&self, request: &ConnectRequest) {
        self.state.lock().requests.push(request.clone());
    }

    fn record_header(&self, socket: SocketHandle, name: &str, value: &str) {
        self.state
            .lock()
            .headers
            .push((socket, name.to_string(), value.to_string()));
    }

    fn record_frame(&self, frame: WrittenFrame) {
        self.state.lock().frames.push(frame);
    }

    fn record_close(&self, socket: SocketHandle, code: CloseCode) {
        self.state.lock().closes.push((socket, code));
    }
}

// ============================================================================
// LoopbackPeer
// ============================================================================

/// Per-context inbox for peer actions.
#[derive(Debug)]
struct Mailbox {
    actions: Mutex<Vec<PeerAction>>,
    signal: Arc<ServiceSignal>,
}

/// Remote end of every loopback socket created by one factory.
///
/// Actions apply to all sockets that are open when the owning context
/// next services them. Safe to use from any thread.
#[derive(Debug, Clone, Default)]
pub struct LoopbackPeer {
    mailboxes: Arc<Mutex<Vec<Weak<Mailbox>>>>,
    writes_paused: Arc<AtomicBool>,
}

impl LoopbackPeer {
    /// Sends a complete text message.
    pub fn send_text(&self, text: &str) {
        self.send_frame(text.as_bytes(), true, true, false);
    }

    /// Sends a complete binary message.
    pub fn send_binary(&self, data: &[u8]) {
        self.send_frame(data, true, true, true);
    }

    /// Sends one frame with explicit fragmentation flags.
    pub fn send_frame(&self, data: &[u8], is_first: bool, is_final: bool, is_binary: bool) {
        self.broadcast(PeerAction::Frame {
            data: data.to_vec(),
            is_first,
            is_final,
            is_binary,
        });
    }

    /// Sends an unsolicited pong.
    pub fn send_pong(&self, payload: &[u8]) {
        self.broadcast(PeerAction::Pong(payload.to_vec()));
    }

    /// Starts a closing handshake with `code`.
    pub fn close(&self, code: CloseCode) {
        self.broadcast(PeerAction::Close(code.as_u16().to_be_bytes().to_vec()));
    }

    /// Starts a closing handshake with a raw close payload.
    pub fn close_with_payload(&self, payload: &[u8]) {
        self.broadcast(PeerAction::Close(payload.to_vec()));
    }

    /// Drops the transport without a closing handshake.
    pub fn disconnect(&self, description: &str) {
        self.broadcast(PeerAction::Disconnect(description.to_string()));
    }

    /// Stops reporting sockets as writable until [`resume_writes`](Self::resume_writes).
    pub fn pause_writes(&self) {
        self.writes_paused.store(true, Ordering::SeqCst);
    }

    /// Reports sockets as writable again.
    pub fn resume_writes(&self) {
        self.writes_paused.store(false, Ordering::SeqCst);
        for mailbox in self.mailboxes.lock().iter().filter_map(Weak::upgrade) {
            mailbox.signal.wake();
        }
    }

    fn attach(&self, mailbox: &Arc<Mailbox>) {
        let mut mailboxes = self.mailboxes.lock();
        mailboxes.retain(|weak| weak.strong_count() > 0);
        mailboxes.push(Arc::downgrade(mailbox));
    }

    fn broadcast(&self, action: PeerAction) {
        let mailboxes: Vec<Arc<Mailbox>> =
            self.mailboxes.lock().iter().filter_map(Weak::upgrade).collect();

        for mailbox in mailboxes {
            mailbox.actions.lock().push(action.clone());
            mailbox.signal.wake();
        }
    }
}

// ============================================================================
// LoopbackFactory
// ============================================================================

/// Creates loopback contexts that share one journal and one peer.
#[derive(Debug, Clone)]
pub struct LoopbackFactory {
    handshake: HandshakeBehavior,
    behavior: PeerBehavior,
    fail_after: Option<usize>,
    created: Arc<AtomicUsize>,
    journal: LoopbackJournal,
    peer: LoopbackPeer,
}

impl Default for LoopbackFactory {
    fn default() -> Self {
        Self {
            handshake: HandshakeBehavior::Accept,
            behavior: PeerBehavior {
                answer_pings: true,
                greeting: None,
                write_limit: None,
            },
            fail_after: None,
            created: Arc::new(AtomicUsize::new(0)),
            journal: LoopbackJournal::default(),
            peer: LoopbackPeer::default(),
        }
    }
}

impl LoopbackFactory {
    /// Creates a factory whose peer accepts every handshake.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets how the peer answers handshakes.
    #[must_use]
    pub fn handshake(mut self, behavior: HandshakeBehavior) -> Self {
        self.handshake = behavior;
        self
    }

    /// Sets whether the peer answers pings.
    #[must_use]
    pub fn answer_pings(mut self, enabled: bool) -> Self {
        self.behavior.answer_pings = enabled;
        self
    }

    /// Sends `text` to every socket as soon as its handshake completes.
    #[must_use]
    pub fn greeting(mut self, text: impl Into<String>) -> Self {
        self.behavior.greeting = Some(text.into());
        self
    }

    /// Fails every write of a socket after its first `count`.
    #[must_use]
    pub fn fail_writes_after(mut self, count: usize) -> Self {
        self.behavior.write_limit = Some(count);
        self
    }

    /// Fails every context creation after the first `count`.
    #[must_use]
    pub fn fail_after(mut self, count: usize) -> Self {
        self.fail_after = Some(count);
        self
    }

    /// Returns the shared journal.
    #[inline]
    #[must_use]
    pub fn journal(&self) -> LoopbackJournal {
        self.journal.clone()
    }

    /// Returns the shared peer.
    #[inline]
    #[must_use]
    pub fn peer(&self) -> LoopbackPeer {
        self.peer.clone()
    }

    /// Returns how many creations were attempted.
    #[inline]
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl NativeEngineFactory for LoopbackFactory {
    fn create(
        &self,
        options: &EngineOptions,
        signal: Arc<ServiceSignal>,
    ) -> Result<Box<dyn NativeEngine>> {
        let index = self.created.fetch_add(1, Ordering::SeqCst);
        if self.fail_after.is_some_and(|limit| index >= limit) {
            return Err(Error::engine_creation(format!(
                "loopback context {index} refused"
            )));
        }
        if options.protocol_name.is_empty() {
            return Err(Error::engine_creation("protocol name must not be empty"));
        }

        let mailbox = Arc::new(Mailbox {
            actions: Mutex::new(Vec::new()),
            signal,
        });
        self.peer.attach(&mailbox);

        debug!(index, protocol = %options.protocol_name, "Loopback context created");

        Ok(Box::new(LoopbackEngine {
            handshake: self.handshake.clone(),
            behavior: self.behavior.clone(),
            writes_paused: Arc::clone(&self.peer.writes_paused),
            journal: self.journal.clone(),
            mailbox,
            sockets: BTreeMap::new(),
            next_handle: 1,
        }))
    }
}

// ============================================================================
// LoopbackEngine
// ============================================================================

/// How the echo peer treats open sockets.
#[derive(Debug, Clone)]
struct PeerBehavior {
    answer_pings: bool,
    greeting: Option<String>,
    write_limit: Option<usize>,
}

#[derive(Debug)]
enum Phase {
    Handshake,
    Refused(String),
    Silent,
    Open,
}

#[derive(Debug)]
enum Inbound {
    Receive {
        data: Vec<u8>,
        is_first: bool,
        is_final: bool,
        is_binary: bool,
    },
    PeerClose(Vec<u8>),
    Pong(Vec<u8>),
    Closed,
    Error(String),
}

#[derive(Debug)]
struct LoopbackSocket {
    phase: Phase,
    inbound: VecDeque<Inbound>,
    writable_requested: bool,
    echo_binary: bool,
    close_sent: bool,
    closing: bool,
    written: usize,
}

/// Outcome of driving one socket once.
#[derive(Debug, Default, Clone, Copy)]
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

struct LoopbackEngine {
    handshake: HandshakeBehavior,
    behavior: PeerBehavior,
    writes_paused: Arc<AtomicBool>,
    journal: LoopbackJournal,
    mailbox: Arc<Mailbox>,
    sockets: BTreeMap<SocketHandle, LoopbackSocket>,
    next_handle: u64,
}

impl LoopbackEngine {
    fn apply_peer_actions(&mut self) {
        let actions = std::mem::take(&mut *self.mailbox.actions.lock());
        for action in actions {
            for socket in self.sockets.values_mut() {
                if !matches!(socket.phase, Phase::Open) || socket.closing {
                    continue;
                }
                socket.inbound.push_back(match action.clone() {
                    PeerAction::Frame {
                        data,
                        is_first,
                        is_final,
                        is_binary,
                    } => Inbound::Receive {
                        data,
                        is_first,
                        is_final,
                        is_binary,
                    },
                    PeerAction::Close(payload) => Inbound::PeerClose(payload),
                    PeerAction::Pong(payload) => Inbound::Pong(payload),
                    PeerAction::Disconnect(description) => Inbound::Error(description),
                });
            }
        }
    }
}

impl NativeEngine for LoopbackEngine {
    fn connect(&mut self, request: &ConnectRequest) -> Result<SocketHandle> {
        if request.host.is_empty() {
            return Err(Error::connection("empty host"));
        }

        let handle = SocketHandle::from_raw(self.next_handle);
        self.next_handle += 1;
        self.journal.record_request(request);

        let phase = match &self.handshake {
            HandshakeBehavior::Accept => Phase::Handshake,
            HandshakeBehavior::Refuse(reason) => Phase::Refused(reason.clone()),
            HandshakeBehavior::Silent => Phase::Silent,
        };
        self.sockets.insert(
            handle,
            LoopbackSocket {
                phase,
                inbound: VecDeque::new(),
                writable_requested: false,
                echo_binary: false,
                close_sent: false,
                closing: false,
                written: 0,
            },
        );

        trace!(socket = %handle, url = %request.url(), "Loopback connect");
        Ok(handle)
    }

    fn service(&mut self, timeout: Duration, callback: &mut dyn NativeCallback) {
        let deadline = Instant::now() + timeout;

        loop {
            self.apply_peer_actions();

            let mut progressed = false;
            let mut finished = Vec::new();
            let handles: Vec<SocketHandle> = self.sockets.keys().copied().collect();
            let writes_paused = self.writes_paused.load(Ordering::SeqCst);

            for handle in handles {
                let Some(socket) = self.sockets.get_mut(&handle) else {
                    continue;
                };
                let step = drive(
                    handle,
                    socket,
                    &self.journal,
                    &self.behavior,
                    writes_paused,
                    callback,
                );
                progressed |= step.progressed;
                if step.finished {
                    finished.push(handle);
                }
            }

            for handle in finished {
                self.sockets.remove(&handle);
            }

            if progressed {
                return;
            }

            let now = Instant::now();
            if now >= deadline || self.mailbox.signal.wait(deadline - now) {
                return;
            }
        }
    }

    fn request_writable(&mut self, socket: SocketHandle) {
        if let Some(socket) = self.sockets.get_mut(&socket) {
            socket.writable_requested = true;
        }
    }

    fn close(&mut self, handle: SocketHandle, code: CloseCode) {
        if let Some(socket) = self.sockets.get_mut(&handle) {
            self.journal.record_close(handle, code);
            socket.closing = true;
        }
    }
}

// ============================================================================
// Socket Driver
// ============================================================================

/// Delivers at most one inbound item and one writable event for `socket`.
fn drive(
    handle: SocketHandle,
    socket: &mut LoopbackSocket,
    journal: &LoopbackJournal,
    behavior: &PeerBehavior,
    writes_paused: bool,
    callback: &mut dyn NativeCallback,
) -> Step {
    if socket.closing {
        let mut view = LoopbackView::new(handle, socket, journal, behavior);
        callback.on_event(&mut view, NativeEvent::Closed);
        return Step::FINISHED;
    }

    match &socket.phase {
        Phase::Open => {}
        Phase::Silent => return Step::IDLE,
        Phase::Refused(reason) => {
            let reason = reason.clone();
            let mut view = LoopbackView::new(handle, socket, journal, behavior);
            callback.on_event(
                &mut view,
                NativeEvent::ConnectionError {
                    description: &reason,
                },
            );
            return Step::FINISHED;
        }
        Phase::Handshake => {
            let mut sink = JournalSink { handle, journal };
            let mut view = LoopbackView::new(handle, socket, journal, behavior);
            let action = callback.on_event(
                &mut view,
                NativeEvent::AppendHandshakeHeaders { sink: &mut sink },
            );
            if action == CallbackAction::Close {
                callback.on_event(
                    &mut view,
                    NativeEvent::ConnectionError {
                        description: "handshake header injection failed",
                    },
                );
                return Step::FINISHED;
            }

            view.socket.phase = Phase::Open;
            if let Some(greeting) = &behavior.greeting {
                view.socket.inbound.push_back(Inbound::Receive {
                    data: greeting.as_bytes().to_vec(),
                    is_first: true,
                    is_final: true,
                    is_binary: false,
                });
            }
            if callback.on_event(&mut view, NativeEvent::Established) == CallbackAction::Close {
                view.socket.closing = true;
            }
            return Step::PROGRESSED;
        }
    }

    let mut step = Step::IDLE;

    if let Some(item) = socket.inbound.pop_front() {
        step = Step::PROGRESSED;
        let mut view = LoopbackView::new(handle, socket, journal, behavior);

        let action = match item {
            Inbound::Receive {
                data,
                is_first,
                is_final,
                is_binary,
            } => callback.on_event(
                &mut view,
                NativeEvent::Receive {
                    data: &data,
                    is_first,
                    is_final,
                    is_binary,
                },
            ),
            Inbound::PeerClose(payload) => {
                let action = callback.on_event(
                    &mut view,
                    NativeEvent::PeerInitiatedClose { payload: &payload },
                );
                // The peer tears the transport down once close frames crossed.
                view.socket.inbound.push_front(Inbound::Closed);
                action
            }
            Inbound::Pong(payload) => {
                callback.on_event(&mut view, NativeEvent::Pong { payload: &payload })
            }
            Inbound::Closed => {
                callback.on_event(&mut view, NativeEvent::Closed);
                return Step::FINISHED;
            }
            Inbound::Error(description) => {
                callback.on_event(
                    &mut view,
                    NativeEvent::ConnectionError {
                        description: &description,
                    },
                );
                return Step::FINISHED;
            }
        };

        if action == CallbackAction::Close {
            view.socket.closing = true;
        }
    }

    if socket.writable_requested && !socket.closing && !writes_paused {
        socket.writable_requested = false;
        step = Step::PROGRESSED;

        let mut view = LoopbackView::new(handle, socket, journal, behavior);
        if callback.on_event(&mut view, NativeEvent::Writable) == CallbackAction::Close {
            view.socket.closing = true;
        }
    }

    step
}

// ============================================================================
// Socket View
// ============================================================================

struct LoopbackView<'a> {
    handle: SocketHandle,
    socket: &'a mut LoopbackSocket,
    journal: &'a LoopbackJournal,
    behavior: &'a PeerBehavior,
}

impl<'a> LoopbackView<'a> {
    fn new(
        handle: SocketHandle,
        socket: &'a mut LoopbackSocket,
        journal: &'a LoopbackJournal,
        behavior: &'a PeerBehavior,
    ) -> Self {
        Self {
            handle,
            socket,
            journal,
            behavior,
        }
    }
}

impl NativeSocket for LoopbackView<'_> {
    fn handle(&self) -> SocketHandle {
        self.handle
    }

    fn write(&mut self, opcode: Opcode, payload: &[u8], fin: bool) -> Result<()> {
        if !matches!(self.socket.phase, Phase::Open) {
            return Err(Error::write_failed("socket is not open"));
        }
        if self.socket.closing || self.socket.close_sent {
            return Err(Error::write_failed("socket is closing"));
        }
        if self
            .behavior
            .write_limit
            .is_some_and(|limit| self.socket.written >= limit)
        {
            return Err(Error::write_failed("loopback write limit reached"));
        }
        self.socket.written += 1;

        self.journal.record_frame(WrittenFrame {
            socket: self.handle,
            opcode,
            payload: payload.to_vec(),
            fin,
        });

        let echo = match opcode {
            Opcode::Text | Opcode::Binary => {
                self.socket.echo_binary = opcode == Opcode::Binary;
                Some(Inbound::Receive {
                    data: payload.to_vec(),
                    is_first: true,
                    is_final: fin,
                    is_binary: self.socket.echo_binary,
                })
            }
            Opcode::Continuation => Some(Inbound::Receive {
                data: payload.to_vec(),
                is_first: false,
                is_final: fin,
                is_binary: self.socket.echo_binary,
            }),
            Opcode::Ping => self
                .behavior
                .answer_pings
                .then(|| Inbound::Pong(payload.to_vec())),
            Opcode::Close(code) => {
                self.socket.close_sent = true;
                let reply = if code.is_sendable() {
                    code.as_u16().to_be_bytes().to_vec()
                } else {
                    Vec::new()
                };
                Some(Inbound::PeerClose(reply))
            }
        };

        if let Some(echo) = echo {
            self.socket.inbound.push_back(echo);
        }
        Ok(())
    }

    fn request_writable(&mut self) {
        self.socket.writable_requested = true;
    }

    fn close(&mut self, code: CloseCode) {
        self.journal.record_close(self.handle, code);
        self.socket.closing = true;
    }
}

struct JournalSink<'a> {
    handle: SocketHandle,
    journal: &'a LoopbackJournal,
}

impl HeaderSink for JournalSink<'_> {
    fn append(&mut self, name: &str, value: &str) -> Result<()> {
        if name.is_empty() || name.contains([':', '\r', '\n']) {
            return Err(Error::connection(format!("invalid header name {name:?}")));
        }
        if value.contains(['\r', '\n']) {
            return Err(Error::connection(format!("invalid value for header {name}")));
        }
        self.journal.record_header(self.handle, name, value);
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
