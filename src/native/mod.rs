//! Boundary to the native I/O engine.
//!
//! The native engine performs DNS, sockets, TLS, the HTTP upgrade and
//! wire framing. This crate only drives it: a polling engine thread calls
//! [`NativeEngine::service`] in a loop and receives every lifecycle event
//! through a single [`NativeCallback`].
//!
//! # Capabilities
//!
//! | Capability | Item |
//! |------------|------|
//! | Create / destroy a context | [`NativeEngineFactory::create`], `Drop` |
//! | Initiate an outbound connection | [`NativeEngine::connect`] |
//! | Blocking service step | [`NativeEngine::service`] |
//! | Request a writable notification | [`NativeEngine::request_writable`], [`NativeSocket::request_writable`] |
//! | Cancel the blocking wait | [`ServiceSignal::wake`] |
//! | Close with a reason code | [`NativeEngine::close`], [`NativeSocket::close`] |
//!
//! # Implementations
//!
//! | Module | Description |
//! |--------|-------------|
//! | `net` | Non-blocking sockets driven by synchronous tungstenite |
//! | `loopback` | In-memory echo peer, no sockets |

// ============================================================================
// Submodules
// ============================================================================

/// In-memory echo engine.
pub mod loopback;

/// Socket engine built on synchronous tungstenite.
pub mod net;

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::Result;
use crate::identifiers::SocketHandle;
use crate::protocol::{CloseCode, Opcode, Scheme};

// ============================================================================
// Re-exports
// ============================================================================

pub use self::loopback::{
    HandshakeBehavior, LoopbackFactory, LoopbackJournal, LoopbackPeer, WrittenFrame,
};
pub use self::net::TungsteniteFactory;

// ============================================================================
// Constants
// ============================================================================

/// Name of the permessage-deflate extension.
pub const PERMESSAGE_DEFLATE: &str = "permessage-deflate";

/// Offer sent for permessage-deflate during the handshake.
pub const PERMESSAGE_DEFLATE_OFFER: &str = "permessage-deflate; client_max_window_bits";

// ============================================================================
// Engine Options
// ============================================================================

/// An extension the engine may offer during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionOffer {
    /// Extension name.
    pub name: String,
    /// Value offered in `Sec-WebSocket-Extensions`.
    pub client_offer: String,
}

impl ExtensionOffer {
    /// The permessage-deflate offer.
    #[must_use]
    pub fn permessage_deflate() -> Self {
        Self {
            name: PERMESSAGE_DEFLATE.to_string(),
            client_offer: PERMESSAGE_DEFLATE_OFFER.to_string(),
        }
    }
}

/// Options for creating one native engine context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    /// Name of the single wire protocol the context serves.
    pub protocol_name: String,
    /// Extensions offered to peers, in preference order.
    pub extensions: Vec<ExtensionOffer>,
    /// Receive buffer size; received data is delivered in chunks no larger.
    pub rx_buffer_size: usize,
}

// ============================================================================
// Connect Request
// ============================================================================

/// Parameters of an outbound connection handed to the native engine.
///
/// Extra handshake headers are not part of the request: the engine asks for
/// them through [`NativeEvent::AppendHandshakeHeaders`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Endpoint scheme.
    pub scheme: Scheme,
    /// Host to resolve and connect to.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Request target: path plus optional `?query`.
    pub resource: String,
    /// Value of the `Host` header.
    pub host_header: String,
    /// Value of the `Origin` header.
    pub origin: String,
    /// Wire protocol name.
    pub protocol: String,
    /// Send `protocol` as `Sec-WebSocket-Protocol`.
    ///
    /// A server that does not echo an offered protocol fails the handshake.
    pub offer_protocol: bool,
    /// Offer the context's extensions to this peer.
    pub compression: bool,
    /// Deadline for TCP connect plus handshake.
    pub connect_timeout: Duration,
    /// Largest chunk delivered per receive event.
    pub max_frame_size: usize,
    /// Largest incoming message the engine buffers, unlimited if `None`.
    pub max_message_size: Option<usize>,
}

impl ConnectRequest {
    /// Returns the full `scheme://host:port/resource` URL.
    #[must_use]
    pub fn url(&self) -> String {
        format!(
            "{}://{}:{}{}",
            self.scheme, self.host, self.port, self.resource
        )
    }
}

// ============================================================================
// Events
// ============================================================================

/// Sink for headers injected into the opening handshake.
pub trait HeaderSink {
    /// Appends one header to the handshake request.
    ///
    /// # Errors
    ///
    /// Returns an error if the header is malformed or the buffer is full.
    fn append(&mut self, name: &str, value: &str) -> Result<()>;
}

/// Lifecycle event reported by the native engine for one socket.
pub enum NativeEvent<'a> {
    /// The opening handshake completed.
    Established,
    /// A chunk of an incoming message.
    Receive {
        /// Payload bytes of this chunk.
        data: &'a [u8],
        /// First chunk of its message.
        is_first: bool,
        /// Last chunk of its message.
        is_final: bool,
        /// The message is binary rather than text.
        is_binary: bool,
    },
    /// The socket can accept another frame.
    Writable,
    /// The peer sent a close frame.
    PeerInitiatedClose {
        /// Close frame payload (big-endian code, then reason).
        payload: &'a [u8],
    },
    /// The socket is gone; its handle will not be reported again.
    Closed,
    /// The connection failed; its handle will not be reported again.
    ConnectionError {
        /// Human-readable failure description.
        description: &'a str,
    },
    /// Incoming data broke the protocol.
    ///
    /// The engine closes the socket with `code` and reports
    /// [`NativeEvent::Closed`] once the close frame went out.
    ProtocolViolation {
        /// Close code sent to the peer.
        code: CloseCode,
        /// What was wrong with the data.
        description: &'a str,
    },
    /// A pong arrived.
    Pong {
        /// Pong payload.
        payload: &'a [u8],
    },
    /// The handshake buffer is open for extra headers.
    ///
    /// Must be answered synchronously, before the callback returns.
    AppendHandshakeHeaders {
        /// Where to write the headers.
        sink: &'a mut dyn HeaderSink,
    },
}

impl NativeEvent<'_> {
    /// Short event name for logging.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Established => "established",
            Self::Receive { .. } => "receive",
            Self::Writable => "writable",
            Self::PeerInitiatedClose { .. } => "peer_initiated_close",
            Self::Closed => "closed",
            Self::ConnectionError { .. } => "connection_error",
            Self::ProtocolViolation { .. } => "protocol_violation",
            Self::Pong { .. } => "pong",
            Self::AppendHandshakeHeaders { .. } => "append_handshake_headers",
        }
    }
}

/// What the native engine should do with the socket after a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    /// Keep the socket.
    Continue,
    /// Close and destroy the socket.
    Close,
}

// ============================================================================
// Traits
// ============================================================================

/// Socket view handed to a callback for the duration of one event.
pub trait NativeSocket {
    /// Handle of the socket the event belongs to.
    fn handle(&self) -> SocketHandle;

    /// Writes one frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WriteFailed`](crate::Error::WriteFailed) if the frame
    /// could not be handed to the socket in full.
    fn write(&mut self, opcode: Opcode, payload: &[u8], fin: bool) -> Result<()>;

    /// Asks for another [`NativeEvent::Writable`].
    fn request_writable(&mut self);

    /// Closes the socket with the given code.
    fn close(&mut self, code: CloseCode);
}

/// Receiver of native lifecycle events.
pub trait NativeCallback {
    /// Handles one event for one socket.
    fn on_event(&mut self, socket: &mut dyn NativeSocket, event: NativeEvent<'_>)
    -> CallbackAction;
}

/// One native engine context.
///
/// Only the polling engine thread that owns the context drives it.
pub trait NativeEngine: Send {
    /// Starts an outbound connection and returns its handle.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot even be started.
    fn connect(&mut self, request: &ConnectRequest) -> Result<SocketHandle>;

    /// Performs pending I/O, invoking `callback` for every event.
    ///
    /// Blocks for at most `timeout` when idle; returns early once the
    /// context's [`ServiceSignal`] is woken.
    fn service(&mut self, timeout: Duration, callback: &mut dyn NativeCallback);

    /// Requests a writable notification for `socket`.
    fn request_writable(&mut self, socket: SocketHandle);

    /// Closes `socket` with `code`.
    ///
    /// The engine reports [`NativeEvent::Closed`] for it on a later service
    /// step unless the handle is unknown.
    fn close(&mut self, socket: SocketHandle, code: CloseCode);
}

/// Creates native engine contexts.
pub trait NativeEngineFactory: Send + Sync {
    /// Creates a context.
    ///
    /// `signal` is the wake-up source the context must honour while
    /// blocked in [`NativeEngine::service`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::EngineCreationFailed`](crate::Error::EngineCreationFailed)
    /// if the context cannot be created.
    fn create(
        &self,
        options: &EngineOptions,
        signal: Arc<ServiceSignal>,
    ) -> Result<Box<dyn NativeEngine>>;
}

// ============================================================================
// ServiceSignal
// ============================================================================

/// Cross-thread wake-up for a blocked service step.
#[derive(Debug, Default)]
pub struct ServiceSignal {
    /// Set by `wake`, cleared by whoever observes it.
    woken: Mutex<bool>,
    /// Notified on `wake`.
    condvar: Condvar,
}

impl ServiceSignal {
    /// Creates an unsignalled instance.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Forces the current or next wait to return early.
    pub fn wake(&self) {
        let mut woken = self.woken.lock();
        *woken = true;
        self.condvar.notify_all();
    }

    /// Blocks until woken or until `timeout` elapses.
    ///
    /// Returns `true` if a wake-up was consumed.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut woken = self.woken.lock();
        if !*woken {
            let _ = self.condvar.wait_for(&mut woken, timeout);
        }
        std::mem::replace(&mut *woken, false)
    }

    /// Consumes a pending wake-up without blocking.
    pub fn take(&self) -> bool {
        std::mem::replace(&mut *self.woken.lock(), false)
    }
}

// ============================================================================
// Tests
// ============================================================================
