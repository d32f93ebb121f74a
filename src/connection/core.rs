//! Connection state machine and public handle.
//!
//! A [`Connection`] is a cheap, cloneable handle to shared connection state.
//! The polling engine that owns the socket only holds a weak reference
//! through its registry; dropping the last handle tears the socket down.
//!
//! # Lifecycle
//!
//! | State | Entered when |
//! |-------|--------------|
//! | Connecting | [`Connection::connect`] scheduled the native connect |
//! | Open | The handshake completed |
//! | Closing | [`Connection::close`] queued a close frame |
//! | Closed | A close code was recorded |
//!
//! A connection error sets a sticky flag that makes the connection unusable
//! in any state.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::{ConnectionId, EngineId, SocketHandle};
use crate::native::ConnectRequest;
use crate::protocol::{CloseCode, Opcode};
use crate::transport::{EngineContext, EnginePool, PollingEngine};

use super::assembler::FrameAssembler;
use super::callbacks::{Callbacks, Delivery, Fragment, Registration, spawn_delivery};
use super::config::ConnectionConfig;
use super::keepalive::Keepalive;
use super::queue::{Completion, PendingWrite, WriteQueue};

// ============================================================================
// LifecycleState
// ============================================================================

/// Mutable lifecycle flags, guarded by one lock.
#[derive(Debug, Default)]
pub(crate) struct LifecycleState {
    /// Native socket, once the connect job ran.
    pub(crate) socket: Option<SocketHandle>,
    /// The handshake completed at some point.
    pub(crate) was_connected: bool,
    /// The native engine reported a connection error.
    pub(crate) had_connection_error: bool,
    /// First close code recorded.
    pub(crate) close_status: Option<CloseCode>,
    /// Code staged by a local close request.
    pub(crate) waiting_close_status: Option<CloseCode>,
    /// Our close frame reached the socket.
    pub(crate) close_frame_sent: bool,
    /// Resolver of the connect future.
    pub(crate) pending_connect: Option<oneshot::Sender<Result<()>>>,
    /// Message being reassembled.
    pub(crate) frame_sequence: Option<FrameAssembler>,
    /// A keepalive ping is unanswered.
    pub(crate) waiting_for_pong: bool,
}

impl LifecycleState {
    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        self.socket.is_none() || !self.was_connected || self.is_closed_forever()
    }

    #[inline]
    pub(crate) fn is_closed_forever(&self) -> bool {
        self.had_connection_error || self.close_status.is_some()
    }
}

// ============================================================================
// ConnectionInner
// ============================================================================

/// State shared by all handles of one connection.
pub(crate) struct ConnectionInner {
    pub(crate) id: ConnectionId,
    pub(crate) config: ConnectionConfig,
    pub(crate) engine: Arc<PollingEngine>,
    pub(crate) state: Mutex<LifecycleState>,
    pub(crate) queue: WriteQueue,
    runtime: Handle,
    deliveries: mpsc::UnboundedSender<Delivery>,
    keepalive: Mutex<Option<Keepalive>>,
}

impl ConnectionInner {
    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().is_closed()
    }

    #[inline]
    pub(crate) fn is_closed_forever(&self) -> bool {
        self.state.lock().is_closed_forever()
    }

    /// Queues a delivery for the consumer callbacks.
    pub(crate) fn deliver(&self, delivery: Delivery) {
        // The delivery task only stops once every handle is gone.
        let _ = self.deliveries.send(delivery);
    }

    /// Resolves the connect future with `error` unless it already resolved.
    pub(crate) fn fail_pending_connect(&self, error: Error) {
        let pending = self.state.lock().pending_connect.take();
        if let Some(tx) = pending {
            debug!(connection_id = %self.id, error = %error, "Connect failed");
            let _ = tx.send(Err(error));
        }
    }

    /// Splits `data` into frames and queues them for the socket.
    ///
    /// `completion` fires with the outcome of the last frame.
    pub(crate) fn enqueue(
        &self,
        data: Vec<u8>,
        opcode: Opcode,
        fin: bool,
        completion: Option<Completion>,
    ) {
        let state = self.state.lock();

        let socket = if state.is_closed_forever() || state.waiting_close_status.is_some() {
            Err(Error::ConnectionClosed)
        } else {
            state.socket.filter(|_| !state.is_closed()).ok_or(Error::NotYetOpen)
        };

        let socket = match socket {
            Ok(socket) => socket,
            Err(error) => {
                drop(state);
                PendingWrite::new(Vec::new(), opcode, fin, completion).fail(error);
                return;
            }
        };

        let entries = split_frames(data, opcode, fin, completion, self.config.max_frame_size);
        // Pushed under the state lock so a concurrent close cannot slip in between.
        let rejected = self.queue.push_all(entries).err();
        drop(state);

        match rejected {
            Some(entries) => entries
                .into_iter()
                .for_each(|entry| entry.fail(Error::ConnectionClosed)),
            None => self.engine.call_writable(socket),
        }
    }

    /// Requests a graceful close with `code`.
    pub(crate) fn close(&self, code: CloseCode) {
        let mut state = self.state.lock();
        if state.is_closed_forever() || state.waiting_close_status.is_some() {
            return;
        }
        state.waiting_close_status = Some(code);
        let socket = state.socket;

        if state.was_connected {
            let entry = PendingWrite::new(Vec::new(), Opcode::Close(code), true, None);
            let queued = self.queue.push_all(vec![entry]).is_ok();
            drop(state);

            debug!(connection_id = %self.id, code = code.as_u16(), "Close requested");
            if let (true, Some(socket)) = (queued, socket) {
                self.engine.call_writable(socket);
            }
        } else {
            let pending = state.pending_connect.take();
            drop(state);

            if let Some(tx) = pending {
                let _ = tx.send(Err(Error::ConnectionClosed));
            }
            self.mark_as_closed(code);
            if let Some(socket) = socket {
                self.engine.close_socket(socket, code);
            }
        }
    }

    /// Closes the write queue and fails everything still in it.
    pub(crate) fn fail_writes(&self, reason: &str) {
        let drained = {
            let _state = self.state.lock();
            self.queue.close()
        };
        if !drained.is_empty() {
            debug!(connection_id = %self.id, dropped = drained.len(), "Failing queued writes");
        }
        for entry in drained {
            entry.fail(Error::write_failed(reason));
        }
    }

    /// Records `code` as the close status.
    ///
    /// Fails every queued write and delivers the close callback. Returns
    /// `false` if a close code was already recorded.
    pub(crate) fn mark_as_closed(&self, code: CloseCode) -> bool {
        let drained = {
            let mut state = self.state.lock();
            if state.close_status.is_some() {
                return false;
            }
            state.close_status = Some(code);
            state.frame_sequence = None;
            state.waiting_for_pong = false;
            self.queue.close()
        };

        for entry in drained {
            entry.fail(Error::ConnectionClosed);
        }
        self.keepalive.lock().take();

        info!(connection_id = %self.id, code = code.as_u16(), "Connection closed");
        self.deliver(Delivery::Close(code));
        true
    }

    /// Records `code` and tears the socket down without a closing handshake.
    pub(crate) fn force_close(&self, code: CloseCode) {
        if !self.mark_as_closed(code) {
            return;
        }
        let socket = self.state.lock().socket;
        if let Some(socket) = socket {
            self.engine.close_socket(socket, code);
        }
    }

    /// Closes the connection because its engine is going away.
    pub(crate) fn engine_destroyed(&self) {
        let pending = {
            let mut state = self.state.lock();
            state.socket = None;
            state.pending_connect.take()
        };
        if let Some(tx) = pending {
            let _ = tx.send(Err(Error::EngineShutdown));
        }
        self.mark_as_closed(CloseCode::NoStatusContextDestroy);
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        let ConnectionInner {
            id,
            engine,
            state,
            queue,
            ..
        } = self;
        let state = state.get_mut();

        if let Some(tx) = state.pending_connect.take() {
            let _ = tx.send(Err(Error::DestroyedBeforeConnect));
        }

        if let Some(socket) = state.socket.take() {
            engine.registry().remove(socket);
            engine.close_socket(socket, CloseCode::GoingAway);
        }

        for entry in queue.close() {
            entry.fail(Error::ConnectionClosed);
        }

        trace!(connection_id = %id, "Connection dropped");
    }
}

// ============================================================================
// Connection
// ============================================================================

/// Client-side WebSocket connection.
///
/// Handles are cheap to clone and safe to use from any thread. Sends and
/// closes only enqueue work; the polling engine performs the I/O.
///
/// # Example
///
/// ```ignore
/// let pool = EnginePool::default();
/// let config = ConnectionConfig::builder("echo.example.com").path("/echo").build()?;
/// let connection = Connection::connect(&pool, config).await?;
///
/// connection.on_text(|_, text| println!("received {text}"));
/// connection.send_text("HELLO").await?;
/// connection.close(CloseCode::Normal);
/// ```
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

// ============================================================================
// Connection - Constructor
// ============================================================================

impl Connection {
    /// Connects to the endpoint described by `config` without handlers.
    ///
    /// Handlers registered on the returned connection miss anything that
    /// arrived before they were set. Use [`connect_with`](Self::connect_with)
    /// when the server may speak first.
    ///
    /// # Errors
    ///
    /// See [`connect_with`](Self::connect_with).
    pub async fn connect(pool: &EnginePool, config: ConnectionConfig) -> Result<Self> {
        Self::connect_with(pool, config, Callbacks::new()).await
    }

    /// Connects to the endpoint described by `config`.
    ///
    /// The connection is started on the next engine of `pool`. `callbacks`
    /// are installed before the connect is scheduled, so they see every
    /// event. Callbacks run on `config.callback_runtime`, or on the runtime
    /// this is awaited from.
    ///
    /// # Errors
    ///
    /// - [`Error::EngineCreationFailed`] if the pool could not be started
    /// - [`Error::Connection`] if the native engine reported a failure
    /// - [`Error::ConnectTimeout`] if the handshake did not finish in time
    /// - [`Error::EngineShutdown`] if the engine stopped while connecting
    pub async fn connect_with(
        pool: &EnginePool,
        config: ConnectionConfig,
        callbacks: Callbacks,
    ) -> Result<Self> {
        let engine = pool.acquire()?;
        Self::connect_on(engine, config, callbacks).await
    }

    pub(crate) async fn connect_on(
        engine: Arc<PollingEngine>,
        config: ConnectionConfig,
        callbacks: Callbacks,
    ) -> Result<Self> {
        let runtime = match config.callback_runtime.clone() {
            Some(runtime) => runtime,
            None => Handle::try_current()
                .map_err(|e| Error::config(format!("no runtime for callbacks: {e}")))?,
        };

        let id = ConnectionId::next();
        let request = config.connect_request(engine.protocol_name());
        let connect_timeout = config.connect_timeout;
        let (connect_tx, connect_rx) = oneshot::channel();

        let inner = Arc::new_cyclic(|weak| ConnectionInner {
            id,
            deliveries: spawn_delivery(&runtime, weak.clone(), id),
            config,
            engine,
            state: Mutex::new(LifecycleState {
                pending_connect: Some(connect_tx),
                ..LifecycleState::default()
            }),
            queue: WriteQueue::new(),
            runtime,
            keepalive: Mutex::new(None),
        });

        for registration in callbacks.into_registrations() {
            inner.deliver(Delivery::Register(registration));
        }

        debug!(
            connection_id = %id,
            engine = %inner.engine.id(),
            url = %request.url(),
            "Connect scheduled"
        );

        let connection = Arc::downgrade(&inner);
        inner
            .engine
            .schedule_immediate(move |cx: &mut EngineContext<'_>| {
                start_connect(cx, &connection, &request);
            })?;

        let timer = {
            let connection = Arc::downgrade(&inner);
            tokio::spawn(async move {
                tokio::time::sleep(connect_timeout).await;
                if let Some(inner) = connection.upgrade() {
                    inner.fail_pending_connect(Error::connect_timeout(
                        connect_timeout.as_millis() as u64,
                    ));
                }
            })
        };

        let outcome = connect_rx.await.unwrap_or(Err(Error::EngineShutdown));
        timer.abort();

        match outcome {
            Ok(()) => {
                info!(connection_id = %id, "Connection established");
                Ok(Self { inner })
            }
            Err(error) => {
                warn!(connection_id = %id, error = %error, "Connect failed");
                Err(error)
            }
        }
    }

    #[inline]
    pub(crate) fn from_inner(inner: Arc<ConnectionInner>) -> Self {
        Self { inner }
    }
}

/// Runs on the engine thread: opens the native socket and registers it.
fn start_connect(
    cx: &mut EngineContext<'_>,
    connection: &Weak<ConnectionInner>,
    request: &ConnectRequest,
) {
    let Some(inner) = connection.upgrade() else {
        return;
    };

    if cx.is_shutting_down() {
        inner.fail_pending_connect(Error::EngineShutdown);
        return;
    }
    if inner.state.lock().pending_connect.is_none() {
        // Timed out before the engine got to it.
        return;
    }

    match cx.native().connect(request) {
        Ok(socket) => {
            cx.registry().insert(socket, Arc::downgrade(&inner));
            inner.state.lock().socket = Some(socket);
            trace!(connection_id = %inner.id, socket = %socket, "Native connect started");
        }
        Err(error) => {
            inner.state.lock().had_connection_error = true;
            inner.fail_pending_connect(error);
        }
    }
}

// ============================================================================
// Connection - Accessors
// ============================================================================

impl Connection {
    /// Returns the connection ID.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Returns the ID of the engine servicing this connection.
    #[inline]
    #[must_use]
    pub fn engine_id(&self) -> EngineId {
        self.inner.engine.id()
    }

    /// Returns the configuration the connection was opened with.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Returns `true` if sends are currently rejected.
    ///
    /// True while not yet established, after an error and once a close
    /// code was recorded.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Returns `true` if the connection can never be used again.
    #[inline]
    #[must_use]
    pub fn is_closed_forever(&self) -> bool {
        self.inner.is_closed_forever()
    }

    /// Returns the recorded close code, if any.
    #[inline]
    #[must_use]
    pub fn close_status(&self) -> Option<CloseCode> {
        self.inner.state.lock().close_status
    }
}

// ============================================================================
// Connection - Writes
// ============================================================================

impl Connection {
    /// Queues `data` for sending.
    ///
    /// Payloads larger than the configured frame size are split: the first
    /// frame keeps `opcode`, the rest are continuations, and only the last
    /// one carries `fin`. Frames of one connection reach the wire in call
    /// order.
    ///
    /// The frames are queued before this returns; the future only reports
    /// the outcome and may be dropped.
    ///
    /// # Errors
    ///
    /// The future resolves to:
    /// - [`Error::ConnectionClosed`] if the connection is closed or closing
    /// - [`Error::NotYetOpen`] if the handshake has not completed
    /// - [`Error::WriteFailed`] if the socket refused the frame
    pub fn send(&self, data: impl Into<Vec<u8>>, opcode: Opcode, fin: bool) -> SendFuture {
        let (tx, rx) = oneshot::channel();
        self.inner.enqueue(data.into(), opcode, fin, Some(tx));
        SendFuture { rx }
    }

    /// Sends a complete text message.
    #[inline]
    pub fn send_text(&self, text: impl Into<String>) -> SendFuture {
        self.send(text.into().into_bytes(), Opcode::Text, true)
    }

    /// Sends a complete binary message.
    #[inline]
    pub fn send_binary(&self, data: impl Into<Vec<u8>>) -> SendFuture {
        self.send(data, Opcode::Binary, true)
    }

    /// Sends a ping.
    #[inline]
    pub fn ping(&self, payload: impl Into<Vec<u8>>) -> SendFuture {
        self.send(payload, Opcode::Ping, true)
    }

    /// Starts a graceful close with `code`.
    ///
    /// The close frame is queued behind earlier sends. Calling this again,
    /// or after the connection closed, does nothing.
    pub fn close(&self, code: CloseCode) {
        self.inner.close(code);
    }
}

// ============================================================================
// Connection - Callbacks
// ============================================================================

impl Connection {
    /// Sets the handler for complete text messages.
    pub fn on_text(&self, handler: impl FnMut(&Connection, String) + Send + 'static) {
        self.register(Registration::Text(Box::new(handler)));
    }

    /// Sets the handler for complete binary messages.
    pub fn on_binary(&self, handler: impl FnMut(&Connection, Vec<u8>) + Send + 'static) {
        self.register(Registration::Binary(Box::new(handler)));
    }

    /// Sets the handler called for every received frame.
    pub fn on_fragment(&self, handler: impl FnMut(&Connection, Fragment) + Send + 'static) {
        self.register(Registration::Fragment(Box::new(handler)));
    }

    /// Sets the handler for pongs.
    pub fn on_pong(&self, handler: impl FnMut(&Connection, Vec<u8>) + Send + 'static) {
        self.register(Registration::Pong(Box::new(handler)));
    }

    /// Sets the handler for the close event. It runs at most once.
    ///
    /// If the connection already closed, the handler runs right away with
    /// the recorded code.
    pub fn on_close(&self, handler: impl FnMut(CloseCode) + Send + 'static) {
        self.register(Registration::Close(Box::new(handler)));
    }

    fn register(&self, registration: Registration) {
        self.inner.deliver(Delivery::Register(registration));
    }
}

// ============================================================================
// Connection - Keepalive
// ============================================================================

impl Connection {
    /// Returns the keepalive ping interval.
    #[must_use]
    pub fn ping_interval(&self) -> Option<Duration> {
        self.inner.keepalive.lock().as_ref().map(Keepalive::interval)
    }

    /// Replaces the keepalive.
    ///
    /// Each tick sends a ping; a tick that finds the previous ping still
    /// unanswered closes the connection with [`CloseCode::AbnormalClose`].
    /// `None` or a zero interval disables the keepalive.
    pub fn set_ping_interval(&self, interval: Option<Duration>) {
        let mut keepalive = self.inner.keepalive.lock();
        *keepalive = None;
        self.inner.state.lock().waiting_for_pong = false;

        let Some(interval) = interval.filter(|interval| !interval.is_zero()) else {
            return;
        };
        if self.inner.is_closed_forever() {
            return;
        }

        debug!(
            connection_id = %self.inner.id,
            interval_ms = interval.as_millis() as u64,
            "Keepalive armed"
        );
        *keepalive = Some(Keepalive::spawn(
            &self.inner.runtime,
            Arc::downgrade(&self.inner),
            interval,
        ));
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("engine", &self.inner.engine.id())
            .field("url", &self.inner.config.url())
            .field("close_status", &self.close_status())
            .finish()
    }
}

// ============================================================================
// SendFuture
// ============================================================================

/// Outcome of one [`Connection::send`].
#[derive(Debug)]
pub struct SendFuture {
    rx: oneshot::Receiver<Result<()>>,
}

impl Future for SendFuture {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|outcome| outcome.unwrap_or(Err(Error::ConnectionClosed)))
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Splits one send into frames of at most `max_frame_size` bytes.
fn split_frames(
    data: Vec<u8>,
    opcode: Opcode,
    fin: bool,
    mut completion: Option<Completion>,
    max_frame_size: usize,
) -> Vec<PendingWrite> {
    if data.len() <= max_frame_size || !opcode.is_data() {
        return vec![PendingWrite::new(data, opcode, fin, completion)];
    }

    let count = data.len().div_ceil(max_frame_size);
    data.chunks(max_frame_size)
        .enumerate()
        .map(|(index, chunk)| {
            let last = index + 1 == count;
            PendingWrite::new(
                chunk.to_vec(),
                if index == 0 { opcode } else { Opcode::Continuation },
                fin && last,
                if last { completion.take() } else { None },
            )
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::tungstenite::protocol::frame::Frame;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::{Data as OpData, OpCode};

    use crate::connection::ConnectionBuilder;
    use crate::native::{HandshakeBehavior, LoopbackFactory, TungsteniteFactory};
    use crate::transport::PoolConfig;

    #[test]
    fn test_split_small_payload_single_frame() {
        let frames = split_frames(b"HELLO".to_vec(), Opcode::Text, true, None, 16);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].opcode, Opcode::Text);
        assert!(frames[0].fin);
    }

    #[tokio::test]
    async fn test_split_large_payload() {
        let (tx, rx) = oneshot::channel();
        let frames = split_frames(b"HELLOWORLD".to_vec(), Opcode::Binary, true, Some(tx), 4);

        let shape: Vec<(Opcode, usize, bool, bool)> = frames
            .iter()
            .map(|f| (f.opcode, f.data.len(), f.fin, f.completion.is_some()))
            .collect();
        assert_eq!(
            shape,
            vec![
                (Opcode::Binary, 4, false, false),
                (Opcode::Continuation, 4, false, false),
                (Opcode::Continuation, 2, true, true),
            ]
        );

        let rebuilt: Vec<u8> = frames.iter().flat_map(|f| f.data.clone()).collect();
        assert_eq!(rebuilt, b"HELLOWORLD");

        for frame in frames {
            frame.resolve(Ok(()));
        }
        assert!(rx.await.expect("completion").is_ok());
    }

    #[test]
    fn test_split_keeps_caller_fin_false() {
        let frames = split_frames(vec![0; 9], Opcode::Text, false, None, 4);
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| !f.fin));
    }

    #[test]
    fn test_control_frames_never_split() {
        let frames = split_frames(vec![0; 9], Opcode::Ping, true, None, 4);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_send_future_reports_dropped_completion() {
        let (tx, rx) = oneshot::channel::<Result<()>>();
        let mut future = tokio_test::task::spawn(SendFuture { rx });

        tokio_test::assert_pending!(future.poll());
        drop(tx);
        assert!(future.is_woken());

        let outcome = tokio_test::assert_ready!(future.poll());
        assert!(matches!(outcome, Err(Error::ConnectionClosed)));
    }

    #[test]
    fn test_lifecycle_flags() {
        let mut state = LifecycleState::default();
        assert!(state.is_closed());
        assert!(!state.is_closed_forever());

        state.socket = Some(SocketHandle::from_raw(1));
        state.was_connected = true;
        assert!(!state.is_closed());

        state.close_status = Some(CloseCode::Normal);
        assert!(state.is_closed());
        assert!(state.is_closed_forever());

        let errored = LifecycleState {
            had_connection_error: true,
            ..LifecycleState::default()
        };
        assert!(errored.is_closed_forever());
    }

    // ========================================================================
    // End-to-end against the loopback engine
    // ========================================================================

    const WAIT: Duration = Duration::from_secs(5);

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn loopback_pool(factory: &LoopbackFactory) -> EnginePool {
        init_tracing();
        EnginePool::with_config(
            Arc::new(factory.clone()),
            PoolConfig::default()
                .size(1)
                .service_timeout(Duration::from_millis(20)),
        )
        .expect("pool")
    }

    fn builder() -> ConnectionBuilder {
        ConnectionConfig::builder("loopback.test").path("/echo")
    }

    async fn connect(factory: &LoopbackFactory) -> (EnginePool, Connection) {
        let pool = loopback_pool(factory);
        let config = builder().build().expect("config");
        let connection = Connection::connect(&pool, config).await.expect("connect");
        (pool, connection)
    }

    async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed")
    }

    fn close_channel(connection: &Connection) -> mpsc::UnboundedReceiver<CloseCode> {
        let (tx, rx) = mpsc::unbounded_channel();
        connection.on_close(move |code| {
            let _ = tx.send(code);
        });
        rx
    }

    #[tokio::test]
    async fn test_text_echo() {
        let factory = LoopbackFactory::new();
        let (_pool, connection) = connect(&factory).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        connection.on_text(move |_, text| {
            let _ = tx.send(text);
        });

        connection.send_text("HELLO").await.expect("send");
        assert_eq!(next(&mut rx).await, "HELLO");
        assert!(!connection.is_closed());
    }

    #[tokio::test]
    async fn test_fragmented_send_reassembled() {
        let factory = LoopbackFactory::new();
        let pool = loopback_pool(&factory);
        let config = builder().max_frame_size(1).build().expect("config");
        let connection = Connection::connect(&pool, config).await.expect("connect");

        let (fragments_tx, mut fragments) = mpsc::unbounded_channel();
        connection.on_fragment(move |_, fragment| {
            let _ = fragments_tx.send(fragment);
        });
        let (text_tx, mut texts) = mpsc::unbounded_channel();
        connection.on_text(move |_, text| {
            let _ = text_tx.send(text);
        });

        connection.send_text("HELLO").await.expect("send");
        assert_eq!(next(&mut texts).await, "HELLO");

        let mut flags = Vec::new();
        for _ in 0..5 {
            let fragment = next(&mut fragments).await;
            assert!(fragment.is_text);
            flags.push((fragment.data, fragment.is_first, fragment.is_final));
        }
        assert_eq!(
            flags,
            vec![
                (b"H".to_vec(), true, false),
                (b"E".to_vec(), false, false),
                (b"L".to_vec(), false, false),
                (b"L".to_vec(), false, false),
                (b"O".to_vec(), false, true),
            ]
        );

        let opcodes: Vec<Opcode> = factory
            .journal()
            .frames()
            .iter()
            .map(|frame| frame.opcode)
            .collect();
        assert_eq!(opcodes[0], Opcode::Text);
        assert!(opcodes[1..5].iter().all(|op| *op == Opcode::Continuation));
    }

    #[tokio::test]
    async fn test_caller_fragments_delivered_once() {
        let factory = LoopbackFactory::new();
        let (_pool, connection) = connect(&factory).await;

        let (fragments_tx, mut fragments) = mpsc::unbounded_channel();
        connection.on_fragment(move |_, fragment| {
            let _ = fragments_tx.send((fragment.is_first, fragment.is_final));
        });
        let (text_tx, mut texts) = mpsc::unbounded_channel();
        connection.on_text(move |_, text| {
            let _ = text_tx.send(text);
        });

        let frames = [
            (b"H", Opcode::Text, false),
            (b"E", Opcode::Continuation, false),
            (b"L", Opcode::Continuation, false),
            (b"L", Opcode::Continuation, false),
            (b"O", Opcode::Continuation, true),
        ];
        for (data, opcode, fin) in frames {
            connection.send(data.to_vec(), opcode, fin).await.expect("send");
        }

        assert_eq!(next(&mut texts).await, "HELLO");
        let mut flags = Vec::new();
        for _ in 0..5 {
            flags.push(next(&mut fragments).await);
        }
        assert_eq!(
            flags,
            vec![
                (true, false),
                (false, false),
                (false, false),
                (false, false),
                (false, true)
            ]
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(texts.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_binary_echo_and_send_order() {
        let factory = LoopbackFactory::new();
        let (_pool, connection) = connect(&factory).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        connection.on_binary(move |_, data| {
            let _ = tx.send(data);
        });

        let payloads: [&[u8]; 3] = [b"one", b"two", b"three"];
        let sends: Vec<SendFuture> = payloads
            .iter()
            .map(|data| connection.send_binary(data.to_vec()))
            .collect();
        for send in sends {
            send.await.expect("send");
        }

        assert_eq!(next(&mut rx).await, b"one");
        assert_eq!(next(&mut rx).await, b"two");
        assert_eq!(next(&mut rx).await, b"three");
    }

    #[tokio::test]
    async fn test_local_close_is_idempotent() {
        let factory = LoopbackFactory::new();
        let (_pool, connection) = connect(&factory).await;
        let mut closes = close_channel(&connection);

        connection.close(CloseCode::Normal);
        connection.close(CloseCode::GoingAway);

        assert_eq!(next(&mut closes).await, CloseCode::Normal);
        assert_eq!(connection.close_status(), Some(CloseCode::Normal));
        assert!(connection.is_closed_forever());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(closes.try_recv().is_err());

        let result = connection.send_text("late").await;
        assert!(matches!(result, Err(Error::ConnectionClosed)));

        let close_frames = factory
            .journal()
            .frames()
            .into_iter()
            .filter(|frame| frame.opcode.is_close())
            .count();
        assert_eq!(close_frames, 1);
    }

    #[tokio::test]
    async fn test_peer_close_code_recorded() {
        let factory = LoopbackFactory::new();
        let (_pool, connection) = connect(&factory).await;
        let mut closes = close_channel(&connection);

        factory.peer().close(CloseCode::GoingAway);

        assert_eq!(next(&mut closes).await, CloseCode::GoingAway);
        assert_eq!(connection.close_status(), Some(CloseCode::GoingAway));
    }

    #[tokio::test]
    async fn test_oversized_message_closes() {
        let factory = LoopbackFactory::new();
        let pool = loopback_pool(&factory);
        let config = builder().max_message_size(4).build().expect("config");
        let connection = Connection::connect(&pool, config).await.expect("connect");
        let mut closes = close_channel(&connection);

        factory.peer().send_text("HELLO");

        assert_eq!(next(&mut closes).await, CloseCode::MessageTooLarge);
        assert!(
            factory
                .journal()
                .closes()
                .iter()
                .any(|(_, code)| *code == CloseCode::MessageTooLarge)
        );
    }

    #[tokio::test]
    async fn test_invalid_utf8_closes() {
        let factory = LoopbackFactory::new();
        let (_pool, connection) = connect(&factory).await;
        let mut closes = close_channel(&connection);

        factory.peer().send_frame(&[0xff, 0xfe, 0xfd], true, true, false);

        assert_eq!(next(&mut closes).await, CloseCode::InvalidPayload);
    }

    #[tokio::test]
    async fn test_disconnect_is_abnormal() {
        let factory = LoopbackFactory::new();
        let (_pool, connection) = connect(&factory).await;
        let mut closes = close_channel(&connection);

        factory.peer().disconnect("connection reset");

        assert_eq!(next(&mut closes).await, CloseCode::AbnormalClose);
        assert!(connection.is_closed_forever());
    }

    #[tokio::test]
    async fn test_keepalive_answered() {
        let factory = LoopbackFactory::new();
        let (_pool, connection) = connect(&factory).await;

        let (tx, mut pongs) = mpsc::unbounded_channel();
        connection.on_pong(move |_, payload| {
            let _ = tx.send(payload);
        });
        connection.set_ping_interval(Some(Duration::from_millis(100)));
        assert_eq!(connection.ping_interval(), Some(Duration::from_millis(100)));

        next(&mut pongs).await;
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(!connection.is_closed());

        connection.set_ping_interval(None);
        assert_eq!(connection.ping_interval(), None);
    }

    #[tokio::test]
    async fn test_keepalive_timeout_closes() {
        let factory = LoopbackFactory::new().answer_pings(false);
        let (_pool, connection) = connect(&factory).await;
        let mut closes = close_channel(&connection);

        connection.set_ping_interval(Some(Duration::from_millis(50)));

        assert_eq!(next(&mut closes).await, CloseCode::AbnormalClose);
        assert!(
            factory
                .journal()
                .frames()
                .iter()
                .any(|frame| frame.opcode == Opcode::Ping)
        );
    }

    #[tokio::test]
    async fn test_handshake_headers_injected() {
        let factory = LoopbackFactory::new();
        let pool = loopback_pool(&factory);
        let config = builder().header("x-token", "abc").build().expect("config");
        let _connection = Connection::connect(&pool, config).await.expect("connect");

        assert!(
            factory
                .journal()
                .headers()
                .contains(&("x-token".to_string(), "abc".to_string()))
        );
        let requests = factory.journal().requests();
        assert_eq!(requests[0].resource, "/echo");
        assert_eq!(requests[0].protocol, "libwebsockets-protocol");
    }

    #[tokio::test]
    async fn test_rejected_header_fails_connect() {
        let factory = LoopbackFactory::new();
        let pool = loopback_pool(&factory);
        let config = builder().header("bad:name", "v").build().expect("config");

        let result = Connection::connect(&pool, config).await;
        assert!(matches!(result, Err(Error::Connection { .. })));
    }

    #[tokio::test]
    async fn test_silent_host_times_out() {
        let factory = LoopbackFactory::new().handshake(HandshakeBehavior::Silent);
        let pool = loopback_pool(&factory);
        let config = builder()
            .connect_timeout(Duration::from_millis(100))
            .build()
            .expect("config");

        let result = Connection::connect(&pool, config).await;
        assert!(matches!(result, Err(Error::ConnectTimeout { timeout_ms: 100 })));
    }

    #[tokio::test]
    async fn test_refused_handshake_fails_connect() {
        let factory =
            LoopbackFactory::new().handshake(HandshakeBehavior::Refuse("403 Forbidden".into()));
        let pool = loopback_pool(&factory);
        let config = builder().build().expect("config");

        match Connection::connect(&pool, config).await {
            Err(Error::Connection { message }) => assert_eq!(message, "403 Forbidden"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_engine_shutdown_closes_connections() {
        let factory = LoopbackFactory::new();
        let (pool, connection) = connect(&factory).await;
        let mut closes = close_channel(&connection);

        pool.shutdown();

        assert_eq!(next(&mut closes).await, CloseCode::NoStatusContextDestroy);
        let result = connection.send_text("after shutdown").await;
        assert!(matches!(result, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_dropping_last_handle_closes_socket() {
        let factory = LoopbackFactory::new();
        let (_pool, connection) = connect(&factory).await;
        let engine = connection.inner.engine.clone();

        drop(connection);

        tokio::time::timeout(WAIT, async {
            while factory.journal().closes().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("socket closed");
        assert_eq!(factory.journal().closes()[0].1, CloseCode::GoingAway);
        assert_eq!(engine.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_greeting_reaches_handlers_given_at_connect() {
        let factory = LoopbackFactory::new().greeting("WELCOME");
        let pool = loopback_pool(&factory);

        let (tx, mut texts) = mpsc::unbounded_channel();
        let callbacks = Callbacks::new().on_text(move |_, text| {
            let _ = tx.send(text);
        });
        let config = builder().build().expect("config");
        let _connection = Connection::connect_with(&pool, config, callbacks)
            .await
            .expect("connect");

        assert_eq!(next(&mut texts).await, "WELCOME");
    }

    #[tokio::test]
    async fn test_close_handler_set_after_close_runs() {
        let factory = LoopbackFactory::new();
        let (_pool, connection) = connect(&factory).await;

        factory.peer().close(CloseCode::GoingAway);
        tokio::time::timeout(WAIT, async {
            while connection.close_status().is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("closed");

        let mut closes = close_channel(&connection);
        assert_eq!(next(&mut closes).await, CloseCode::GoingAway);
    }

    #[tokio::test]
    async fn test_rejected_frame_reaches_fragment_handler() {
        let factory = LoopbackFactory::new();
        let pool = loopback_pool(&factory);

        let (fragment_tx, mut fragments) = mpsc::unbounded_channel();
        let (close_tx, mut closes) = mpsc::unbounded_channel();
        let callbacks = Callbacks::new()
            .on_fragment(move |_, fragment| {
                let _ = fragment_tx.send(fragment);
            })
            .on_close(move |code| {
                let _ = close_tx.send(code);
            });
        let config = builder().build().expect("config");
        let _connection = Connection::connect_with(&pool, config, callbacks)
            .await
            .expect("connect");

        factory.peer().send_frame(&[0xff, 0xfe, 0xfd], true, true, false);

        let fragment = next(&mut fragments).await;
        assert_eq!(fragment.data, vec![0xff, 0xfe, 0xfd]);
        assert!(fragment.is_text && fragment.is_first && fragment.is_final);
        assert_eq!(next(&mut closes).await, CloseCode::InvalidPayload);
    }

    #[tokio::test]
    async fn test_write_failure_mid_message_fails_the_rest() {
        let factory = LoopbackFactory::new().fail_writes_after(1);
        let pool = loopback_pool(&factory);
        let config = builder().max_frame_size(2).build().expect("config");
        let connection = Connection::connect(&pool, config).await.expect("connect");
        let mut closes = close_channel(&connection);

        let result = connection.send_text("HELLO").await;

        assert!(matches!(result, Err(Error::WriteFailed { .. })));
        assert_eq!(next(&mut closes).await, CloseCode::AbnormalClose);
        let frames = factory.journal().frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, b"HE");

        let late = connection.send_text("late").await;
        assert!(matches!(late, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_queued_writes_fail_when_peer_closes() {
        let factory = LoopbackFactory::new();
        let (_pool, connection) = connect(&factory).await;
        let mut closes = close_channel(&connection);

        factory.peer().pause_writes();
        let sends: Vec<SendFuture> = (0..3u8)
            .map(|byte| connection.send_binary(vec![byte]))
            .collect();
        factory.peer().close(CloseCode::GoingAway);

        assert_eq!(next(&mut closes).await, CloseCode::GoingAway);
        for send in sends {
            assert!(matches!(send.await, Err(Error::ConnectionClosed)));
        }
        assert!(factory.journal().frames().is_empty());
    }

    #[tokio::test]
    async fn test_close_frame_follows_queued_data() {
        let factory = LoopbackFactory::new();
        let (_pool, connection) = connect(&factory).await;
        let mut closes = close_channel(&connection);

        let sends: Vec<SendFuture> = [b"a", b"b", b"c"]
            .iter()
            .map(|data| connection.send_binary(data.to_vec()))
            .collect();
        connection.close(CloseCode::Normal);

        for send in sends {
            send.await.expect("send queued before close");
        }
        assert_eq!(next(&mut closes).await, CloseCode::Normal);

        let opcodes: Vec<Opcode> = factory
            .journal()
            .frames()
            .iter()
            .map(|frame| frame.opcode)
            .collect();
        assert_eq!(
            opcodes,
            vec![
                Opcode::Binary,
                Opcode::Binary,
                Opcode::Binary,
                Opcode::Close(CloseCode::Normal),
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_socket_engine_invalid_utf8_closes_with_invalid_payload() {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut ws = tokio_tungstenite::accept_async(stream).await.expect("upgrade");
            let frame = Frame::message(vec![0xff, 0xfe, 0xfd], OpCode::Data(OpData::Text), true);
            ws.send(WsMessage::Frame(frame)).await.expect("send");
            while let Some(Ok(_)) = ws.next().await {}
        });

        let pool = EnginePool::with_config(
            Arc::new(TungsteniteFactory::new()),
            PoolConfig::default()
                .size(1)
                .service_timeout(Duration::from_millis(20)),
        )
        .expect("pool");

        let (tx, mut closes) = mpsc::unbounded_channel();
        let callbacks = Callbacks::new().on_close(move |code| {
            let _ = tx.send(code);
        });
        let config = ConnectionConfig::builder("127.0.0.1")
            .port(port)
            .compression(false)
            .build()
            .expect("config");
        let connection = Connection::connect_with(&pool, config, callbacks)
            .await
            .expect("connect");

        assert_eq!(next(&mut closes).await, CloseCode::InvalidPayload);
        assert_eq!(connection.close_status(), Some(CloseCode::InvalidPayload));
    }
}
