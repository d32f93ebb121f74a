//! Consumer callback table and its delivery task.
//!
//! Every connection owns one unbounded channel. The polling engine thread
//! is the producer; a single task on the connection's callback runtime is
//! the consumer. Handler registration travels through the same channel, so
//! registrations and deliveries are applied in the order they were issued
//! and no two callbacks of one connection ever run concurrently.
//!
//! Handlers that must see the first message are passed to
//! [`Connection::connect_with`] as [`Callbacks`]; they are queued ahead of
//! any event the engine can produce.
//!
//! The task only holds a weak reference to the connection and upgrades it
//! for the duration of one callback. After the close callback has run the
//! table is cleared, which drops any connection handle a handler captured.
//! A close handler registered later runs at once with the recorded code;
//! other handlers registered after the close never run.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Weak;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::trace;

use crate::identifiers::ConnectionId;
use crate::protocol::CloseCode;

use super::core::{Connection, ConnectionInner};

// ============================================================================
// Types
// ============================================================================

/// Handler for complete text messages.
pub type TextHandler = Box<dyn FnMut(&Connection, String) + Send>;

/// Handler for complete binary messages.
pub type BinaryHandler = Box<dyn FnMut(&Connection, Vec<u8>) + Send>;

/// Handler for every received frame.
pub type FragmentHandler = Box<dyn FnMut(&Connection, Fragment) + Send>;

/// Handler for pongs.
pub type PongHandler = Box<dyn FnMut(&Connection, Vec<u8>) + Send>;

/// Handler for the close event.
pub type CloseHandler = Box<dyn FnMut(CloseCode) + Send>;

/// One received frame, complete or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Frame payload.
    pub data: Vec<u8>,
    /// The frame belongs to a text message.
    pub is_text: bool,
    /// First frame of its message.
    pub is_first: bool,
    /// Last frame of its message.
    pub is_final: bool,
}

/// Replacement for one slot of the callback table.
pub(crate) enum Registration {
    Text(TextHandler),
    Binary(BinaryHandler),
    Fragment(FragmentHandler),
    Pong(PongHandler),
    Close(CloseHandler),
}

/// Item on a connection's delivery channel.
pub(crate) enum Delivery {
    Register(Registration),
    Text(String),
    Binary(Vec<u8>),
    Fragment(Fragment),
    Pong(Vec<u8>),
    Close(CloseCode),
}

// ============================================================================
// Callbacks
// ============================================================================

/// Handlers installed before a connection is started.
///
/// # Example
///
/// ```ignore
/// let callbacks = Callbacks::new()
///     .on_text(|_, text| println!("received {text}"))
///     .on_close(|code| println!("closed with {code:?}"));
/// let connection = Connection::connect_with(&pool, config, callbacks).await?;
/// ```
#[derive(Default)]
pub struct Callbacks {
    registrations: Vec<Registration>,
}

impl Callbacks {
    /// Creates an empty handler set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the handler for complete text messages.
    #[must_use]
    pub fn on_text(self, handler: impl FnMut(&Connection, String) + Send + 'static) -> Self {
        self.with(Registration::Text(Box::new(handler)))
    }

    /// Sets the handler for complete binary messages.
    #[must_use]
    pub fn on_binary(self, handler: impl FnMut(&Connection, Vec<u8>) + Send + 'static) -> Self {
        self.with(Registration::Binary(Box::new(handler)))
    }

    /// Sets the handler called for every received frame.
    #[must_use]
    pub fn on_fragment(self, handler: impl FnMut(&Connection, Fragment) + Send + 'static) -> Self {
        self.with(Registration::Fragment(Box::new(handler)))
    }

    /// Sets the handler for pongs.
    #[must_use]
    pub fn on_pong(self, handler: impl FnMut(&Connection, Vec<u8>) + Send + 'static) -> Self {
        self.with(Registration::Pong(Box::new(handler)))
    }

    /// Sets the handler for the close event.
    #[must_use]
    pub fn on_close(self, handler: impl FnMut(CloseCode) + Send + 'static) -> Self {
        self.with(Registration::Close(Box::new(handler)))
    }

    /// Returns the number of handlers set.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    /// Returns `true` if no handler is set.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    fn with(mut self, registration: Registration) -> Self {
        self.registrations.push(registration);
        self
    }

    pub(crate) fn into_registrations(self) -> Vec<Registration> {
        self.registrations
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("handlers", &self.registrations.len())
            .finish()
    }
}

// ============================================================================
// CallbackTable
// ============================================================================

/// At most one handler per event kind.
#[derive(Default)]
struct CallbackTable {
    text: Option<TextHandler>,
    binary: Option<BinaryHandler>,
    fragment: Option<FragmentHandler>,
    pong: Option<PongHandler>,
    close: Option<CloseHandler>,
}

impl CallbackTable {
    fn register(&mut self, registration: Registration) {
        match registration {
            Registration::Text(handler) => self.text = Some(handler),
            Registration::Binary(handler) => self.binary = Some(handler),
            Registration::Fragment(handler) => self.fragment = Some(handler),
            Registration::Pong(handler) => self.pong = Some(handler),
            Registration::Close(handler) => self.close = Some(handler),
        }
    }
}

// ============================================================================
// Delivery Task
// ============================================================================

/// Spawns the delivery task on `runtime` and returns its sender.
pub(crate) fn spawn_delivery(
    runtime: &Handle,
    connection: Weak<ConnectionInner>,
    id: ConnectionId,
) -> mpsc::UnboundedSender<Delivery> {
    let (tx, rx) = mpsc::unbounded_channel();
    runtime.spawn(run_delivery_loop(rx, connection, id));
    tx
}

async fn run_delivery_loop(
    mut rx: mpsc::UnboundedReceiver<Delivery>,
    connection: Weak<ConnectionInner>,
    id: ConnectionId,
) {
    let mut table = CallbackTable::default();
    let mut closed = None;

    while let Some(delivery) = rx.recv().await {
        match delivery {
            Delivery::Register(registration) => match (closed, registration) {
                (None, registration) => table.register(registration),
                (Some(code), Registration::Close(mut handler)) => handler(code),
                (Some(_), _) => {}
            },

            Delivery::Close(code) => {
                closed = Some(code);
                if let Some(handler) = table.close.as_mut() {
                    handler(code);
                }
                table = CallbackTable::default();
                trace!(connection_id = %id, ?code, "Close delivered, callbacks released");
            }

            Delivery::Text(text) => {
                if let (Some(handler), Some(connection)) = (table.text.as_mut(), upgrade(&connection)) {
                    handler(&connection, text);
                }
            }

            Delivery::Binary(data) => {
                if let (Some(handler), Some(connection)) = (table.binary.as_mut(), upgrade(&connection)) {
                    handler(&connection, data);
                }
            }

            Delivery::Fragment(fragment) => {
                if let (Some(handler), Some(connection)) =
                    (table.fragment.as_mut(), upgrade(&connection))
                {
                    handler(&connection, fragment);
                }
            }

            Delivery::Pong(payload) => {
                if let (Some(handler), Some(connection)) = (table.pong.as_mut(), upgrade(&connection)) {
                    handler(&connection, payload);
                }
            }
        }
    }

    trace!(connection_id = %id, "Delivery loop terminated");
}

fn upgrade(connection: &Weak<ConnectionInner>) -> Option<Connection> {
    connection.upgrade().map(Connection::from_inner)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_register_replaces_handler() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let mut table = CallbackTable::default();
        let counter = Arc::clone(&first);
        table.register(Registration::Close(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })));
        let counter = Arc::clone(&second);
        table.register(Registration::Close(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        if let Some(handler) = table.close.as_mut() {
            handler(CloseCode::Normal);
        }
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_delivered_without_connection() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let delivery_tx = spawn_delivery(&Handle::current(), Weak::new(), ConnectionId::next());

        delivery_tx
            .send(Delivery::Register(Registration::Close(Box::new(move |code| {
                let _ = tx.send(code);
            }))))
            .expect("register");
        delivery_tx
            .send(Delivery::Text("dropped: no connection".into()))
            .expect("text");
        delivery_tx
            .send(Delivery::Close(CloseCode::GoingAway))
            .expect("close");

        assert_eq!(rx.recv().await, Some(CloseCode::GoingAway));
    }

    #[tokio::test]
    async fn test_close_handler_registered_after_close_runs() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let delivery_tx = spawn_delivery(&Handle::current(), Weak::new(), ConnectionId::next());

        delivery_tx
            .send(Delivery::Close(CloseCode::InvalidPayload))
            .expect("close");
        delivery_tx
            .send(Delivery::Register(Registration::Close(Box::new(move |code| {
                let _ = tx.send(code);
            }))))
            .expect("register");

        assert_eq!(rx.recv().await, Some(CloseCode::InvalidPayload));
        // The handler was dropped after running once.
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn test_callbacks_collect_handlers() {
        let callbacks = Callbacks::new()
            .on_text(|_, _| {})
            .on_close(|_| {})
            .on_text(|_, _| {});
        assert_eq!(callbacks.len(), 3);
        assert!(Callbacks::new().is_empty());

        let mut table = CallbackTable::default();
        for registration in callbacks.into_registrations() {
            table.register(registration);
        }
        assert!(table.text.is_some());
        assert!(table.close.is_some());
        assert!(table.binary.is_none());
    }
}
