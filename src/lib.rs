//! Client-side WebSocket connection engine.
//!
//! This library drives client WebSocket connections through their handshake,
//! frame exchange, keepalive and close, on top of a native I/O engine, and
//! exposes an asynchronous, callback-based API.
//!
//! # Architecture
//!
//! A small pool of polling engines, each owning one native context and one
//! dedicated thread, is shared by every connection:
//!
//! - **Consumer side**: [`Connection`] handles enqueue writes and close
//!   requests from any thread; results come back as futures and callbacks
//! - **Engine side**: the polling thread services the native context and
//!   turns native events into lifecycle transitions
//!
//! Key design principles:
//!
//! - The native context is only ever touched by its own thread
//! - Frames of one connection reach the wire in the order they were sent
//! - Callbacks of one connection run one at a time, in event order
//! - A connection's failure is isolated to that connection
//!
//! # Quick Start
//!
//! ```no_run
//! use lws_engine::{Callbacks, CloseCode, Connection, ConnectionConfig, EnginePool, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let pool = EnginePool::default();
//!
//!     let config = ConnectionConfig::from_url("ws://127.0.0.1:9000/echo")?;
//!     let callbacks = Callbacks::new()
//!         .on_text(|_, text| println!("received: {text}"))
//!         .on_close(|code| println!("closed: {code}"));
//!     let connection = Connection::connect_with(&pool, config, callbacks).await?;
//!
//!     connection.send_text("HELLO").await?;
//!     connection.close(CloseCode::Normal);
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`connection`] | [`Connection`], its configuration and callbacks |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`native`] | Native engine boundary and bundled engines |
//! | [`protocol`] | Close codes, opcodes and schemes |
//! | [`transport`] | Polling engines and the [`EnginePool`] |

// ============================================================================
// Modules
// ============================================================================

/// Client connections.
///
/// - [`Connection`] - Connection handle
/// - [`ConnectionConfig`] - Endpoint and limits
pub mod connection;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers for connections, engines and sockets.
pub mod identifiers;

/// Native I/O engine boundary.
///
/// Use [`TungsteniteFactory`] for real sockets and [`LoopbackFactory`] for
/// in-process tests.
pub mod native;

/// WebSocket protocol vocabulary.
pub mod protocol;

/// Polling engines and the engine pool.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Connection types
pub use connection::{
    Callbacks, Connection, ConnectionBuilder, ConnectionConfig, Fragment, Headers, SendFuture,
};

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{ConnectionId, EngineId, SocketHandle};

// Native engines
pub use native::{LoopbackFactory, NativeEngineFactory, TungsteniteFactory};

// Protocol types
pub use protocol::{CloseCode, Opcode, Scheme};

// Transport types
pub use transport::{EnginePool, PollingEngine, PoolConfig};
