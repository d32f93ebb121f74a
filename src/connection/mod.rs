//! Client connections.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `config` | Connection configuration and builder |
//! | `core` | Lifecycle state machine and [`Connection`] handle |
//! | `queue` | Ordered outbound frame queue |
//! | `assembler` | Incoming fragment reassembly |
//! | `callbacks` | Consumer callback table and delivery task |
//! | `keepalive` | Ping/pong keepalive timer |

// ============================================================================
// Submodules
// ============================================================================

/// Incoming fragment reassembly.
pub mod assembler;

/// Consumer callbacks.
pub mod callbacks;

/// Connection configuration.
pub mod config;

/// Lifecycle state machine.
mod core;

/// Keepalive timer.
mod keepalive;

/// Outbound frame queue.
pub mod queue;

// ============================================================================
// Re-exports
// ============================================================================

pub use assembler::{FrameAssembler, Message, MessageKind};
pub use callbacks::{
    BinaryHandler, Callbacks, CloseHandler, Fragment, FragmentHandler, PongHandler, TextHandler,
};
pub use config::{
    ConnectionBuilder, ConnectionConfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_FRAME_SIZE,
    DEFAULT_ORIGIN, Headers,
};
pub use self::core::{Connection, SendFuture};
pub use queue::{PendingWrite, WriteQueue};

pub(crate) use self::callbacks::Delivery;
pub(crate) use self::core::ConnectionInner;
