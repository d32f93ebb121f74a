//! Polling engines and the pool that spreads connections across them.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  acquire   ┌───────────────────────────────────┐
//! │  EnginePool  │───────────►│ PollingEngine (dedicated thread)  │
//! └──────────────┘            │                                   │
//!                             │  immediate jobs ─┐                │
//!   Connection ── schedule ──►│  deferred jobs ──┼─► NativeEngine │
//!       ▲                     │                  │     service()  │
//!       │                     │  CallbackDispatcher ◄──── events  │
//!       └──── Registry ◄──────┤                                   │
//!                             └───────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `engine` | Service thread and job inboxes |
//! | `pool` | Lazy round-robin engine pool |
//! | `dispatcher` | Native event routing (internal) |
//! | `registry` | Socket handle → connection map (internal) |

// ============================================================================
// Submodules
// ============================================================================

/// Native event routing.
mod dispatcher;

/// Service thread and job inboxes.
pub mod engine;

/// Lazy round-robin engine pool.
pub mod pool;

/// Socket handle registry.
mod registry;

// ============================================================================
// Re-exports
// ============================================================================

pub use engine::{EngineContext, PollingEngine};
pub use pool::{
    DEFAULT_PROTOCOL_NAME, DEFAULT_RX_BUFFER_SIZE, DEFAULT_SERVICE_TIMEOUT, EnginePool, PoolConfig,
};
