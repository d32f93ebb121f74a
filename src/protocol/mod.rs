//! WebSocket protocol vocabulary.
//!
//! This module defines the values exchanged with a peer that the engine
//! needs to reason about. Framing itself belongs to the native engine.
//!
//! # Types
//!
//! | Type | Purpose |
//! |------|---------|
//! | `CloseCode` | Status code carried by a close frame |
//! | `Opcode` | Type tag of an outbound frame |
//! | `Scheme` | `ws` or `wss` endpoint |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `close` | Close-code enumeration |
//! | `opcode` | Opcodes and schemes |

// ============================================================================
// Submodules
// ============================================================================

/// Close-code enumeration.
pub mod close;

/// Frame opcodes and connection schemes.
pub mod opcode;

// ============================================================================
// Re-exports
// ============================================================================

pub use close::CloseCode;
pub use opcode::{Opcode, Scheme};
