//! Error types for the WebSocket engine.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use lws_engine::{Connection, Opcode, Result};
//!
//! async fn example(connection: &Connection) -> Result<()> {
//!     connection.send(b"HELLO".to_vec(), Opcode::Text, true).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`] |
//! | Engine | [`Error::EngineCreationFailed`], [`Error::EngineShutdown`] |
//! | Connection | [`Error::Connection`], [`Error::ConnectTimeout`], [`Error::DestroyedBeforeConnect`] |
//! | Writes | [`Error::WriteFailed`], [`Error::ConnectionClosed`], [`Error::NotYetOpen`] |
//! | Payload | [`Error::InvalidPayload`], [`Error::MessageTooLarge`] |
//! | External | [`Error::Io`] |
//!
//! Payload errors never reach a caller as a value: the connection turns them
//! into a close with the matching [`CloseCode`](crate::CloseCode).

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when a connection or pool configuration is invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Engine Errors
    // ========================================================================
    /// Native engine context could not be created.
    ///
    /// Returned by pool acquisition when any polling engine fails to start.
    #[error("Engine creation failed: {message}")]
    EngineCreationFailed {
        /// Description of the creation failure.
        message: String,
    },

    /// The polling engine servicing the connection was shut down.
    #[error("Engine shut down")]
    EngineShutdown,

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// WebSocket connection failed.
    ///
    /// Carries the description reported by the native engine.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// No established or error event arrived before the connect deadline.
    #[error("Connection timeout after {timeout_ms}ms")]
    ConnectTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// The connection was dropped before the handshake finished.
    #[error("Connection destroyed before connecting")]
    DestroyedBeforeConnect,

    // ========================================================================
    // Write Errors
    // ========================================================================
    /// The native engine refused or truncated a frame.
    #[error("Write failed: {message}")]
    WriteFailed {
        /// Description of the write failure.
        message: String,
    },

    /// The connection is closed for good.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The connection has not been established yet.
    #[error("Connection not yet open")]
    NotYetOpen,

    // ========================================================================
    // Payload Errors
    // ========================================================================
    /// A completed text message was not valid UTF-8.
    #[error("Invalid payload: text message is not valid UTF-8")]
    InvalidPayload,

    /// An incoming message grew beyond the configured limit.
    #[error("Message too large: {size} bytes exceeds limit of {limit}")]
    MessageTooLarge {
        /// Bytes the message would have reached.
        size: usize,
        /// Configured maximum message size.
        limit: usize,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an engine creation error.
    #[inline]
    pub fn engine_creation(message: impl Into<String>) -> Self {
        Self::EngineCreationFailed {
            message: message.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a connect timeout error.
    #[inline]
    pub fn connect_timeout(timeout_ms: u64) -> Self {
        Self::ConnectTimeout { timeout_ms }
    }

    /// Creates a write failed error.
    #[inline]
    pub fn write_failed(message: impl Into<String>) -> Self {
        Self::WriteFailed {
            message: message.into(),
        }
    }

    /// Creates a message too large error.
    #[inline]
    pub fn message_too_large(size: usize, limit: usize) -> Self {
        Self::MessageTooLarge { size, limit }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ConnectTimeout { .. })
    }

    /// Returns `true` if this is a connection establishment error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::ConnectTimeout { .. }
                | Self::DestroyedBeforeConnect
                | Self::EngineCreationFailed { .. }
                | Self::EngineShutdown
        )
    }

    /// Returns `true` if the error means the connection can no longer be used.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed | Self::EngineShutdown)
    }

    /// Returns `true` if this error is recoverable.
    ///
    /// Recoverable errors may succeed on retry with a fresh connection.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ConnectTimeout { .. } | Self::NotYetOpen | Self::EngineCreationFailed { .. }
        )
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::ErrorKind;

    #[test]
    fn test_error_display() {
        let err = Error::connection("connection refused");
        assert_eq!(err.to_string(), "Connection failed: connection refused");
    }

    #[test]
    fn test_config_error() {
        let err = Error::config("host must not be empty");
        assert_eq!(err.to_string(), "Configuration error: host must not be empty");
    }

    #[test]
    fn test_message_too_large_display() {
        let err = Error::message_too_large(20, 16);
        assert_eq!(
            err.to_string(),
            "Message too large: 20 bytes exceeds limit of 16"
        );
    }

    #[test]
    fn test_is_timeout() {
        let timeout_err = Error::connect_timeout(1000);
        let other_err = Error::connection("test");

        assert!(timeout_err.is_timeout());
        assert!(!other_err.is_timeout());
    }

    #[test]
    fn test_is_connection_error() {
        assert!(Error::connection("test").is_connection_error());
        assert!(Error::connect_timeout(1000).is_connection_error());
        assert!(Error::DestroyedBeforeConnect.is_connection_error());
        assert!(!Error::ConnectionClosed.is_connection_error());
        assert!(!Error::write_failed("test").is_connection_error());
    }

    #[test]
    fn test_is_closed() {
        assert!(Error::ConnectionClosed.is_closed());
        assert!(Error::EngineShutdown.is_closed());
        assert!(!Error::NotYetOpen.is_closed());
    }

    #[test]
    fn test_is_recoverable() {
        assert!(Error::connect_timeout(1000).is_recoverable());
        assert!(Error::NotYetOpen.is_recoverable());
        assert!(!Error::config("test").is_recoverable());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = IoError::new(ErrorKind::ConnectionRefused, "refused");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
