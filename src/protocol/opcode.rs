//! Frame opcodes and connection schemes.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};

use super::close::CloseCode;

// ============================================================================
// Opcode
// ============================================================================

/// Type tag of an outbound frame.
///
/// Use `fin = false` with [`Opcode::Text`] or [`Opcode::Binary`] followed by
/// [`Opcode::Continuation`] frames to split a message by hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// First frame of a text message.
    Text,
    /// First frame of a binary message.
    Binary,
    /// Follow-up frame of a fragmented message.
    Continuation,
    /// Ping control frame.
    Ping,
    /// Close control frame carrying a status code.
    Close(CloseCode),
}

impl Opcode {
    /// Returns `true` for close frames.
    #[inline]
    #[must_use]
    pub const fn is_close(&self) -> bool {
        matches!(self, Self::Close(_))
    }

    /// Returns `true` for opcodes that start or continue a data message.
    #[inline]
    #[must_use]
    pub const fn is_data(&self) -> bool {
        matches!(self, Self::Text | Self::Binary | Self::Continuation)
    }
}

// ============================================================================
// Scheme
// ============================================================================

/// URL scheme of a WebSocket endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    /// Plain `ws://`.
    #[default]
    Ws,
    /// TLS `wss://`.
    Wss,
}

impl Scheme {
    /// Parses a scheme name (`ws` or `wss`, case-insensitive).
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        if value.eq_ignore_ascii_case("ws") {
            Some(Self::Ws)
        } else if value.eq_ignore_ascii_case("wss") {
            Some(Self::Wss)
        } else {
            None
        }
    }

    /// Returns the scheme name.
    #[inline]
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ws => "ws",
            Self::Wss => "wss",
        }
    }

    /// Returns the default port for the scheme.
    #[inline]
    #[must_use]
    pub const fn default_port(&self) -> u16 {
        match self {
            Self::Ws => 80,
            Self::Wss => 443,
        }
    }

    /// Returns `true` if the scheme requires TLS.
    #[inline]
    #[must_use]
    pub const fn is_secure(&self) -> bool {
        matches!(self, Self::Wss)
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_predicates() {
        assert!(Opcode::Close(CloseCode::Normal).is_close());
        assert!(!Opcode::Ping.is_close());
        assert!(Opcode::Continuation.is_data());
        assert!(!Opcode::Ping.is_data());
    }

    #[test]
    fn test_scheme_parse() {
        assert_eq!(Scheme::parse("ws"), Some(Scheme::Ws));
        assert_eq!(Scheme::parse("WSS"), Some(Scheme::Wss));
        assert_eq!(Scheme::parse("http"), None);
    }

    #[test]
    fn test_scheme_defaults() {
        assert_eq!(Scheme::default(), Scheme::Ws);
        assert_eq!(Scheme::Ws.default_port(), 80);
        assert_eq!(Scheme::Wss.default_port(), 443);
        assert!(Scheme::Wss.is_secure());
        assert_eq!(Scheme::Wss.to_string(), "wss");
    }
}
