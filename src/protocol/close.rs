//! WebSocket close codes.
//!
//! [`CloseCode`] mirrors the close-code space exchanged with any WebSocket
//! peer. The numeric values are a stable contract: they serialize as plain
//! integers and round-trip through [`u16`].

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};

// ============================================================================
// CloseCode
// ============================================================================

/// Status code carried by a close frame.
///
/// `NoStatus`, `AbnormalClose` and `TlsFailure` are reserved values that a
/// peer never puts on the wire; they describe local outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u16", into = "u16")]
pub enum CloseCode {
    /// Sentinel for values outside the known set.
    UnknownDoNotUse,
    /// 1000: normal closure.
    Normal,
    /// 1001: endpoint going away.
    GoingAway,
    /// 1002: protocol error.
    ProtocolError,
    /// 1003: unacceptable data type.
    UnacceptableOpcode,
    /// 1004: reserved.
    Reserved,
    /// 1005: no status code was present.
    NoStatus,
    /// 1006: connection dropped without a close frame.
    AbnormalClose,
    /// 1007: message payload inconsistent with its type (bad UTF-8).
    InvalidPayload,
    /// 1008: policy violation.
    PolicyViolation,
    /// 1009: message too big to process.
    MessageTooLarge,
    /// 1010: client expected an extension the server did not negotiate.
    ExtensionRequired,
    /// 1011: unexpected server condition.
    UnexpectedCondition,
    /// 1015: TLS handshake failure.
    TlsFailure,
    /// 2000: client finished its transaction.
    ClientTransactionDone,
    /// 9999: the native context was destroyed under the connection.
    NoStatusContextDestroy,
}

impl CloseCode {
    /// Returns the numeric close code.
    #[inline]
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        match self {
            Self::UnknownDoNotUse => 0,
            Self::Normal => 1000,
            Self::GoingAway => 1001,
            Self::ProtocolError => 1002,
            Self::UnacceptableOpcode => 1003,
            Self::Reserved => 1004,
            Self::NoStatus => 1005,
            Self::AbnormalClose => 1006,
            Self::InvalidPayload => 1007,
            Self::PolicyViolation => 1008,
            Self::MessageTooLarge => 1009,
            Self::ExtensionRequired => 1010,
            Self::UnexpectedCondition => 1011,
            Self::TlsFailure => 1015,
            Self::ClientTransactionDone => 2000,
            Self::NoStatusContextDestroy => 9999,
        }
    }

    /// Decodes the status carried by a close frame payload.
    ///
    /// The first two bytes are the big-endian code; a shorter payload means
    /// the peer sent no status.
    #[must_use]
    pub fn from_payload(payload: &[u8]) -> Self {
        match payload {
            [high, low, ..] => Self::from(u16::from_be_bytes([*high, *low])),
            _ => Self::NoStatus,
        }
    }

    /// Returns `true` if the code may appear in a close frame on the wire.
    #[inline]
    #[must_use]
    pub const fn is_sendable(self) -> bool {
        !matches!(
            self,
            Self::UnknownDoNotUse
                | Self::NoStatus
                | Self::AbnormalClose
                | Self::TlsFailure
                | Self::NoStatusContextDestroy
        )
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => Self::Normal,
            1001 => Self::GoingAway,
            1002 => Self::ProtocolError,
            1003 => Self::UnacceptableOpcode,
            1004 => Self::Reserved,
            1005 => Self::NoStatus,
            1006 => Self::AbnormalClose,
            1007 => Self::InvalidPayload,
            1008 => Self::PolicyViolation,
            1009 => Self::MessageTooLarge,
            1010 => Self::ExtensionRequired,
            1011 => Self::UnexpectedCondition,
            1015 => Self::TlsFailure,
            2000 => Self::ClientTransactionDone,
            9999 => Self::NoStatusContextDestroy,
            _ => Self::UnknownDoNotUse,
        }
    }
}

impl From<CloseCode> for u16 {
    #[inline]
    fn from(code: CloseCode) -> Self {
        code.as_u16()
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.as_u16())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_contract() {
        assert_eq!(CloseCode::Normal.as_u16(), 1000);
        assert_eq!(CloseCode::AbnormalClose.as_u16(), 1006);
        assert_eq!(CloseCode::TlsFailure.as_u16(), 1015);
        assert_eq!(CloseCode::NoStatusContextDestroy.as_u16(), 9999);
        assert_eq!(CloseCode::from(1009), CloseCode::MessageTooLarge);
    }

    #[test]
    fn test_unknown_code_maps_to_sentinel() {
        assert_eq!(CloseCode::from(4321), CloseCode::UnknownDoNotUse);
        assert_eq!(CloseCode::from(1012), CloseCode::UnknownDoNotUse);
    }

    #[test]
    fn test_from_payload() {
        assert_eq!(CloseCode::from_payload(&[0x03, 0xE8]), CloseCode::Normal);
        assert_eq!(
            CloseCode::from_payload(&[0x03, 0xEF, b'b', b'y', b'e']),
            CloseCode::InvalidPayload
        );
        assert_eq!(CloseCode::from_payload(&[0x03]), CloseCode::NoStatus);
        assert_eq!(CloseCode::from_payload(&[]), CloseCode::NoStatus);
    }

    #[test]
    fn test_sendable() {
        assert!(CloseCode::Normal.is_sendable());
        assert!(CloseCode::MessageTooLarge.is_sendable());
        assert!(!CloseCode::AbnormalClose.is_sendable());
        assert!(!CloseCode::NoStatus.is_sendable());
    }

    #[test]
    fn test_serializes_as_number() {
        let json = serde_json::to_string(&CloseCode::GoingAway).expect("serialize");
        assert_eq!(json, "1001");

        let code: CloseCode = serde_json::from_str("1007").expect("deserialize");
        assert_eq!(code, CloseCode::InvalidPayload);
    }
}
