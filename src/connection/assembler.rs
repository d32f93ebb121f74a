//! Reassembly of fragmented incoming messages.
//!
//! The native engine delivers a message as one or more chunks flagged
//! first/final. A [`FrameAssembler`] collects the chunks of the message in
//! flight; unfragmented messages bypass it through
//! [`FrameAssembler::complete`].
//!
//! UTF-8 is checked once, on the completed text message: a chunk boundary
//! may split a code point. The size limit is checked on every append,
//! before the bytes are copied.

// ============================================================================
// Imports
// ============================================================================

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Smallest buffer allocated for a fragmented message.
const INITIAL_CAPACITY: usize = 1024;

// ============================================================================
// Types
// ============================================================================

/// Kind of a data message, fixed by its first frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// UTF-8 text.
    Text,
    /// Arbitrary bytes.
    Binary,
}

impl MessageKind {
    /// Returns the kind matching a native binary flag.
    #[inline]
    #[must_use]
    pub const fn from_binary_flag(is_binary: bool) -> Self {
        if is_binary { Self::Binary } else { Self::Text }
    }
}

/// A complete incoming message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Text message.
    Text(String),
    /// Binary message.
    Binary(Vec<u8>),
}

impl Message {
    /// Returns the message length in bytes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(data) => data.len(),
        }
    }

    /// Returns `true` if the message carries no bytes.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// FrameAssembler
// ============================================================================

/// Accumulates the fragments of one in-flight message.
#[derive(Debug)]
pub struct FrameAssembler {
    /// Message kind from the first fragment.
    kind: MessageKind,
    /// Bytes received so far.
    buffer: Vec<u8>,
    /// Upper bound on the message length.
    max_message_size: Option<usize>,
}

impl FrameAssembler {
    /// Creates an empty assembler for a message of `kind`.
    #[must_use]
    pub fn new(kind: MessageKind, max_message_size: Option<usize>) -> Self {
        Self {
            kind,
            buffer: Vec::new(),
            max_message_size,
        }
    }

    /// Returns the message kind.
    #[inline]
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Returns the number of bytes accumulated.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Returns `true` if nothing has been accumulated yet.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Returns the current buffer capacity.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    /// Appends one fragment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MessageTooLarge`] if the message would exceed the
    /// configured limit; nothing is appended in that case.
    pub fn append(&mut self, fragment: &[u8]) -> Result<()> {
        let needed = self.buffer.len() + fragment.len();
        check_limit(needed, self.max_message_size)?;

        self.grow_to(needed);
        self.buffer.extend_from_slice(fragment);
        Ok(())
    }

    /// Consumes the assembler and returns the complete message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPayload`] if a text message is not valid UTF-8.
    pub fn finish(self) -> Result<Message> {
        into_message(self.kind, self.buffer)
    }

    /// Builds a message that arrived in a single fragment.
    ///
    /// # Errors
    ///
    /// Same as [`append`](Self::append) followed by [`finish`](Self::finish).
    pub fn complete(
        kind: MessageKind,
        data: &[u8],
        max_message_size: Option<usize>,
    ) -> Result<Message> {
        check_limit(data.len(), max_message_size)?;
        into_message(kind, data.to_vec())
    }

    /// Ensures room for `needed` bytes, at least doubling the capacity.
    fn grow_to(&mut self, needed: usize) {
        let capacity = self.buffer.capacity();
        if needed <= capacity {
            return;
        }

        let target = needed.max(capacity.saturating_mul(2)).max(INITIAL_CAPACITY);
        self.buffer.reserve_exact(target - self.buffer.len());
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn check_limit(size: usize, limit: Option<usize>) -> Result<()> {
    match limit {
        Some(limit) if size > limit => Err(Error::message_too_large(size, limit)),
        _ => Ok(()),
    }
}

fn into_message(kind: MessageKind, buffer: Vec<u8>) -> Result<Message> {
    match kind {
        MessageKind::Binary => Ok(Message::Binary(buffer)),
        MessageKind::Text => String::from_utf8(buffer)
            .map(Message::Text)
            .map_err(|_| Error::InvalidPayload),
    }
}

// ============================================================================
// Tests
// ============================================================================
