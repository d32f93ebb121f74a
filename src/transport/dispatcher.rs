//! Native event dispatch.
//!
//! Runs on the polling engine thread, inside [`NativeEngine::service`]. Each
//! event is routed through the registry to its connection and turned into
//! lifecycle transitions, queued writes, or callback deliveries.
//!
//! [`NativeEngine::service`]: crate::native::NativeEngine::service

// ============================================================================
// Imports
// ============================================================================

use tracing::{debug, trace, warn};

use crate::connection::{
    ConnectionInner, Delivery, Fragment, FrameAssembler, Message, MessageKind,
};
use crate::error::{Error, Result};
use crate::native::{CallbackAction, HeaderSink, NativeCallback, NativeEvent, NativeSocket};
use crate::protocol::CloseCode;

use super::engine::PollingEngine;

// ============================================================================
// CallbackDispatcher
// ============================================================================

/// [`NativeCallback`] of one polling engine.
pub(crate) struct CallbackDispatcher<'a> {
    engine: &'a PollingEngine,
}

impl<'a> CallbackDispatcher<'a> {
    pub(crate) fn new(engine: &'a PollingEngine) -> Self {
        Self { engine }
    }
}

impl NativeCallback for CallbackDispatcher<'_> {
    fn on_event(
        &mut self,
        socket: &mut dyn NativeSocket,
        event: NativeEvent<'_>,
    ) -> CallbackAction {
        let handle = socket.handle();

        let Some(inner) = self.engine.registry().get(handle) else {
            trace!(socket = %handle, event = event.name(), "Event for unknown socket");
            return match event {
                NativeEvent::Closed | NativeEvent::ConnectionError { .. } => {
                    self.engine.registry().remove(handle);
                    CallbackAction::Continue
                }
                _ => CallbackAction::Close,
            };
        };

        match event {
            NativeEvent::Established => on_established(&inner),
            NativeEvent::Receive {
                data,
                is_first,
                is_final,
                is_binary,
            } => on_receive(&inner, socket, data, is_first, is_final, is_binary),
            NativeEvent::Writable => on_writable(&inner, socket),
            NativeEvent::PeerInitiatedClose { payload } => {
                let code = {
                    let state = inner.state.lock();
                    state
                        .waiting_close_status
                        .filter(|_| state.close_frame_sent)
                        .unwrap_or_else(|| CloseCode::from_payload(payload))
                };
                debug!(connection_id = %inner.id, code = code.as_u16(), "Peer initiated close");
                inner.mark_as_closed(code);
                CallbackAction::Continue
            }
            NativeEvent::Closed => {
                self.engine.registry().remove(handle);
                on_closed(&inner);
                CallbackAction::Continue
            }
            NativeEvent::ConnectionError { description } => {
                self.engine.registry().remove(handle);
                on_connection_error(&inner, description);
                CallbackAction::Continue
            }
            NativeEvent::ProtocolViolation { code, description } => {
                warn!(
                    connection_id = %inner.id,
                    code = code.as_u16(),
                    description,
                    "Peer violated the protocol"
                );
                inner.mark_as_closed(code);
                CallbackAction::Continue
            }
            NativeEvent::Pong { payload } => {
                inner.state.lock().waiting_for_pong = false;
                inner.deliver(Delivery::Pong(payload.to_vec()));
                CallbackAction::Continue
            }
            NativeEvent::AppendHandshakeHeaders { sink } => match append_headers(&inner, sink) {
                Ok(()) => CallbackAction::Continue,
                Err(e) => {
                    warn!(connection_id = %inner.id, error = %e, "Header injection failed");
                    CallbackAction::Close
                }
            },
        }
    }
}

// ============================================================================
// Event Handlers
// ============================================================================

fn on_established(inner: &ConnectionInner) -> CallbackAction {
    let pending = {
        let mut state = inner.state.lock();
        state.was_connected = true;
        state.pending_connect.take()
    };

    match pending.map(|tx| tx.send(Ok(()))) {
        Some(Ok(())) => {
            debug!(connection_id = %inner.id, "Handshake complete");
            CallbackAction::Continue
        }
        // Connect already failed (timeout, close) or its caller went away.
        _ => {
            debug!(connection_id = %inner.id, "Handshake completed for abandoned connect");
            CallbackAction::Close
        }
    }
}

fn on_receive(
    inner: &ConnectionInner,
    socket: &mut dyn NativeSocket,
    data: &[u8],
    is_first: bool,
    is_final: bool,
    is_binary: bool,
) -> CallbackAction {
    let (kind, assembled) = {
        let mut state = inner.state.lock();
        if state.is_closed() {
            return CallbackAction::Continue;
        }
        if is_first {
            state.frame_sequence = None;
        }

        let kind = state
            .frame_sequence
            .as_ref()
            .map_or(MessageKind::from_binary_flag(is_binary), FrameAssembler::kind);
        let max_message_size = inner.config.max_message_size;

        let message = if is_first && is_final {
            FrameAssembler::complete(kind, data, max_message_size).map(Some)
        } else {
            let assembler = state
                .frame_sequence
                .get_or_insert_with(|| FrameAssembler::new(kind, max_message_size));
            match assembler.append(data) {
                Ok(()) if is_final => state
                    .frame_sequence
                    .take()
                    .map_or(Ok(None), |assembler| assembler.finish().map(Some)),
                Ok(()) => Ok(None),
                Err(e) => Err(e),
            }
        };
        (kind, message)
    };

    // Every frame reaches the fragment handler, including one that fails
    // the message checks below.
    inner.deliver(Delivery::Fragment(Fragment {
        data: data.to_vec(),
        is_text: kind == MessageKind::Text,
        is_first,
        is_final,
    }));

    match assembled {
        Ok(Some(Message::Text(text))) => inner.deliver(Delivery::Text(text)),
        Ok(Some(Message::Binary(bytes))) => inner.deliver(Delivery::Binary(bytes)),
        Ok(None) => {}
        Err(error) => {
            let code = receive_close_code(&error);
            warn!(connection_id = %inner.id, error = %error, "Dropping connection on bad message");
            inner.mark_as_closed(code);
            socket.close(code);
        }
    }
    CallbackAction::Continue
}

fn on_writable(inner: &ConnectionInner, socket: &mut dyn NativeSocket) -> CallbackAction {
    let written = {
        let mut state = inner.state.lock();
        if state.is_closed() {
            return CallbackAction::Continue;
        }
        let Some(entry) = inner.queue.pop() else {
            return CallbackAction::Continue;
        };

        let outcome = socket.write(entry.opcode, &entry.data, entry.fin);
        if outcome.is_ok() && entry.opcode.is_close() {
            state.close_frame_sent = true;
        }
        (entry, outcome)
    };

    let (entry, outcome) = written;
    match outcome {
        Ok(()) => {
            trace!(
                connection_id = %inner.id,
                opcode = ?entry.opcode,
                len = entry.data.len(),
                fin = entry.fin,
                "Frame written"
            );
            entry.resolve(Ok(()));
            socket.request_writable();
        }
        Err(error) => {
            warn!(connection_id = %inner.id, error = %error, opcode = ?entry.opcode, "Write failed");
            let reason = match &error {
                Error::WriteFailed { message } => message.clone(),
                other => other.to_string(),
            };
            entry.resolve(Err(error));

            // The rest of a split message must not reach the wire after a gap.
            inner.fail_writes(&reason);
            inner.mark_as_closed(CloseCode::AbnormalClose);
            socket.close(CloseCode::AbnormalClose);
        }
    }
    CallbackAction::Continue
}

fn on_closed(inner: &ConnectionInner) {
    let code = {
        let mut state = inner.state.lock();
        state.socket = None;
        state
            .waiting_close_status
            .filter(|_| state.close_frame_sent)
            .unwrap_or(CloseCode::NoStatus)
    };

    inner.fail_pending_connect(Error::connection("socket closed during handshake"));
    inner.mark_as_closed(code);
}

fn on_connection_error(inner: &ConnectionInner, description: &str) {
    let was_connected = {
        let mut state = inner.state.lock();
        state.had_connection_error = true;
        state.socket = None;
        state.was_connected
    };

    warn!(connection_id = %inner.id, description, "Connection error");
    inner.fail_pending_connect(Error::connection(description));
    if was_connected {
        inner.mark_as_closed(CloseCode::AbnormalClose);
    }
}

fn append_headers(inner: &ConnectionInner, sink: &mut dyn HeaderSink) -> Result<()> {
    for (name, value) in inner.config.headers.iter() {
        sink.append(name, value)?;
    }
    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

/// Close code for a message that could not be accepted.
fn receive_close_code(error: &Error) -> CloseCode {
    match error {
        Error::InvalidPayload => CloseCode::InvalidPayload,
        Error::MessageTooLarge { .. } => CloseCode::MessageTooLarge,
        _ => CloseCode::ProtocolError,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receive_close_codes() {
        assert_eq!(
            receive_close_code(&Error::InvalidPayload),
            CloseCode::InvalidPayload
        );
        assert_eq!(
            receive_close_code(&Error::message_too_large(10, 4)),
            CloseCode::MessageTooLarge
        );
        assert_eq!(
            receive_close_code(&Error::connection("boom")),
            CloseCode::ProtocolError
        );
    }
}
