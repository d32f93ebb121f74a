//! Ping/pong keepalive.
//!
//! Each tick either sends a ping and marks a pong as awaited, or, if the
//! previous ping is still unanswered, force-closes the connection with
//! [`CloseCode::AbnormalClose`].

// ============================================================================
// Imports
// ============================================================================

use std::sync::Weak;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, warn};

use crate::protocol::{CloseCode, Opcode};

use super::core::ConnectionInner;

// ============================================================================
// Keepalive
// ============================================================================

/// Running keepalive task. Dropping it cancels the task.
#[derive(Debug)]
pub(crate) struct Keepalive {
    interval: Duration,
    task: JoinHandle<()>,
}

impl Keepalive {
    /// Arms a repeating keepalive on `runtime`.
    pub(crate) fn spawn(
        runtime: &Handle,
        connection: Weak<ConnectionInner>,
        interval: Duration,
    ) -> Self {
        let task = runtime.spawn(run_keepalive(connection, interval));
        Self { interval, task }
    }

    /// Returns the ping interval.
    #[inline]
    pub(crate) fn interval(&self) -> Duration {
        self.interval
    }
}

impl Drop for Keepalive {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_keepalive(connection: Weak<ConnectionInner>, interval: Duration) {
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let Some(inner) = connection.upgrade() else {
            break;
        };
        if inner.is_closed_forever() {
            break;
        }

        let missed_pong = std::mem::replace(&mut inner.state.lock().waiting_for_pong, true);
        if missed_pong {
            warn!(
                connection_id = %inner.id,
                interval_ms = interval.as_millis() as u64,
                "Pong not received in time, closing"
            );
            inner.force_close(CloseCode::AbnormalClose);
            break;
        }

        debug!(connection_id = %inner.id, "Keepalive ping");
        inner.enqueue(Vec::new(), Opcode::Ping, true, None);
    }
}
