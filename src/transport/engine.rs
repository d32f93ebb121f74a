//! Polling engine: one native context driven by one dedicated thread.
//!
//! Every native call happens on the engine thread. Other threads talk to the
//! engine by scheduling jobs into one of two inboxes and waking the thread
//! out of its service step.
//!
//! # Service Loop
//!
//! ```text
//! while running:
//!     run immediate jobs      (connect, close)
//!     native.service(timeout) (events → CallbackDispatcher)
//!     run deferred jobs       (writable requests)
//! ```
//!
//! On shutdown the inboxes are drained once more with
//! [`EngineContext::is_shutting_down`] set, and every connection still in
//! the registry is closed with [`CloseCode::NoStatusContextDestroy`].
//!
//! [`CloseCode::NoStatusContextDestroy`]: crate::protocol::CloseCode::NoStatusContextDestroy

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use tracing::{debug, error, info, trace};

use crate::error::{Error, Result};
use crate::identifiers::{EngineId, SocketHandle};
use crate::native::{EngineOptions, NativeEngine, NativeEngineFactory, ServiceSignal};
use crate::protocol::CloseCode;

use super::dispatcher::CallbackDispatcher;
use super::registry::Registry;

// ============================================================================
// Types
// ============================================================================

/// Work item executed on the engine thread.
type EngineJob = Box<dyn FnOnce(&mut EngineContext<'_>) + Send>;

/// What a job sees while running on the engine thread.
pub struct EngineContext<'a> {
    engine: &'a PollingEngine,
    native: &'a mut dyn NativeEngine,
    shutting_down: bool,
}

impl EngineContext<'_> {
    /// Returns the native context.
    #[inline]
    pub fn native(&mut self) -> &mut dyn NativeEngine {
        &mut *self.native
    }

    /// Returns `true` if the engine is draining its inboxes before exit.
    #[inline]
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    #[inline]
    pub(crate) fn registry(&self) -> &Registry {
        &self.engine.registry
    }
}

// ============================================================================
// PollingEngine
// ============================================================================

/// A native engine context and the thread servicing it.
pub struct PollingEngine {
    id: EngineId,
    protocol_name: String,
    service_timeout: Duration,
    signal: Arc<ServiceSignal>,

    /// Jobs run before each service step.
    immediate: Mutex<Vec<EngineJob>>,
    /// Jobs run after each service step.
    deferred: Mutex<Vec<EngineJob>>,
    /// Sockets with a writable request already scheduled.
    pending_writable: Mutex<FxHashSet<SocketHandle>>,

    registry: Registry,
    running: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

// ============================================================================
// PollingEngine - Constructor
// ============================================================================

impl PollingEngine {
    /// Creates a native context and starts its service thread.
    ///
    /// # Arguments
    ///
    /// * `id` - Slot of the engine in its pool
    /// * `factory` - Native context factory
    /// * `options` - Context options
    /// * `service_timeout` - Upper bound of one idle service step
    ///
    /// # Errors
    ///
    /// - [`Error::EngineCreationFailed`] if the context or thread could not
    ///   be created
    pub fn start(
        id: EngineId,
        factory: &dyn NativeEngineFactory,
        options: &EngineOptions,
        service_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let signal = Arc::new(ServiceSignal::new());
        let native = factory.create(options, Arc::clone(&signal))?;

        let engine = Arc::new(Self {
            id,
            protocol_name: options.protocol_name.clone(),
            service_timeout,
            signal,
            immediate: Mutex::new(Vec::new()),
            deferred: Mutex::new(Vec::new()),
            pending_writable: Mutex::new(FxHashSet::default()),
            registry: Registry::new(),
            running: AtomicBool::new(true),
            thread: Mutex::new(None),
        });

        let runner = Arc::clone(&engine);
        let handle = thread::Builder::new()
            .name(format!("lws-engine-{}", id.index()))
            .spawn(move || runner.run(native))
            .map_err(|e| Error::engine_creation(format!("failed to spawn {id} thread: {e}")))?;

        *engine.thread.lock() = Some(handle);
        info!(engine = %id, protocol = %engine.protocol_name, "Polling engine started");

        Ok(engine)
    }
}

// ============================================================================
// PollingEngine - Accessors
// ============================================================================

impl PollingEngine {
    /// Returns the engine ID.
    #[inline]
    #[must_use]
    pub fn id(&self) -> EngineId {
        self.id
    }

    /// Returns the protocol name the context was created with.
    #[inline]
    #[must_use]
    pub fn protocol_name(&self) -> &str {
        &self.protocol_name
    }

    /// Returns `true` until [`shutdown`](Self::shutdown) is called.
    #[inline]
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns the number of sockets currently registered.
    #[inline]
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    #[inline]
    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }
}

// ============================================================================
// PollingEngine - Scheduling
// ============================================================================

impl PollingEngine {
    /// Runs `job` on the engine thread before the next service step.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EngineShutdown`] if the engine has stopped.
    pub fn schedule_immediate(
        &self,
        job: impl FnOnce(&mut EngineContext<'_>) + Send + 'static,
    ) -> Result<()> {
        self.schedule(&self.immediate, Box::new(job))
    }

    /// Runs `job` on the engine thread after the next service step.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EngineShutdown`] if the engine has stopped.
    pub fn schedule_deferred(
        &self,
        job: impl FnOnce(&mut EngineContext<'_>) + Send + 'static,
    ) -> Result<()> {
        self.schedule(&self.deferred, Box::new(job))
    }

    fn schedule(&self, inbox: &Mutex<Vec<EngineJob>>, job: EngineJob) -> Result<()> {
        {
            let mut jobs = inbox.lock();
            if !self.running.load(Ordering::SeqCst) {
                return Err(Error::EngineShutdown);
            }
            jobs.push(job);
        }
        self.signal.wake();
        Ok(())
    }

    /// Asks the native context for a writable event on `socket`.
    ///
    /// Requests made before the previous one was forwarded are coalesced.
    pub(crate) fn call_writable(&self, socket: SocketHandle) {
        if !self.pending_writable.lock().insert(socket) {
            return;
        }

        let scheduled = self.schedule_deferred(move |cx: &mut EngineContext<'_>| {
            cx.engine.pending_writable.lock().remove(&socket);
            cx.native().request_writable(socket);
        });

        if scheduled.is_err() {
            self.pending_writable.lock().remove(&socket);
        }
    }

    /// Closes `socket` on the engine thread.
    pub(crate) fn close_socket(&self, socket: SocketHandle, code: CloseCode) {
        let scheduled = self.schedule_immediate(move |cx: &mut EngineContext<'_>| {
            cx.native().close(socket, code);
        });

        if scheduled.is_err() {
            trace!(engine = %self.id, socket = %socket, "Close skipped, engine stopped");
        }
    }
}

// ============================================================================
// PollingEngine - Lifecycle
// ============================================================================

impl PollingEngine {
    /// Stops the service thread and closes every remaining connection.
    ///
    /// Blocks until the thread exits, unless called from the engine thread
    /// itself. Calling it again does nothing.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        debug!(engine = %self.id, "Polling engine shutting down");
        self.signal.wake();

        let Some(handle) = self.thread.lock().take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            error!(engine = %self.id, "Polling engine thread panicked");
        }
    }

    fn run(self: Arc<Self>, mut native: Box<dyn NativeEngine>) {
        debug!(engine = %self.id, "Service loop started");

        while self.running.load(Ordering::SeqCst) {
            self.run_jobs(&self.immediate, native.as_mut(), false);
            native.service(self.service_timeout, &mut CallbackDispatcher::new(&self));
            self.run_jobs(&self.deferred, native.as_mut(), false);
        }

        self.run_jobs(&self.immediate, native.as_mut(), true);
        self.run_jobs(&self.deferred, native.as_mut(), true);

        let remaining = self.registry.drain();
        let count = remaining.len();
        for connection in remaining {
            connection.engine_destroyed();
        }

        drop(native);
        info!(engine = %self.id, closed = count, "Polling engine stopped");
    }

    fn run_jobs(
        &self,
        inbox: &Mutex<Vec<EngineJob>>,
        native: &mut dyn NativeEngine,
        shutting_down: bool,
    ) {
        let jobs = std::mem::take(&mut *inbox.lock());
        if jobs.is_empty() {
            return;
        }

        let mut cx = EngineContext {
            engine: self,
            native,
            shutting_down,
        };
        for job in jobs {
            job(&mut cx);
        }
    }
}

impl fmt::Debug for PollingEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollingEngine")
            .field("id", &self.id)
            .field("protocol_name", &self.protocol_name)
            .field("running", &self.is_running())
            .field("connections", &self.connection_count())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::mpsc;

    use crate::native::LoopbackFactory;

    fn options() -> EngineOptions {
        EngineOptions {
            protocol_name: "test-protocol".into(),
            extensions: Vec::new(),
            rx_buffer_size: 3000,
        }
    }

    fn start() -> Arc<PollingEngine> {
        PollingEngine::start(
            EngineId::new(0),
            &LoopbackFactory::new(),
            &options(),
            Duration::from_millis(50),
        )
        .expect("engine")
    }

    #[test]
    fn test_jobs_run_on_engine_thread() {
        let engine = start();
        let (tx, rx) = mpsc::channel();

        engine
            .schedule_immediate(move |cx: &mut EngineContext<'_>| {
                let name = thread::current().name().map(str::to_owned);
                let _ = tx.send((name, cx.is_shutting_down()));
            })
            .expect("schedule");

        let (name, shutting_down) = rx.recv_timeout(Duration::from_secs(5)).expect("job ran");
        assert_eq!(name.as_deref(), Some("lws-engine-0"));
        assert!(!shutting_down);

        engine.shutdown();
    }

    #[test]
    fn test_schedule_after_shutdown_fails() {
        let engine = start();
        engine.shutdown();

        assert!(!engine.is_running());
        let result = engine.schedule_deferred(|_: &mut EngineContext<'_>| {});
        assert!(matches!(result, Err(Error::EngineShutdown)));

        // Second shutdown is a no-op.
        engine.shutdown();
    }

    #[test]
    fn test_start_propagates_factory_failure() {
        let factory = LoopbackFactory::new().fail_after(0);
        let result = PollingEngine::start(
            EngineId::new(3),
            &factory,
            &options(),
            Duration::from_millis(50),
        );
        assert!(matches!(result, Err(Error::EngineCreationFailed { .. })));
    }
}
