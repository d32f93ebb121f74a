//! Engine pool for spreading connections across threads.
//!
//! A fixed number of polling engines, created lazily on first use and handed
//! out in round-robin order. Each engine owns one thread, so the number of
//! I/O threads is bounded by the pool size no matter how many connections
//! are open.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │               EnginePool                │
//! │  cursor ─┐                              │
//! │  ┌───────▼──┐ ┌──────────┐ ┌──────────┐ │
//! │  │ engine-0 │ │ engine-1 │ │ engine-N │ │
//! │  │ (thread) │ │ (thread) │ │ (thread) │ │
//! │  └──────────┘ └──────────┘ └──────────┘ │
//! └─────────────────────────────────────────┘
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::connection::{Connection, ConnectionConfig};
use crate::error::{Error, Result};
use crate::identifiers::EngineId;
use crate::native::{EngineOptions, ExtensionOffer, NativeEngineFactory, TungsteniteFactory};

use super::engine::PollingEngine;

// ============================================================================
// Constants
// ============================================================================

/// Protocol name used when none is configured.
pub const DEFAULT_PROTOCOL_NAME: &str = "libwebsockets-protocol";

/// Upper bound of one idle service step.
pub const DEFAULT_SERVICE_TIMEOUT: Duration = Duration::from_millis(250);

/// Receive buffer size of each native context.
pub const DEFAULT_RX_BUFFER_SIZE: usize = 3000;

// ============================================================================
// PoolConfig
// ============================================================================

/// Configuration shared by every engine of a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of engines. Defaults to the available parallelism.
    pub size: usize,
    /// Upper bound of one idle service step.
    pub service_timeout: Duration,
    /// Wire protocol name registered with each native context.
    pub protocol_name: String,
    /// Receive buffer size of each native context.
    pub rx_buffer_size: usize,
    /// Extensions offered during the handshake.
    pub extensions: Vec<ExtensionOffer>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: thread::available_parallelism().map_or(1, NonZeroUsize::get),
            service_timeout: DEFAULT_SERVICE_TIMEOUT,
            protocol_name: DEFAULT_PROTOCOL_NAME.to_string(),
            rx_buffer_size: DEFAULT_RX_BUFFER_SIZE,
            extensions: vec![ExtensionOffer::permessage_deflate()],
        }
    }
}

impl PoolConfig {
    /// Sets the number of engines.
    #[inline]
    #[must_use]
    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Sets the service step timeout.
    #[inline]
    #[must_use]
    pub fn service_timeout(mut self, timeout: Duration) -> Self {
        self.service_timeout = timeout;
        self
    }

    /// Sets the wire protocol name.
    #[inline]
    #[must_use]
    pub fn protocol_name(mut self, name: impl Into<String>) -> Self {
        self.protocol_name = name.into();
        self
    }

    /// Sets the receive buffer size.
    #[inline]
    #[must_use]
    pub fn rx_buffer_size(mut self, size: usize) -> Self {
        self.rx_buffer_size = size;
        self
    }

    /// Replaces the extension offers.
    #[inline]
    #[must_use]
    pub fn extensions(mut self, extensions: Vec<ExtensionOffer>) -> Self {
        self.extensions = extensions;
        self
    }

    /// Checks the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if any value is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(Error::config("pool size must be at least 1"));
        }
        if self.service_timeout.is_zero() {
            return Err(Error::config("service timeout must be non-zero"));
        }
        if self.protocol_name.is_empty() {
            return Err(Error::config("protocol name must not be empty"));
        }
        if self.rx_buffer_size == 0 {
            return Err(Error::config("rx buffer size must be non-zero"));
        }
        Ok(())
    }

    fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            protocol_name: self.protocol_name.clone(),
            extensions: self.extensions.clone(),
            rx_buffer_size: self.rx_buffer_size,
        }
    }
}

// ============================================================================
// EnginePool
// ============================================================================

/// Lazily started, round-robin set of polling engines.
///
/// Construct one per application and share it; dropping the pool shuts its
/// engines down and closes every connection still open on them.
///
/// # Example
///
/// ```ignore
/// let pool = EnginePool::with_config(
///     Arc::new(TungsteniteFactory::new()),
///     PoolConfig::default().size(2),
/// )?;
///
/// let config = ConnectionConfig::from_url("ws://127.0.0.1:9000/chat")?;
/// let connection = pool.connect(config).await?;
/// ```
pub struct EnginePool {
    config: PoolConfig,
    factory: Arc<dyn NativeEngineFactory>,
    /// `None` until the first `acquire`, and again after `shutdown`.
    engines: Mutex<Option<Arc<[Arc<PollingEngine>]>>>,
    cursor: AtomicUsize,
}

// ============================================================================
// EnginePool - Constructor
// ============================================================================

impl EnginePool {
    /// Creates a pool with the default configuration.
    #[must_use]
    pub fn new(factory: Arc<dyn NativeEngineFactory>) -> Self {
        Self {
            config: PoolConfig::default(),
            factory,
            engines: Mutex::new(None),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Creates a pool with `config`.
    ///
    /// No engine is started until the first [`acquire`](Self::acquire).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `config` is invalid.
    pub fn with_config(factory: Arc<dyn NativeEngineFactory>, config: PoolConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            factory,
            engines: Mutex::new(None),
            cursor: AtomicUsize::new(0),
        })
    }
}

impl Default for EnginePool {
    /// A pool backed by [`TungsteniteFactory`].
    fn default() -> Self {
        Self::new(Arc::new(TungsteniteFactory::new()))
    }
}

// ============================================================================
// EnginePool - Public API
// ============================================================================

impl EnginePool {
    /// Returns the next engine in round-robin order.
    ///
    /// Starts the pool on first use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EngineCreationFailed`] if any engine failed to
    /// start. The pool stays unstarted and the next call retries.
    pub fn acquire(&self) -> Result<Arc<PollingEngine>> {
        let engines = self.started()?;

        let len = engines.len();
        let slot = self
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cursor| {
                Some((cursor + 1) % len)
            })
            .unwrap_or(0)
            % len;

        let engine = Arc::clone(&engines[slot]);
        debug!(engine = %engine.id(), "Engine acquired");
        Ok(engine)
    }

    /// Opens a connection on the next engine.
    ///
    /// # Errors
    ///
    /// See [`Connection::connect`].
    pub async fn connect(&self, config: ConnectionConfig) -> Result<Connection> {
        Connection::connect(self, config).await
    }

    /// Returns the pool configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Returns `true` once the engines are running.
    #[inline]
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.engines.lock().is_some()
    }

    /// Returns the running engines, empty if the pool is not started.
    #[must_use]
    pub fn engines(&self) -> Vec<Arc<PollingEngine>> {
        self.engines
            .lock()
            .as_deref()
            .map(<[_]>::to_vec)
            .unwrap_or_default()
    }

    /// Stops every engine.
    ///
    /// Connections still open are closed with
    /// [`CloseCode::NoStatusContextDestroy`](crate::protocol::CloseCode::NoStatusContextDestroy).
    /// A later [`acquire`](Self::acquire) starts a fresh set of engines.
    pub fn shutdown(&self) {
        let engines = self.engines.lock().take();
        let Some(engines) = engines else {
            return;
        };

        info!(engines = engines.len(), "EnginePool shutting down");
        for engine in engines.iter() {
            engine.shutdown();
        }
        info!("EnginePool shutdown complete");
    }
}

// ============================================================================
// EnginePool - Startup
// ============================================================================

impl EnginePool {
    fn started(&self) -> Result<Arc<[Arc<PollingEngine>]>> {
        let mut slot = self.engines.lock();
        if let Some(engines) = slot.as_ref() {
            return Ok(Arc::clone(engines));
        }

        let options = self.config.engine_options();
        let mut engines = Vec::with_capacity(self.config.size);

        for index in 0..self.config.size {
            match PollingEngine::start(
                EngineId::new(index),
                self.factory.as_ref(),
                &options,
                self.config.service_timeout,
            ) {
                Ok(engine) => engines.push(engine),
                Err(e) => {
                    error!(index, error = %e, "Engine failed to start, discarding pool");
                    for engine in &engines {
                        engine.shutdown();
                    }
                    return Err(Error::engine_creation(format!(
                        "engine {index} of {} failed to start: {e}",
                        self.config.size
                    )));
                }
            }
        }

        let engines: Arc<[Arc<PollingEngine>]> = engines.into();
        *slot = Some(Arc::clone(&engines));
        self.cursor.store(0, Ordering::Release);

        info!(
            size = engines.len(),
            protocol = %self.config.protocol_name,
            "EnginePool started"
        );
        Ok(engines)
    }
}

impl Drop for EnginePool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for EnginePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnginePool")
            .field("config", &self.config)
            .field("started", &self.is_started())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::native::LoopbackFactory;

    fn pool(factory: LoopbackFactory, size: usize) -> EnginePool {
        EnginePool::with_config(
            Arc::new(factory),
            PoolConfig::default()
                .size(size)
                .service_timeout(Duration::from_millis(20)),
        )
        .expect("valid config")
    }

    #[test]
    fn test_default_config() {
        let config = PoolConfig::default();
        assert!(config.size >= 1);
        assert_eq!(config.service_timeout, DEFAULT_SERVICE_TIMEOUT);
        assert_eq!(config.protocol_name, DEFAULT_PROTOCOL_NAME);
        assert_eq!(config.extensions, vec![ExtensionOffer::permessage_deflate()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_config() {
        assert!(PoolConfig::default().size(0).validate().is_err());
        assert!(PoolConfig::default().protocol_name("").validate().is_err());
        assert!(
            PoolConfig::default()
                .service_timeout(Duration::ZERO)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_lazy_start() {
        let factory = LoopbackFactory::new();
        let pool = pool(factory.clone(), 2);

        assert!(!pool.is_started());
        assert_eq!(factory.attempts(), 0);

        pool.acquire().expect("acquire");
        assert!(pool.is_started());
        assert_eq!(factory.attempts(), 2);

        pool.acquire().expect("acquire");
        assert_eq!(factory.attempts(), 2);
    }

    #[test]
    fn test_round_robin() {
        let pool = pool(LoopbackFactory::new(), 3);

        let ids: Vec<usize> = (0..7)
            .map(|_| pool.acquire().expect("acquire").id().index())
            .collect();
        assert_eq!(ids, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn test_partial_failure_discards_pool() {
        let factory = LoopbackFactory::new().fail_after(2);
        let pool = pool(factory.clone(), 3);

        let result = pool.acquire();
        assert!(matches!(result, Err(Error::EngineCreationFailed { .. })));
        assert!(!pool.is_started());
        assert!(pool.engines().is_empty());

        // Retried on the next call.
        assert!(pool.acquire().is_err());
        assert_eq!(factory.attempts(), 4);
    }

    #[test]
    fn test_shutdown_then_restart() {
        let pool = pool(LoopbackFactory::new(), 2);

        let first = pool.acquire().expect("acquire");
        pool.shutdown();
        assert!(!first.is_running());
        assert!(!pool.is_started());

        let second = pool.acquire().expect("acquire");
        assert!(second.is_running());
    }
}
