//! Connection configuration and its builder.
//!
//! A [`ConnectionConfig`] is immutable once built. Use
//! [`ConnectionConfig::builder`] or [`ConnectionBuilder::from_url`] to
//! create one.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use lws_engine::ConnectionConfig;
//!
//! let config = ConnectionConfig::builder("echo.example.com")
//!     .port(8080)
//!     .path("/echo")
//!     .header("Authorization", "Bearer token")
//!     .connect_timeout(Duration::from_secs(5))
//!     .build()?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::runtime::Handle;
use url::Url;

use crate::error::{Error, Result};
use crate::native::ConnectRequest;
use crate::protocol::Scheme;

// ============================================================================
// Constants
// ============================================================================

/// Default largest outbound frame; larger sends are split.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 4096;

/// Default deadline for establishing a connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default `Origin` header value.
pub const DEFAULT_ORIGIN: &str = "localhost";

// ============================================================================
// Headers
// ============================================================================

/// Extra handshake headers.
///
/// Names are case-insensitive; inserting an existing name replaces its value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    /// Lowercased name -> (name as given, value).
    entries: FxHashMap<String, (String, String)>,
}

impl Headers {
    /// Creates an empty header set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a header, replacing any value stored under the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.entries
            .insert(name.to_ascii_lowercase(), (name, value.into()));
    }

    /// Returns the value stored under `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .get(&name.to_ascii_lowercase())
            .map(|(_, value)| value.as_str())
    }

    /// Returns the number of headers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no header is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over `(name, value)` pairs in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .values()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Self::new();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}

// ============================================================================
// ConnectionConfig
// ============================================================================

/// Immutable configuration of one connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Endpoint scheme.
    pub scheme: Scheme,
    /// Host name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Request path, starting with `/`.
    pub path: String,
    /// Query string without the leading `?`.
    pub query: Option<String>,
    /// Extra handshake headers.
    pub headers: Headers,
    /// `Origin` header value.
    pub origin: String,
    /// Largest outbound frame.
    pub max_frame_size: usize,
    /// Largest accepted incoming message, unlimited if `None`.
    pub max_message_size: Option<usize>,
    /// Offer permessage-deflate.
    pub compression: bool,
    /// Offer the engine's protocol name as `Sec-WebSocket-Protocol`.
    pub offer_protocol: bool,
    /// Deadline for establishing the connection.
    pub connect_timeout: Duration,
    /// Runtime that runs consumer callbacks; the connecting runtime if `None`.
    pub callback_runtime: Option<Handle>,
}

impl ConnectionConfig {
    /// Starts a builder for `host` with default settings.
    #[inline]
    #[must_use]
    pub fn builder(host: impl Into<String>) -> ConnectionBuilder {
        ConnectionBuilder::new(host)
    }

    /// Parses a `ws://` or `wss://` URL into a default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the URL is malformed or not a WebSocket
    /// URL.
    pub fn from_url(url: &str) -> Result<Self> {
        ConnectionBuilder::from_url(url)?.build()
    }

    /// Returns the request target: path plus `?query` when present.
    #[must_use]
    pub fn resource(&self) -> String {
        match self.query.as_deref() {
            Some(query) if !query.is_empty() => format!("{}?{}", self.path, query),
            _ => self.path.clone(),
        }
    }

    /// Returns the `Host` header value (`host:port`).
    #[inline]
    #[must_use]
    pub fn host_header(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Returns the full endpoint URL.
    #[must_use]
    pub fn url(&self) -> String {
        format!(
            "{}://{}:{}{}",
            self.scheme,
            self.host,
            self.port,
            self.resource()
        )
    }

    /// Builds the request handed to the native engine.
    #[must_use]
    pub fn connect_request(&self, protocol: &str) -> ConnectRequest {
        ConnectRequest {
            scheme: self.scheme,
            host: self.host.clone(),
            port: self.port,
            resource: self.resource(),
            host_header: self.host_header(),
            origin: self.origin.clone(),
            protocol: protocol.to_string(),
            offer_protocol: self.offer_protocol,
            compression: self.compression,
            connect_timeout: self.connect_timeout,
            max_frame_size: self.max_frame_size,
            max_message_size: self.max_message_size,
        }
    }
}

// ============================================================================
// ConnectionBuilder
// ============================================================================

/// Builder for a [`ConnectionConfig`].
#[derive(Debug, Clone)]
pub struct ConnectionBuilder {
    scheme: Scheme,
    host: String,
    port: Option<u16>,
    path: String,
    query: Option<String>,
    headers: Headers,
    origin: String,
    max_frame_size: usize,
    max_message_size: Option<usize>,
    compression: bool,
    offer_protocol: bool,
    connect_timeout: Duration,
    callback_runtime: Option<Handle>,
}

impl ConnectionBuilder {
    /// Creates a builder for `host` with default settings.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            scheme: Scheme::Ws,
            host: host.into(),
            port: None,
            path: "/".to_string(),
            query: None,
            headers: Headers::new(),
            origin: DEFAULT_ORIGIN.to_string(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_message_size: None,
            compression: true,
            offer_protocol: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            callback_runtime: None,
        }
    }

    /// Creates a builder from a `ws://` or `wss://` URL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the URL does not parse, has another
    /// scheme or has no host.
    pub fn from_url(url: &str) -> Result<Self> {
        let parsed = Url::parse(url).map_err(|e| Error::config(format!("Invalid URL {url}: {e}")))?;

        let scheme = Scheme::parse(parsed.scheme()).ok_or_else(|| {
            Error::config(format!(
                "Unsupported scheme {}: expected ws or wss",
                parsed.scheme()
            ))
        })?;
        let host = parsed
            .host_str()
            .ok_or_else(|| Error::config(format!("URL has no host: {url}")))?;

        let mut builder = Self::new(host).scheme(scheme);
        if let Some(port) = parsed.port() {
            builder = builder.port(port);
        }
        builder = builder.path(parsed.path());
        if let Some(query) = parsed.query() {
            builder = builder.query(query);
        }

        Ok(builder)
    }

    /// Sets the scheme.
    #[inline]
    #[must_use]
    pub fn scheme(mut self, scheme: Scheme) -> Self {
        self.scheme = scheme;
        self
    }

    /// Sets the port. Defaults to the scheme's port.
    #[inline]
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Sets the request path.
    #[inline]
    #[must_use]
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Sets the query string (without `?`).
    #[inline]
    #[must_use]
    pub fn query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    /// Adds a handshake header; the last value for a name wins.
    #[inline]
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Adds several handshake headers.
    #[must_use]
    pub fn headers<K, V>(mut self, headers: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        for (name, value) in headers {
            self.headers.insert(name, value);
        }
        self
    }

    /// Sets the `Origin` header.
    #[inline]
    #[must_use]
    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    /// Sets the largest outbound frame.
    #[inline]
    #[must_use]
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Sets the largest accepted incoming message.
    #[inline]
    #[must_use]
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = Some(size);
        self
    }

    /// Enables or disables the permessage-deflate offer.
    #[inline]
    #[must_use]
    pub fn compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    /// Offers the engine's protocol name during the handshake.
    ///
    /// The server must then select it, or the handshake fails.
    #[inline]
    #[must_use]
    pub fn offer_protocol(mut self, enabled: bool) -> Self {
        self.offer_protocol = enabled;
        self
    }

    /// Sets the connect deadline.
    #[inline]
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Runs consumer callbacks on `runtime`.
    #[inline]
    #[must_use]
    pub fn callback_runtime(mut self, runtime: Handle) -> Self {
        self.callback_runtime = Some(runtime);
        self
    }

    /// Validates and builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the host is empty, the path does not
    /// start with `/`, the frame size is zero or the timeout is zero.
    pub fn build(self) -> Result<ConnectionConfig> {
        if self.host.trim().is_empty() {
            return Err(Error::config("Host must not be empty"));
        }
        if !self.path.starts_with('/') {
            return Err(Error::config(format!(
                "Path must start with '/': {}",
                self.path
            )));
        }
        if self.max_frame_size == 0 {
            return Err(Error::config("Max frame size must be greater than zero"));
        }
        if self.connect_timeout.is_zero() {
            return Err(Error::config("Connect timeout must be greater than zero"));
        }

        Ok(ConnectionConfig {
            port: self.port.unwrap_or_else(|| self.scheme.default_port()),
            scheme: self.scheme,
            host: self.host,
            path: self.path,
            query: self.query,
            headers: self.headers,
            origin: self.origin,
            max_frame_size: self.max_frame_size,
            max_message_size: self.max_message_size,
            compression: self.compression,
            offer_protocol: self.offer_protocol,
            connect_timeout: self.connect_timeout,
            callback_runtime: self.callback_runtime,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
