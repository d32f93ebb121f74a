//! Socket handle registry.
//!
//! Maps the opaque handles a native engine reports back to the connection
//! that owns them. Entries are weak: the registry never keeps a connection
//! alive, and a lookup that races with the last handle being dropped simply
//! misses.

// ============================================================================
// Imports
// ============================================================================

use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::connection::ConnectionInner;
use crate::identifiers::SocketHandle;

// ============================================================================
// Registry
// ============================================================================

/// Thread-safe `SocketHandle → connection` map.
#[derive(Default)]
pub(crate) struct Registry {
    entries: RwLock<FxHashMap<SocketHandle, Weak<ConnectionInner>>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Associates `socket` with `connection`, replacing any previous entry.
    pub(crate) fn insert(&self, socket: SocketHandle, connection: Weak<ConnectionInner>) {
        self.entries.write().insert(socket, connection);
    }

    /// Returns the live connection for `socket`.
    pub(crate) fn get(&self, socket: SocketHandle) -> Option<Arc<ConnectionInner>> {
        // Upgrade outside the lock: dropping the result may re-enter `remove`.
        let weak = self.entries.read().get(&socket).cloned()?;
        weak.upgrade()
    }

    pub(crate) fn remove(&self, socket: SocketHandle) {
        self.entries.write().remove(&socket);
    }

    /// Empties the registry and returns the connections still alive.
    pub(crate) fn drain(&self) -> Vec<Arc<ConnectionInner>> {
        let drained: Vec<Weak<ConnectionInner>> =
            self.entries.write().drain().map(|(_, weak)| weak).collect();
        drained.iter().filter_map(Weak::upgrade).collect()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.entries.read().len()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dead_entry_misses() {
        let registry = Registry::new();
        let socket = SocketHandle::from_raw(7);

        registry.insert(socket, Weak::new());
        assert_eq!(registry.len(), 1);
        assert!(registry.get(socket).is_none());
        assert!(registry.drain().is_empty());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_remove() {
        let registry = Registry::new();
        let socket = SocketHandle::from_raw(1);

        registry.insert(socket, Weak::new());
        registry.insert(SocketHandle::from_raw(2), Weak::new());
        registry.remove(socket);

        assert_eq!(registry.len(), 1);
        assert!(registry.get(SocketHandle::from_raw(2)).is_none());
    }
}
