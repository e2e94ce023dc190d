//! ConnectionRegistry: every connection attached to this controller.
//!
//! The registry is created once at startup and handed to the
//! [`HotplugDispatcher`](super::dispatcher::HotplugDispatcher); nothing looks
//! connections up through ambient global state.
//!
//! # Locking
//!
//! Lookups happen on the hotplug path, so the map sits behind a
//! `std::sync::RwLock` and only `Arc` clones leave the critical section.
//! The lock is never held across an `.await`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use dplink_core::ConnectionId;

use super::connection::Connection;

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ConnectionId, Arc<Connection>>> {
        self.connections.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ConnectionId, Arc<Connection>>> {
        self.connections.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Registers a connection, replacing any previous one with the same id.
    pub fn insert(&self, connection: Arc<Connection>) {
        self.write().insert(connection.id(), connection);
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.read().get(&id).cloned()
    }

    /// Every registered connection, sorted by id.
    pub fn all(&self) -> Vec<Arc<Connection>> {
        let mut all: Vec<_> = self.read().values().cloned().collect();
        all.sort_by_key(|c| c.id());
        all
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.write().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
