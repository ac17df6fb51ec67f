//! Proxy-side map from server name to the live connection for that server.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::connection::{Connection, ConnectionId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("a server named '{0}' is already connected")]
    DuplicateName(String),
}

/// Live server links, keyed by the name each server announced.
#[derive(Default)]
pub struct ServerRegistry {
    servers: DashMap<String, Arc<Connection>>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `name` could be registered right now.
    pub fn can_register(&self, name: &str) -> Result<(), RegistryError> {
        match self.servers.get(name) {
            Some(existing) if !existing.is_closed() => {
                Err(RegistryError::DuplicateName(name.to_string()))
            }
            _ => Ok(()),
        }
    }

    /// Registers `connection` under its peer name. A previous connection
    /// under the same name is replaced only if it has already closed.
    pub fn register(&self, connection: Arc<Connection>) -> Result<(), RegistryError> {
        let name = connection.peer_name().to_string();
        match self.servers.entry(name) {
            Entry::Occupied(mut slot) => {
                if !slot.get().is_closed() {
                    return Err(RegistryError::DuplicateName(slot.key().clone()));
                }
                tracing::debug!("Replacing closed link for '{}'", slot.key());
                slot.insert(connection);
            }
            Entry::Vacant(slot) => {
                slot.insert(connection);
            }
        }
        Ok(())
    }

    /// Removes `name` if it still maps to connection `id`. A newer link
    /// registered under the same name is left alone.
    pub fn unregister(&self, name: &str, id: ConnectionId) -> bool {
        self.servers.remove_if(name, |_, conn| conn.id() == id).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Connection>> {
        self.servers.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.servers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.servers.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}
