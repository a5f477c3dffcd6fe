// Connection registry: the single shared structure every other component
// touches. Sharded by id hash so unrelated users never contend on one lock;
// critical sections are synchronous and never span an await.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use parley_common::protocol::ws::WsMessage;
use tokio::sync::mpsc;
use uuid::Uuid;

pub const SHARD_COUNT: usize = 16;

/// Outbound handle for one live connection. The socket task drains the
/// receiving end, giving each connection a single writer.
pub type ConnectionHandle = mpsc::UnboundedSender<WsMessage>;

pub fn shard_index(id: &Uuid) -> usize {
    let mut hasher = DefaultHasher::new();
    id.hash(&mut hasher);
    (hasher.finish() as usize) % SHARD_COUNT
}

#[derive(Debug, Clone)]
struct ConnectionRecord {
    user_id: Uuid,
    handle: ConnectionHandle,
    connected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("connection {0} is already registered")]
    DuplicateConnection(Uuid),
}

/// Maps authenticated (user, connection) pairs to live transport handles.
///
/// Connections are owned exclusively by the registry; the event emitter only
/// ever borrows handles through [`lookup`]. Many connections may map to one
/// user (multi-device), each connection to exactly one user.
///
/// [`lookup`]: ConnectionRegistry::lookup
pub struct ConnectionRegistry {
    /// connection id -> record, sharded by connection id.
    connections: Vec<RwLock<HashMap<Uuid, ConnectionRecord>>>,
    /// user id -> connection ids, sharded by user id.
    by_user: Vec<RwLock<HashMap<Uuid, HashSet<Uuid>>>>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self {
            connections: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
            by_user: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a live connection for a user.
    ///
    /// Fails with `DuplicateConnection` only when the exact connection id is
    /// already present; a new connection id for the same user is the normal
    /// multi-device path.
    pub fn register(
        &self,
        user_id: Uuid,
        connection_id: Uuid,
        handle: ConnectionHandle,
    ) -> Result<(), RegistryError> {
        {
            let mut connections = self.connections[shard_index(&connection_id)]
                .write()
                .expect("registry shard lock poisoned");
            if connections.contains_key(&connection_id) {
                return Err(RegistryError::DuplicateConnection(connection_id));
            }
            connections.insert(
                connection_id,
                ConnectionRecord { user_id, handle, connected_at: Utc::now() },
            );
        }

        self.by_user[shard_index(&user_id)]
            .write()
            .expect("registry shard lock poisoned")
            .entry(user_id)
            .or_default()
            .insert(connection_id);

        Ok(())
    }

    /// All live handles for a user; empty when none. Never contains another
    /// user's handles: the connection-id set consulted here is keyed by the
    /// registry's own user binding.
    pub fn lookup(&self, user_id: Uuid) -> Vec<ConnectionHandle> {
        let connection_ids: Vec<Uuid> = {
            let by_user = self.by_user[shard_index(&user_id)]
                .read()
                .expect("registry shard lock poisoned");
            match by_user.get(&user_id) {
                Some(ids) => ids.iter().copied().collect(),
                None => return Vec::new(),
            }
        };

        let mut handles = Vec::with_capacity(connection_ids.len());
        for connection_id in connection_ids {
            let connections = self.connections[shard_index(&connection_id)]
                .read()
                .expect("registry shard lock poisoned");
            if let Some(record) = connections.get(&connection_id) {
                if record.user_id == user_id {
                    handles.push(record.handle.clone());
                }
            }
        }
        handles
    }

    /// Removes a connection. Idempotent: removing an absent id is a no-op.
    pub fn remove(&self, connection_id: Uuid) {
        let record = self.connections[shard_index(&connection_id)]
            .write()
            .expect("registry shard lock poisoned")
            .remove(&connection_id);

        if let Some(record) = record {
            let mut by_user = self.by_user[shard_index(&record.user_id)]
                .write()
                .expect("registry shard lock poisoned");
            if let Some(ids) = by_user.get_mut(&record.user_id) {
                ids.remove(&connection_id);
                if ids.is_empty() {
                    by_user.remove(&record.user_id);
                }
            }
        }
    }

    /// The owning user of a connection, if it is live.
    pub fn user_of(&self, connection_id: Uuid) -> Option<Uuid> {
        self.connections[shard_index(&connection_id)]
            .read()
            .expect("registry shard lock poisoned")
            .get(&connection_id)
            .map(|record| record.user_id)
    }

    /// Total live connections across all users.
    pub fn connection_count(&self) -> usize {
        self.connections
            .iter()
            .map(|shard| shard.read().expect("registry shard lock poisoned").len())
            .sum()
    }

    /// Live connections for one user.
    pub fn user_connection_count(&self, user_id: Uuid) -> usize {
        self.by_user[shard_index(&user_id)]
            .read()
            .expect("registry shard lock poisoned")
            .get(&user_id)
            .map(|ids| ids.len())
            .unwrap_or(0)
    }
}
