use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use wirehub_core::ids::{ConnectionId, UserId};

use crate::connection::ClientConnection;

/// Index of all locally-attached connections, by id and by user.
///
/// Both indexes live under one lock so a connection is visible in both or in
/// neither — never half-registered.
#[derive(Default)]
pub struct ConnectionDirectory {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    by_id: HashMap<ConnectionId, Arc<ClientConnection>>,
    by_user: HashMap<UserId, Vec<Arc<ClientConnection>>>,
}

impl ConnectionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// False if the id is already registered; the existing entry wins.
    pub fn insert(&self, conn: Arc<ClientConnection>) -> bool {
        let mut inner = self.inner.write();
        if inner.by_id.contains_key(conn.id()) {
            return false;
        }
        if let Some(user) = conn.user_id() {
            inner
                .by_user
                .entry(user.clone())
                .or_default()
                .push(Arc::clone(&conn));
        }
        inner.by_id.insert(conn.id().clone(), conn);
        true
    }

    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        let mut inner = self.inner.write();
        let conn = inner.by_id.remove(id)?;
        if let Some(user) = conn.user_id() {
            if let Some(list) = inner.by_user.get_mut(user) {
                list.retain(|c| c.id() != id);
                if list.is_empty() {
                    inner.by_user.remove(user);
                }
            }
        }
        Some(conn)
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        self.inner.read().by_id.get(id).cloned()
    }

    /// All connections for one user; a user may hold several (tabs, devices).
    pub fn user_connections(&self, user: &UserId) -> Vec<Arc<ClientConnection>> {
        self.inner
            .read()
            .by_user
            .get(user)
            .map(|list| list.to_vec())
            .unwrap_or_default()
    }

    /// Snapshot of every attached connection.
    pub fn all(&self) -> Vec<Arc<ClientConnection>> {
        self.inner.read().by_id.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().by_id.is_empty()
    }
}
