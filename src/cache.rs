//! Shares one [`Connection`] per name without keeping it alive.

use std::{
    collections::HashMap,
    sync::{Mutex, Weak},
};

use tracing::trace;

use crate::connection::{Connection, ConnectionInner};

/// Name to connection lookup holding only weak references
///
/// Entries whose connection was dropped or destroyed are discarded when next
/// looked up, or all at once by [`ConnectionCache::cleanup`].
#[derive(Default)]
pub struct ConnectionCache {
    entries: Mutex<HashMap<String, Weak<ConnectionInner>>>,
}

fn live(entry: &Weak<ConnectionInner>) -> Option<Connection> {
    entry
        .upgrade()
        .map(Connection::from_inner)
        .filter(|c| !c.is_destroyed())
}

impl ConnectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache `connection` under `name`, returning the entry it replaces if
    /// that one is still live
    pub fn add(&self, name: &str, connection: &Connection) -> Option<Connection> {
        self.entries
            .lock()
            .unwrap()
            .insert(name.to_owned(), connection.downgrade())
            .as_ref()
            .and_then(live)
            .filter(|previous| !previous.ptr_eq(connection))
    }

    pub fn get(&self, name: &str) -> Option<Connection> {
        let mut entries = self.entries.lock().unwrap();
        let found = entries.get(name).and_then(live);
        if found.is_none() && entries.remove(name).is_some() {
            trace!("Evicted stale cache entry {name}");
        }
        found
    }

    pub fn remove(&self, name: &str) -> Option<Connection> {
        self.entries
            .lock()
            .unwrap()
            .remove(name)
            .as_ref()
            .and_then(live)
    }

    /// Drop every entry that no longer refers to a live connection, returning
    /// how many were removed
    pub fn cleanup(&self) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, entry| live(entry).is_some());
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
