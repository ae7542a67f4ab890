use std::collections::{BTreeMap, HashMap};

use crate::net::connection::ConnectionId;

/// Non-owning set of open connections, iterated in insertion order.
///
/// Identity lookups go through a hash index, ordering through a sequence
/// number, so both insert and remove avoid a linear scan.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    order: BTreeMap<u64, ConnectionId>,
    index: HashMap<ConnectionId, u64>,
    next_seq: u64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if `id` was already present.
    pub fn insert(&mut self, id: ConnectionId) -> bool {
        if self.index.contains_key(&id) {
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.index.insert(id, seq);
        self.order.insert(seq, id);
        true
    }

    /// Returns `false` if `id` was not present. Removing twice is a no-op.
    pub fn remove(&mut self, id: ConnectionId) -> bool {
        match self.index.remove(&id) {
            Some(seq) => {
                self.order.remove(&seq);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.order.values().copied()
    }

    pub fn snapshot(&self) -> Vec<ConnectionId> {
        self.iter().collect()
    }
}
