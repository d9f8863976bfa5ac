//! Fixed partitioning of registered connections. Each shard has its own lock so
//! broadcast and ping workers can scan shards in parallel.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::connection::{Connection, ConnectionId};

type Shard = RwLock<HashMap<ConnectionId, Arc<Connection>>>;

pub struct ShardTable {
    shards: Box<[Shard]>,
}

impl ShardTable {
    pub fn new(count: usize) -> Self {
        let shards = (0..count.max(1))
            .map(|_| RwLock::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { shards }
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Deterministic shard for an id (FNV-1a, 32 bit).
    pub fn index_for(&self, id: &str) -> usize {
        if self.shards.len() <= 1 {
            return 0;
        }
        (fnv1a32(id.as_bytes()) % self.shards.len() as u32) as usize
    }

    pub(crate) fn insert(&self, conn: Arc<Connection>) {
        let idx = self.index_for(conn.id());
        self.shards[idx].write().insert(conn.id().to_string(), conn);
    }

    pub(crate) fn remove(&self, id: &str) -> Option<Arc<Connection>> {
        self.shards[self.index_for(id)].write().remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.shards[self.index_for(id)].read().contains_key(id)
    }

    /// Copy of the shard's live connections. The lock is released before returning,
    /// so callers may await while delivering.
    pub fn snapshot(&self, idx: usize) -> Vec<Arc<Connection>> {
        match self.shards.get(idx) {
            Some(shard) => shard
                .read()
                .values()
                .filter(|c| c.is_alive())
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn sizes(&self) -> Vec<usize> {
        self.shards.iter().map(|s| s.read().len()).collect()
    }
}

fn fnv1a32(bytes: &[u8]) -> u32 {
    const OFFSET: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    bytes
        .iter()
        .fold(OFFSET, |hash, b| (hash ^ u32::from(*b)).wrapping_mul(PRIME))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv_reference_values() {
        assert_eq!(fnv1a32(b""), 0x811c_9dc5);
        assert_eq!(fnv1a32(b"a"), 0xe40c_292c);
        assert_eq!(fnv1a32(b"foobar"), 0xbf9c_f968);
    }

    #[test]
    fn index_is_stable_and_in_range() {
        let table = ShardTable::new(16);
        for i in 0..200 {
            let id = format!("conn-{i}");
            let idx = table.index_for(&id);
            assert!(idx < 16);
            assert_eq!(idx, table.index_for(&id));
        }
        assert_eq!(ShardTable::new(1).index_for("anything"), 0);
        assert_eq!(ShardTable::new(0).len(), 1);
    }

    #[test]
    fn connection_lives_in_exactly_one_shard() {
        let table = ShardTable::new(8);
        let (conn, _rx) = Connection::new("u1", 1);
        conn.activate();
        table.insert(conn.clone());

        let holders: Vec<usize> = (0..table.len())
            .filter(|i| table.snapshot(*i).iter().any(|c| c.id() == conn.id()))
            .collect();
        assert_eq!(holders, vec![table.index_for(conn.id())]);
        assert_eq!(table.sizes().iter().sum::<usize>(), 1);

        assert!(table.remove(conn.id()).is_some());
        assert!(!table.contains(conn.id()));
        assert!(table.remove(conn.id()).is_none());
    }

    #[test]
    fn snapshot_skips_dead_connections() {
        let table = ShardTable::new(1);
        let (alive, _r1) = Connection::new("u1", 1);
        let (dead, _r2) = Connection::new("u2", 1);
        alive.activate();
        dead.activate();
        dead.close(crate::connection::CloseReason::Requested);
        table.insert(alive.clone());
        table.insert(dead);
        let snap = table.snapshot(0);
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].id(), alive.id());
        assert!(table.snapshot(5).is_empty());
    }
}
