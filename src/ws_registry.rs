//! Connection registry: id -> connection, user id -> connection ids, group -> connection ids,
//! plus the shard projection used for fanout.
//!
//! Every mutating method is `pub(crate)` and called only from the hub's control loop, which
//! totally orders them. Readers (introspection, routing, workers) take short read locks.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::connection::{Connection, ConnectionId};
use crate::error::HubError;
use crate::shard::ShardTable;

#[derive(Default)]
struct MembershipIndex {
    users: HashMap<String, HashSet<ConnectionId>>,
    groups: HashMap<String, HashSet<ConnectionId>>,
}

impl MembershipIndex {
    fn add(map: &mut HashMap<String, HashSet<ConnectionId>>, key: &str, id: &str) {
        map.entry(key.to_string()).or_default().insert(id.to_string());
    }

    /// Remove `id` under `key`, dropping the key once its set is empty.
    fn remove(map: &mut HashMap<String, HashSet<ConnectionId>>, key: &str, id: &str) -> bool {
        let Some(ids) = map.get_mut(key) else {
            return false;
        };
        let removed = ids.remove(id);
        if ids.is_empty() {
            map.remove(key);
        }
        removed
    }
}

pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    index: RwLock<MembershipIndex>,
    shards: ShardTable,
    count: AtomicUsize,
    max_connections: usize,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize, shard_count: usize) -> Self {
        Self {
            connections: DashMap::new(),
            index: RwLock::new(MembershipIndex::default()),
            shards: ShardTable::new(shard_count),
            count: AtomicUsize::new(0),
            max_connections,
        }
    }

    /// Index a new connection and move it to `Active`. Fails without touching any
    /// state when the registry is at capacity. `Ok(false)` if it was already registered.
    pub(crate) fn insert(&self, conn: Arc<Connection>) -> Result<bool, HubError> {
        if self.connections.contains_key(conn.id()) {
            return Ok(false);
        }
        if self.count.load(Ordering::Acquire) >= self.max_connections {
            return Err(HubError::CapacityExceeded {
                max: self.max_connections,
            });
        }
        if !conn.activate() {
            // closed before the control loop got to it
            return Err(HubError::ConnectionClosed(conn.id().to_string()));
        }

        {
            let mut index = self.index.write();
            if !conn.is_anonymous() {
                MembershipIndex::add(&mut index.users, conn.user_id(), conn.id());
            }
            for group in conn.groups() {
                MembershipIndex::add(&mut index.groups, &group, conn.id());
            }
        }
        self.shards.insert(conn.clone());
        self.connections.insert(conn.id().to_string(), conn);
        self.count.fetch_add(1, Ordering::AcqRel);
        Ok(true)
    }

    /// Remove a connection from every index. Idempotent: returns false if it was not registered.
    pub(crate) fn remove(&self, conn: &Connection) -> bool {
        if self.connections.remove(conn.id()).is_none() {
            return false;
        }
        self.shards.remove(conn.id());
        {
            let mut index = self.index.write();
            if !conn.is_anonymous() {
                MembershipIndex::remove(&mut index.users, conn.user_id(), conn.id());
            }
            for group in conn.groups() {
                MembershipIndex::remove(&mut index.groups, &group, conn.id());
            }
        }
        self.count.fetch_sub(1, Ordering::AcqRel);
        true
    }

    pub(crate) fn join_group(&self, conn: &Connection, group: &str) -> Result<bool, HubError> {
        if !self.connections.contains_key(conn.id()) {
            return Err(HubError::NotRegistered(conn.id().to_string()));
        }
        let mut index = self.index.write();
        let added = conn.insert_group(group);
        MembershipIndex::add(&mut index.groups, group, conn.id());
        Ok(added)
    }

    pub(crate) fn leave_group(&self, conn: &Connection, group: &str) -> Result<bool, HubError> {
        if !self.connections.contains_key(conn.id()) {
            return Err(HubError::NotRegistered(conn.id().to_string()));
        }
        let mut index = self.index.write();
        let removed = conn.remove_group(group);
        MembershipIndex::remove(&mut index.groups, group, conn.id());
        Ok(removed)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn shards(&self) -> &ShardTable {
        &self.shards
    }

    pub fn user_connections(&self, user_id: &str) -> Vec<Arc<Connection>> {
        let ids: Vec<ConnectionId> = match self.index.read().users.get(user_id) {
            Some(ids) => ids.iter().cloned().collect(),
            None => return Vec::new(),
        };
        ids.iter().filter_map(|id| self.get(id)).collect()
    }

    pub fn group_connections(&self, group: &str) -> Vec<Arc<Connection>> {
        let ids: Vec<ConnectionId> = match self.index.read().groups.get(group) {
            Some(ids) => ids.iter().cloned().collect(),
            None => return Vec::new(),
        };
        ids.iter().filter_map(|id| self.get(id)).collect()
    }

    pub fn user_connection_count(&self, user_id: &str) -> usize {
        self.index.read().users.get(user_id).map_or(0, HashSet::len)
    }

    pub fn group_connection_count(&self, group: &str) -> usize {
        self.index.read().groups.get(group).map_or(0, HashSet::len)
    }

    pub fn user_total(&self) -> usize {
        self.index.read().users.len()
    }

    pub fn group_total(&self) -> usize {
        self.index.read().groups.len()
    }

    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.connections.iter().map(|e| e.value().clone()).collect()
    }

    /// Connections asked to close that are still indexed.
    pub fn closed_connections(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .filter(|e| e.value().is_closed())
            .map(|e| e.value().clone())
            .collect()
    }

    /// Connections with no liveness signal for more than `timeout_ms`.
    pub fn stale_connections(&self, now_ms: i64, timeout_ms: i64) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .filter(|e| e.value().is_stale(now_ms, timeout_ms))
            .map(|e| e.value().clone())
            .collect()
    }
}
