//! Client id -> bound connection map

use std::sync::Arc;

use dashmap::DashMap;

use super::Connection;

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<Arc<str>, Arc<Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `client_id` to `conn`, returning the connection it replaced
    pub fn insert(&self, client_id: Arc<str>, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        self.connections.insert(client_id, conn)
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<Connection>> {
        self.connections.get(client_id).map(|c| c.value().clone())
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.connections.contains_key(client_id)
    }

    /// Remove the entry for `client_id` only while it still points at the
    /// connection `conn_id`. A newer connection that took the id over keeps
    /// its entry.
    pub fn remove_if_current(&self, client_id: &str, conn_id: u64) -> bool {
        self.connections
            .remove_if(client_id, |_, conn| conn.id() == conn_id)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Bound client ids, sorted
    pub fn client_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .connections
            .iter()
            .map(|e| e.key().to_string())
            .collect();
        ids.sort();
        ids
    }

    /// Snapshot of every bound connection
    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.connections.iter().map(|e| e.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(id: u64) -> Arc<Connection> {
        Connection::new(id, "127.0.0.1:1".parse().unwrap(), 4).0
    }

    #[test]
    fn test_remove_if_current_spares_newer_connection() {
        let registry = ConnectionRegistry::new();
        let id: Arc<str> = Arc::from("c");
        registry.insert(id.clone(), conn(1));
        let old = registry.insert(id.clone(), conn(2));
        assert_eq!(old.map(|c| c.id()), Some(1));

        assert!(!registry.remove_if_current("c", 1));
        assert!(registry.contains("c"));
        assert!(registry.remove_if_current("c", 2));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_client_ids_sorted() {
        let registry = ConnectionRegistry::new();
        for (n, id) in ["b", "c", "a"].into_iter().enumerate() {
            registry.insert(Arc::from(id), conn(n as u64));
        }
        assert_eq!(registry.client_ids(), vec!["a", "b", "c"]);
        assert_eq!(registry.len(), 3);
    }
}
