use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::metrics;
use crate::models::ServerInfo;

/// The servers currently known to the proxy, with their live player counts.
pub trait ServerDirectory: Send + Sync {
    fn is_registered(&self, name: &str) -> bool;

    /// Registered servers sorted by name.
    fn snapshot(&self) -> Vec<ServerInfo>;

    fn names(&self) -> Vec<String> {
        self.snapshot().into_iter().map(|s| s.name).collect()
    }
}

#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    servers: RwLock<BTreeMap<String, i32>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_servers<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let directory = Self::new();
        for name in names {
            directory.register(name);
        }
        directory
    }

    /// Registers a server with zero players. Returns false if it was already
    /// registered, in which case its count is left alone.
    pub fn register(&self, name: impl Into<String>) -> bool {
        let mut servers = self.servers.write();
        let name = name.into();
        if servers.contains_key(&name) {
            return false;
        }
        servers.insert(name, 0);
        metrics::set_registered_servers(servers.len());
        true
    }

    pub fn unregister(&self, name: &str) -> bool {
        let mut servers = self.servers.write();
        let removed = servers.remove(name).is_some();
        metrics::set_registered_servers(servers.len());
        removed
    }

    /// Sets the live count, registering the server if needed. Negative
    /// counts are clamped to zero.
    pub fn set_player_count(&self, name: impl Into<String>, count: i32) {
        let mut servers = self.servers.write();
        servers.insert(name.into(), count.max(0));
        metrics::set_registered_servers(servers.len());
    }

    pub fn player_count(&self, name: &str) -> Option<i32> {
        self.servers.read().get(name).copied()
    }
}

impl ServerDirectory for InMemoryDirectory {
    fn is_registered(&self, name: &str) -> bool {
        self.servers.read().contains_key(name)
    }

    fn snapshot(&self) -> Vec<ServerInfo> {
        self.servers
            .read()
            .iter()
            .map(|(name, &player_count)| ServerInfo {
                name: name.clone(),
                player_count,
            })
            .collect()
    }
}
