//! Process-global environment store.
//!
//! TigerStyle: One shared table behind one lock, values opaque.
//!
//! Opaque string key/value pairs shared by every service. Values written
//! before bootstrap (for example search paths) are readable from any worker.

use std::collections::HashMap;
use std::sync::RwLock;

/// Shared environment store
#[derive(Debug, Default)]
pub struct EnvStore {
    values: RwLock<HashMap<String, String>>,
}

impl EnvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a value, replacing any previous one
    pub fn set(&self, name: impl Into<String>, value: impl Into<String>) {
        let mut values = self.values.write().expect("env store lock poisoned");
        values.insert(name.into(), value.into());
    }

    /// Get a value
    pub fn get(&self, name: &str) -> Option<String> {
        let values = self.values.read().expect("env store lock poisoned");
        values.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get() {
        let env = EnvStore::new();
        assert_eq!(env.get("PATH"), None);
        env.set("PATH", "./lib/?.lua;");
        assert_eq!(env.get("PATH").as_deref(), Some("./lib/?.lua;"));
        env.set("PATH", "other");
        assert_eq!(env.get("PATH").as_deref(), Some("other"));
    }
}
