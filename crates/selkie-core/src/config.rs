//! Configuration for selkie nodes and services.
//!
//! TigerStyle: Explicit defaults, validation, JSON shape preserved from
//! the node configuration file.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::constants::WORKER_COUNT_MAX;

/// Configuration of one service, as passed to creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name; also the registered unique name when `unique` is set
    pub name: String,

    /// Name of the behavior that implements this service
    pub file: String,

    /// Register the name in the global directory; creation fails on collision
    #[serde(default)]
    pub unique: bool,

    /// Memory limit in bytes; 0 disables the limit
    #[serde(default)]
    pub memlimit: i64,

    /// Strict-serial dispatch: never start the next message while a
    /// dispatch of this service is suspended
    #[serde(default)]
    pub serial: bool,

    /// Appended search path, forwarded to the behavior
    #[serde(default)]
    pub path: String,

    /// Appended native search path, forwarded to the behavior
    #[serde(default)]
    pub cpath: String,

    /// Unrecognized keys, forwarded opaquely to the behavior
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ServiceConfig {
    /// Minimal config for a named behavior
    pub fn new(name: impl Into<String>, file: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            file: file.into(),
            unique: false,
            memlimit: 0,
            serial: false,
            path: String::new(),
            cpath: String::new(),
            extra: Map::new(),
        }
    }

    /// Mark the service unique
    pub fn with_unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    /// Set the memory limit in bytes
    pub fn with_memlimit(mut self, bytes: i64) -> Self {
        self.memlimit = bytes;
        self
    }

    /// Opt into strict-serial dispatch
    pub fn with_serial(mut self, serial: bool) -> Self {
        self.serial = serial;
        self
    }

    /// Attach an opaque extra key
    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidConfiguration {
                field: "name".into(),
                reason: "must not be empty".into(),
            });
        }
        if self.file.is_empty() {
            return Err(Error::InvalidConfiguration {
                field: "file".into(),
                reason: "must not be empty".into(),
            });
        }
        if self.memlimit < 0 {
            return Err(Error::InvalidConfiguration {
                field: "memlimit".into(),
                reason: "must not be negative".into(),
            });
        }
        Ok(())
    }
}

/// Configuration of one node in the node configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node id, selectable with `--sid`
    pub sid: u16,

    /// Node name
    pub name: String,

    /// Worker thread count; 0 means hardware concurrency
    #[serde(default)]
    pub thread: usize,

    /// Log path template; `#sid` and `#date` are substituted
    #[serde(default)]
    pub log: String,

    /// Services created at bootstrap
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

impl NodeConfig {
    /// Effective worker count, clamped to the addressable range
    pub fn worker_count(&self) -> usize {
        let n = if self.thread == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            self.thread
        };
        n.clamp(1, WORKER_COUNT_MAX)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidConfiguration {
                field: "name".into(),
                reason: "must not be empty".into(),
            });
        }
        if self.thread > WORKER_COUNT_MAX {
            return Err(Error::InvalidConfiguration {
                field: "thread".into(),
                reason: format!("{} exceeds limit {}", self.thread, WORKER_COUNT_MAX),
            });
        }
        for svc in &self.services {
            svc.validate()?;
        }
        Ok(())
    }
}

/// Parse the node configuration file (a JSON array of nodes)
pub fn parse_nodes(json: &str) -> Result<Vec<NodeConfig>> {
    let nodes: Vec<NodeConfig> =
        serde_json::from_str(json).map_err(|e| Error::serialization(e.to_string()))?;
    for node in &nodes {
        node.validate()?;
    }
    Ok(nodes)
}

/// Select a node by sid
pub fn select_node(nodes: Vec<NodeConfig>, sid: u16) -> Result<NodeConfig> {
    nodes
        .into_iter()
        .find(|n| n.sid == sid)
        .ok_or_else(|| Error::InvalidConfiguration {
            field: "sid".into(),
            reason: format!("no node with sid {sid}"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_config_defaults() {
        let cfg: ServiceConfig =
            serde_json::from_str(r#"{"name":"gate","file":"gate"}"#).unwrap();
        assert_eq!(cfg.name, "gate");
        assert!(!cfg.unique);
        assert_eq!(cfg.memlimit, 0);
        assert!(!cfg.serial);
        assert!(cfg.extra.is_empty());
        cfg.validate().unwrap();
    }

    #[test]
    fn test_service_config_extra_keys_preserved() {
        let cfg: ServiceConfig = serde_json::from_str(
            r#"{"name":"gate","file":"gate","port":8890,"host":"0.0.0.0"}"#,
        )
        .unwrap();
        assert_eq!(cfg.extra.get("port"), Some(&Value::from(8890)));
        assert_eq!(cfg.extra.get("host"), Some(&Value::from("0.0.0.0")));
    }

    #[test]
    fn test_service_config_rejects_negative_memlimit() {
        let cfg = ServiceConfig::new("a", "b").with_memlimit(-1);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_node_parse_and_select() {
        let json = r#"[
            {"sid":1,"name":"node-1","thread":2,"services":[
                {"name":"bootstrap","file":"bootstrap","unique":true}
            ]},
            {"sid":2,"name":"node-2"}
        ]"#;
        let nodes = parse_nodes(json).unwrap();
        assert_eq!(nodes.len(), 2);
        let node = select_node(nodes, 1).unwrap();
        assert_eq!(node.name, "node-1");
        assert_eq!(node.worker_count(), 2);
        assert!(node.services[0].unique);
    }

    #[test]
    fn test_node_select_missing_sid() {
        let nodes = parse_nodes(r#"[{"sid":1,"name":"n"}]"#).unwrap();
        assert!(select_node(nodes, 9).is_err());
    }
}
