//! Typed protocol registry.
//!
//! TigerStyle: Typed codecs behind a closed enum, explicit registration.
//!
//! Maps each wire protocol to its payload codec. The structured payload of
//! `PType::Lua` is JSON; `PType::Text` packs plain strings. Registration is
//! runtime but typed: a service may install its own entry for a protocol.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use serde_json::Value;

use selkie_core::error::{Error, Result};
use selkie_core::{Buffer, PType};

type PackFn = Box<dyn Fn(&Value) -> Result<Buffer>>;
type UnpackFn = Box<dyn Fn(&[u8]) -> Result<Value>>;

/// Codec for one wire protocol
pub struct ProtocolEntry {
    pub name: &'static str,
    pub pack: Option<PackFn>,
    pub unpack: Option<UnpackFn>,
}

impl ProtocolEntry {
    fn raw(name: &'static str) -> Self {
        Self {
            name,
            pack: None,
            unpack: None,
        }
    }
}

/// Encode a structured value as a JSON payload
pub fn pack_json(value: &Value) -> Result<Buffer> {
    let bytes = serde_json::to_vec(value).map_err(|e| Error::serialization(e.to_string()))?;
    Ok(Buffer::from(bytes))
}

/// Decode a JSON payload
pub fn unpack_json(bytes: &[u8]) -> Result<Value> {
    serde_json::from_slice(bytes).map_err(|e| Error::serialization(e.to_string()))
}

/// Per-service registry of protocol codecs
pub struct ProtocolRegistry {
    entries: RefCell<HashMap<u8, Rc<ProtocolEntry>>>,
}

impl ProtocolRegistry {
    /// Registry with every reserved protocol installed
    pub fn with_defaults() -> Self {
        let registry = Self {
            entries: RefCell::new(HashMap::new()),
        };
        registry.register(
            PType::Lua,
            ProtocolEntry {
                name: "lua",
                pack: Some(Box::new(pack_json)),
                unpack: Some(Box::new(unpack_json)),
            },
        );
        registry.register(
            PType::Text,
            ProtocolEntry {
                name: "text",
                pack: Some(Box::new(|v: &Value| match v {
                    Value::String(s) => Ok(Buffer::from(s.as_str())),
                    other => Ok(Buffer::from(other.to_string())),
                })),
                unpack: Some(Box::new(|bytes: &[u8]| {
                    Ok(Value::String(String::from_utf8_lossy(bytes).into_owned()))
                })),
            },
        );
        registry.register(PType::System, ProtocolEntry::raw("system"));
        registry.register(PType::Socket, ProtocolEntry::raw("socket"));
        registry.register(PType::Error, ProtocolEntry::raw("error"));
        registry.register(PType::Ws, ProtocolEntry::raw("websocket"));
        registry.register(PType::Debug, ProtocolEntry::raw("debug"));
        registry
    }

    /// Install or replace the codec of a protocol
    pub fn register(&self, ptype: PType, entry: ProtocolEntry) {
        self.entries.borrow_mut().insert(ptype.as_u8(), Rc::new(entry));
    }

    /// Look up a codec
    pub fn get(&self, ptype: PType) -> Option<Rc<ProtocolEntry>> {
        self.entries.borrow().get(&ptype.as_u8()).cloned()
    }

    /// Pack a value with the protocol's codec
    pub fn pack(&self, ptype: PType, value: &Value) -> Result<Buffer> {
        let entry = self.get(ptype).ok_or(Error::UnknownProtocol {
            ptype: ptype.as_u8(),
        })?;
        let pack = entry.pack.as_ref().ok_or(Error::MissingDispatch {
            ptype: ptype.as_u8(),
        })?;
        pack(value)
    }

    /// Unpack a payload with the protocol's codec, when one exists
    pub fn unpack(&self, ptype: PType, bytes: &[u8]) -> Result<Option<Value>> {
        let Some(entry) = self.get(ptype) else {
            return Ok(None);
        };
        match &entry.unpack {
            Some(unpack) => unpack(bytes).map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_round_trip_structural_identity() {
        let value = json!({
            "who": "selkie",
            "depth": [1, 2, [3, {"k": null}]],
            "nested": {"f": 1.5, "t": true, "s": "text"},
        });
        let packed = pack_json(&value).unwrap();
        let unpacked = unpack_json(packed.data()).unwrap();
        assert_eq!(unpacked, value);
    }

    #[test]
    fn test_registry_defaults_cover_reserved_types() {
        let registry = ProtocolRegistry::with_defaults();
        for ptype in [
            PType::System,
            PType::Text,
            PType::Lua,
            PType::Socket,
            PType::Error,
            PType::Ws,
            PType::Debug,
        ] {
            assert!(registry.get(ptype).is_some(), "{ptype:?} missing");
        }
    }

    #[test]
    fn test_text_codec_packs_strings_bare() {
        let registry = ProtocolRegistry::with_defaults();
        let packed = registry.pack(PType::Text, &json!("ping")).unwrap();
        assert_eq!(packed.data(), b"ping");

        let unpacked = registry.unpack(PType::Text, b"pong").unwrap().unwrap();
        assert_eq!(unpacked, json!("pong"));
    }

    #[test]
    fn test_raw_protocols_have_no_codec() {
        let registry = ProtocolRegistry::with_defaults();
        assert!(registry.unpack(PType::Socket, b"x").unwrap().is_none());
        assert!(registry.pack(PType::Socket, &json!(1)).is_err());
    }

    #[test]
    fn test_runtime_registration_replaces_entry() {
        let registry = ProtocolRegistry::with_defaults();
        registry.register(
            PType::Debug,
            ProtocolEntry {
                name: "debug",
                pack: None,
                unpack: Some(Box::new(|b| Ok(Value::from(b.len())))),
            },
        );
        let value = registry.unpack(PType::Debug, b"12345").unwrap().unwrap();
        assert_eq!(value, Value::from(5));
    }
}
