//! Adaptation of `json` and `jsonb` values.
//!
//! Serialization strategies are looked up per `(JsonKind, FormatCode)`:
//! first in a per-connection registry, then in the process-wide registry,
//! and finally the built-in `serde_json` functions are used.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, PoisonError, RwLock};

use serde_json::Value;

use crate::error::{Error, Result};
use crate::protocol::types::{FormatCode, Oid, oid};
use crate::types::Param;

/// Version byte that prefixes `jsonb` values in binary format.
const JSONB_BINARY_VERSION: u8 = 1;

/// Which of the two PostgreSQL JSON types a value is exchanged as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JsonKind {
    Json,
    Jsonb,
}

impl JsonKind {
    pub fn oid(self) -> Oid {
        match self {
            JsonKind::Json => oid::JSON,
            JsonKind::Jsonb => oid::JSONB,
        }
    }
}

/// Serializes a value into JSON text.
pub type DumpFn = Arc<dyn Fn(&Value) -> Result<String> + Send + Sync>;
/// Parses JSON text into a value.
pub type LoadFn = Arc<dyn Fn(&[u8]) -> Result<Value> + Send + Sync>;

type Key = (JsonKind, FormatCode);

const ALL_KEYS: [Key; 4] = [
    (JsonKind::Json, FormatCode::Text),
    (JsonKind::Json, FormatCode::Binary),
    (JsonKind::Jsonb, FormatCode::Text),
    (JsonKind::Jsonb, FormatCode::Binary),
];

/// A set of JSON dump/load strategies.
#[derive(Default)]
pub struct JsonRegistry {
    dumps: RwLock<HashMap<Key, DumpFn>>,
    loads: RwLock<HashMap<Key, LoadFn>>,
}

static GLOBAL: LazyLock<JsonRegistry> = LazyLock::new(JsonRegistry::default);

impl JsonRegistry {
    /// The process-wide registry consulted when a connection has no
    /// strategy of its own.
    pub fn global() -> &'static JsonRegistry {
        &GLOBAL
    }

    /// Use `dumps` for every JSON kind and format.
    pub fn set_dumps<F>(&self, dumps: F)
    where
        F: Fn(&Value) -> Result<String> + Send + Sync + 'static,
    {
        let dumps: DumpFn = Arc::new(dumps);
        let mut map = self.dumps.write().unwrap_or_else(PoisonError::into_inner);
        for key in ALL_KEYS {
            map.insert(key, dumps.clone());
        }
    }

    /// Use `loads` for every JSON kind and format.
    pub fn set_loads<F>(&self, loads: F)
    where
        F: Fn(&[u8]) -> Result<Value> + Send + Sync + 'static,
    {
        let loads: LoadFn = Arc::new(loads);
        let mut map = self.loads.write().unwrap_or_else(PoisonError::into_inner);
        for key in ALL_KEYS {
            map.insert(key, loads.clone());
        }
    }

    /// Use `dumps` for one kind and format only.
    pub fn set_dumps_for(&self, kind: JsonKind, format: FormatCode, dumps: DumpFn) {
        self.dumps
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((kind, format), dumps);
    }

    /// Use `loads` for one kind and format only.
    pub fn set_loads_for(&self, kind: JsonKind, format: FormatCode, loads: LoadFn) {
        self.loads
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((kind, format), loads);
    }

    /// Drop every strategy of this registry.
    pub fn clear(&self) {
        self.dumps.write().unwrap_or_else(PoisonError::into_inner).clear();
        self.loads.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    fn dumps_for(&self, key: Key) -> Option<DumpFn> {
        self.dumps
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned()
    }

    fn loads_for(&self, key: Key) -> Option<LoadFn> {
        self.loads
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned()
    }

    /// Turn `value` into a query parameter of the given kind and format.
    pub fn dump(&self, kind: JsonKind, format: FormatCode, value: &Value) -> Result<Param> {
        let key = (kind, format);
        let text = match self.dumps_for(key).or_else(|| GLOBAL.dumps_for(key)) {
            Some(dumps) => dumps(value)?,
            None => serde_json::to_string(value)?,
        };

        let mut bytes = Vec::with_capacity(text.len() + 1);
        if key == (JsonKind::Jsonb, FormatCode::Binary) {
            bytes.push(JSONB_BINARY_VERSION);
        }
        bytes.extend_from_slice(text.as_bytes());

        Ok(Param {
            value: Some(bytes),
            format,
            oid: kind.oid(),
        })
    }

    /// Parse a value received from the server.
    pub fn load(&self, kind: JsonKind, format: FormatCode, data: &[u8]) -> Result<Value> {
        let key = (kind, format);
        let data = if key == (JsonKind::Jsonb, FormatCode::Binary) {
            match data.split_first() {
                Some((&JSONB_BINARY_VERSION, rest)) => rest,
                Some((&version, _)) => {
                    return Err(Error::Data(format!("unknown jsonb binary format: {}", version)));
                }
                None => return Err(Error::Data("empty jsonb binary value".into())),
            }
        } else {
            data
        };

        match self.loads_for(key).or_else(|| GLOBAL.loads_for(key)) {
            Some(loads) => loads(data),
            None => Ok(serde_json::from_slice(data)?),
        }
    }
}

impl std::fmt::Debug for JsonRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let dumps = self.dumps.read().unwrap_or_else(PoisonError::into_inner);
        let loads = self.loads.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("JsonRegistry")
            .field("dumps", &dumps.keys().collect::<Vec<_>>())
            .field("loads", &loads.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Set the process-wide dumps function.
pub fn set_json_dumps<F>(dumps: F)
where
    F: Fn(&Value) -> Result<String> + Send + Sync + 'static,
{
    GLOBAL.set_dumps(dumps);
}

/// Set the process-wide loads function.
pub fn set_json_loads<F>(loads: F)
where
    F: Fn(&[u8]) -> Result<Value> + Send + Sync + 'static,
{
    GLOBAL.set_loads(loads);
}
