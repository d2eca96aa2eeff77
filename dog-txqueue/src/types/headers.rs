use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::marker::PhantomData;

/// Name of a header plus the type stored under it
#[derive(Debug)]
pub struct HeaderKey<T> {
    name: &'static str,
    _type: PhantomData<fn() -> T>,
}

impl<T> HeaderKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _type: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for HeaderKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for HeaderKey<T> {}

/// Headers the queue itself reads or writes
pub mod standard {
    use super::HeaderKey;

    pub const ROUTE: HeaderKey<String> = HeaderKey::new("queue.route");
    pub const TRACE_ID: HeaderKey<String> = HeaderKey::new("queue.trace_id");
    /// Id of the codec that produced the body
    pub const CODEC: HeaderKey<String> = HeaderKey::new("queue.codec");
    /// Milliseconds to push the process time forward on rollback
    pub const INCREASE_QUEUE_DELAY_MS: HeaderKey<u64> = HeaderKey::new("queue.increase_delay_ms");
    pub const RPC_RESPONSE_ROUTE: HeaderKey<String> = HeaderKey::new("rpc.response_route");
    pub const RPC_TIMEOUT_MS: HeaderKey<u64> = HeaderKey::new("rpc.timeout_ms");
    pub const EXCEPTION_TYPE: HeaderKey<String> = HeaderKey::new("error.exception_type");
    pub const EXCEPTION_MESSAGE: HeaderKey<String> = HeaderKey::new("error.message");
}

/// Map of named typed values travelling with a message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers {
    values: BTreeMap<String, Value>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<T: Serialize>(&mut self, key: &HeaderKey<T>, value: T) {
        // Values of header types are plain data; serialization cannot fail for them.
        if let Ok(value) = serde_json::to_value(value) {
            self.values.insert(key.name().to_string(), value);
        }
    }

    pub fn with<T: Serialize>(mut self, key: &HeaderKey<T>, value: T) -> Self {
        self.set(key, value);
        self
    }

    /// Typed read; a value of the wrong shape reads as absent
    pub fn get<T: DeserializeOwned>(&self, key: &HeaderKey<T>) -> Option<T> {
        self.values
            .get(key.name())
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    pub fn remove<T>(&mut self, key: &HeaderKey<T>) -> Option<Value> {
        self.values.remove(key.name())
    }

    /// Untyped access for user-defined headers
    pub fn set_raw(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), value);
    }

    pub fn get_raw(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    pub fn to_json(&self) -> String {
        // A map of JSON values always serializes
        serde_json::to_string(&self.values).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        Ok(Self {
            values: serde_json::from_str(text)?,
        })
    }
}
