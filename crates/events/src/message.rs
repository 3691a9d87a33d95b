use std::collections::BTreeMap;

use serde::Serialize;
use serde::de::DeserializeOwned;

/// String headers carried next to a payload.
pub type Headers = BTreeMap<String, String>;

/// A broker message: opaque payload bytes plus headers.
///
/// The pipeline topics carry JSON payloads, but the broker layer never looks inside.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    pub payload: Vec<u8>,
    pub headers: Headers,
}

impl Message {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            headers: Headers::new(),
        }
    }

    /// Serialize `body` as the JSON payload of a header-less message.
    pub fn json<T: Serialize>(body: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::to_vec(body)?))
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// A message received from a subscription, not yet acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker-assigned id, used to acknowledge.
    pub id: String,
    pub topic: String,
    pub message: Message,
}
