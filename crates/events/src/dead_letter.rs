use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::{Headers, Message};

/// Quarantined message, as published on the dead-letter topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    /// Topic the message would have been retried on.
    pub topic_name: String,
    pub error: String,
    /// Original payload text, unchanged. Empty when the payload is not UTF-8.
    pub message: String,
    /// Raw payload bytes, present only when the payload is not UTF-8.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_bytes: Option<Vec<u8>>,
    pub headers: Headers,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    pub fn new(topic_name: impl Into<String>, error: impl Into<String>, original: &Message) -> Self {
        let (message, message_bytes) = match std::str::from_utf8(&original.payload) {
            Ok(text) => (text.to_string(), None),
            Err(_) => (String::new(), Some(original.payload.clone())),
        };
        Self {
            topic_name: topic_name.into(),
            error: error.into(),
            message,
            message_bytes,
            headers: original.headers.clone(),
            dead_lettered_at: Utc::now(),
        }
    }

    /// The quarantined payload exactly as it was received.
    pub fn original_payload(&self) -> Vec<u8> {
        match &self.message_bytes {
            Some(bytes) => bytes.clone(),
            None => self.message.clone().into_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_payload_is_stored_as_text() {
        let original = Message::new(r#"{"upload_id":"U1"}"#);
        let record = DeadLetterRecord::new("t_retry", "boom", &original);

        assert_eq!(record.message, r#"{"upload_id":"U1"}"#);
        assert!(record.message_bytes.is_none());
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("message_bytes").is_none());
    }

    #[test]
    fn binary_payload_survives_the_json_round_trip() {
        let raw = vec![0xff, 0x00, 0xfe, b'{'];
        let record = DeadLetterRecord::new("t_retry", "undecodable", &Message::new(raw.clone()));

        let encoded = serde_json::to_vec(&record).unwrap();
        let decoded: DeadLetterRecord = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded.original_payload(), raw);
        assert!(decoded.message.is_empty());
    }
}
