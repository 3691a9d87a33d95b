//! Retry envelope codec.
//!
//! A message that failed processing is republished to its stage's retry topic with two
//! headers: `no_of_retries` (decimal attempt counter) and `error` (the last failure).

use crate::message::{Headers, Message};

pub const NO_OF_RETRIES: &str = "no_of_retries";
pub const ERROR: &str = "error";

/// Attempt counter carried by `headers`; 0 when absent or not a number.
pub fn retry_count(headers: &Headers) -> u32 {
    headers
        .get(NO_OF_RETRIES)
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(0)
}

/// Last failure text carried by `headers`; empty when absent.
pub fn last_error(headers: &Headers) -> &str {
    headers.get(ERROR).map(String::as_str).unwrap_or("")
}

/// Fresh header set for a retry attempt.
pub fn retry_headers(count: u32, error: &str) -> Headers {
    let mut headers = Headers::new();
    headers.insert(NO_OF_RETRIES.to_string(), count.to_string());
    headers.insert(ERROR.to_string(), error.to_string());
    headers
}

/// The message to publish on the retry topic after `original` failed with `error`.
///
/// The payload is kept byte-for-byte; headers are replaced, with the counter incremented.
pub fn next_attempt(original: &Message, error: &str) -> Message {
    let count = retry_count(&original.headers).saturating_add(1);
    Message {
        payload: original.payload.clone(),
        headers: retry_headers(count, error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_or_garbled_counter_reads_as_zero() {
        assert_eq!(retry_count(&Headers::new()), 0);

        let garbled = Message::new("{}").with_header(NO_OF_RETRIES, "three");
        assert_eq!(retry_count(&garbled.headers), 0);

        let negative = Message::new("{}").with_header(NO_OF_RETRIES, "-1");
        assert_eq!(retry_count(&negative.headers), 0);
    }

    #[test]
    fn next_attempt_increments_and_replaces_error() {
        let original = Message::new(r#"{"upload_id":"U1"}"#)
            .with_header(NO_OF_RETRIES, "4")
            .with_header(ERROR, "old failure")
            .with_header("trace", "abc");

        let retry = next_attempt(&original, "db unavailable");

        assert_eq!(retry.payload, original.payload);
        assert_eq!(retry_count(&retry.headers), 5);
        assert_eq!(last_error(&retry.headers), "db unavailable");
        assert!(retry.header("trace").is_none());
    }

    #[test]
    fn first_failure_starts_counting_at_one() {
        let retry = next_attempt(&Message::new("{}"), "boom");
        assert_eq!(retry.header(NO_OF_RETRIES), Some("1"));
    }
}
