//! Redis Streams-backed broker (durable, at-least-once delivery).
//!
//! - **Stream per topic**: `{prefix}{topic}`, e.g. `nomflow:process_nom_dgraph_success`
//! - **Consumer groups**: one group per worker fleet, created with `MKSTREAM` from id `0`
//! - **Explicit ack**: entries stay in the group's pending list until `XACK`
//! - **Recovery**: a new subscription first re-reads its own pending entries (id `0`),
//!   then switches to new entries (id `>`)
//!
//! Entry layout: a `payload` field with the raw bytes, plus one `h:<name>` field per header.
//! An entry that does not decode (missing payload, deleted data) is written to the
//! dead-letter stream and acknowledged, so it never blocks the entries behind it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamReadReply};
use tokio::sync::OnceCell;
use tracing::{debug, error, instrument, warn};

use nomflow_events::topics::DEAD_LETTER_QUEUE;
use nomflow_events::{
    BrokerError, DeadLetterRecord, Delivery, Headers, Message, MessageBroker, Subscription,
};

const DEFAULT_STREAM_PREFIX: &str = "nomflow:";
const PAYLOAD_FIELD: &str = "payload";
const HEADER_PREFIX: &str = "h:";
const READ_COUNT: usize = 10;

#[derive(Debug, Clone)]
pub struct RedisStreamsBroker {
    client: Arc<redis::Client>,
    stream_prefix: String,
    consumer_name: String,
    publisher: Arc<OnceCell<MultiplexedConnection>>,
}

impl RedisStreamsBroker {
    /// Create a broker.
    ///
    /// * `redis_url` - e.g. "redis://localhost:6379"
    /// * `stream_prefix` - prepended to every topic (default: "nomflow:")
    /// * `consumer_name` - this process' name inside every consumer group
    pub fn new(
        redis_url: impl AsRef<str>,
        stream_prefix: Option<String>,
        consumer_name: impl Into<String>,
    ) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            stream_prefix: stream_prefix.unwrap_or_else(|| DEFAULT_STREAM_PREFIX.to_string()),
            consumer_name: consumer_name.into(),
            publisher: Arc::new(OnceCell::new()),
        })
    }

    pub fn stream_key(&self, topic: &str) -> String {
        format!("{}{}", self.stream_prefix, topic)
    }

    async fn connection(&self) -> Result<MultiplexedConnection, BrokerError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))
    }

    async fn publisher(&self) -> Result<MultiplexedConnection, BrokerError> {
        self.publisher
            .get_or_try_init(|| self.connection())
            .await
            .cloned()
    }

    /// Ensure a consumer group exists (idempotent).
    async fn ensure_consumer_group(
        &self,
        conn: &mut MultiplexedConnection,
        stream_key: &str,
        group: &str,
    ) -> Result<(), BrokerError> {
        let created: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream_key)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(conn)
            .await;

        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(BrokerError::ConsumerGroup(format!(
                "XGROUP CREATE {stream_key} {group} failed: {e}"
            ))),
        }
    }
}

#[async_trait]
impl MessageBroker for RedisStreamsBroker {
    #[instrument(skip(self, message), fields(stream_key = %self.stream_key(topic)), err)]
    async fn publish(&self, topic: &str, message: Message) -> Result<(), BrokerError> {
        let mut conn = self.publisher().await?;
        let fields = encode_fields(&message);

        let mut cmd = redis::cmd("XADD");
        cmd.arg(self.stream_key(topic)).arg("*");
        for (field, value) in &fields {
            cmd.arg(field.as_str()).arg(value.as_slice());
        }
        let _: String = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Command(format!("XADD failed: {}", e)))?;

        Ok(())
    }

    #[instrument(skip(self), fields(consumer = %self.consumer_name), err)]
    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
    ) -> Result<Box<dyn Subscription>, BrokerError> {
        // Dedicated connection: a blocking XREADGROUP must not stall other commands.
        let mut conn = self.connection().await?;
        let stream_key = self.stream_key(topic);
        self.ensure_consumer_group(&mut conn, &stream_key, group).await?;

        Ok(Box::new(RedisStreamsSubscription {
            conn,
            topic: topic.to_string(),
            stream_key,
            dead_letter_key: self.stream_key(DEAD_LETTER_QUEUE),
            group: group.to_string(),
            consumer: self.consumer_name.clone(),
            reading_pending: true,
            buffer: VecDeque::new(),
        }))
    }
}

struct RedisStreamsSubscription {
    conn: MultiplexedConnection,
    topic: String,
    stream_key: String,
    dead_letter_key: String,
    group: String,
    consumer: String,
    reading_pending: bool,
    buffer: VecDeque<Delivery>,
}

impl RedisStreamsSubscription {
    async fn read_group(
        &mut self,
        id: &str,
        block: Option<Duration>,
    ) -> Result<Vec<Delivery>, BrokerError> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(READ_COUNT);
        if let Some(block) = block {
            // BLOCK 0 waits forever.
            cmd.arg("BLOCK").arg(block.as_millis().max(1) as u64);
        }
        cmd.arg("STREAMS").arg(&self.stream_key).arg(id);

        let reply: Option<StreamReadReply> = cmd
            .query_async(&mut self.conn)
            .await
            .map_err(|e| BrokerError::Command(format!("XREADGROUP failed: {}", e)))?;

        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        let (deliveries, rejected) =
            split_entries(&self.topic, reply.keys.into_iter().flat_map(|key| key.ids));
        for entry in rejected {
            if let Err(e) = self.quarantine(&entry).await {
                error!(
                    stream_key = %self.stream_key,
                    entry_id = %entry.id,
                    error = %e,
                    "failed to quarantine undecodable entry; left pending"
                );
            }
        }
        Ok(deliveries)
    }

    /// Dead-letter an undecodable entry, then acknowledge it.
    async fn quarantine(&mut self, entry: &RejectedEntry) -> Result<(), BrokerError> {
        warn!(
            stream_key = %self.stream_key,
            entry_id = %entry.id,
            error = %entry.error,
            "undecodable stream entry; sending to dead-letter stream"
        );
        let record = DeadLetterRecord::new(&self.topic, entry.error.to_string(), &entry.salvaged);

        let mut cmd = redis::cmd("XADD");
        cmd.arg(&self.dead_letter_key).arg("*");
        for (field, value) in encode_fields(&Message::json(&record)?) {
            cmd.arg(field).arg(value);
        }
        let _: String = cmd
            .query_async(&mut self.conn)
            .await
            .map_err(|e| BrokerError::Command(format!("XADD failed: {}", e)))?;

        self.ack_id(&entry.id).await
    }

    async fn ack_id(&mut self, id: &str) -> Result<(), BrokerError> {
        let _: u64 = redis::cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(id)
            .query_async(&mut self.conn)
            .await
            .map_err(|e| BrokerError::Command(format!("XACK failed: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl Subscription for RedisStreamsSubscription {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Delivery>, BrokerError> {
        if self.buffer.is_empty() && self.reading_pending {
            let pending = self.read_group("0", None).await?;
            if pending.is_empty() {
                self.reading_pending = false;
            } else {
                debug!(stream_key = %self.stream_key, count = pending.len(), "re-reading pending entries");
                self.buffer.extend(pending);
            }
        }

        if self.buffer.is_empty() {
            let fresh = self.read_group(">", Some(timeout)).await?;
            self.buffer.extend(fresh);
        }

        Ok(self.buffer.pop_front())
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), BrokerError> {
        self.ack_id(&delivery.id).await
    }
}

fn encode_fields(message: &Message) -> Vec<(String, Vec<u8>)> {
    let mut fields = Vec::with_capacity(message.headers.len() + 1);
    fields.push((PAYLOAD_FIELD.to_string(), message.payload.clone()));
    for (name, value) in &message.headers {
        fields.push((format!("{HEADER_PREFIX}{name}"), value.clone().into_bytes()));
    }
    fields
}

/// A stream entry that could not be decoded, with whatever could be read from it.
#[derive(Debug)]
struct RejectedEntry {
    id: String,
    error: BrokerError,
    salvaged: Message,
}

/// Decode entries one by one; a bad entry never takes the rest of the batch with it.
fn split_entries(
    topic: &str,
    entries: impl IntoIterator<Item = StreamId>,
) -> (Vec<Delivery>, Vec<RejectedEntry>) {
    let mut deliveries = Vec::new();
    let mut rejected = Vec::new();
    for entry in entries {
        match decode_fields(&entry.map) {
            Ok(message) => deliveries.push(Delivery {
                id: entry.id,
                topic: topic.to_string(),
                message,
            }),
            Err(error) => rejected.push(RejectedEntry {
                salvaged: salvage_fields(&entry.map),
                id: entry.id,
                error,
            }),
        }
    }
    (deliveries, rejected)
}

/// Best-effort read of a broken entry for the dead-letter record.
fn salvage_fields(map: &HashMap<String, redis::Value>) -> Message {
    let payload = map
        .get(PAYLOAD_FIELD)
        .and_then(|v| redis::from_redis_value::<Vec<u8>>(v).ok())
        .unwrap_or_default();
    let headers = map
        .iter()
        .filter_map(|(field, value)| {
            let name = field.strip_prefix(HEADER_PREFIX)?;
            let value = redis::from_redis_value::<String>(value).ok()?;
            Some((name.to_string(), value))
        })
        .collect();
    Message { payload, headers }
}

fn decode_fields(map: &HashMap<String, redis::Value>) -> Result<Message, BrokerError> {
    let payload = map
        .get(PAYLOAD_FIELD)
        .ok_or_else(|| BrokerError::Deserialization("missing payload field".to_string()))?;
    let payload: Vec<u8> = redis::from_redis_value(payload)
        .map_err(|e| BrokerError::Deserialization(format!("invalid payload field: {e}")))?;

    let mut headers = Headers::new();
    for (field, value) in map {
        if let Some(name) = field.strip_prefix(HEADER_PREFIX) {
            let value: String = redis::from_redis_value(value).map_err(|e| {
                BrokerError::Deserialization(format!("invalid header {name}: {e}"))
            })?;
            headers.insert(name.to_string(), value);
        }
    }

    Ok(Message { payload, headers })
}
