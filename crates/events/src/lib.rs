//! Broker mechanics for the nominative-user completion pipeline.
//!
//! - [`Message`] / [`Delivery`]: opaque payload plus string headers
//! - [`MessageBroker`] / [`Subscription`]: transport-agnostic publish/consume with explicit ack
//! - [`InMemoryBroker`]: in-process implementation for tests and local runs
//! - [`retry`]: the `no_of_retries` / `error` header codec
//! - [`payload`]: JSON bodies exchanged on the pipeline topics

pub mod broker;
pub mod dead_letter;
pub mod in_memory_broker;
pub mod message;
pub mod payload;
pub mod retry;
pub mod topics;

pub use broker::{BrokerError, MessageBroker, Subscription};
pub use dead_letter::DeadLetterRecord;
pub use in_memory_broker::InMemoryBroker;
pub use message::{Delivery, Headers, Message};
pub use payload::{GraphBatchCompletion, NotificationRequest, RelationalStageCompletion, UploadAnalysis};
