//! Publish/subscribe over persistent streams with consumer groups.
//!
//! Publishers append encoded messages to the stream named by a topic.
//! Subscribers join a consumer group on that stream, replay whatever was left
//! pending for them before a crash, and then read new entries. Every delivered
//! message carries a handle used to acknowledge it.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod ack;
mod config;
mod coordinator;
mod error;
mod log;
mod marshaler;
mod message;
mod publisher;
mod subscriber;

pub use ack::{AckHandle, ReceivedMessage};
pub use config::{MAX_BLOCK_TIME, PublisherConfig, SubscriberConfig};
pub use error::{BoxError, Error};
pub use log::{
    EntryId, Fields, GroupStart, ParseEntryIdError, PendingEntry, StreamEntry, StreamLog,
    StreamLogError,
};
pub use marshaler::{
    DefaultMarshaler, DefaultMarshalerError, METADATA_FIELD, Marshaler, MarshalerError,
    PAYLOAD_FIELD, UUID_FIELD,
};
pub use message::{Message, Metadata};
pub use publisher::{Publisher, StreamPublisher};
pub use subscriber::{StreamSubscriber, Subscriber};
