use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::config::PublisherConfig;
use crate::error::Error;
use crate::log::{EntryId, StreamLog};
use crate::marshaler::Marshaler;
use crate::message::Message;

/// A trait representing a publisher of messages to topics.
#[async_trait]
pub trait Publisher
where
    Self: Clone + Debug + Send + Sync + 'static,
{
    /// Publishes a message to `topic`, returning the id of the stored entry.
    async fn publish(&self, topic: &str, message: Message) -> Result<EntryId, Error>;

    /// Closes the publisher. Later publishes fail with [`Error::Closed`].
    async fn close(&self) -> Result<(), Error>;
}

/// Publishes messages by appending them to the stream named by the topic.
#[derive(Clone, Debug)]
pub struct StreamPublisher<L, M>
where
    L: StreamLog,
    M: Marshaler,
{
    closed: Arc<AtomicBool>,
    config: Arc<PublisherConfig>,
    log: L,
    marshaler: M,
}

impl<L, M> StreamPublisher<L, M>
where
    L: StreamLog,
    M: Marshaler,
{
    /// Creates a new publisher writing to `log`.
    #[must_use]
    pub fn new(log: L, marshaler: M, config: PublisherConfig) -> Self {
        Self {
            closed: Arc::new(AtomicBool::new(false)),
            config: Arc::new(config),
            log,
            marshaler,
        }
    }
}

#[async_trait]
impl<L, M> Publisher for StreamPublisher<L, M>
where
    L: StreamLog,
    M: Marshaler,
{
    async fn publish(&self, topic: &str, message: Message) -> Result<EntryId, Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }

        let message = if message.uuid().is_empty() {
            message.with_uuid(Uuid::new_v4().to_string())
        } else {
            message
        };

        let fields = self
            .marshaler
            .marshal(topic, &message)
            .map_err(|e| Error::Encoding(Box::new(e)))?;

        let entry_id = self
            .log
            .append(topic, fields, self.config.max_len(topic))
            .await
            .map_err(|e| Error::Transport(Box::new(e)))?;

        trace!(topic, uuid = message.uuid(), entry_id = %entry_id, "published message");

        Ok(entry_id)
    }

    async fn close(&self) -> Result<(), Error> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("publisher closed");
        }

        Ok(())
    }
}
