use std::fmt::{self, Debug};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace};

use crate::error::Error;
use crate::log::{EntryId, StreamLog};
use crate::message::Message;

/// Settles delivered entries against the storage log.
#[async_trait]
pub(crate) trait Acknowledger: Send + Sync + 'static {
    async fn ack(&self, stream: &str, group: &str, id: EntryId) -> Result<(), Error>;
}

/// Acknowledges through a [`StreamLog`], optionally deleting the entry too.
pub(crate) struct LogAcknowledger<L> {
    pub log: L,
    pub delete_on_ack: bool,
}

#[async_trait]
impl<L> Acknowledger for LogAcknowledger<L>
where
    L: StreamLog,
{
    async fn ack(&self, stream: &str, group: &str, id: EntryId) -> Result<(), Error> {
        let acked = self
            .log
            .ack(stream, group, &[id])
            .await
            .map_err(|e| Error::from_log(stream, group, e))?;

        if self.delete_on_ack {
            self.log
                .delete(stream, &[id])
                .await
                .map_err(|e| Error::from_log(stream, group, e))?;
        }

        trace!(stream, group, entry_id = %id, acked, "acknowledged entry");

        Ok(())
    }
}

/// State shared by every message delivered from one subscription.
pub(crate) struct DeliveryContext {
    pub topic: String,
    pub group: String,
    pub acker: Arc<dyn Acknowledger>,
    pub output: mpsc::WeakSender<ReceivedMessage>,
    pub shutdown: CancellationToken,
    pub tracker: TaskTracker,
    pub nack_resend_sleep: Duration,
}

impl Debug for DeliveryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryContext")
            .field("topic", &self.topic)
            .field("group", &self.group)
            .field("nack_resend_sleep", &self.nack_resend_sleep)
            .finish_non_exhaustive()
    }
}

/// Acknowledges a single delivered entry.
///
/// Acknowledging is idempotent: once an ack succeeded, later calls return
/// `Ok(())` without touching storage.
#[derive(Debug)]
pub struct AckHandle {
    acked: AtomicBool,
    context: Arc<DeliveryContext>,
    entry_id: EntryId,
}

impl AckHandle {
    pub(crate) const fn new(entry_id: EntryId, context: Arc<DeliveryContext>) -> Self {
        Self {
            acked: AtomicBool::new(false),
            context,
            entry_id,
        }
    }

    /// Acknowledges the entry so it is never delivered to the group again.
    ///
    /// Succeeds without effect once the consumer group has been removed, since
    /// nothing is pending for it anymore.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if storage could not be reached.
    pub async fn ack(&self) -> Result<(), Error> {
        if self.is_acked() {
            return Ok(());
        }

        self.context
            .acker
            .ack(&self.context.topic, &self.context.group, self.entry_id)
            .await?;

        self.acked.store(true, Ordering::Release);

        Ok(())
    }

    /// Whether [`AckHandle::ack`] already succeeded on this handle.
    #[must_use]
    pub fn is_acked(&self) -> bool {
        self.acked.load(Ordering::Acquire)
    }

    /// The id of the entry in the stream.
    #[must_use]
    pub const fn entry_id(&self) -> EntryId {
        self.entry_id
    }

    /// The consumer group the entry was delivered to.
    #[must_use]
    pub fn consumer_group(&self) -> &str {
        &self.context.group
    }

    /// The topic the entry was read from.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.context.topic
    }
}

/// A decoded message together with its acknowledgment handle.
#[derive(Debug)]
pub struct ReceivedMessage {
    handle: AckHandle,
    message: Message,
}

impl ReceivedMessage {
    pub(crate) const fn new(message: Message, handle: AckHandle) -> Self {
        Self { handle, message }
    }

    /// The decoded message.
    #[must_use]
    pub const fn message(&self) -> &Message {
        &self.message
    }

    /// The acknowledgment handle.
    #[must_use]
    pub const fn handle(&self) -> &AckHandle {
        &self.handle
    }

    /// Acknowledges the message. See [`AckHandle::ack`].
    ///
    /// # Errors
    ///
    /// Same as [`AckHandle::ack`].
    pub async fn ack(&self) -> Result<(), Error> {
        self.handle.ack().await
    }

    /// Rejects the message. It stays pending and is delivered again on the same
    /// subscription after the configured resend delay. If the subscription
    /// shuts down first it is left pending for recovery.
    pub fn nack(self) {
        let Self { handle, message } = self;

        if handle.is_acked() {
            return;
        }

        let context = handle.context;
        let entry_id = handle.entry_id;

        if context.shutdown.is_cancelled() {
            debug!(topic = %context.topic, entry_id = %entry_id, "nacked during shutdown, left pending");
            return;
        }

        let tracker = context.tracker.clone();
        tracker.spawn(async move {
            tokio::select! {
                () = context.shutdown.cancelled() => {
                    debug!(topic = %context.topic, entry_id = %entry_id, "nacked message left pending");
                }
                () = tokio::time::sleep(context.nack_resend_sleep) => {
                    let Some(output) = context.output.upgrade() else {
                        return;
                    };

                    let shutdown = context.shutdown.clone();
                    let redelivery =
                        Self::new(message, AckHandle::new(entry_id, Arc::clone(&context)));

                    tokio::select! {
                        () = shutdown.cancelled() => {}
                        result = output.send(redelivery) => {
                            if result.is_ok() {
                                trace!(topic = %context.topic, entry_id = %entry_id, "redelivered nacked message");
                            }
                        }
                    }
                }
            }
        });
    }

    /// Splits into the message and its acknowledgment handle.
    #[must_use]
    pub fn into_parts(self) -> (Message, AckHandle) {
        (self.message, self.handle)
    }
}
