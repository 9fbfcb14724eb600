//! Consumer-group coordination for a single topic.
//!
//! A coordinator first replays the entries still pending for its consumer
//! (recovery), then reads entries never delivered to the group (live). Entries
//! idling with other consumers are claimed periodically while live.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::ack::{AckHandle, Acknowledger, DeliveryContext, LogAcknowledger, ReceivedMessage};
use crate::config::SubscriberSettings;
use crate::error::Error;
use crate::log::{EntryId, StreamEntry, StreamLog};
use crate::marshaler::Marshaler;

/// Which part of the group's entries the loop is reading.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReadMode {
    /// Replaying this consumer's pending entries, starting at the cursor.
    Recovery { cursor: EntryId },

    /// Reading entries never delivered to the group.
    Live,
}

/// Exponential backoff with jitter for retrying storage calls.
#[derive(Debug)]
struct Backoff {
    base: Duration,
    current: Duration,
    max: Duration,
}

impl Backoff {
    const fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            current: base,
            max,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;

        // Add 0-10% jitter
        self.current = std::cmp::min(
            self.current.mul_f64(fastrand::f64().mul_add(0.1, 2.0)),
            self.max,
        );

        delay
    }

    fn reset(&mut self) {
        self.current = self.base;
    }
}

/// Runs the read loop for one topic on behalf of a subscriber.
pub(crate) struct Coordinator<L, M>
where
    L: StreamLog,
    M: Marshaler,
{
    context: Arc<DeliveryContext>,
    log: L,
    marshaler: M,
    settings: Arc<SubscriberSettings>,
    shutdown: CancellationToken,
}

impl<L, M> Coordinator<L, M>
where
    L: StreamLog,
    M: Marshaler,
{
    /// Ensures the consumer group exists and spawns the read loop on `tracker`.
    ///
    /// The loop stops when `shutdown` or `cancel` is cancelled, when the
    /// receiver is dropped, or when the group disappears. Its output channel
    /// closes once it has stopped.
    pub(crate) async fn start(
        log: L,
        marshaler: M,
        settings: Arc<SubscriberSettings>,
        topic: String,
        shutdown: CancellationToken,
        cancel: CancellationToken,
        tracker: &TaskTracker,
    ) -> Result<mpsc::Receiver<ReceivedMessage>, Error> {
        log.create_group(&topic, &settings.consumer_group, settings.group_start)
            .await
            .map_err(|e| Error::from_log(&topic, &settings.consumer_group, e))?;

        debug!(
            topic = %topic,
            group = %settings.consumer_group,
            "consumer group ready"
        );

        let (sender, receiver) = mpsc::channel(settings.output_buffer);

        let acker: Arc<dyn Acknowledger> = Arc::new(LogAcknowledger {
            log: log.clone(),
            delete_on_ack: settings.delete_on_ack,
        });

        let context = Arc::new(DeliveryContext {
            topic,
            group: settings.consumer_group.clone(),
            acker,
            output: sender.downgrade(),
            shutdown: shutdown.clone(),
            tracker: tracker.clone(),
            nack_resend_sleep: settings.nack_resend_sleep,
        });

        // Caller cancellation stops this subscription only.
        tracker.spawn({
            let shutdown = shutdown.clone();
            async move {
                tokio::select! {
                    () = cancel.cancelled() => shutdown.cancel(),
                    () = shutdown.cancelled() => {}
                }
            }
        });

        let coordinator = Self {
            context,
            log,
            marshaler,
            settings,
            shutdown,
        };

        tracker.spawn(coordinator.run(sender));

        Ok(receiver)
    }

    fn topic(&self) -> &str {
        &self.context.topic
    }

    fn group(&self) -> &str {
        &self.settings.consumer_group
    }

    fn consumer(&self) -> &str {
        &self.settings.consumer
    }

    #[allow(clippy::cognitive_complexity)]
    async fn run(self, output: mpsc::Sender<ReceivedMessage>) {
        info!(
            topic = self.topic(),
            group = self.group(),
            consumer = self.consumer(),
            "subscription started"
        );

        let mut mode = ReadMode::Recovery {
            cursor: EntryId::MIN,
        };
        let mut backoff = Backoff::new(self.settings.retry_base_delay, self.settings.retry_max_delay);
        let mut last_claim = Instant::now();

        while !self.shutdown.is_cancelled() {
            if mode == ReadMode::Live && self.claim_due(last_claim) {
                last_claim = Instant::now();

                match self.claim_idle().await {
                    Ok(claimed) => {
                        if !self.deliver(&output, claimed).await {
                            break;
                        }
                    }
                    Err(e) if e.is_fatal() => {
                        error!(topic = self.topic(), group = self.group(), error = %e, "claim failed, stopping subscription");
                        break;
                    }
                    Err(e) => {
                        warn!(topic = self.topic(), group = self.group(), error = %e, "claim failed");
                    }
                }
            }

            let read = match mode {
                ReadMode::Recovery { cursor } => {
                    self.log
                        .read_pending(
                            self.topic(),
                            self.group(),
                            self.consumer(),
                            cursor,
                            self.settings.read_batch_size,
                        )
                        .await
                }
                ReadMode::Live => {
                    self.log
                        .read_new(
                            self.topic(),
                            self.group(),
                            self.consumer(),
                            self.settings.read_batch_size,
                            self.settings.block_time,
                        )
                        .await
                }
            };

            let entries = match read {
                Ok(entries) => {
                    backoff.reset();
                    entries
                }
                Err(e) => {
                    let e = Error::from_log(self.topic(), self.group(), e);

                    if e.is_fatal() {
                        error!(topic = self.topic(), group = self.group(), error = %e, "read failed, stopping subscription");
                        break;
                    }

                    let delay = backoff.next_delay();
                    warn!(topic = self.topic(), group = self.group(), error = %e, delay = ?delay, "read failed, retrying");

                    if !self.pause(delay).await {
                        break;
                    }
                    continue;
                }
            };

            if let ReadMode::Recovery { cursor } = &mut mode {
                match entries.last() {
                    Some(last) => *cursor = last.id.successor(),
                    None => {
                        debug!(
                            topic = self.topic(),
                            consumer = self.consumer(),
                            "pending entries replayed, switching to new entries"
                        );
                        mode = ReadMode::Live;
                        continue;
                    }
                }
            }

            if !self.deliver(&output, entries).await {
                break;
            }
        }

        // Stops nack resends and the cancellation watcher.
        self.shutdown.cancel();

        info!(
            topic = self.topic(),
            group = self.group(),
            consumer = self.consumer(),
            "subscription stopped"
        );
    }

    fn claim_due(&self, last_claim: Instant) -> bool {
        self.settings
            .claim_interval
            .is_some_and(|interval| last_claim.elapsed() >= interval)
    }

    /// Claims entries that idled with other consumers for too long.
    ///
    /// Pages through the whole pending list so idle entries behind a full page
    /// of unclaimable ones are still found.
    async fn claim_idle(&self) -> Result<Vec<StreamEntry>, Error> {
        let batch_size = self.settings.claim_batch_size;
        let mut cursor = EntryId::MIN;
        let mut claimed = Vec::new();

        loop {
            let page = self
                .log
                .pending(self.topic(), self.group(), cursor, batch_size)
                .await
                .map_err(|e| Error::from_log(self.topic(), self.group(), e))?;

            let ids: Vec<EntryId> = page
                .iter()
                .filter(|entry| {
                    entry.consumer != self.consumer() && entry.idle >= self.settings.max_idle_time
                })
                .map(|entry| entry.id)
                .collect();

            if !ids.is_empty() {
                claimed.extend(
                    self.log
                        .claim(
                            self.topic(),
                            self.group(),
                            self.consumer(),
                            self.settings.max_idle_time,
                            &ids,
                        )
                        .await
                        .map_err(|e| Error::from_log(self.topic(), self.group(), e))?,
                );
            }

            match page.last() {
                Some(last) if page.len() >= batch_size && last.id < EntryId::MAX => {
                    cursor = last.id.successor();
                }
                _ => break,
            }

            if self.shutdown.is_cancelled() {
                break;
            }
        }

        if !claimed.is_empty() {
            info!(
                topic = self.topic(),
                consumer = self.consumer(),
                count = claimed.len(),
                "claimed idle entries"
            );
        }

        Ok(claimed)
    }

    /// Decodes and emits entries in order. Returns `false` once the loop should stop.
    async fn deliver(&self, output: &mpsc::Sender<ReceivedMessage>, entries: Vec<StreamEntry>) -> bool {
        for entry in entries {
            let message = match self.marshaler.unmarshal(&entry.fields) {
                Ok(message) => message,
                Err(e) => {
                    self.discard(entry, &e).await;
                    continue;
                }
            };

            let received =
                ReceivedMessage::new(message, AckHandle::new(entry.id, Arc::clone(&self.context)));

            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => return false,
                result = output.send(received) => {
                    if result.is_err() {
                        debug!(topic = self.topic(), "receiver dropped, stopping subscription");
                        return false;
                    }
                }
            }
        }

        true
    }

    /// Settles an entry that will never decode so it cannot block the group.
    async fn discard(&self, entry: StreamEntry, error: &M::Error) {
        warn!(
            topic = self.topic(),
            entry_id = %entry.id,
            error = %error,
            "failed to decode entry, skipping"
        );

        // Entries deleted while pending have nothing left to dead-letter.
        if let Some(dead_letter_topic) = self
            .settings
            .dead_letter_topic
            .as_ref()
            .filter(|_| !entry.fields.is_empty())
        {
            if let Err(e) = self.log.append(dead_letter_topic, entry.fields, None).await {
                warn!(
                    topic = self.topic(),
                    entry_id = %entry.id,
                    dead_letter_topic = %dead_letter_topic,
                    error = ?e,
                    "failed to dead-letter entry, leaving it pending"
                );
                return;
            }
        }

        if let Err(e) = self
            .context
            .acker
            .ack(self.topic(), self.group(), entry.id)
            .await
        {
            warn!(
                topic = self.topic(),
                entry_id = %entry.id,
                error = %e,
                "failed to acknowledge undecodable entry, leaving it pending"
            );
        }
    }

    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            () = self.shutdown.cancelled() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }
}
