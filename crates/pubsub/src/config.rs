use std::collections::HashMap;
use std::time::Duration;

use crate::error::Error;
use crate::log::GroupStart;

const DEFAULT_BLOCK_TIME: Duration = Duration::from_millis(100);

/// Longest accepted `block_time`. Cancellation is only observed between reads.
pub const MAX_BLOCK_TIME: Duration = Duration::from_secs(60);
const DEFAULT_READ_BATCH_SIZE: usize = 10;
const DEFAULT_OUTPUT_BUFFER: usize = 16;
const DEFAULT_CLAIM_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_CLAIM_BATCH_SIZE: usize = 100;
const DEFAULT_MAX_IDLE_TIME: Duration = Duration::from_secs(60);
const DEFAULT_NACK_RESEND_SLEEP: Duration = Duration::from_secs(1);
const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(100);
const DEFAULT_RETRY_MAX_DELAY: Duration = Duration::from_secs(5);

/// Configuration for a [`StreamSubscriber`](crate::StreamSubscriber).
#[derive(Clone, Debug, Default)]
pub struct SubscriberConfig {
    /// Identity of this subscriber within its group. Must be unique per
    /// process within the group.
    pub consumer: String,

    /// Group shared by cooperating subscribers.
    pub consumer_group: String,

    /// Also delete entries from the stream when they are acknowledged.
    pub delete_on_ack: bool,

    /// How long a read for new entries waits before checking for shutdown.
    /// Defaults to 100ms, at most [`MAX_BLOCK_TIME`].
    pub block_time: Option<Duration>,

    /// Maximum entries fetched per read. Defaults to 10.
    pub read_batch_size: Option<usize>,

    /// Capacity of the output channel. Defaults to 16.
    pub output_buffer: Option<usize>,

    /// How often entries idling with other consumers are claimed. Defaults to
    /// 5 seconds. `Duration::ZERO` disables claiming.
    pub claim_interval: Option<Duration>,

    /// Pending entries inspected per page of a claim round. Defaults to 100.
    pub claim_batch_size: Option<usize>,

    /// How long an entry must idle with another consumer before it may be
    /// claimed. Defaults to 60 seconds.
    pub max_idle_time: Option<Duration>,

    /// Delay before a nacked message is delivered again. Defaults to 1 second.
    pub nack_resend_sleep: Option<Duration>,

    /// Where a group created by this subscriber starts reading.
    pub group_start: GroupStart,

    /// Topic receiving raw records that could not be decoded. When unset such
    /// records are only logged before being acknowledged.
    pub dead_letter_topic: Option<String>,

    /// Base delay for exponential backoff after storage errors. Defaults to 100ms.
    pub retry_base_delay: Option<Duration>,

    /// Maximum delay for exponential backoff. Defaults to 5 seconds.
    pub retry_max_delay: Option<Duration>,
}

/// A validated [`SubscriberConfig`] with every default applied.
#[derive(Clone, Debug)]
pub(crate) struct SubscriberSettings {
    pub consumer: String,
    pub consumer_group: String,
    pub delete_on_ack: bool,
    pub block_time: Duration,
    pub read_batch_size: usize,
    pub output_buffer: usize,
    pub claim_interval: Option<Duration>,
    pub claim_batch_size: usize,
    pub max_idle_time: Duration,
    pub nack_resend_sleep: Duration,
    pub group_start: GroupStart,
    pub dead_letter_topic: Option<String>,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

impl TryFrom<SubscriberConfig> for SubscriberSettings {
    type Error = Error;

    fn try_from(
        SubscriberConfig {
            consumer,
            consumer_group,
            delete_on_ack,
            block_time,
            read_batch_size,
            output_buffer,
            claim_interval,
            claim_batch_size,
            max_idle_time,
            nack_resend_sleep,
            group_start,
            dead_letter_topic,
            retry_base_delay,
            retry_max_delay,
        }: SubscriberConfig,
    ) -> Result<Self, Self::Error> {
        if consumer.trim().is_empty() {
            return Err(Error::Config("consumer must not be empty".to_string()));
        }

        if consumer_group.trim().is_empty() {
            return Err(Error::Config("consumer_group must not be empty".to_string()));
        }

        if block_time.is_some_and(|block| block.is_zero()) {
            return Err(Error::Config("block_time must be positive".to_string()));
        }

        if block_time.is_some_and(|block| block > MAX_BLOCK_TIME) {
            return Err(Error::Config(format!(
                "block_time must not exceed {MAX_BLOCK_TIME:?}"
            )));
        }

        if read_batch_size == Some(0) {
            return Err(Error::Config("read_batch_size must be positive".to_string()));
        }

        if output_buffer == Some(0) {
            return Err(Error::Config("output_buffer must be positive".to_string()));
        }

        if claim_batch_size == Some(0) {
            return Err(Error::Config("claim_batch_size must be positive".to_string()));
        }

        if dead_letter_topic.as_deref().is_some_and(str::is_empty) {
            return Err(Error::Config(
                "dead_letter_topic must not be empty when set".to_string(),
            ));
        }

        let retry_base_delay = retry_base_delay.unwrap_or(DEFAULT_RETRY_BASE_DELAY);
        let retry_max_delay = retry_max_delay
            .unwrap_or(DEFAULT_RETRY_MAX_DELAY)
            .max(retry_base_delay);

        Ok(Self {
            consumer,
            consumer_group,
            delete_on_ack,
            block_time: block_time.unwrap_or(DEFAULT_BLOCK_TIME),
            read_batch_size: read_batch_size.unwrap_or(DEFAULT_READ_BATCH_SIZE),
            output_buffer: output_buffer.unwrap_or(DEFAULT_OUTPUT_BUFFER),
            claim_interval: match claim_interval {
                Some(interval) if interval.is_zero() => None,
                Some(interval) => Some(interval),
                None => Some(DEFAULT_CLAIM_INTERVAL),
            },
            claim_batch_size: claim_batch_size.unwrap_or(DEFAULT_CLAIM_BATCH_SIZE),
            max_idle_time: max_idle_time.unwrap_or(DEFAULT_MAX_IDLE_TIME),
            nack_resend_sleep: nack_resend_sleep.unwrap_or(DEFAULT_NACK_RESEND_SLEEP),
            group_start,
            dead_letter_topic,
            retry_base_delay,
            retry_max_delay,
        })
    }
}

/// Configuration for a [`StreamPublisher`](crate::StreamPublisher).
#[derive(Clone, Debug, Default)]
pub struct PublisherConfig {
    /// Approximate maximum length applied to every topic without its own entry
    /// in `max_lens`. Unbounded when unset.
    pub default_max_len: Option<usize>,

    /// Approximate maximum length per topic.
    pub max_lens: HashMap<String, usize>,
}

impl PublisherConfig {
    pub(crate) fn max_len(&self, topic: &str) -> Option<usize> {
        self.max_lens.get(topic).copied().or(self.default_max_len)
    }
}
