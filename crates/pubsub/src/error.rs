use std::error::Error as StdError;

use thiserror::Error;

use crate::log::StreamLogError;

/// Boxed source error from a storage backend or marshaler.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Errors surfaced by publishers, subscribers and acknowledgment handles.
#[derive(Debug, Error)]
pub enum Error {
    /// A subscription for the topic is still running on this subscriber.
    #[error("already subscribed to topic {0}")]
    AlreadySubscribed(String),

    /// The publisher or subscriber has been closed.
    #[error("pubsub is closed")]
    Closed,

    /// Invalid construction parameters.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A message could not be encoded or decoded.
    #[error("encoding error: {0}")]
    Encoding(#[source] BoxError),

    /// The consumer group (or its stream) no longer exists.
    #[error("consumer group {group} does not exist on stream {stream}")]
    NoGroup {
        /// The stream name.
        stream: String,

        /// The consumer group name.
        group: String,
    },

    /// The storage log could not be reached or rejected the call.
    #[error("storage transport error: {0}")]
    Transport(#[source] BoxError),
}

impl Error {
    /// Classifies a storage log error raised while working on `stream`/`group`.
    pub(crate) fn from_log<E>(stream: &str, group: &str, error: E) -> Self
    where
        E: StreamLogError,
    {
        if error.is_no_group() {
            Self::NoGroup {
                stream: stream.to_string(),
                group: group.to_string(),
            }
        } else {
            Self::Transport(Box::new(error))
        }
    }

    /// Whether retrying the failed operation cannot succeed.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::Transport(_))
    }
}
