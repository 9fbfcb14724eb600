use proven_pubsub::StreamLogError;
use thiserror::Error;

/// Errors that can occur in the in-memory stream log.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The consumer group (or its stream) does not exist.
    #[error("no such consumer group {group} for stream {stream}")]
    NoGroup {
        /// The stream name.
        stream: String,

        /// The consumer group name.
        group: String,
    },

    /// The log was switched to unavailable.
    #[error("stream log unavailable")]
    Unavailable,
}

impl StreamLogError for Error {
    fn is_no_group(&self) -> bool {
        matches!(self, Self::NoGroup { .. })
    }
}
