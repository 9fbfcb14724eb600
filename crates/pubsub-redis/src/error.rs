use proven_pubsub::{ParseEntryIdError, StreamLogError};
use thiserror::Error;

/// Errors that can occur in the Redis stream log.
#[derive(Debug, Error)]
pub enum Error {
    /// An entry id returned by the server could not be parsed.
    #[error(transparent)]
    EntryId(#[from] ParseEntryIdError),

    /// A reply did not have the expected shape.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// An error originating from the Redis driver or server.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl StreamLogError for Error {
    fn is_no_group(&self) -> bool {
        matches!(self, Self::Redis(e) if e.code() == Some("NOGROUP"))
    }
}
