use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{self, Debug, Display};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

/// A storage record: ordered field names mapped to raw values.
pub type Fields = BTreeMap<String, Bytes>;

/// Marker trait for stream log errors.
pub trait StreamLogError: Debug + Error + Send + Sync + 'static {
    /// Whether the error means the consumer group (or its stream) does not exist.
    fn is_no_group(&self) -> bool;
}

/// Identifier of an entry in a stream, assigned by the log on append.
///
/// Ids are strictly increasing within a stream and render as `<ms>-<seq>`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId {
    /// Millisecond part.
    pub ms: u64,

    /// Sequence within the millisecond.
    pub seq: u64,
}

impl EntryId {
    /// The smallest possible id (`0-0`).
    pub const MIN: Self = Self { ms: 0, seq: 0 };

    /// The largest possible id.
    pub const MAX: Self = Self {
        ms: u64::MAX,
        seq: u64::MAX,
    };

    /// Creates an id from its parts.
    #[must_use]
    pub const fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// The id directly after this one, saturating at [`EntryId::MAX`].
    #[must_use]
    pub const fn successor(self) -> Self {
        if self.seq < u64::MAX {
            Self::new(self.ms, self.seq + 1)
        } else if self.ms < u64::MAX {
            Self::new(self.ms + 1, 0)
        } else {
            Self::MAX
        }
    }
}

impl Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

/// Error returned when parsing a malformed entry id.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid stream entry id: {0:?}")]
pub struct ParseEntryIdError(pub String);

impl FromStr for EntryId {
    type Err = ParseEntryIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseEntryIdError(s.to_string());

        match s.split_once('-') {
            Some((ms, seq)) => Ok(Self::new(
                ms.parse().map_err(|_| invalid())?,
                seq.parse().map_err(|_| invalid())?,
            )),
            None => Ok(Self::new(s.parse().map_err(|_| invalid())?, 0)),
        }
    }
}

/// An entry read from a stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamEntry {
    /// The entry id.
    pub id: EntryId,

    /// The stored record. Empty when the entry is still pending but its data
    /// has been deleted from the stream.
    pub fields: Fields,
}

/// An entry delivered to a group member that has not been acknowledged yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingEntry {
    /// The entry id.
    pub id: EntryId,

    /// The consumer currently owning the entry.
    pub consumer: String,

    /// Time since the entry was last delivered.
    pub idle: Duration,

    /// How many times the entry has been delivered.
    pub delivery_count: u64,
}

/// Where a newly created consumer group starts reading.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GroupStart {
    /// From the first entry still in the stream.
    #[default]
    Beginning,

    /// Only entries appended after the group was created.
    Latest,
}

/// The storage primitive: an append-only log of streams with consumer groups.
///
/// Implementations must be cheap to clone and safe to share between tasks.
#[async_trait]
pub trait StreamLog: Clone + Debug + Send + Sync + 'static {
    /// The error type for log operations.
    type Error: StreamLogError;

    /// Appends a record to `stream`, creating the stream if needed.
    ///
    /// When `max_len` is set the stream is trimmed to roughly that many entries.
    async fn append(
        &self,
        stream: &str,
        fields: Fields,
        max_len: Option<usize>,
    ) -> Result<EntryId, Self::Error>;

    /// Creates `group` on `stream`. Succeeds if the group already exists.
    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: GroupStart,
    ) -> Result<(), Self::Error>;

    /// Reads up to `count` entries never delivered to `group`, waiting up to
    /// `block` for new entries when there are none. Read entries become
    /// pending for `consumer`.
    async fn read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, Self::Error>;

    /// Reads up to `count` entries from the pending set of `consumer`, starting
    /// at `from` (inclusive). Never blocks.
    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        from: EntryId,
        count: usize,
    ) -> Result<Vec<StreamEntry>, Self::Error>;

    /// Acknowledges entries, removing them from the group's pending set.
    ///
    /// Returns how many entries were actually pending.
    async fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<u64, Self::Error>;

    /// Deletes entries from the stream. Returns how many existed.
    async fn delete(&self, stream: &str, ids: &[EntryId]) -> Result<u64, Self::Error>;

    /// Lists up to `count` pending entries of `group` with ids at or after
    /// `from` (inclusive), oldest first.
    async fn pending(
        &self,
        stream: &str,
        group: &str,
        from: EntryId,
        count: usize,
    ) -> Result<Vec<PendingEntry>, Self::Error>;

    /// Transfers ownership of pending entries idle for at least `min_idle` to
    /// `consumer`, returning the claimed entries that still hold data.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> Result<Vec<StreamEntry>, Self::Error>;
}
