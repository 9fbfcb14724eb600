//! Implementation of stream logs using Redis streams and consumer groups.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod reply;

pub use error::Error;

use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use proven_pubsub::{EntryId, Fields, GroupStart, PendingEntry, StreamEntry, StreamLog};
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{Client, Cmd, Value};
use tracing::{debug, instrument, trace, warn};

/// Configuration for the `RedisStreamLog`.
#[derive(Clone, Debug)]
pub struct RedisStreamLogConfig {
    /// Connection URL, for example `redis://127.0.0.1:6379`.
    pub url: String,

    /// Whether `MAXLEN` trimming may leave a few extra entries so Redis can
    /// trim whole nodes. Defaults to true if not set.
    pub approximate_trim: Option<bool>,
}

/// Key of a dedicated blocking-read connection: stream, group and consumer.
type ReaderKey = (String, String, String);

/// A stream log backed by Redis streams.
///
/// Regular commands share one auto-reconnecting connection. Blocking group
/// reads get a dedicated connection per stream, group and consumer so a waiting
/// `XREADGROUP` never delays acks or appends.
#[derive(Clone)]
pub struct RedisStreamLog {
    approximate_trim: bool,
    client: Client,
    connection: ConnectionManager,
    readers: Arc<DashMap<ReaderKey, MultiplexedConnection>>,
}

impl Debug for RedisStreamLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStreamLog")
            .field("approximate_trim", &self.approximate_trim)
            .field("readers", &self.readers.len())
            .finish_non_exhaustive()
    }
}

impl RedisStreamLog {
    /// Connects to the Redis server described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Redis`] if the URL is invalid or the server cannot be
    /// reached.
    pub async fn connect(
        RedisStreamLogConfig {
            url,
            approximate_trim,
        }: RedisStreamLogConfig,
    ) -> Result<Self, Error> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client.clone()).await?;

        debug!("connected to redis");

        Ok(Self {
            approximate_trim: approximate_trim.unwrap_or(true),
            client,
            connection,
            readers: Arc::new(DashMap::new()),
        })
    }

    async fn query<T>(&self, cmd: &Cmd) -> Result<T, Error>
    where
        T: redis::FromRedisValue,
    {
        let mut connection = self.connection.clone();
        Ok(cmd.query_async(&mut connection).await?)
    }

    /// Number of dedicated blocking-read connections currently open.
    #[must_use]
    pub fn open_readers(&self) -> usize {
        self.readers.len()
    }

    /// Runs a blocking command on the reader connection for `key`, opening it
    /// on first use. The connection is dropped after connection failures and
    /// once its group is gone, as the read loop stops reading then.
    async fn query_blocking(&self, key: ReaderKey, cmd: &Cmd) -> Result<Value, Error> {
        let existing = self.readers.get(&key).map(|reader| reader.clone());

        let mut reader = match existing {
            Some(reader) => reader,
            None => {
                let reader = self.client.get_multiplexed_async_connection().await?;
                self.readers.entry(key.clone()).or_insert(reader).clone()
            }
        };

        match cmd.query_async(&mut reader).await {
            Ok(value) => Ok(value),
            Err(e) => {
                if e.is_io_error() || e.is_connection_dropped() {
                    warn!(stream = %key.0, consumer = %key.2, error = ?e, "dropping broken reader connection");
                    self.readers.remove(&key);
                } else if e.code() == Some("NOGROUP") {
                    debug!(stream = %key.0, group = %key.1, consumer = %key.2, "group gone, dropping reader connection");
                    self.readers.remove(&key);
                }

                Err(e.into())
            }
        }
    }
}

/// The exclusive start id for `XREADGROUP` so that reading begins at `from`.
const fn exclusive_start(from: EntryId) -> EntryId {
    if from.seq > 0 {
        EntryId::new(from.ms, from.seq - 1)
    } else if from.ms > 0 {
        EntryId::new(from.ms - 1, u64::MAX)
    } else {
        EntryId::MIN
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[async_trait]
impl StreamLog for RedisStreamLog {
    type Error = Error;

    #[instrument(skip(self, fields))]
    async fn append(
        &self,
        stream: &str,
        fields: Fields,
        max_len: Option<usize>,
    ) -> Result<EntryId, Self::Error> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream);

        if let Some(max_len) = max_len {
            cmd.arg("MAXLEN");
            if self.approximate_trim {
                cmd.arg("~");
            }
            cmd.arg(max_len);
        }

        cmd.arg("*");
        for (name, value) in &fields {
            cmd.arg(name).arg(&value[..]);
        }

        let id: String = self.query(&cmd).await?;
        let id: EntryId = id.parse()?;

        trace!(entry_id = %id, "appended entry");

        Ok(id)
    }

    #[instrument(skip(self))]
    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: GroupStart,
    ) -> Result<(), Self::Error> {
        let start_id = match start {
            GroupStart::Beginning => "0",
            GroupStart::Latest => "$",
        };

        let mut cmd = redis::cmd("XGROUP");
        cmd.arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg(start_id)
            .arg("MKSTREAM");

        match self.query::<()>(&cmd).await {
            Ok(()) => {
                debug!("created consumer group");
                Ok(())
            }
            Err(Error::Redis(e)) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self))]
    async fn read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, Self::Error> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(duration_millis(block).max(1))
            .arg("STREAMS")
            .arg(stream)
            .arg(">");

        let key = (stream.to_string(), group.to_string(), consumer.to_string());
        let value = self.query_blocking(key, &cmd).await?;

        reply::read(value)
    }

    #[instrument(skip(self))]
    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        from: EntryId,
        count: usize,
    ) -> Result<Vec<StreamEntry>, Self::Error> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count)
            .arg("STREAMS")
            .arg(stream)
            .arg(exclusive_start(from).to_string());

        reply::read(self.query(&cmd).await?)
    }

    #[instrument(skip(self))]
    async fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<u64, Self::Error> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut cmd = redis::cmd("XACK");
        cmd.arg(stream).arg(group);
        for id in ids {
            cmd.arg(id.to_string());
        }

        self.query(&cmd).await
    }

    #[instrument(skip(self))]
    async fn delete(&self, stream: &str, ids: &[EntryId]) -> Result<u64, Self::Error> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut cmd = redis::cmd("XDEL");
        cmd.arg(stream);
        for id in ids {
            cmd.arg(id.to_string());
        }

        self.query(&cmd).await
    }

    #[instrument(skip(self))]
    async fn pending(
        &self,
        stream: &str,
        group: &str,
        from: EntryId,
        count: usize,
    ) -> Result<Vec<PendingEntry>, Self::Error> {
        let mut cmd = redis::cmd("XPENDING");
        cmd.arg(stream)
            .arg(group)
            .arg(from.to_string())
            .arg("+")
            .arg(count);

        reply::pending(self.query(&cmd).await?)
    }

    #[instrument(skip(self))]
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> Result<Vec<StreamEntry>, Self::Error> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(duration_millis(min_idle));
        for id in ids {
            cmd.arg(id.to_string());
        }

        reply::entries(self.query(&cmd).await?)
    }
}
