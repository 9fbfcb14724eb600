//! In-memory (single node) implementation of stream logs for local development.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use proven_pubsub::{EntryId, Fields, GroupStart, PendingEntry, StreamEntry, StreamLog};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::trace;

/// Stands in for a blocking read deadline that does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

#[derive(Debug)]
struct PendingState {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u64,
}

#[derive(Debug)]
struct GroupState {
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, PendingState>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: BTreeMap<EntryId, Fields>,
    groups: HashMap<String, GroupState>,
    last_id: EntryId,
}

impl StreamState {
    fn next_id(&self) -> EntryId {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX));

        if now_ms > self.last_id.ms {
            EntryId::new(now_ms, 0)
        } else {
            self.last_id.successor()
        }
    }

    fn group_mut(&mut self, stream: &str, group: &str) -> Result<&mut GroupState, Error> {
        self.groups.get_mut(group).ok_or_else(|| Error::NoGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        })
    }
}

/// In-memory stream log with consumer groups.
///
/// Clones share the same streams.
#[derive(Clone, Debug, Default)]
pub struct MemoryStreamLog {
    appended: Arc<Notify>,
    streams: Arc<Mutex<HashMap<String, StreamState>>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryStreamLog {
    /// Creates a new, empty `MemoryStreamLog`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following call fail with [`Error::Unavailable`] until
    /// switched back, simulating a storage outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }

    /// Removes a consumer group and its pending entries.
    ///
    /// Returns whether the group existed.
    pub async fn destroy_group(&self, stream: &str, group: &str) -> bool {
        self.streams
            .lock()
            .await
            .get_mut(stream)
            .is_some_and(|state| state.groups.remove(group).is_some())
    }

    /// Number of entries currently held by `stream`.
    pub async fn len(&self, stream: &str) -> usize {
        self.streams
            .lock()
            .await
            .get(stream)
            .map_or(0, |state| state.entries.len())
    }

    /// Whether `stream` holds no entries.
    pub async fn is_empty(&self, stream: &str) -> bool {
        self.len(stream).await == 0
    }

    fn check_available(&self) -> Result<(), Error> {
        if self.unavailable.load(Ordering::Acquire) {
            Err(Error::Unavailable)
        } else {
            Ok(())
        }
    }

    async fn try_read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, Error> {
        let mut streams = self.streams.lock().await;

        let no_group = || Error::NoGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        };

        let state = streams.get_mut(stream).ok_or_else(no_group)?;
        let StreamState {
            entries, groups, ..
        } = state;
        let group_state = groups.get_mut(group).ok_or_else(no_group)?;

        let now = Instant::now();
        let read: Vec<StreamEntry> = entries
            .range(group_state.last_delivered.successor()..)
            .take(count)
            .map(|(id, fields)| StreamEntry {
                id: *id,
                fields: fields.clone(),
            })
            .collect();

        for entry in &read {
            group_state.pending.insert(
                entry.id,
                PendingState {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    delivery_count: 1,
                },
            );
        }

        if let Some(last) = read.last() {
            group_state.last_delivered = last.id;
        }

        Ok(read)
    }
}

#[async_trait]
impl StreamLog for MemoryStreamLog {
    type Error = Error;

    async fn append(
        &self,
        stream: &str,
        fields: Fields,
        max_len: Option<usize>,
    ) -> Result<EntryId, Self::Error> {
        self.check_available()?;

        let id = {
            let mut streams = self.streams.lock().await;
            let state = streams.entry(stream.to_string()).or_default();

            let id = state.next_id();
            state.entries.insert(id, fields);
            state.last_id = id;

            if let Some(max_len) = max_len {
                while state.entries.len() > max_len {
                    state.entries.pop_first();
                }
            }

            id
        };

        trace!(stream, entry_id = %id, "appended entry");
        self.appended.notify_waiters();

        Ok(id)
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: GroupStart,
    ) -> Result<(), Self::Error> {
        self.check_available()?;

        let mut streams = self.streams.lock().await;
        let state = streams.entry(stream.to_string()).or_default();

        let last_delivered = match start {
            GroupStart::Beginning => EntryId::MIN,
            GroupStart::Latest => state.last_id,
        };

        state
            .groups
            .entry(group.to_string())
            .or_insert_with(|| GroupState {
                last_delivered,
                pending: BTreeMap::new(),
            });

        Ok(())
    }

    async fn read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, Self::Error> {
        let now = Instant::now();
        let deadline = now
            .checked_add(block)
            .unwrap_or_else(|| now + FAR_FUTURE);

        loop {
            self.check_available()?;

            // Register before reading so an append in between is not missed.
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let entries = self.try_read_new(stream, group, consumer, count).await?;
            if !entries.is_empty() {
                return Ok(entries);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        from: EntryId,
        count: usize,
    ) -> Result<Vec<StreamEntry>, Self::Error> {
        self.check_available()?;

        let mut streams = self.streams.lock().await;
        let state = streams.get_mut(stream).ok_or_else(|| Error::NoGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        })?;
        let StreamState {
            entries, groups, ..
        } = state;
        let group_state = groups.get_mut(group).ok_or_else(|| Error::NoGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        })?;

        let now = Instant::now();
        let mut read = Vec::new();

        for (id, pending) in group_state.pending.range_mut(from..) {
            if read.len() >= count {
                break;
            }

            if pending.consumer != consumer {
                continue;
            }

            pending.delivered_at = now;
            pending.delivery_count += 1;

            read.push(StreamEntry {
                id: *id,
                fields: entries.get(id).cloned().unwrap_or_default(),
            });
        }

        Ok(read)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<u64, Self::Error> {
        self.check_available()?;

        let mut streams = self.streams.lock().await;
        // A missing stream or group has nothing pending to acknowledge.
        let Some(group_state) = streams
            .get_mut(stream)
            .and_then(|state| state.groups.get_mut(group))
        else {
            return Ok(0);
        };

        let acked = ids
            .iter()
            .filter(|id| group_state.pending.remove(id).is_some())
            .count();

        Ok(acked as u64)
    }

    async fn delete(&self, stream: &str, ids: &[EntryId]) -> Result<u64, Self::Error> {
        self.check_available()?;

        let mut streams = self.streams.lock().await;
        let Some(state) = streams.get_mut(stream) else {
            return Ok(0);
        };

        let deleted = ids
            .iter()
            .filter(|id| state.entries.remove(id).is_some())
            .count();

        Ok(deleted as u64)
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        from: EntryId,
        count: usize,
    ) -> Result<Vec<PendingEntry>, Self::Error> {
        self.check_available()?;

        let mut streams = self.streams.lock().await;
        let state = streams.get_mut(stream).ok_or_else(|| Error::NoGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        })?;
        let group_state = state.group_mut(stream, group)?;

        Ok(group_state
            .pending
            .range(from..)
            .take(count)
            .map(|(id, pending)| PendingEntry {
                id: *id,
                consumer: pending.consumer.clone(),
                idle: pending.delivered_at.elapsed(),
                delivery_count: pending.delivery_count,
            })
            .collect())
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> Result<Vec<StreamEntry>, Self::Error> {
        self.check_available()?;

        let mut streams = self.streams.lock().await;
        let state = streams.get_mut(stream).ok_or_else(|| Error::NoGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        })?;
        let StreamState {
            entries, groups, ..
        } = state;
        let group_state = groups.get_mut(group).ok_or_else(|| Error::NoGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        })?;

        let now = Instant::now();
        let mut claimed = Vec::new();

        for id in ids {
            let Some(pending) = group_state.pending.get_mut(id) else {
                continue;
            };

            if pending.delivered_at.elapsed() < min_idle {
                continue;
            }

            // Entries deleted from the stream cannot be delivered again.
            let Some(fields) = entries.get(id) else {
                group_state.pending.remove(id);
                continue;
            };

            pending.consumer = consumer.to_string();
            pending.delivered_at = now;
            pending.delivery_count += 1;

            claimed.push(StreamEntry {
                id: *id,
                fields: fields.clone(),
            });
        }

        Ok(claimed)
    }
}
