use std::collections::BTreeMap;

use bytes::Bytes;

/// Message metadata, ordered by key.
pub type Metadata = BTreeMap<String, String>;

/// An application message as seen by publishers and subscribers.
///
/// Messages are immutable once built. An empty `uuid` asks the publisher to
/// assign a fresh one before the message is written.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    uuid: String,
    metadata: Metadata,
    payload: Bytes,
}

impl Message {
    /// Creates a message with the given identifier and payload and no metadata.
    pub fn new<U, P>(uuid: U, payload: P) -> Self
    where
        U: Into<String>,
        P: Into<Bytes>,
    {
        Self {
            uuid: uuid.into(),
            metadata: Metadata::new(),
            payload: payload.into(),
        }
    }

    /// Creates a message without an identifier; one is assigned on publish.
    pub fn from_payload<P>(payload: P) -> Self
    where
        P: Into<Bytes>,
    {
        Self::new(String::new(), payload)
    }

    /// Returns a copy of this message carrying the given metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Returns a copy of this message with one metadata entry added.
    #[must_use]
    pub fn with_metadata_entry<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Returns a copy of this message with the given identifier.
    #[must_use]
    pub fn with_uuid<U>(mut self, uuid: U) -> Self
    where
        U: Into<String>,
    {
        self.uuid = uuid.into();
        self
    }

    /// The message identifier.
    #[must_use]
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// The message metadata.
    #[must_use]
    pub const fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// The message payload.
    #[must_use]
    pub const fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Splits the message into identifier, metadata and payload.
    #[must_use]
    pub fn into_parts(self) -> (String, Metadata, Bytes) {
        (self.uuid, self.metadata, self.payload)
    }
}
