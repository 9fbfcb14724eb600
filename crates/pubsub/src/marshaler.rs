use std::error::Error as StdError;
use std::fmt::Debug;

use bytes::Bytes;
use thiserror::Error;

use crate::log::Fields;
use crate::message::{Message, Metadata};

/// Field holding the message identifier.
pub const UUID_FIELD: &str = "_uuid";

/// Field holding the CBOR-encoded metadata map.
pub const METADATA_FIELD: &str = "metadata";

/// Field holding the raw payload.
pub const PAYLOAD_FIELD: &str = "payload";

/// Marker trait for marshaler errors
pub trait MarshalerError: Debug + StdError + Send + Sync + 'static {}

/// Converts messages to and from storage records.
///
/// Publishers and coordinators only depend on this trait, so alternate wire
/// encodings can be swapped in without touching either.
pub trait Marshaler: Clone + Debug + Send + Sync + 'static {
    /// The error type for encoding and decoding.
    type Error: MarshalerError;

    /// Encodes a message bound for `topic`.
    fn marshal(&self, topic: &str, message: &Message) -> Result<Fields, Self::Error>;

    /// Decodes a record read from the log.
    fn unmarshal(&self, fields: &Fields) -> Result<Message, Self::Error>;
}

/// Errors from [`DefaultMarshaler`].
#[derive(Debug, Error)]
pub enum DefaultMarshalerError {
    /// Metadata could not be decoded.
    #[error("failed to decode metadata: {0}")]
    DecodeMetadata(#[from] ciborium::de::Error<std::io::Error>),

    /// Metadata could not be encoded.
    #[error("failed to encode metadata: {0}")]
    EncodeMetadata(#[from] ciborium::ser::Error<std::io::Error>),

    /// The message identifier is not valid UTF-8.
    #[error("message uuid is not valid utf-8")]
    InvalidUuid,

    /// The record carries no message identifier.
    #[error("record is missing the message uuid field")]
    MissingUuid,
}

impl MarshalerError for DefaultMarshalerError {}

/// Stores the uuid and payload as raw fields and metadata as a CBOR map.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultMarshaler;

impl Marshaler for DefaultMarshaler {
    type Error = DefaultMarshalerError;

    fn marshal(&self, _topic: &str, message: &Message) -> Result<Fields, Self::Error> {
        let mut fields = Fields::new();

        fields.insert(
            UUID_FIELD.to_string(),
            Bytes::copy_from_slice(message.uuid().as_bytes()),
        );
        fields.insert(PAYLOAD_FIELD.to_string(), message.payload().clone());

        if !message.metadata().is_empty() {
            let mut buf = Vec::new();
            ciborium::into_writer(message.metadata(), &mut buf)?;
            fields.insert(METADATA_FIELD.to_string(), Bytes::from(buf));
        }

        Ok(fields)
    }

    fn unmarshal(&self, fields: &Fields) -> Result<Message, Self::Error> {
        let uuid = fields
            .get(UUID_FIELD)
            .ok_or(DefaultMarshalerError::MissingUuid)?;
        let uuid =
            std::str::from_utf8(uuid).map_err(|_| DefaultMarshalerError::InvalidUuid)?;

        let metadata: Metadata = match fields.get(METADATA_FIELD) {
            Some(raw) => ciborium::from_reader(raw.as_ref())?,
            None => Metadata::new(),
        };

        let payload = fields.get(PAYLOAD_FIELD).cloned().unwrap_or_default();

        Ok(Message::new(uuid, payload).with_metadata(metadata))
    }
}
