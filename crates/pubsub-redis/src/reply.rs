//! Decoding of stream command replies (RESP2 and RESP3 shapes).

use std::time::Duration;

use bytes::Bytes;
use proven_pubsub::{EntryId, Fields, PendingEntry, StreamEntry};
use redis::Value;

use crate::error::Error;

fn invalid(what: &str, value: &Value) -> Error {
    Error::InvalidResponse(format!("unexpected {what}: {value:?}"))
}

fn into_string(value: Value) -> Result<String, Error> {
    match value {
        Value::BulkString(bytes) => {
            String::from_utf8(bytes).map_err(|e| Error::InvalidResponse(e.to_string()))
        }
        Value::SimpleString(s) => Ok(s),
        Value::VerbatimString { text, .. } => Ok(text),
        other => Err(invalid("string", &other)),
    }
}

fn into_bytes(value: Value) -> Result<Bytes, Error> {
    match value {
        Value::BulkString(bytes) => Ok(Bytes::from(bytes)),
        Value::SimpleString(s) => Ok(Bytes::from(s)),
        other => Err(invalid("field value", &other)),
    }
}

fn into_u64(value: Value) -> Result<u64, Error> {
    match value {
        Value::Int(i) => u64::try_from(i).map_err(|e| Error::InvalidResponse(e.to_string())),
        Value::BulkString(bytes) => std::str::from_utf8(&bytes)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| invalid("integer", &Value::BulkString(bytes.clone()))),
        other => Err(invalid("integer", &other)),
    }
}

pub fn entry_id(value: Value) -> Result<EntryId, Error> {
    Ok(into_string(value)?.parse()?)
}

fn fields(value: Value) -> Result<Fields, Error> {
    match value {
        // The entry was deleted while still pending.
        Value::Nil => Ok(Fields::new()),
        Value::Array(items) => {
            let mut fields = Fields::new();
            let mut items = items.into_iter();

            while let Some(name) = items.next() {
                let value = items
                    .next()
                    .ok_or_else(|| Error::InvalidResponse("odd number of field items".into()))?;
                fields.insert(into_string(name)?, into_bytes(value)?);
            }

            Ok(fields)
        }
        Value::Map(pairs) => pairs
            .into_iter()
            .map(|(name, value)| Ok((into_string(name)?, into_bytes(value)?)))
            .collect(),
        other => Err(invalid("entry fields", &other)),
    }
}

/// Decodes a list of `[id, [field, value, ...]]` entries.
///
/// `nil` items (claimed entries that no longer exist) are skipped.
pub fn entries(value: Value) -> Result<Vec<StreamEntry>, Error> {
    let items = match value {
        Value::Nil => return Ok(Vec::new()),
        Value::Array(items) => items,
        other => return Err(invalid("entry list", &other)),
    };

    let mut entries = Vec::with_capacity(items.len());

    for item in items {
        match item {
            Value::Nil => {}
            Value::Array(parts) => {
                let mut parts = parts.into_iter();
                let id = parts
                    .next()
                    .ok_or_else(|| Error::InvalidResponse("entry without id".into()))?;

                entries.push(StreamEntry {
                    id: entry_id(id)?,
                    fields: fields(parts.next().unwrap_or(Value::Nil))?,
                });
            }
            other => return Err(invalid("entry", &other)),
        }
    }

    Ok(entries)
}

/// Decodes an `XREADGROUP` reply for a single stream. `nil` means the read
/// timed out.
pub fn read(value: Value) -> Result<Vec<StreamEntry>, Error> {
    let streams: Vec<Value> = match value {
        Value::Nil => return Ok(Vec::new()),
        Value::Map(pairs) => pairs.into_iter().map(|(_, entries)| entries).collect(),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Array(mut pair) if pair.len() == 2 => Ok(pair.swap_remove(1)),
                other => Err(invalid("stream reply", &other)),
            })
            .collect::<Result<_, _>>()?,
        other => return Err(invalid("read reply", &other)),
    };

    let mut read = Vec::new();
    for stream in streams {
        read.extend(entries(stream)?);
    }

    Ok(read)
}

/// Decodes the extended form of `XPENDING`.
pub fn pending(value: Value) -> Result<Vec<PendingEntry>, Error> {
    let items = match value {
        Value::Nil => return Ok(Vec::new()),
        Value::Array(items) => items,
        other => return Err(invalid("pending list", &other)),
    };

    items
        .into_iter()
        .map(|item| match item {
            Value::Array(parts) if parts.len() == 4 => {
                let mut parts = parts.into_iter();
                let mut next = || parts.next().unwrap_or(Value::Nil);

                Ok(PendingEntry {
                    id: entry_id(next())?,
                    consumer: into_string(next())?,
                    idle: Duration::from_millis(into_u64(next())?),
                    delivery_count: into_u64(next())?,
                })
            }
            other => Err(invalid("pending entry", &other)),
        })
        .collect()
}
