//! Versioned JSON envelope for everything the sync core persists.
//!
//! Each value is stored as `{"schema": N, "kind": "...", "body": {...}}`.
//! Bodies use `#[serde(default)]` for fields added after schema 1, so older
//! rows decode with defaults and rows written by a newer release decode
//! with their unknown fields ignored.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{error::StorageError, Keyspace};

/// A persisted record type and the schema version this build writes.
pub trait Versioned {
    const KIND: &'static str;
    const SCHEMA: u16;
}

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    schema: u16,
    kind: &'a str,
    body: &'a T,
}

#[derive(Deserialize)]
struct Envelope {
    schema: u16,
    kind: String,
    body: serde_json::Value,
}

pub fn encode<T: Versioned + Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    let envelope = EnvelopeRef {
        schema: T::SCHEMA,
        kind: T::KIND,
        body: value,
    };
    Ok(serde_json::to_vec(&envelope)?)
}

pub fn decode<T: Versioned + DeserializeOwned>(
    space: Keyspace,
    key: &str,
    bytes: &[u8],
) -> Result<T, StorageError> {
    let corrupt = |reason: String| StorageError::Corrupt {
        keyspace: space.tree_name().to_string(),
        key: key.to_string(),
        reason,
    };

    let envelope: Envelope = serde_json::from_slice(bytes).map_err(|e| corrupt(e.to_string()))?;

    if envelope.kind != T::KIND {
        return Err(corrupt(format!(
            "expected kind '{}', found '{}'",
            T::KIND,
            envelope.kind
        )));
    }

    if envelope.schema > T::SCHEMA {
        log::warn!(
            "Record '{}' in {} has schema {} (this build writes {}); unknown fields are ignored",
            key,
            space.tree_name(),
            envelope.schema,
            T::SCHEMA
        );
    }

    serde_json::from_value(envelope.body).map_err(|e| corrupt(e.to_string()))
}
