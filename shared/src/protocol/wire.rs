//! Binary envelope for persisted signal batches.
//!
//! Uses bincode with an explicit config so the writer and a later reader (possibly
//! a newer build of the agent, after a restart) always agree on the encoding
//! (fixint for lengths and enums).
//!
//! Every batch is wrapped in an envelope carrying the format version and the
//! signal kind, so a batch written by one kind's store can never be decoded as
//! another kind's records.

use crate::types::signals::{Signal, SignalKind};
use bincode::Options;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Envelope format version
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("unsupported envelope version {found} (expected {expected})")]
    Version { found: u32, expected: u32 },

    #[error("envelope holds {found} records, expected {expected}")]
    KindMismatch { found: SignalKind, expected: SignalKind },
}

fn wire_bincode() -> impl bincode::config::Options {
    bincode::config::DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
}

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    version: u32,
    kind: SignalKind,
    records: &'a [T],
}

/// Leading fields of every envelope version, read before the records.
#[derive(Deserialize)]
struct EnvelopeHeader {
    version: u32,
    kind: SignalKind,
}

/// Serialize a batch into its persisted form.
pub fn encode_batch<T: Signal>(records: &[T]) -> Result<Vec<u8>, CodecError> {
    let envelope = EnvelopeRef {
        version: PROTOCOL_VERSION,
        kind: T::KIND,
        records,
    };
    Ok(wire_bincode().serialize(&envelope)?)
}

/// Deserialize a persisted batch, validating version and signal kind before
/// touching the records.
pub fn decode_batch<T: Signal>(bytes: &[u8]) -> Result<Vec<T>, CodecError> {
    let header: EnvelopeHeader = wire_bincode().deserialize(bytes)?;
    if header.version != PROTOCOL_VERSION {
        return Err(CodecError::Version {
            found: header.version,
            expected: PROTOCOL_VERSION,
        });
    }
    if header.kind != T::KIND {
        return Err(CodecError::KindMismatch {
            found: header.kind,
            expected: T::KIND,
        });
    }
    // bincode lays a struct out as a tuple of its fields.
    let (_, records): (EnvelopeHeader, Vec<T>) = wire_bincode().deserialize(bytes)?;
    Ok(records)
}
