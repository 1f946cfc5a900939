//! Binary envelope placed on the partitioned log.
//!
//! Layout: two magic bytes (`LE`), one version byte, then a protobuf
//! `WireRecord` message.

use std::collections::HashMap;

use prost::Message;

use crate::LogEvent;

const WIRE_MAGIC: [u8; 2] = *b"LE";
const WIRE_VERSION: u8 = 1;
const HEADER_LEN: usize = WIRE_MAGIC.len() + 1;

/// Upper bound for a single encoded record, header included.
pub const MAX_WIRE_RECORD_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("encoded record is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("record shorter than envelope header ({0} bytes)")]
    Truncated(usize),
    #[error("bad envelope magic")]
    BadMagic,
    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u8),
    #[error("protobuf decode failed: {0}")]
    Decode(String),
    #[error("record has no event payload")]
    MissingPayload,
}

#[derive(Clone, PartialEq, Message)]
struct WireRecord {
    #[prost(string, tag = "1")]
    project_id: String,
    #[prost(string, tag = "2")]
    api_key: String,
    #[prost(message, optional, tag = "3")]
    payload: Option<WirePayload>,
}

#[derive(Clone, PartialEq, Message)]
struct WirePayload {
    #[prost(string, tag = "1")]
    name: String,
    #[prost(int64, tag = "2")]
    timestamp: i64,
    #[prost(map = "string, string", tag = "3")]
    data: HashMap<String, String>,
}

pub fn encode_event(event: &LogEvent) -> Result<Vec<u8>, CodecError> {
    let record = WireRecord {
        project_id: event.project_id.clone(),
        api_key: event.api_key.clone(),
        payload: Some(WirePayload {
            name: event.name.clone(),
            timestamp: event.timestamp,
            data: event.data.clone(),
        }),
    };
    let size = HEADER_LEN + record.encoded_len();
    if size > MAX_WIRE_RECORD_BYTES {
        return Err(CodecError::TooLarge {
            size,
            limit: MAX_WIRE_RECORD_BYTES,
        });
    }

    let mut out = Vec::with_capacity(size);
    out.extend_from_slice(&WIRE_MAGIC);
    out.push(WIRE_VERSION);
    record
        .encode(&mut out)
        .map_err(|err| CodecError::TooLarge {
            size: size + err.required_capacity(),
            limit: MAX_WIRE_RECORD_BYTES,
        })?;
    Ok(out)
}

pub fn decode_event(bytes: &[u8]) -> Result<LogEvent, CodecError> {
    if bytes.len() < HEADER_LEN {
        return Err(CodecError::Truncated(bytes.len()));
    }
    if bytes[..WIRE_MAGIC.len()] != WIRE_MAGIC {
        return Err(CodecError::BadMagic);
    }
    let version = bytes[WIRE_MAGIC.len()];
    if version != WIRE_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }

    let record = WireRecord::decode(&bytes[HEADER_LEN..])
        .map_err(|err| CodecError::Decode(err.to_string()))?;
    let payload = record.payload.ok_or(CodecError::MissingPayload)?;
    Ok(LogEvent {
        project_id: record.project_id,
        api_key: record.api_key,
        name: payload.name,
        timestamp: payload.timestamp,
        data: payload.data,
    })
}
