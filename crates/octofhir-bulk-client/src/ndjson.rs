//! NDJSON decoding of exported files.
//!
//! Each non-blank line becomes either a [`ResourceRecord`] or a
//! [`DecodeFailure`]; a bad line never ends the stream. Only failures of the
//! underlying byte stream are returned as errors.

use std::io;

use bytes::Bytes;
use futures_util::{Stream, StreamExt, TryStreamExt, future};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead};
use tokio_util::io::StreamReader;

use crate::BulkResult;
use crate::error::BulkError;

/// A FHIR resource read from one line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub id: String,
    #[serde(rename = "resourceType")]
    pub resource_type: String,
    /// All other top-level fields.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// A line that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeFailure {
    /// 1-based line number in the file.
    pub line: usize,
    /// The raw line, lossily converted to UTF-8.
    pub text: String,
    pub message: String,
}

/// One decoded line.
#[derive(Debug, Clone, PartialEq)]
pub enum NdjsonLine {
    Record(ResourceRecord),
    Invalid(DecodeFailure),
}

/// Default upper bound on the length of a single line, in bytes.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 64 * 1024 * 1024;

/// Decodes a byte stream line by line.
///
/// A line longer than `max_line_length` bytes yields a
/// [`BulkError::ProtocolViolation`] and ends the stream.
pub fn decode<S>(stream: S, max_line_length: usize) -> impl Stream<Item = BulkResult<NdjsonLine>>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>>,
{
    let reader = StreamReader::new(stream.map_err(io::Error::other));
    let codec =
        AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), Vec::new(), max_line_length);
    FramedRead::new(reader, codec)
        .enumerate()
        .filter_map(|(index, chunk)| {
            future::ready(match chunk {
                Ok(bytes) => decode_line(index + 1, &bytes).map(Ok),
                Err(e) => Some(Err(stream_error(e))),
            })
        })
}

/// Decodes a single line. Blank lines yield `None`.
#[must_use]
pub fn decode_line(line: usize, bytes: &[u8]) -> Option<NdjsonLine> {
    let text = match std::str::from_utf8(bytes) {
        Ok(text) => text.trim(),
        Err(e) => return Some(invalid(line, bytes, format!("invalid UTF-8: {e}"))),
    };
    if text.is_empty() {
        return None;
    }

    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => return Some(invalid(line, bytes, format!("invalid JSON: {e}"))),
    };
    if !value.is_object() {
        return Some(invalid(line, bytes, "expected a JSON object".to_string()));
    }
    Some(match serde_json::from_value::<ResourceRecord>(value) {
        Ok(record) => NdjsonLine::Record(record),
        Err(e) => invalid(line, bytes, format!("not a FHIR resource: {e}")),
    })
}

fn invalid(line: usize, bytes: &[u8], message: String) -> NdjsonLine {
    let text = String::from_utf8_lossy(bytes).trim_end_matches('\r').to_string();
    NdjsonLine::Invalid(DecodeFailure {
        line,
        text,
        message,
    })
}

fn stream_error(err: AnyDelimiterCodecError) -> BulkError {
    let io = match err {
        AnyDelimiterCodecError::Io(io) => io,
        other => return BulkError::protocol(format!("failed to read NDJSON: {other}")),
    };
    let message = io.to_string();
    match io.into_inner().map(|inner| inner.downcast::<reqwest::Error>()) {
        Some(Ok(e)) => BulkError::Transport(*e),
        _ => BulkError::protocol(format!("failed to read NDJSON: {message}")),
    }
}
