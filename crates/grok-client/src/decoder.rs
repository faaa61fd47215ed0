//! Incremental newline-delimited JSON decoding
//!
//! The upstream body arrives in arbitrary chunks. [`LineDecoder`] reassembles
//! complete lines across chunk boundaries; [`decode_line`] extracts the token
//! at `result.response.token` from one line.

use bytes::{Bytes, BytesMut};
use serde_json::Value;

/// Upper bound on one buffered line. A longer line aborts the stream.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

const TOKEN_POINTER: &str = "/result/response/token";

/// A line that does not carry a token. Logged and counted, never surfaced.
#[derive(Debug, thiserror::Error)]
pub enum DecodeSkip {
    #[error("malformed JSON: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("record is not a JSON object")]
    NotAnObject,

    #[error("record has no string at result.response.token")]
    MissingToken,
}

impl DecodeSkip {
    /// Metrics label.
    pub fn label(&self) -> &'static str {
        match self {
            DecodeSkip::Malformed(_) => "malformed",
            DecodeSkip::NotAnObject => "not_object",
            DecodeSkip::MissingToken => "missing_token",
        }
    }
}

/// Buffered line exceeded [`MAX_LINE_BYTES`] without a terminator.
#[derive(Debug, thiserror::Error)]
#[error("upstream line exceeds {limit} bytes")]
pub struct LineTooLong {
    pub limit: usize,
}

/// Splits a chunked byte stream into non-empty lines.
///
/// `\n` terminates a line; a trailing `\r` and surrounding ASCII whitespace
/// are trimmed. Blank lines are dropped.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buf: BytesMut,
    /// Prefix of `buf` already known to hold no `\n`.
    scanned: usize,
}

impl LineDecoder {
    /// Feed one chunk, returning every line it completed, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Bytes>, LineTooLong> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(offset) = self.buf[self.scanned..].iter().position(|b| *b == b'\n') {
            let pos = self.scanned + offset;
            let line = self.buf.split_to(pos + 1).freeze();
            self.scanned = 0;
            if let Some(line) = non_blank(line.slice(..pos)) {
                lines.push(line);
            }
        }
        self.scanned = self.buf.len();

        if self.buf.len() > MAX_LINE_BYTES {
            return Err(LineTooLong {
                limit: MAX_LINE_BYTES,
            });
        }
        Ok(lines)
    }

    /// Flush a final line that had no terminator.
    pub fn finish(&mut self) -> Option<Bytes> {
        self.scanned = 0;
        if self.buf.is_empty() {
            return None;
        }
        non_blank(self.buf.split().freeze())
    }
}

fn non_blank(line: Bytes) -> Option<Bytes> {
    let trimmed = line.trim_ascii();
    if trimmed.is_empty() {
        None
    } else {
        Some(line.slice_ref(trimmed))
    }
}

/// Extract the token from one upstream record.
///
/// `Ok(None)` means the record carried an empty token, which is not an error
/// but produces nothing.
pub fn decode_line(line: &[u8]) -> Result<Option<String>, DecodeSkip> {
    let mut record: Value = serde_json::from_slice(line)?;
    if !record.is_object() {
        return Err(DecodeSkip::NotAnObject);
    }

    match record.pointer_mut(TOKEN_POINTER).map(Value::take) {
        Some(Value::String(token)) if token.is_empty() => Ok(None),
        Some(Value::String(token)) => Ok(Some(token)),
        _ => Err(DecodeSkip::MissingToken),
    }
}
