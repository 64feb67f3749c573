// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Line framing for runtime output streams.
//!
//! Runtime processes write newline-delimited records to stdout, stderr and
//! the control channel. Reads from a pipe return arbitrary chunks, so a
//! record may be split across several reads or several records may arrive
//! in one read:
//! - `\n` terminates a record, a trailing `\r` is stripped
//! - an incomplete tail is buffered until the next chunk arrives
//! - a tail longer than [`MAX_LINE_SIZE`] is emitted as-is

use bytes::{Buf, BufMut, BytesMut};
use serde::Serialize;
use thiserror::Error;

/// Maximum buffered line size (16 MB)
pub const MAX_LINE_SIZE: usize = 16 * 1024 * 1024;

/// Record terminator
pub const LINE_TERMINATOR: u8 = b'\n';

/// Errors that can occur while encoding a framed record
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("line too large: {0} bytes (max: {MAX_LINE_SIZE})")]
    LineTooLarge(usize),

    #[error("JSON encode error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Accumulates raw output chunks and yields complete lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: BytesMut,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.put_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == LINE_TERMINATOR) {
            let line = self.buf.split_to(pos);
            self.buf.advance(1);
            lines.push(decode_line(&line));
        }

        if self.buf.len() > MAX_LINE_SIZE {
            tracing::warn!(
                buffered = self.buf.len(),
                "Runtime output line exceeds maximum size, emitting partial line"
            );
            let line = self.buf.split();
            lines.push(decode_line(&line));
        }

        lines
    }

    /// Take whatever partial line is left, e.g. after the stream closed.
    pub fn flush(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let line = self.buf.split();
        Some(decode_line(&line))
    }

    /// Number of bytes waiting for a terminator.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// Encode a message as one control-channel record, without the terminator.
///
/// The transport writing the record appends [`LINE_TERMINATOR`].
pub fn encode_message<M: Serialize>(msg: &M) -> Result<String, FrameError> {
    let payload = serde_json::to_string(msg)?;
    if payload.len() > MAX_LINE_SIZE {
        return Err(FrameError::LineTooLarge(payload.len()));
    }
    Ok(payload)
}
