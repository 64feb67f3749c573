// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Emulator Protocol - emulator/runtime communication layer
//!
//! This crate defines what travels between the functions emulator and the
//! runtime processes it supervises:
//! - Runtime log records read from stdout, stderr and the control channel
//! - Line framing for those streams
//! - Debug bundles written to the control channel
//! - Well-known paths and headers on the runtime's socket server
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   HTTP over Unix socket    ┌──────────────────┐
//! │                  │ ─────────────────────────▶ │                  │
//! │ functions        │   control channel (JSON)   │ runtime process  │
//! │ emulator         │ ─────────────────────────▶ │                  │
//! │                  │ ◀───────────────────────── │                  │
//! └──────────────────┘   stdout/stderr/control    └──────────────────┘
//!                        (JSON log lines)
//! ```
//!
//! # Usage
//!
//! ```
//! use emulator_protocol::{LineBuffer, LogLevel, RuntimeLog};
//!
//! let mut buffer = LineBuffer::new();
//! let lines = buffer.push(b"{\"level\":\"INFO\",\"type\":\"t\",\"text\":\"ready\"}\npartial");
//! let log = RuntimeLog::from_line(&lines[0]);
//! assert_eq!(log.level, LogLevel::Info);
//! assert_eq!(buffer.pending(), "partial".len());
//! ```

pub mod control;
pub mod frame;
pub mod log;

pub use control::{
    CALLABLE_AUTH_HEADER, DebugBundle, HEALTH_CHECK_PATH, ORIGINAL_AUTH_HEADER, SignatureType,
};
pub use frame::{FrameError, LineBuffer, MAX_LINE_SIZE, encode_message};
pub use log::{LogLevel, RUNTIME_STATUS_TYPE, RuntimeLog};
