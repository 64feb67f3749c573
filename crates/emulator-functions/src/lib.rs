// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Emulator Functions - local functions emulator
//!
//! Serves HTTPS, callable, event, schedule and auth blocking functions from
//! local source directories. Every function runs inside a runtime process
//! that listens on a private Unix socket; the emulator starts those
//! processes on demand, proxies requests to them and tears them down when
//! sources change.
//!
//! # Architecture
//!
//! ```text
//!   HTTP callers          companion emulators (pubsub, firestore, auth ...)
//!        │                          │
//!        ▼                          ▼
//! ┌─────────────────────────────────────────────┐
//! │                  HTTP hub                   │
//! │  /{project}/{region}/{name}   /functions/…  │
//! └──────────────────────┬──────────────────────┘
//!                        │ resolve trigger
//!                        ▼
//! ┌─────────────────────────────────────────────┐
//! │                 Work queue                  │
//! │        AUTO: parallel  SEQUENTIAL: 1        │
//! └──────────────────────┬──────────────────────┘
//!                        │ acquire worker
//!                        ▼
//! ┌─────────────────────────────────────────────┐
//! │              Runtime worker pool            │
//! │   key → [worker, worker, ...]  (bounded)    │
//! └──────────────────────┬──────────────────────┘
//!                        │ HTTP over Unix socket
//!                        ▼
//!              ┌───────────────────┐
//!              │  runtime process  │
//!              └───────────────────┘
//! ```
//!
//! # Execution modes
//!
//! | Mode | When | Behavior |
//! |------|------|----------|
//! | `AUTO` | default | one runtime per trigger, invocations run in parallel |
//! | `SEQUENTIAL` | debugger attached | one shared runtime, one invocation at a time |
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `FUNCTIONS_EMULATOR_PROJECT_ID` | Yes | - | Project served by the emulator |
//! | `FUNCTIONS_EMULATOR_PROJECT_ALIAS` | No | - | Alias used to pick `.env.<alias>` |
//! | `FUNCTIONS_EMULATOR_HOST` | No | `127.0.0.1` | Hub bind host |
//! | `FUNCTIONS_EMULATOR_PORT` | No | `5001` | Hub bind port |
//! | `FUNCTIONS_EMULATOR_DEBUG_PORT` | No | - | Debugger port, enables sequential mode |
//! | `FUNCTIONS_EMULATOR_MAX_WORKERS_PER_KEY` | No | `8` | Live runtimes per trigger |
//! | `FUNCTIONS_EMULATOR_MAX_CONCURRENCY` | No | `0` | Concurrent invocations, 0 for unlimited |
//! | `FUNCTIONS_EMULATOR_BACKENDS` | No | `functions.json` | Backend declarations |
//! | `FUNCTIONS_EMULATOR_SOCKET_DIR` | No | temp dir | Directory for runtime sockets |
//! | `FUNCTIONS_EMULATOR_QUIET` | No | `false` | Log warnings only |
//!
//! Companion emulators are picked up from their usual host variables, for
//! example `FIRESTORE_EMULATOR_HOST` or `PUBSUB_EMULATOR_HOST`.

pub mod auth;
pub mod backend;
pub mod config;
pub mod discovery;
pub mod emulator;
pub mod env;
pub mod error;
pub mod logging;
pub mod pool;
pub mod process;
pub mod registry;
pub mod server;
pub mod services;
pub mod trigger;
pub mod watcher;
pub mod work_queue;
pub mod worker;

pub use backend::{BackendInfo, EmulatableBackend};
pub use config::{Companion, CompanionEmulators, Config};
pub use emulator::{FunctionsEmulator, FunctionsEmulatorBuilder};
pub use error::{Error, Result};
pub use pool::{ExecutionMode, RuntimeWorkerPool};
pub use process::{MockSpawner, NativeSpawner, ProcessSpawner};
pub use registry::{TriggerRecord, TriggerRegistry};
pub use trigger::{TriggerDefinition, TriggerKind, TriggerSpec};
pub use work_queue::{QueueError, WorkQueue};
pub use worker::{ProxyRequest, RuntimeWorker, WorkerState};
