//! # opsync-server
//!
//! Operation-log sync server for opsync.
//!
//! Clients upload operations; the server gives each one a per-account
//! sequence number and serves them back in order. It never merges or
//! interprets payloads, which may be encrypted end to end.
//!
//! ## Architecture
//!
//! ```text
//! Device A ──┐                         ┌── Device B
//!            │   HTTP + JSON           │
//!            ├────────────────────────►│
//!        ┌───┴─────────────────────────┴───┐
//!        │          opsync-server          │
//!        │  http ─► service ─► storage     │
//!        │           │  (per-account lock) │
//!        │  ┌──────────────────────────┐   │
//!        │  │  SQLite (operation log)  │   │
//!        │  └──────────────────────────┘   │
//!        └─────────────────────────────────┘
//! ```
//!
//! ## Endpoints
//!
//! - `POST /api/sync/ops` upload a batch
//! - `GET /api/sync/ops` download a page
//! - `GET /api/sync/status`, `GET /api/sync/restore-points`
//! - `POST /api/sync/compact`, `DELETE /api/sync/data`
//! - `GET /health`, `GET /metrics`

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cleanup;
pub mod config;
pub mod error;
pub mod http;
pub mod limits;
pub mod quota;
pub mod server;
pub mod service;
pub mod storage;
pub mod validation;

pub use config::Config;
pub use error::{ServerError, StorageError};
pub use server::SyncServer;
pub use service::SyncService;
pub use storage::{OpStorage, SqliteStorage};
