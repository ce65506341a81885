//! # sync-client
//!
//! Client library for opsync, the offline-first operation-log sync engine.
//!
//! This is the main library that applications use to sync data.
//!
//! ## Features
//!
//! - **Offline-first**: local writes apply immediately and queue for upload
//! - **Convergent**: causal ordering via vector clocks, per-field LWW on
//!   concurrent writes, deletes win
//! - **E2E Encryption**: XChaCha20-Poly1305 payloads under an Argon2id
//!   password key
//! - **Transport Abstraction**: Pluggable transport layer (HTTP, mock)
//! - **Pure Core**: Uses sync-core for side-effect-free logic
//!
//! ## Example
//!
//! ```ignore
//! use opsync_client::{HttpTransport, SyncClient, SyncConfig};
//!
//! let transport = HttpTransport::new("http://localhost:8080", user_id.clone())?;
//! let client = SyncClient::new(SyncConfig::default(), user_id, transport);
//! client.set_password("correct horse")?;
//!
//! client.record_local(OpType::Create, EntityType::Task, Some(id), json!({"title": "Milk"}))?;
//! let report = client.sync().await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod crypto;
mod retry;
pub mod status;
pub mod transport;

pub use client::{ClientError, ClientState, PullReport, PushReport, SyncClient, SyncConfig, SyncReport};
pub use crypto::{Argon2Params, CryptoError, PayloadKey, KEY_SIZE, NONCE_SIZE};
pub use status::{StatusContext, SyncStatus};
pub use transport::{HttpTransport, MockTransport, Transport, TransportError};
