//! # sync-types
//!
//! Wire format types for the opsync operation-log sync protocol.
//!
//! This crate provides the foundational types used across all opsync crates:
//! - [`OpId`], [`ClientId`], [`UserId`], [`ServerSeq`] - Identity and ordering types
//! - [`VectorClock`] - Causality tracking stamped on every operation
//! - [`Operation`], [`ServerOperation`] - The immutable unit of change
//! - Upload/download request and response bodies
//! - [`TypesError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod ids;
mod messages;
mod operation;
mod vector_clock;

pub use error::TypesError;
pub use ids::{ClientId, OpId, ServerSeq, UserId};
pub use messages::{
    CompactResponse, DeleteAllResponse, DownloadRequest, DownloadResponse, ErrorBody, RejectCode,
    RestorePoint, RestorePointsResponse, StatusResponse, UploadRequest, UploadResponse,
    UploadResult, UploadStatus, DEFAULT_DOWNLOAD_LIMIT, MAX_DOWNLOAD_LIMIT, PIGGYBACK_LIMIT,
};
pub use operation::{EntityType, OpType, Operation, ServerOperation, CURRENT_SCHEMA_VERSION};
pub use vector_clock::{ClockOrdering, VectorClock};
