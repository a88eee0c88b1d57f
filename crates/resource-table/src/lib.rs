//! Shared Resource Table: a named shared-memory region holding per-GPU
//! compute-unit masks, shared between the controller daemon (the creator
//! and only writer) and any number of independently started consumer
//! processes.
//!
//! The region's byte layout is fixed and versionless (see [`layout`]); the
//! creator and every attacher compute the same offsets from the GPU count
//! stored in the region itself. All reads and writes go through the
//! process-shared lock embedded in the region.

use std::io;

use thiserror::Error;

pub mod layout;
pub mod mutex;
mod region;
mod table;

pub use mutex::RawTableMutex;
pub use mutex::TableLockGuard;
pub use table::ResourceTable;

/// Errors raised by table creation, attachment, and teardown.
#[derive(Debug, Error)]
pub enum TableError {
    #[error("failed to allocate shared memory region `{name}`: {source}")]
    Allocation { name: String, source: io::Error },

    #[error("shared memory region `{name}` already exists")]
    AlreadyExists { name: String },

    #[error("shared memory region `{name}` not found")]
    NotFound { name: String },

    #[error("shared memory region `{name}` has an unusable layout: {reason}")]
    Layout { name: String, reason: String },

    #[error("gpu_count {0} is outside the supported range")]
    InvalidGpuCount(u32),

    #[error("only the creating process may destroy the table")]
    NotCreator,
}
