//! DriftBox: a chunked upload depot.
//!
//! Files arrive as independently uploaded, fixed-order chunks that are
//! buffered on disk, verified for completeness, assembled in index order
//! and published atomically into an object store, then registered in a
//! file catalog. The [`orchestrator::UploadOrchestrator`] owns the whole
//! pipeline; the HTTP layer in [`api`] only moves parameters.

use shadow_rs::shadow;

pub mod api;
pub mod assembler;
pub mod background;
pub mod catalog;
pub mod chunk_store;
pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod logging;
pub mod object_store;
pub mod orchestrator;
pub mod session;
pub mod version;

#[cfg(test)]
pub(crate) mod testutil;

shadow!(build);
