//! Chunked upload engine.
//!
//! ```text
//! UploadRequest ──► ChunkGroup ──next()──► ChunkInfo ──process()──► ChunkProcessor
//!                       │                                   ▲
//!                       └── Backoff decides retries ────────┘
//! ```
//!
//! Seekable sources are rewound to the chunk start on retry. Read-once sources
//! are staged chunk by chunk in a temp file when buffering is enabled, and
//! cannot be retried otherwise.

mod backoff;
mod group;

#[cfg(test)]
mod group_props;

pub use backoff::{Backoff, ConstantBackoff, NoBackoff};
pub use group::{ChunkGroup, ChunkInfo, ChunkProcessor};
