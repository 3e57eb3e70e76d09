//! Entity serving.
//!
//! An [`EntitySource`] binds one stored entity to its storage policy and either
//! links it (a signed internal URL or the backend's own URL) or answers an HTTP
//! request for it:
//!
//! ```text
//! GET /file/content/{entity}/..
//!        │
//!        ▼
//!   EntitySource::serve ──► local driver ──► serve_content (preconditions, ranges, limiter)
//!                      └──► other drivers ──► proxy::forward (short-lived direct URL)
//! ```

pub mod conditional;
pub mod content_type;
pub mod limiter;
mod options;
pub mod proxy;
pub mod range;
#[cfg(test)]
mod range_props;
mod serve;
mod source;

pub use options::EntitySourceOptions;
pub use serve::{ContentReader, FileContent, ServeParams, serve_content};
pub use source::{EntitySource, ServeContext, entity_etag};
