//! Storage data-plane for Nimbus.
//!
//! This crate contains the storage logic with no web framework dependencies:
//! the chunked upload engine, the driver contract and its backends, the slave
//! node client, and upload session orchestration.
//!
//! # Modules
//!
//! - `chunk` - Chunk splitting, retry, and replay buffering
//! - `driver` - Driver trait, capabilities, and the local, object, and remote backends
//! - `remote` - Signed client for slave nodes and the protocol wire types
//! - `upload` - Upload sessions, sentinel cleanup, and the upload service
//! - `entity` - Stored entity references and their repository

pub mod chunk;
pub mod disposition;
pub mod driver;
pub mod entity;
pub mod error;
pub mod remote;
pub mod request;
pub mod upload;

pub use error::StorageError;
pub use request::{UploadProps, UploadReader, UploadRequest};
