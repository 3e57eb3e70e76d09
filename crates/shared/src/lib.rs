//! Shared types, errors, signing, and configuration for Nimbus.
//!
//! This crate provides common types used across all other crates:
//! - Typed IDs for entities, policies, and upload sessions
//! - Application-wide error types
//! - URL and request signatures
//! - Configuration management

pub mod config;
pub mod error;
pub mod signing;
pub mod types;

pub use config::{AppConfig, ChunkConfig, NodeRole, PolicyConfig, StorageProvider};
pub use error::{AppError, AppResult};
pub use signing::{SignatureError, Signer};
