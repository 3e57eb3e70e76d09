//! Client side of the slave node protocol.

mod client;
pub mod protocol;

pub use client::RemoteClient;
