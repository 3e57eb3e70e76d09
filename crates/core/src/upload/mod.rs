//! Client uploads: sessions, credentials, cleanup, and orchestration.

mod sentinel;
mod service;
mod session;
mod store;

pub use sentinel::SentinelTasks;
pub use service::{CreateUploadInput, UploadService};
pub use session::{UploadCredential, UploadSession};
pub use store::SessionStore;
