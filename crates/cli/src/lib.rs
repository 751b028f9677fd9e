//! Resumable chunked upload client for reel.

pub mod api_client;
pub mod config;
pub mod error;
pub mod upload;

pub use api_client::{ApiClient, UploadApi};
pub use error::{ClientError, ClientResult};
