//! HTTP server for reel chunked uploads.
//!
//! This crate provides the upload control plane:
//! - Upload session start, status, cancel and completion
//! - Chunk intake over direct (pre-signed) and proxied paths
//! - Single-request uploads for small files
//! - Quota reporting and admin quota management
//! - Expiry, garbage collection and reconciliation sweeps

pub mod auth;
pub mod bootstrap;
pub mod catalog;
pub mod coordinator;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod routes;
pub mod state;
pub mod sweep;

pub use auth::TraceId;
pub use catalog::{MetadataCatalog, VideoCatalog};
pub use coordinator::SessionCoordinator;
pub use error::ApiError;
pub use routes::create_router;
pub use state::AppState;
