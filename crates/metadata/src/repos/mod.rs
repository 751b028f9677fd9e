//! Repository traits for metadata operations.

pub mod bootstrap;
pub mod chunks;
pub mod jobs;
pub mod quotas;
pub mod sessions;
pub mod tokens;
pub mod videos;

pub use bootstrap::BootstrapRepo;
pub use chunks::{ChunkRepo, RecordedChunk};
pub use jobs::{JobRepo, JobState, JobType, ReconcileStats, SweepStats};
pub use quotas::{QuotaRepo, ReconciledQuota};
pub use sessions::{ReleaseOutcome, SessionRepo};
pub use tokens::TokenRepo;
pub use videos::VideoRepo;
