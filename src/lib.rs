// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod api;
pub mod config;
pub mod ingest;
pub mod metrics;
pub mod model;
pub mod ratelimit;
pub mod realtime;
pub mod store;

// ---- Re-exports for stable public API ----
pub use crate::api::{router, AppState};
pub use crate::config::Settings;
pub use crate::ingest::scheduler::{CycleReport, OverlapPolicy, Scheduler};
pub use crate::ratelimit::TokenBucket;
pub use crate::realtime::{Hub, HubHandle};
pub use crate::store::{MemoryRepository, Repository};
