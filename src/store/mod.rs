// src/store/mod.rs
//! Storage contract consumed by the ingestion pipeline.
//!
//! The schema and query engine live elsewhere; the core only needs ordered
//! sources, an idempotent item insert, and a source's follower set.

pub mod memory;

use std::cmp::Ordering;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::{Item, Source, SubscriberId};

pub use memory::MemoryRepository;

/// Result of an insert-if-absent keyed on the item link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The link already exists. Benign.
    Conflict,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("source {0} not found")]
    SourceNotFound(Uuid),
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait Repository: Send + Sync {
    /// Sources in dispatch order (see [`dispatch_order`]).
    async fn list_sources_by_priority(&self) -> StoreResult<Vec<Source>>;

    async fn insert_item_if_absent(&self, item: Item) -> StoreResult<InsertOutcome>;

    async fn list_subscribers(&self, source_id: Uuid) -> StoreResult<Vec<SubscriberId>>;

    async fn mark_source_fetched(&self, source_id: Uuid, at: DateTime<Utc>) -> StoreResult<()>;
}

/// Priority descending, then stalest first. Never-fetched sources count as
/// the stalest of all.
pub fn dispatch_order(a: &Source, b: &Source) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| match (a.last_fetched_at, b.last_fetched_at) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(x), Some(y)) => x.cmp(&y),
        })
}
