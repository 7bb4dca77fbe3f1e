// src/model.rs
//! Domain records shared by ingestion, storage and the realtime hub.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a subscriber (a user that may hold a live connection).
pub type SubscriberId = Uuid;

/// A polled content feed. Owned by storage; the core only reads it and
/// stamps `last_fetched_at` after each successful fetch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Source {
    pub id: Uuid,
    pub name: String,
    pub url: String,
    /// Higher is fetched earlier.
    pub priority: i32,
    /// `None` means the source was never fetched.
    pub last_fetched_at: Option<DateTime<Utc>>,
}

/// One normalized entry as produced by the fetcher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeedEntry {
    pub title: String,
    pub link: String,
    pub description: Option<String>,
    pub published_at: DateTime<Utc>,
}

/// A stored item. The link is the global idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Item {
    pub id: Uuid,
    pub source_id: Uuid,
    pub link: String,
    pub title: String,
    pub description: Option<String>,
    pub published_at: DateTime<Utc>,
    pub ingested_at: DateTime<Utc>,
}

impl Item {
    pub fn from_entry(source_id: Uuid, entry: FeedEntry, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_id,
            link: entry.link,
            title: entry.title,
            description: entry.description,
            published_at: entry.published_at,
            ingested_at: now,
        }
    }
}

/// Message pushed to followers when a cycle found new items for a source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewItemsNotice {
    #[serde(rename = "type")]
    pub kind: String,
    pub source_id: Uuid,
    pub source_name: String,
    pub new_items: usize,
}

impl NewItemsNotice {
    pub fn new(source: &Source, new_items: usize) -> Self {
        Self {
            kind: "new_items".to_string(),
            source_id: source.id,
            source_name: source.name.clone(),
            new_items,
        }
    }
}
