// tests/common/mod.rs
// Shared stubs for the integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feedhub::ingest::fetch::{FeedFetcher, FetchError};
use feedhub::model::{FeedEntry, Item, Source, SubscriberId};
use feedhub::store::{InsertOutcome, MemoryRepository, Repository, StoreError, StoreResult};
use tokio::sync::Semaphore;
use uuid::Uuid;

pub fn entry(link: &str) -> FeedEntry {
    FeedEntry {
        title: format!("title for {link}"),
        link: link.to_string(),
        description: None,
        published_at: Utc::now(),
    }
}

enum Canned {
    Entries(Vec<FeedEntry>),
    Fail,
    Hang,
    Panic,
}

/// Fetcher answering from a URL table. Records the order of fetch calls and
/// can hold every call until the gate is opened.
#[derive(Default)]
pub struct StubFetcher {
    table: Mutex<HashMap<String, Canned>>,
    calls: Mutex<Vec<String>>,
    gate: Option<Arc<Semaphore>>,
}

impl StubFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every fetch waits for a permit from `gate` first.
    pub fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    pub fn serve(&self, url: &str, links: &[&str]) {
        let entries = links.iter().map(|l| entry(l)).collect();
        self.table
            .lock()
            .unwrap()
            .insert(url.to_string(), Canned::Entries(entries));
    }

    pub fn fail(&self, url: &str) {
        self.table.lock().unwrap().insert(url.to_string(), Canned::Fail);
    }

    pub fn hang(&self, url: &str) {
        self.table.lock().unwrap().insert(url.to_string(), Canned::Hang);
    }

    /// The fetch task for `url` panics.
    pub fn panic_on(&self, url: &str) {
        self.table.lock().unwrap().insert(url.to_string(), Canned::Panic);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl FeedFetcher for StubFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<FeedEntry>, FetchError> {
        self.calls.lock().unwrap().push(url.to_string());
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await.expect("gate closed");
        }
        let (canned, blow_up) = {
            let table = self.table.lock().unwrap();
            match table.get(url) {
                Some(Canned::Entries(v)) => (Some(Ok(v.clone())), false),
                Some(Canned::Fail) => (Some(Err(FetchError::Status(503))), false),
                Some(Canned::Hang) => (None, false),
                Some(Canned::Panic) => (None, true),
                None => (Some(Err(FetchError::Status(404))), false),
            }
        };
        // Outside the lock, so the table is not poisoned for sibling fetches.
        if blow_up {
            panic!("feed handler blew up for {url}");
        }
        match canned {
            Some(res) => res,
            None => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Vec::new())
            }
        }
    }
}

/// Wraps a [`MemoryRepository`] and fails inserts for chosen links.
pub struct FlakyRepo {
    pub inner: MemoryRepository,
    pub failing_links: Vec<String>,
}

#[async_trait]
impl Repository for FlakyRepo {
    async fn list_sources_by_priority(&self) -> StoreResult<Vec<Source>> {
        self.inner.list_sources_by_priority().await
    }

    async fn insert_item_if_absent(&self, item: Item) -> StoreResult<InsertOutcome> {
        if self.failing_links.contains(&item.link) {
            return Err(StoreError::Unavailable("disk full".into()));
        }
        self.inner.insert_item_if_absent(item).await
    }

    async fn list_subscribers(&self, source_id: Uuid) -> StoreResult<Vec<SubscriberId>> {
        self.inner.list_subscribers(source_id).await
    }

    async fn mark_source_fetched(&self, source_id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        self.inner.mark_source_fetched(source_id, at).await
    }
}
