// src/store/memory.rs
//! In-process repository. Backs the binary's demo mode and the test-suite.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{dispatch_order, InsertOutcome, Repository, StoreError, StoreResult};
use crate::config::{SourceSeed, SubscriptionSeed};
use crate::model::{Item, Source, SubscriberId};

#[derive(Debug, Default)]
pub struct MemoryRepository {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    sources: HashMap<Uuid, Source>,
    /// Keyed by canonical link.
    items: HashMap<String, Item>,
    follows: HashMap<Uuid, HashSet<SubscriberId>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source and return its id.
    pub fn add_source(&self, name: &str, url: &str, priority: i32) -> Uuid {
        let id = Uuid::new_v4();
        let mut inner = self.inner.lock().expect("memory repo mutex poisoned");
        inner.sources.insert(
            id,
            Source {
                id,
                name: name.to_string(),
                url: url.to_string(),
                priority,
                last_fetched_at: None,
            },
        );
        id
    }

    /// Build a repository from configured sources and subscriptions.
    /// Subscriptions naming an unknown source are skipped.
    pub fn from_seed(sources: &[SourceSeed], subscriptions: &[SubscriptionSeed]) -> Self {
        let repo = Self::new();
        for s in sources {
            repo.add_source(&s.name, &s.url, s.priority);
        }
        for sub in subscriptions {
            match repo.source_by_name(&sub.source) {
                Some(src) => repo.follow(sub.subscriber, src.id),
                None => tracing::warn!(source = %sub.source, "subscription to unknown source ignored"),
            }
        }
        repo
    }

    pub fn follow(&self, subscriber: SubscriberId, source_id: Uuid) {
        let mut inner = self.inner.lock().expect("memory repo mutex poisoned");
        inner.follows.entry(source_id).or_default().insert(subscriber);
    }

    pub fn source_by_name(&self, name: &str) -> Option<Source> {
        let inner = self.inner.lock().expect("memory repo mutex poisoned");
        inner.sources.values().find(|s| s.name == name).cloned()
    }

    pub fn source(&self, id: Uuid) -> Option<Source> {
        let inner = self.inner.lock().expect("memory repo mutex poisoned");
        inner.sources.get(&id).cloned()
    }

    pub fn item_count(&self) -> usize {
        self.inner.lock().expect("memory repo mutex poisoned").items.len()
    }

    pub fn items_for(&self, source_id: Uuid) -> Vec<Item> {
        let inner = self.inner.lock().expect("memory repo mutex poisoned");
        let mut out: Vec<Item> = inner
            .items
            .values()
            .filter(|it| it.source_id == source_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.published_at.cmp(&b.published_at));
        out
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn list_sources_by_priority(&self) -> StoreResult<Vec<Source>> {
        let inner = self.inner.lock().expect("memory repo mutex poisoned");
        let mut v: Vec<Source> = inner.sources.values().cloned().collect();
        v.sort_by(dispatch_order);
        Ok(v)
    }

    async fn insert_item_if_absent(&self, item: Item) -> StoreResult<InsertOutcome> {
        let mut inner = self.inner.lock().expect("memory repo mutex poisoned");
        if !inner.sources.contains_key(&item.source_id) {
            return Err(StoreError::SourceNotFound(item.source_id));
        }
        if inner.items.contains_key(&item.link) {
            return Ok(InsertOutcome::Conflict);
        }
        inner.items.insert(item.link.clone(), item);
        Ok(InsertOutcome::Inserted)
    }

    async fn list_subscribers(&self, source_id: Uuid) -> StoreResult<Vec<SubscriberId>> {
        let inner = self.inner.lock().expect("memory repo mutex poisoned");
        Ok(inner
            .follows
            .get(&source_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn mark_source_fetched(&self, source_id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("memory repo mutex poisoned");
        let src = inner
            .sources
            .get_mut(&source_id)
            .ok_or(StoreError::SourceNotFound(source_id))?;
        src.last_fetched_at = Some(at);
        Ok(())
    }
}
