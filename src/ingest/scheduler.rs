// src/ingest/scheduler.rs
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::ingest::fetch::{FeedFetcher, FetchError};
use crate::ingest::{ensure_metrics_described, ingest_entries, IngestTally};
use crate::model::{NewItemsNotice, Source};
use crate::realtime::HubHandle;
use crate::store::{dispatch_order, Repository};

/// What to do when a tick fires while an earlier cycle is still running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlapPolicy {
    /// Drop the tick and log it.
    #[default]
    Skip,
    /// Start another cycle alongside the running one.
    Allow,
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub overlap: OverlapPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceOutcome {
    Ingested(IngestTally),
    FetchFailed(String),
    /// The task died before reporting.
    Aborted(String),
}

#[derive(Debug, Clone)]
pub struct SourceReport {
    pub source_id: Uuid,
    pub source_name: String,
    pub outcome: SourceOutcome,
}

/// Result of one full pass over all sources.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    /// Source ids in dispatch order.
    pub dispatched: Vec<Uuid>,
    /// In completion order.
    pub sources: Vec<SourceReport>,
    pub elapsed: Duration,
}

impl CycleReport {
    pub fn new_items(&self) -> usize {
        self.sources
            .iter()
            .map(|r| match &r.outcome {
                SourceOutcome::Ingested(t) => t.inserted,
                _ => 0,
            })
            .sum()
    }

    pub fn failures(&self) -> usize {
        self.sources
            .iter()
            .filter(|r| !matches!(r.outcome, SourceOutcome::Ingested(_)))
            .count()
    }

    pub fn outcome_for(&self, source_id: Uuid) -> Option<&SourceOutcome> {
        self.sources
            .iter()
            .find(|r| r.source_id == source_id)
            .map(|r| &r.outcome)
    }
}

/// Periodic fetch-and-ingest driver. Cloning shares the in-flight counter.
#[derive(Clone)]
pub struct Scheduler {
    repo: Arc<dyn Repository>,
    fetcher: Arc<dyn FeedFetcher>,
    hub: HubHandle,
    cfg: SchedulerConfig,
    fetch_timeout: Duration,
    in_flight: Arc<AtomicUsize>,
}

struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Scheduler {
    pub fn new(
        repo: Arc<dyn Repository>,
        fetcher: Arc<dyn FeedFetcher>,
        hub: HubHandle,
        cfg: SchedulerConfig,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            repo,
            fetcher,
            hub,
            cfg,
            fetch_timeout,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn cycles_in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Tick loop. Stops ticking when `shutdown` fires; cycles already
    /// running are left to finish.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            ensure_metrics_described();
            tracing::info!(target: "ingest", interval = ?self.cfg.interval, overlap = ?self.cfg.overlap, "scheduler started");
            let mut ticker = tokio::time::interval(self.cfg.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let _ = self.try_start_cycle();
                    }
                }
            }
            tracing::info!(target: "ingest", "scheduler stopped");
        })
    }

    /// Start a cycle in the background unless the overlap policy forbids it.
    pub fn try_start_cycle(&self) -> Option<JoinHandle<anyhow::Result<CycleReport>>> {
        let previous = self.in_flight.fetch_add(1, Ordering::AcqRel);
        let guard = InFlightGuard(self.in_flight.clone());
        if previous > 0 {
            match self.cfg.overlap {
                OverlapPolicy::Skip => {
                    tracing::warn!(target: "ingest", running = previous, "previous cycle still running, skipping tick");
                    counter!("ingest_cycles_skipped_total").increment(1);
                    return None;
                }
                OverlapPolicy::Allow => {
                    tracing::info!(target: "ingest", running = previous, "starting overlapping cycle");
                }
            }
        }

        let this = self.clone();
        Some(tokio::spawn(async move {
            let _guard = guard;
            let res = this.run_cycle().await;
            if let Err(e) = &res {
                tracing::error!(target: "ingest", error = ?e, "cycle aborted");
            }
            res
        }))
    }

    /// One full pass: list, order, fan out one task per source, wait for all.
    pub async fn run_cycle(&self) -> anyhow::Result<CycleReport> {
        ensure_metrics_described();
        let t0 = Instant::now();

        let mut sources = self.repo.list_sources_by_priority().await?;
        sources.sort_by(dispatch_order);
        tracing::info!(target: "ingest", sources = sources.len(), "cycle started");

        let mut report = CycleReport {
            dispatched: sources.iter().map(|s| s.id).collect(),
            ..CycleReport::default()
        };

        let mut tasks = JoinSet::new();
        let mut names = HashMap::with_capacity(sources.len());
        for source in sources {
            let label = (source.id, source.name.clone());
            let handle = tasks.spawn(process_source(
                self.repo.clone(),
                self.fetcher.clone(),
                self.hub.clone(),
                source,
                self.fetch_timeout,
            ));
            names.insert(handle.id(), label);
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(r) => report.sources.push(r),
                Err(e) => {
                    let (source_id, source_name) = names.remove(&e.id()).unwrap_or_default();
                    tracing::error!(target: "ingest", source = %source_name, error = %e, "source task died");
                    report.sources.push(SourceReport {
                        source_id,
                        source_name,
                        outcome: SourceOutcome::Aborted(e.to_string()),
                    });
                }
            }
        }

        report.elapsed = t0.elapsed();
        counter!("ingest_cycles_total").increment(1);
        gauge!("ingest_last_cycle_ts").set(Utc::now().timestamp() as f64);
        tracing::info!(
            target: "ingest",
            new_items = report.new_items(),
            failed = report.failures(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "cycle finished"
        );
        Ok(report)
    }
}

async fn process_source(
    repo: Arc<dyn Repository>,
    fetcher: Arc<dyn FeedFetcher>,
    hub: HubHandle,
    source: Source,
    fetch_timeout: Duration,
) -> SourceReport {
    let fetched = tokio::time::timeout(fetch_timeout, fetcher.fetch(&source.url))
        .await
        .unwrap_or(Err(FetchError::Timeout(fetch_timeout)));

    let entries = match fetched {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(target: "ingest", source = %source.name, url = %source.url, error = %e, "fetch failed");
            counter!("ingest_fetch_errors_total").increment(1);
            return SourceReport {
                source_id: source.id,
                source_name: source.name,
                outcome: SourceOutcome::FetchFailed(e.to_string()),
            };
        }
    };

    let tally = ingest_entries(repo.as_ref(), &source, entries).await;

    if let Err(e) = repo.mark_source_fetched(source.id, Utc::now()).await {
        tracing::warn!(target: "ingest", source = %source.name, error = %e, "could not stamp source as fetched");
    }

    if tally.inserted > 0 {
        notify_followers(repo.as_ref(), &hub, &source, tally.inserted).await;
    }

    tracing::debug!(
        target: "ingest",
        source = %source.name,
        inserted = tally.inserted,
        conflicts = tally.conflicts,
        failed = tally.failed,
        "source done"
    );

    SourceReport {
        source_id: source.id,
        source_name: source.name,
        outcome: SourceOutcome::Ingested(tally),
    }
}

async fn notify_followers(repo: &dyn Repository, hub: &HubHandle, source: &Source, new_items: usize) {
    let followers = match repo.list_subscribers(source.id).await {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(target: "ingest", source = %source.name, error = %e, "could not resolve followers");
            return;
        }
    };
    if followers.is_empty() {
        return;
    }
    match serde_json::to_vec(&NewItemsNotice::new(source, new_items)) {
        Ok(body) => hub.submit_to(&followers, Bytes::from(body)),
        Err(e) => tracing::error!(target: "ingest", error = %e, "notice serialization failed"),
    }
}
