// src/ingest/mod.rs
pub mod fetch;
pub mod scheduler;

use chrono::Utc;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram};
use once_cell::sync::OnceCell;

use crate::model::{FeedEntry, Item, Source};
use crate::store::{InsertOutcome, Repository};

/// One-time metrics registration (so series show up on /metrics).
pub(crate) fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("ingest_cycles_total", "Completed scheduler cycles.");
        describe_counter!(
            "ingest_cycles_skipped_total",
            "Ticks dropped because the previous cycle was still running."
        );
        describe_counter!("ingest_items_inserted_total", "Net-new items stored.");
        describe_counter!(
            "ingest_conflicts_total",
            "Items skipped because their link was already stored."
        );
        describe_counter!("ingest_insert_errors_total", "Item inserts that failed.");
        describe_counter!("ingest_fetch_errors_total", "Source fetch/parse errors.");
        describe_histogram!("ingest_fetch_ms", "Source fetch + parse time in milliseconds.");
        describe_gauge!("ingest_last_cycle_ts", "Unix ts when the last cycle finished.");
    });
}

/// Normalize feed text: decode entities, strip tags, collapse whitespace,
/// cap at `max_chars`.
pub fn normalize_text(s: &str, max_chars: usize) -> String {
    // 1) HTML entity decode
    let mut out = html_escape::decode_html_entities(s).to_string();

    // 2) Strip HTML tags
    static RE_TAGS: OnceCell<regex::Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| regex::Regex::new(r"(?is)</?[^>]+>").unwrap());
    out = re_tags.replace_all(&out, " ").to_string();

    // 3) Collapse whitespace
    static RE_WS: OnceCell<regex::Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| regex::Regex::new(r"\s+").unwrap());
    out = re_ws.replace_all(&out, " ").trim().to_string();

    if out.chars().count() > max_chars {
        out = out.chars().take(max_chars).collect();
    }
    out
}

/// Per-source insert counts for one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestTally {
    pub inserted: usize,
    pub conflicts: usize,
    pub failed: usize,
}

/// Insert every entry independently. A failed insert is logged and skipped;
/// it never stops the remaining entries.
pub async fn ingest_entries(
    repo: &dyn Repository,
    source: &Source,
    entries: Vec<FeedEntry>,
) -> IngestTally {
    let mut tally = IngestTally::default();
    for entry in entries {
        let link = entry.link.clone();
        let item = Item::from_entry(source.id, entry, Utc::now());
        match repo.insert_item_if_absent(item).await {
            Ok(InsertOutcome::Inserted) => {
                tally.inserted += 1;
                tracing::debug!(target: "ingest", source = %source.name, %link, "item stored");
            }
            Ok(InsertOutcome::Conflict) => {
                tally.conflicts += 1;
                tracing::debug!(target: "ingest", source = %source.name, %link, "item already stored, skipping");
            }
            Err(e) => {
                tally.failed += 1;
                tracing::warn!(target: "ingest", source = %source.name, %link, error = %e, "item insert failed");
            }
        }
    }

    counter!("ingest_items_inserted_total").increment(tally.inserted as u64);
    counter!("ingest_conflicts_total").increment(tally.conflicts as u64);
    counter!("ingest_insert_errors_total").increment(tally.failed as u64);
    tally
}
