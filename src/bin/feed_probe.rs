//! Fetch one feed URL and print the normalized entries (no storage involved).
//!
//! Usage: `cargo run --bin feed_probe -- https://blog.rust-lang.org/feed.xml`

use std::time::Duration;

use feedhub::ingest::fetch::{FeedFetcher, HttpFetcher};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_target(false).init();

    let url = std::env::args()
        .nth(1)
        .ok_or_else(|| anyhow::anyhow!("usage: feed_probe <url>"))?;

    let fetcher = HttpFetcher::new(Duration::from_secs(10))?;
    let entries = fetcher.fetch(&url).await?;
    for e in &entries {
        println!("{}  {}  {}", e.published_at.to_rfc3339(), e.link, e.title);
    }
    println!("{} entries", entries.len());
    Ok(())
}
