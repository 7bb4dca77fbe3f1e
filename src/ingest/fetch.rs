// src/ingest/fetch.rs
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::histogram;
use once_cell::sync::OnceCell;
use quick_xml::de::from_str;
use quick_xml::events::Event;
use quick_xml::Reader;
use regex::{Captures, Regex};
use serde::Deserialize;
use time::format_description::well_known::{Rfc2822, Rfc3339};
use time::OffsetDateTime;

use crate::model::FeedEntry;

const MAX_TITLE_CHARS: usize = 500;
const MAX_DESCRIPTION_CHARS: usize = 1500;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
    #[error("http transport error: {0}")]
    Http(#[source] reqwest::Error),
    #[error("unexpected http status {0}")]
    Status(u16),
    #[error("feed parse error: {0}")]
    Parse(String),
}

/// Retrieves a source locator and turns it into normalized entries.
#[async_trait]
pub trait FeedFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<FeedEntry>, FetchError>;
}

/// reqwest-backed fetcher. Every request is bounded by `timeout`.
#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("feedhub/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(FetchError::Http)?;
        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl FeedFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<FeedEntry>, FetchError> {
        let t0 = Instant::now();
        let resp = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout(self.timeout)
            } else {
                FetchError::Http(e)
            }
        })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        let body = resp.text().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout(self.timeout)
            } else {
                FetchError::Http(e)
            }
        })?;
        let out = parse_feed(&body, Utc::now());
        histogram!("ingest_fetch_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
        out
    }
}

// --- RSS 2.0 ---

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}
#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    item: Vec<RssItem>,
}
#[derive(Debug, Deserialize)]
struct RssItem {
    title: Option<String>,
    link: Option<String>,
    guid: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    description: Option<String>,
}

// --- Atom ---

#[derive(Debug, Deserialize)]
struct AtomFeed {
    #[serde(rename = "entry", default)]
    entry: Vec<AtomEntry>,
}
#[derive(Debug, Deserialize)]
struct AtomEntry {
    title: Option<AtomText>,
    #[serde(default)]
    link: Vec<AtomLink>,
    summary: Option<AtomText>,
    content: Option<AtomText>,
    published: Option<String>,
    updated: Option<String>,
}
#[derive(Debug, Deserialize)]
struct AtomText {
    #[serde(rename = "$text", default)]
    value: String,
}
#[derive(Debug, Deserialize)]
struct AtomLink {
    #[serde(rename = "@href", default)]
    href: Option<String>,
    #[serde(rename = "@rel", default)]
    rel: Option<String>,
}

/// Parse an RSS 2.0 or Atom document. `now` stands in for missing or
/// unparsable publish dates.
pub fn parse_feed(xml: &str, now: DateTime<Utc>) -> Result<Vec<FeedEntry>, FetchError> {
    let xml_clean = scrub_html_entities_for_xml(xml);
    match root_element(&xml_clean).as_deref() {
        Some("rss") => parse_rss(&xml_clean, now),
        Some("feed") => parse_atom(&xml_clean, now),
        Some(other) => Err(FetchError::Parse(format!("unsupported root element <{other}>"))),
        None => Err(FetchError::Parse("empty document".into())),
    }
}

fn parse_rss(xml: &str, now: DateTime<Utc>) -> Result<Vec<FeedEntry>, FetchError> {
    let rss: Rss = from_str(xml).map_err(|e| FetchError::Parse(e.to_string()))?;
    let mut out = Vec::with_capacity(rss.channel.item.len());
    for it in rss.channel.item {
        // Some feeds only carry a permalink guid.
        let Some(link) = non_empty(it.link).or_else(|| non_empty(it.guid).filter(|g| g.starts_with("http")))
        else {
            continue;
        };
        out.push(FeedEntry {
            title: clean_text(it.title.as_deref().unwrap_or_default(), MAX_TITLE_CHARS),
            link,
            description: it
                .description
                .map(|d| clean_text(&d, MAX_DESCRIPTION_CHARS))
                .filter(|d| !d.is_empty()),
            published_at: it
                .pub_date
                .as_deref()
                .and_then(parse_rfc2822)
                .unwrap_or(now),
        });
    }
    Ok(out)
}

fn parse_atom(xml: &str, now: DateTime<Utc>) -> Result<Vec<FeedEntry>, FetchError> {
    let feed: AtomFeed = from_str(xml).map_err(|e| FetchError::Parse(e.to_string()))?;
    let mut out = Vec::with_capacity(feed.entry.len());
    for en in feed.entry {
        // Links without an href (e.g. bare rel="replies") are ignored.
        let usable: Vec<(&str, Option<&str>)> = en
            .link
            .iter()
            .filter_map(|l| {
                let href = l.href.as_deref()?.trim();
                (!href.is_empty()).then_some((href, l.rel.as_deref()))
            })
            .collect();
        let link = usable
            .iter()
            .find(|(_, rel)| matches!(rel, None | Some("alternate")))
            .or_else(|| usable.first())
            .map(|(href, _)| href.to_string());
        let Some(link) = link else {
            continue;
        };
        let description = en
            .summary
            .or(en.content)
            .map(|t| clean_text(&t.value, MAX_DESCRIPTION_CHARS))
            .filter(|d| !d.is_empty());
        out.push(FeedEntry {
            title: en
                .title
                .map(|t| clean_text(&t.value, MAX_TITLE_CHARS))
                .unwrap_or_default(),
            link,
            description,
            published_at: en
                .published
                .or(en.updated)
                .as_deref()
                .and_then(|ts| parse_timestamp(ts, &Rfc3339))
                .unwrap_or(now),
        });
    }
    Ok(out)
}

fn root_element(xml: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                return Some(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
            }
            Ok(Event::Eof) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

fn parse_timestamp<F>(ts: &str, format: &F) -> Option<DateTime<Utc>>
where
    F: time::parsing::Parsable + ?Sized,
{
    let dt = OffsetDateTime::parse(ts.trim(), format).ok()?;
    DateTime::from_timestamp(dt.unix_timestamp(), dt.nanosecond())
}

/// RFC 2822 with the obsolete `GMT`/`UT` zone names many feeds still emit.
fn parse_rfc2822(ts: &str) -> Option<DateTime<Utc>> {
    let ts = ts.trim();
    parse_timestamp(ts, &Rfc2822).or_else(|| {
        let base = ts
            .strip_suffix(" GMT")
            .or_else(|| ts.strip_suffix(" UT"))
            .or_else(|| ts.strip_suffix(" Z"))?;
        parse_timestamp(&format!("{base} +0000"), &Rfc2822)
    })
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn clean_text(s: &str, max_chars: usize) -> String {
    crate::ingest::normalize_text(s, max_chars)
}

/// XML only predefines five named entities. Rewrite every other HTML named
/// entity (`&hellip;`, `&eacute;`, ...) as a numeric reference so the XML
/// parser accepts it; names HTML does not know either are kept as literal text.
fn scrub_html_entities_for_xml(s: &str) -> String {
    static RE_ENTITY: OnceCell<Regex> = OnceCell::new();
    let re = RE_ENTITY.get_or_init(|| Regex::new(r"&([A-Za-z][A-Za-z0-9]{1,31});").unwrap());
    re.replace_all(s, |caps: &Captures| {
        let whole = &caps[0];
        if matches!(&caps[1], "amp" | "lt" | "gt" | "quot" | "apos") {
            return whole.to_string();
        }
        let decoded = html_escape::decode_html_entities(whole);
        if decoded == whole {
            format!("&amp;{}", &whole[1..])
        } else {
            decoded.chars().map(|c| format!("&#{};", c as u32)).collect()
        }
    })
    .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn rss_items_with_missing_date_fall_back_to_now() {
        let xml = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>x</title>
  <item><title>One</title><link>https://x/1</link><pubDate>Tue, 10 Jun 2003 04:00:00 GMT</pubDate></item>
  <item><title>Two&nbsp;words</title><link>https://x/2</link></item>
</channel></rss>"#;
        let out = parse_feed(xml, now()).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].published_at, Utc.with_ymd_and_hms(2003, 6, 10, 4, 0, 0).unwrap());
        assert_eq!(out[1].title, "Two words");
        assert_eq!(out[1].published_at, now());
    }

    #[test]
    fn rss_item_without_link_uses_permalink_guid_or_is_dropped() {
        let xml = r#"<rss><channel>
  <item><title>guid only</title><guid>https://x/g</guid></item>
  <item><title>nothing</title><guid>tag:abc</guid></item>
</channel></rss>"#;
        let out = parse_feed(xml, now()).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].link, "https://x/g");
    }

    #[test]
    fn atom_prefers_alternate_link() {
        let xml = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Blog</title>
  <entry>
    <title type="html">Hello &amp;amp; welcome</title>
    <link rel="self" href="https://x/self"/>
    <link rel="alternate" href="https://x/post"/>
    <updated>2024-03-01T12:00:00Z</updated>
    <summary>Short</summary>
  </entry>
</feed>"#;
        let out = parse_feed(xml, now()).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].link, "https://x/post");
        assert_eq!(out[0].title, "Hello & welcome");
        assert_eq!(out[0].description.as_deref(), Some("Short"));
        assert_eq!(out[0].published_at, Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
    }

    #[test]
    fn html_named_entities_are_accepted() {
        let xml = r#"<rss><channel>
  <item><title>Caf&eacute; &copy; 2024</title><link>https://x/1</link></item>
  <item><title>Wait for it&hellip;</title><link>https://x/2</link></item>
  <item><title>Tom &amp; Jerry &bogus;</title><link>https://x/3</link></item>
</channel></rss>"#;
        let out = parse_feed(xml, now()).unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].title, "Café © 2024");
        assert_eq!(out[1].title, "Wait for it…");
        assert_eq!(out[2].title, "Tom & Jerry &bogus;");
    }

    #[test]
    fn atom_link_without_href_is_skipped() {
        let xml = r#"<feed xmlns="http://www.w3.org/2005/Atom">
  <entry>
    <title>Replies first</title>
    <link rel="replies"/>
    <link rel="alternate" href="https://x/a"/>
  </entry>
  <entry>
    <title>No usable link</title>
    <link rel="replies"/>
  </entry>
</feed>"#;
        let out = parse_feed(xml, now()).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].link, "https://x/a");
    }

    #[test]
    fn unknown_root_is_a_parse_error() {
        let err = parse_feed("<html><body/></html>", now()).unwrap_err();
        assert!(matches!(err, FetchError::Parse(_)));
    }
}
