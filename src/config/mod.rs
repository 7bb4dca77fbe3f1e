// src/config/mod.rs
//! Process settings: poll cadence, admission budget, realtime liveness and
//! the seed data for the in-memory repository.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ingest::scheduler::{OverlapPolicy, SchedulerConfig};
use crate::realtime::SessionConfig;

pub const ENV_CONFIG_PATH: &str = "FEEDHUB_CONFIG_PATH";
pub const DEFAULT_TOML_PATH: &str = "config/feedhub.toml";
pub const DEFAULT_JSON_PATH: &str = "config/feedhub.json";

const ENV_FETCH_INTERVAL: &str = "FEEDHUB_FETCH_INTERVAL_SECS";
const ENV_RATE_RPM: &str = "FEEDHUB_RATE_LIMIT_RPM";
const ENV_RATE_BURST: &str = "FEEDHUB_RATE_LIMIT_BURST";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub fetch_interval_secs: u64,
    pub fetch_timeout_secs: u64,
    pub overlap: OverlapPolicy,
    pub rate_limit: RateLimitSettings,
    pub realtime: RealtimeSettings,
    pub sources: Vec<SourceSeed>,
    pub subscriptions: Vec<SubscriptionSeed>,
    /// Session token -> subscriber id.
    pub tokens: HashMap<String, Uuid>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            fetch_interval_secs: 60,
            fetch_timeout_secs: 10,
            overlap: OverlapPolicy::default(),
            rate_limit: RateLimitSettings::default(),
            realtime: RealtimeSettings::default(),
            sources: Vec::new(),
            subscriptions: Vec::new(),
            tokens: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RateLimitSettings {
    pub requests_per_minute: u32,
    pub burst_size: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            burst_size: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RealtimeSettings {
    pub queue_capacity: usize,
    pub pong_wait_secs: u64,
    /// Defaults to 9/10 of `pong_wait_secs`.
    pub ping_period_secs: Option<u64>,
    pub write_wait_secs: u64,
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            pong_wait_secs: 60,
            ping_period_secs: None,
            write_wait_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceSeed {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscriptionSeed {
    pub subscriber: Uuid,
    /// Source name as given in `sources`.
    pub source: String,
}

impl RealtimeSettings {
    pub fn session_config(&self) -> SessionConfig {
        let pong_wait = Duration::from_secs(self.pong_wait_secs);
        let ping_period = self
            .ping_period_secs
            .map(Duration::from_secs)
            .unwrap_or(pong_wait * 9 / 10);
        SessionConfig {
            queue_capacity: self.queue_capacity,
            ping_period,
            pong_wait,
            write_wait: Duration::from_secs(self.write_wait_secs),
        }
    }
}

impl Settings {
    /// Load from an explicit path. Supports TOML or JSON formats.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading settings from {}", path.display()))?;
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        Self::parse(&content, ext.as_str())
            .with_context(|| format!("parsing settings in {}", path.display()))
    }

    /// Load using env var + fallbacks, then apply env overrides:
    /// 1) $FEEDHUB_CONFIG_PATH
    /// 2) config/feedhub.toml
    /// 3) config/feedhub.json
    /// 4) built-in defaults
    pub fn load_default() -> Result<Self> {
        let mut settings = match std::env::var(ENV_CONFIG_PATH) {
            Ok(p) => {
                let pb = PathBuf::from(p);
                if !pb.exists() {
                    bail!("{ENV_CONFIG_PATH} points to non-existent path {}", pb.display());
                }
                Self::load_from(&pb)?
            }
            Err(_) => {
                let toml_p = PathBuf::from(DEFAULT_TOML_PATH);
                let json_p = PathBuf::from(DEFAULT_JSON_PATH);
                if toml_p.exists() {
                    Self::load_from(&toml_p)?
                } else if json_p.exists() {
                    Self::load_from(&json_p)?
                } else {
                    Self::default()
                }
            }
        };
        settings.apply_overrides(|k| std::env::var(k).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    fn parse(s: &str, hint_ext: &str) -> Result<Self> {
        match hint_ext {
            "json" => Ok(serde_json::from_str(s)?),
            "toml" => Ok(toml::from_str(s)?),
            // Unknown extension: try TOML, then JSON.
            _ => toml::from_str(s)
                .map_err(anyhow::Error::from)
                .or_else(|_| serde_json::from_str(s).map_err(anyhow::Error::from))
                .map_err(|_| anyhow!("unsupported settings format")),
        }
    }

    /// Apply `FEEDHUB_*` overrides through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_FETCH_INTERVAL) {
            self.fetch_interval_secs = v
                .trim()
                .parse()
                .with_context(|| format!("{ENV_FETCH_INTERVAL}={v}"))?;
        }
        if let Some(v) = lookup(ENV_RATE_RPM) {
            self.rate_limit.requests_per_minute =
                v.trim().parse().with_context(|| format!("{ENV_RATE_RPM}={v}"))?;
        }
        if let Some(v) = lookup(ENV_RATE_BURST) {
            self.rate_limit.burst_size =
                v.trim().parse().with_context(|| format!("{ENV_RATE_BURST}={v}"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.fetch_interval_secs == 0 {
            bail!("fetch_interval_secs must be > 0");
        }
        if self.fetch_timeout_secs == 0 {
            bail!("fetch_timeout_secs must be > 0");
        }
        if self.rate_limit.burst_size == 0 {
            bail!("rate_limit.burst_size must be > 0");
        }
        if self.realtime.queue_capacity == 0 {
            bail!("realtime.queue_capacity must be > 0");
        }
        let session = self.realtime.session_config();
        if session.ping_period.is_zero() || session.ping_period >= session.pong_wait {
            bail!("realtime ping period must be > 0 and shorter than pong_wait_secs");
        }
        for sub in &self.subscriptions {
            if !self.sources.iter().any(|s| s.name == sub.source) {
                bail!("subscription references unknown source {:?}", sub.source);
            }
        }
        Ok(())
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            interval: Duration::from_secs(self.fetch_interval_secs),
            overlap: self.overlap,
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}
