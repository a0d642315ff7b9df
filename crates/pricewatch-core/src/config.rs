//! Service configuration, loaded from a TOML file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use pricewatch_cdp::{OverflowPolicy, TabConfig};
use serde::{Deserialize, Serialize};

use crate::batch::BatchSettings;
use crate::crawl::CrawlSettings;

pub const DEFAULT_CONFIG_FILE: &str = "pricewatch.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub task: TaskConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub shortener: ShortenerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub dir: PathBuf,
    /// `trace`, `debug`, `info`, `warn`, `error` or `off`.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
            level: "info".to_string(),
        }
    }
}

/// Either `exec` (launch a browser) or `host`/`port` (attach to one).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub exec: Option<String>,
    pub args: Vec<String>,
    pub host: String,
    pub port: u16,
    pub ready_timeout_secs: u64,
    pub event_capacity: usize,
    pub event_overflow: OverflowPolicy,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            exec: None,
            args: Vec::new(),
            host: "127.0.0.1".to_string(),
            port: pricewatch_cdp::DEFAULT_DEBUGGING_PORT,
            ready_timeout_secs: 30,
            event_capacity: 64,
            event_overflow: OverflowPolicy::DropOldest,
        }
    }
}

impl BrowserConfig {
    pub fn tab_config(&self) -> TabConfig {
        TabConfig {
            event_capacity: self.event_capacity,
            overflow: self.event_overflow,
            ..TabConfig::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Rule directory.
    pub rules: PathBuf,
    pub polling_interval_secs: u64,
    pub reserve_timeout_secs: u64,
    pub crawl_timeout_secs: u64,
    /// Maximum passes over a batch.
    pub crawl_retry: u32,
    pub retry_backoff_secs: u64,
    /// Products crawled within this many minutes are skipped; 0 disables.
    pub crawl_duration_mins: u64,
    pub redirect_settle_ms: u64,
    /// Wait for an extraction after its timeout fired, before closing its tab.
    pub grace_ms: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            rules: PathBuf::from("rules"),
            polling_interval_secs: 60,
            reserve_timeout_secs: 5,
            crawl_timeout_secs: 30,
            crawl_retry: 3,
            retry_backoff_secs: 10,
            crawl_duration_mins: 360,
            redirect_settle_ms: 2000,
            grace_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub inbox: PathBuf,
    pub outbox: PathBuf,
    pub dump_dir: Option<PathBuf>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            inbox: PathBuf::from("spool/inbox"),
            outbox: PathBuf::from("spool/outbox"),
            dump_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub path: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("pricewatch.redb"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShortenerConfig {
    /// URL template with a `{url}` placeholder; shortening is off when unset.
    pub endpoint: Option<String>,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at {:?}", path))?;
        Self::parse(&content).with_context(|| format!("Invalid config file at {:?}", path))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.task.crawl_retry == 0 {
            anyhow::bail!("task.crawl_retry must be at least 1");
        }
        if self.task.crawl_timeout_secs == 0 {
            anyhow::bail!("task.crawl_timeout_secs must be positive");
        }
        if self.browser.event_capacity == 0 {
            anyhow::bail!("browser.event_capacity must be positive");
        }
        if let Some(endpoint) = &self.shortener.endpoint
            && !endpoint.contains("{url}")
        {
            anyhow::bail!("shortener.endpoint must contain a {{url}} placeholder");
        }
        Ok(())
    }

    pub fn crawl_settings(&self) -> CrawlSettings {
        CrawlSettings {
            timeout: Duration::from_secs(self.task.crawl_timeout_secs),
            grace: Duration::from_millis(self.task.grace_ms),
            redirect_settle: Duration::from_millis(self.task.redirect_settle_ms),
        }
    }

    pub fn batch_settings(&self) -> BatchSettings {
        BatchSettings {
            max_attempts: self.task.crawl_retry,
            backoff: Duration::from_secs(self.task.retry_backoff_secs),
            dedup_window: (self.task.crawl_duration_mins > 0)
                .then(|| Duration::from_secs(self.task.crawl_duration_mins * 60)),
        }
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.task.polling_interval_secs)
    }

    pub fn reserve_timeout(&self) -> Duration {
        Duration::from_secs(self.task.reserve_timeout_secs)
    }
}
