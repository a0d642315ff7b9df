//! Pricewatch core: rule-driven product crawling on top of `pricewatch-cdp`.
//!
//! - [`rules`] loads per-site rules and resolves URLs against them
//! - [`crawl`] drives browser tabs to normalize URLs and extract products
//! - [`batch`] applies the retry policy to whole batches
//! - [`runner`] connects batches to the job queue
//! - [`cache`], [`queue`] and [`shortener`] are the external collaborators

pub mod batch;
pub mod cache;
pub mod config;
pub mod crawl;
pub mod error;
pub mod message;
pub mod parse;
pub mod queue;
pub mod rules;
pub mod runner;
pub mod shortener;

pub use batch::{BatchProcessor, BatchSettings, Outcome, retry_batch};
pub use cache::{ProductCache, RedbProductCache};
pub use config::AppConfig;
pub use crawl::{CrawlEngine, CrawlSettings, Crawler};
pub use error::RuleError;
pub use queue::{Job, JobQueue, SpoolQueue};
pub use rules::{Rule, RuleSet};
pub use runner::{Runner, RunnerSettings};
pub use shortener::{HttpShortener, NoopShortener, UrlShortener};

use std::sync::Arc;

use anyhow::{Context, Result};
use pricewatch_cdp::Browser;
use tracing::{info, warn};

use config::BrowserConfig;

/// Browser connection and crawler built from one configuration.
pub struct AppCore {
    pub config: AppConfig,
    pub browser: Browser,
    pub crawler: Arc<Crawler>,
}

impl AppCore {
    /// Load the rules, then launch or attach to the browser.
    pub async fn new(config: AppConfig) -> Result<Self> {
        let rules = RuleSet::load(&config.task.rules)
            .with_context(|| format!("Failed to load rules from {:?}", config.task.rules))?;
        let browser = connect_browser(&config.browser).await?;
        let crawler = Arc::new(Crawler::new(
            browser.clone(),
            rules,
            config.crawl_settings(),
        ));
        Ok(Self {
            config,
            browser,
            crawler,
        })
    }

    /// Reload the rule directory. The current rules stay in place on failure.
    pub fn reload_rules(&self) -> Result<usize> {
        let rules = RuleSet::load(&self.config.task.rules)
            .with_context(|| format!("Failed to reload rules from {:?}", self.config.task.rules))?;
        let count = rules.len();
        self.crawler.replace_rules(rules);
        Ok(count)
    }

    /// Wire the queue, cache and shortener around the crawler.
    pub async fn runner(&self) -> Result<Runner> {
        let config = &self.config;
        let queue = SpoolQueue::open(&config.queue.inbox, &config.queue.outbox)
            .await
            .context("Failed to open job spool")?;
        let cache = RedbProductCache::open(&config.cache.path)?;
        let shortener: Arc<dyn UrlShortener> = match &config.shortener.endpoint {
            Some(endpoint) => Arc::new(HttpShortener::new(endpoint.as_str())?),
            None => Arc::new(NoopShortener),
        };

        let batch = BatchProcessor::new(
            self.crawler.clone(),
            Arc::new(cache),
            shortener,
            config.batch_settings(),
        );
        Ok(Runner::new(
            Arc::new(queue),
            batch,
            RunnerSettings {
                polling_interval: config.polling_interval(),
                reserve_timeout: config.reserve_timeout(),
                dump_dir: config.queue.dump_dir.clone(),
            },
        ))
    }

    /// Ask a launched browser to exit. An attached browser is left running.
    pub async fn shutdown(&self) {
        if self.config.browser.exec.is_none() {
            return;
        }
        if let Err(err) = self.browser.shutdown().await {
            warn!(error = %err, "failed to close browser");
        }
    }
}

/// Launch the configured browser, or attach to a running one, and wait until
/// its debugging endpoint answers.
pub async fn connect_browser(config: &BrowserConfig) -> Result<Browser> {
    let browser = match &config.exec {
        Some(exec) => Browser::launch(exec, &config.args)
            .with_context(|| format!("Failed to launch browser {}", exec))?,
        None => Browser::attach(&config.host, config.port)?,
    }
    .with_tab_config(config.tab_config());

    let version = browser
        .wait_until_ready(std::time::Duration::from_secs(config.ready_timeout_secs))
        .await
        .with_context(|| format!("Browser at {} is not answering", browser.base_url()))?;
    info!(
        browser = %version.browser,
        protocol = %version.protocol_version,
        endpoint = %browser.base_url(),
        "browser ready"
    );
    Ok(browser)
}
