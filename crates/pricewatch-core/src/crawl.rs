//! Crawl Orchestrator.
//!
//! Each page visit runs in its own task on a fresh tab:
//!
//! ```text
//! open tab -> subscribe load -> enable page -> navigate -> wait for load
//!          -> read page -> done
//! ```
//!
//! The visit is bounded by [`CrawlSettings::timeout`]. On expiry a synthetic
//! load event is injected so a task still waiting for the page reaches its
//! terminal state with whatever it has built so far. A task busy with scripts
//! gets [`CrawlSettings::grace`] to finish before the tab is closed under it,
//! which fails its pending calls. Either way the tab is closed exactly once.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use pricewatch_cdp::{Browser, Event, Tab, methods};
use pricewatch_models::{Message, Product};
use tracing::{debug, info, warn};

use crate::message::{candidate_url, unescape_html};
use crate::parse::{apply_failure, apply_field};
use crate::rules::{Rule, RuleSet};

const DOCUMENT_URL: &str = "document.URL";

/// Timing of a single page visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrawlSettings {
    /// Upper bound for load plus extraction.
    pub timeout: Duration,
    /// How long a timed-out visit may keep running before its tab is closed.
    pub grace: Duration,
    /// Pause after the load event before reading `document.URL`, so that
    /// script-driven redirects can finish.
    pub redirect_settle: Duration,
}

impl Default for CrawlSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            grace: Duration::from_secs(2),
            redirect_settle: Duration::from_secs(2),
        }
    }
}

/// What the batch layer needs from a crawler.
///
/// `None` means there was nothing to crawl and retrying is pointless. A
/// product without an id is a failed attempt that may succeed later.
#[async_trait]
pub trait CrawlEngine: Send + Sync {
    async fn crawl_message(&self, message: &Message) -> Option<Product>;
    async fn crawl_product(&self, product: &Product) -> Option<Product>;
}

/// Drives browser tabs according to the loaded rules.
pub struct Crawler {
    browser: Browser,
    rules: RwLock<Arc<RuleSet>>,
    settings: CrawlSettings,
}

/// URLs read from a page while normalizing.
#[derive(Debug, Default)]
struct PageUrls {
    document: String,
    scripted: Option<String>,
}

impl Crawler {
    pub fn new(browser: Browser, rules: RuleSet, settings: CrawlSettings) -> Self {
        Self {
            browser,
            rules: RwLock::new(Arc::new(rules)),
            settings,
        }
    }

    /// Snapshot of the current rule set.
    pub fn rules(&self) -> Arc<RuleSet> {
        self.rules.read().clone()
    }

    /// Swap in a new rule set. Crawls already running keep their snapshot.
    pub fn replace_rules(&self, rules: RuleSet) {
        let count = rules.len();
        *self.rules.write() = Arc::new(rules);
        info!(count, "rule set replaced");
    }

    pub fn settings(&self) -> CrawlSettings {
        self.settings
    }

    /// Resolve `url` to a canonical product URL.
    ///
    /// A chain that rewrites the URL text is tried first. Otherwise the page is
    /// loaded and its final `document.URL` (and the chain's page script, if
    /// any) are resolved instead. Falls back to `url` itself.
    pub async fn normalize(&self, url: &str) -> String {
        let rules = self.rules();
        if let Some(resolved) = settle(&rules, url) {
            debug!(url, resolved = %resolved, "normalized without loading");
            return resolved;
        }

        let page = self
            .visit(url, {
                let rules = rules.clone();
                let target = url.to_string();
                let settle_delay = self.settings.redirect_settle;
                move |tab| read_page_urls(tab, target, rules, settle_delay)
            })
            .await
            .unwrap_or_default();
        if page.document.is_empty() {
            debug!(url, "page gave no document URL");
            return url.to_string();
        }

        let scripted = page.scripted.as_deref();
        if let Some(resolved) = scripted.and_then(|scripted| settle(&rules, scripted)) {
            return resolved;
        }
        if let Some(resolved) = settle(&rules, &page.document) {
            return resolved;
        }
        if rules.find_rule(&page.document).is_none() {
            return page.document;
        }
        url.to_string()
    }

    /// Extract a product from an already canonical URL.
    ///
    /// Always returns a product; one without an id means the attempt failed.
    pub async fn crawl(&self, url: &str) -> Product {
        let rules = self.rules();
        let Some(rule) = rules.find_rule(url).cloned() else {
            debug!(url, "no rule matches");
            return Product::new();
        };

        let owned = url.to_string();
        self.visit(url, move |tab| extract(tab, owned, rule))
            .await
            .unwrap_or_default()
    }

    /// Normalize `url`, then crawl the result.
    pub async fn crawl_url(&self, url: &str) -> Product {
        let canonical = self.normalize(url).await;
        self.crawl(&canonical).await
    }

    /// Run `job` against a fresh tab under the visit timeout.
    ///
    /// Returns `None` when no tab could be opened or the job panicked.
    async fn visit<T, F, Fut>(&self, url: &str, job: F) -> Option<T>
    where
        F: FnOnce(Tab) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let tab = match self.browser.new_tab().await {
            Ok(tab) => tab,
            Err(err) => {
                warn!(url, error = %err, "failed to open tab");
                return None;
            }
        };

        let mut task = tokio::spawn(job(tab.clone()));
        let joined = match tokio::time::timeout(self.settings.timeout, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                debug!(url, tab = %tab.id(), "visit timed out, injecting load event");
                tab.inject(Event::injected(methods::PAGE_LOAD_EVENT_FIRED));
                match tokio::time::timeout(self.settings.grace, &mut task).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        debug!(url, tab = %tab.id(), "visit still running, closing tab");
                        tab.close().await;
                        task.await
                    }
                }
            }
        };
        tab.close().await;

        match joined {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(url, error = %err, "page task failed");
                None
            }
        }
    }
}

#[async_trait]
impl CrawlEngine for Crawler {
    async fn crawl_message(&self, message: &Message) -> Option<Product> {
        debug!(message = %message.id, "crawl message");
        let url = candidate_url(message)?;
        Some(self.crawl_url(&url).await)
    }

    async fn crawl_product(&self, product: &Product) -> Option<Product> {
        debug!(product = %product.id, "crawl product");
        if product.url.is_empty() {
            return None;
        }
        Some(self.crawl_url(&unescape_html(&product.url)).await)
    }
}

/// Canonical URL for `url` from the rules alone, if they settle it.
///
/// A matching rule without a matching chain means `url` is already canonical.
fn settle(rules: &RuleSet, url: &str) -> Option<String> {
    match rules.find_chain(url)? {
        (_, None) => Some(url.to_string()),
        (_, Some(chain)) => chain.resolve(url),
    }
}

/// Navigate and wait for the page. `Ok(false)` means the wait ended on an
/// injected event rather than a real load.
async fn load(tab: &Tab, url: &str) -> pricewatch_cdp::Result<bool> {
    tab.subscribe(methods::PAGE_LOAD_EVENT_FIRED);
    tab.enable_page().await?;
    tab.navigate(url).await?;
    Ok(tab
        .wait_for(methods::PAGE_LOAD_EVENT_FIRED)
        .await
        .is_some_and(|event| !event.is_injected()))
}

async fn read_page_urls(
    tab: Tab,
    url: String,
    rules: Arc<RuleSet>,
    settle_delay: Duration,
) -> PageUrls {
    match load(&tab, &url).await {
        Ok(true) => {}
        Ok(false) => return PageUrls::default(),
        Err(err) => {
            debug!(url = %url, error = %err, "page did not load");
            return PageUrls::default();
        }
    }
    tokio::time::sleep(settle_delay).await;

    let document = match tab.evaluate(DOCUMENT_URL).await {
        Ok(value) => value.as_text(),
        Err(err) => {
            debug!(url = %url, error = %err, "failed to read document URL");
            return PageUrls::default();
        }
    };
    let mut page = PageUrls {
        document,
        scripted: None,
    };
    if page.document.is_empty() {
        return page;
    }

    let Some((_, Some(chain))) = rules.find_chain(&page.document) else {
        return page;
    };
    if let Some(script) = &chain.script {
        match tab.evaluate(&script.expression).await {
            Ok(value) => page.scripted = chain.script_url(&value.as_text()),
            Err(err) => debug!(url = %url, error = %err, "chain script failed"),
        }
    }
    page
}

async fn extract(tab: Tab, url: String, rule: Rule) -> Product {
    let mut product = Product::new();
    match load(&tab, &url).await {
        Ok(true) => {}
        Ok(false) => {
            debug!(url = %url, "no page load before timeout");
            return product;
        }
        Err(err) => {
            debug!(url = %url, error = %err, "page did not load");
            return product;
        }
    }

    let Some(id) = rule.extract_id(&url) else {
        debug!(url = %url, rule = %rule.name, "no id in URL");
        return product;
    };
    product.id = id;
    product.url = url;
    product.source = rule.source;
    product.currency = rule.currency;

    for script in &rule.scripts {
        let expression = script.expression_for(&product.id);
        if script.is_async {
            if let Err(err) = tab.evaluate_async(&expression).await {
                debug!(field = %script.name, error = %err, "async script not sent");
                if err.is_closed() {
                    break;
                }
            }
        } else {
            match tab.evaluate(&expression).await {
                Ok(value) => {
                    let text = value.as_text();
                    debug!(field = %script.name, value = %text, "script result");
                    apply_field(&mut product, &script.name, &text);
                }
                Err(err) => {
                    debug!(field = %script.name, error = %err, "script failed");
                    apply_failure(&mut product, &script.name);
                    if err.is_closed() {
                        break;
                    }
                }
            }
        }
        if !script.sleep.is_zero() {
            tokio::time::sleep(script.sleep).await;
        }
    }
    product
}
