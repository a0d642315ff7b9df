//! Batch crawling with retries.
//!
//! A batch is crawled in passes. Items that came back incomplete (no id or no
//! usable price) are tried again on the next pass after a fixed backoff; items
//! that completed, or that can never complete, leave the batch. Whatever is
//! still incomplete after the last pass is left out of the result.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use pricewatch_models::{Message, Payload, Price, Product, now};
use tracing::{debug, info, warn};

use crate::cache::ProductCache;
use crate::crawl::CrawlEngine;
use crate::shortener::UrlShortener;

const SHORTEN_ATTEMPTS: u32 = 3;
const SHORTEN_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSettings {
    /// Passes over the batch, at least one.
    pub max_attempts: u32,
    /// Pause before every pass but the first.
    pub backoff: Duration,
    /// Products crawled more recently than this are skipped.
    pub dedup_window: Option<Duration>,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(10),
            dedup_window: Some(Duration::from_secs(360 * 60)),
        }
    }
}

/// Result of one attempt at one item.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<R> {
    Done(R),
    /// Incomplete; try again next pass.
    Retry,
    /// Nothing to gain from trying again.
    Abandon,
}

/// Drive `attempt` over `items` until every item is settled or the passes run
/// out. Results keep the order of `items`.
pub async fn retry_batch<T, R, F, Fut>(
    label: &str,
    items: &[T],
    settings: &BatchSettings,
    mut attempt: F,
) -> Vec<R>
where
    T: Clone,
    F: FnMut(T) -> Fut,
    Fut: Future<Output = Outcome<R>>,
{
    let mut results: Vec<Option<R>> = items.iter().map(|_| None).collect();
    let mut pending: Vec<usize> = (0..items.len()).collect();
    let mut passes = 0;

    while !pending.is_empty() && passes < settings.max_attempts.max(1) {
        if passes > 0 {
            tokio::time::sleep(settings.backoff).await;
        }
        passes += 1;
        info!(batch = label, pass = passes, pending = pending.len(), "processing batch");

        let mut retry = Vec::new();
        for index in pending {
            match attempt(items[index].clone()).await {
                Outcome::Done(result) => results[index] = Some(result),
                Outcome::Retry => retry.push(index),
                Outcome::Abandon => {}
            }
        }
        pending = retry;
    }

    let results: Vec<R> = results.into_iter().flatten().collect();
    info!(
        batch = label,
        passes,
        processed = results.len(),
        total = items.len(),
        incomplete = pending.len(),
        "batch finished"
    );
    results
}

/// Crawls the message and product batches of a task.
pub struct BatchProcessor {
    engine: Arc<dyn CrawlEngine>,
    cache: Arc<dyn ProductCache>,
    shortener: Arc<dyn UrlShortener>,
    settings: BatchSettings,
}

impl BatchProcessor {
    pub fn new(
        engine: Arc<dyn CrawlEngine>,
        cache: Arc<dyn ProductCache>,
        shortener: Arc<dyn UrlShortener>,
        settings: BatchSettings,
    ) -> Self {
        Self {
            engine,
            cache,
            shortener,
            settings,
        }
    }

    /// Crawl the link each message carries. Messages without a link drop out
    /// immediately.
    pub async fn process_messages(&self, messages: &[Message]) -> Vec<Payload> {
        retry_batch("messages", messages, &self.settings, move |message| async move {
            let Some(product) = self.engine.crawl_message(&message).await else {
                debug!(message = %message.id, "no crawlable link");
                return Outcome::Abandon;
            };
            if !product.is_complete() {
                return Outcome::Retry;
            }
            let product = self.finish(product).await;
            Outcome::Done(Payload::crawled_message(message, product))
        })
        .await
    }

    /// Re-crawl known products, skipping those crawled recently.
    ///
    /// A crawl landing on a different product than requested counts as
    /// incomplete.
    pub async fn process_products(&self, products: &[Product]) -> Vec<Payload> {
        retry_batch("products", products, &self.settings, move |requested| async move {
            if self.crawled_recently(&requested) {
                debug!(product = %requested.id, "crawled recently, skipping");
                return Outcome::Abandon;
            }
            let Some(product) = self.engine.crawl_product(&requested).await else {
                return Outcome::Abandon;
            };
            if requested.has_id() && product.has_id() && product.id != requested.id {
                warn!(requested = %requested.id, crawled = %product.id, "crawl landed on another product");
                return Outcome::Retry;
            }
            if !product.is_complete() {
                return Outcome::Retry;
            }
            Outcome::Done(Payload::crawled_product(self.finish(product).await))
        })
        .await
    }

    fn crawled_recently(&self, product: &Product) -> bool {
        let Some(window) = self.settings.dedup_window else {
            return false;
        };
        if !product.has_id() {
            return false;
        }
        let cached = match self.cache.get(&product.id) {
            Ok(cached) => cached,
            Err(err) => {
                warn!(product = %product.id, error = %err, "cache lookup failed");
                return false;
            }
        };
        let Some(crawled_at) = cached.and_then(|cached| cached.update_time) else {
            return false;
        };
        let window = TimeDelta::from_std(window).unwrap_or(TimeDelta::MAX);
        now().signed_duration_since(crawled_at) < window
    }

    /// Stamp a completed product, give it a short link and remember it.
    async fn finish(&self, mut product: Product) -> Product {
        if let Some(short) = self.short_url(&product.url).await {
            product.short_url = short;
        }
        product.update_time = Some(now());
        if let Err(err) = self.cache.put(&product) {
            warn!(product = %product.id, error = %err, "failed to cache product");
        }

        match product.price {
            Price::Range { low, high } => debug!(id = %product.id, low, high, "crawled"),
            Price::Single(price) => debug!(id = %product.id, price, "crawled"),
            _ => {}
        }
        product
    }

    async fn short_url(&self, url: &str) -> Option<String> {
        for attempt in 1..=SHORTEN_ATTEMPTS {
            if attempt > 1 {
                tokio::time::sleep(SHORTEN_PAUSE).await;
            }
            match self.shortener.shorten(url).await {
                Ok(short) => return short,
                Err(err) => debug!(url, attempt, error = %err, "shortening failed"),
            }
        }
        warn!(url, "failed to get short URL");
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shortener::NoopShortener;
    use anyhow::Result;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Answers from a per-key script; a key that runs out answers `None`.
    #[derive(Default)]
    struct ScriptedEngine {
        answers: Mutex<HashMap<String, VecDeque<Option<Product>>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedEngine {
        fn answer(self, key: &str, answers: Vec<Option<Product>>) -> Self {
            self.answers.lock().insert(key.to_string(), answers.into());
            self
        }

        fn next(&self, key: &str) -> Option<Product> {
            self.calls.lock().push(key.to_string());
            self.answers
                .lock()
                .get_mut(key)
                .and_then(VecDeque::pop_front)
                .flatten()
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl CrawlEngine for ScriptedEngine {
        async fn crawl_message(&self, message: &Message) -> Option<Product> {
            self.next(&message.id)
        }

        async fn crawl_product(&self, product: &Product) -> Option<Product> {
            self.next(&product.url)
        }
    }

    #[derive(Default)]
    struct MemoryCache(Mutex<HashMap<String, Product>>);

    impl ProductCache for MemoryCache {
        fn get(&self, id: &str) -> Result<Option<Product>> {
            Ok(self.0.lock().get(id).cloned())
        }

        fn put(&self, product: &Product) -> Result<()> {
            self.0.lock().insert(product.id.clone(), product.clone());
            Ok(())
        }
    }

    /// Fails a fixed number of times, then hands out a fixed link.
    struct FlakyShortener {
        failures: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl UrlShortener for FlakyShortener {
        async fn shorten(&self, _url: &str) -> Result<Option<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                anyhow::bail!("unavailable");
            }
            Ok(Some("https://s.example/abc".to_string()))
        }
    }

    fn priced(id: &str, price: Price) -> Product {
        Product {
            price,
            ..Product::reference(id, format!("https://item.example.com/{id}.html"))
        }
    }

    fn message(id: &str) -> Message {
        Message {
            id: id.to_string(),
            url: String::new(),
            content: format!("https://item.example.com/{id}.html"),
        }
    }

    fn settings() -> BatchSettings {
        BatchSettings {
            max_attempts: 3,
            backoff: Duration::from_secs(10),
            dedup_window: Some(Duration::from_secs(60 * 60)),
        }
    }

    fn processor(
        engine: Arc<ScriptedEngine>,
        cache: Arc<MemoryCache>,
        shortener: Arc<dyn UrlShortener>,
    ) -> BatchProcessor {
        BatchProcessor::new(engine, cache, shortener, settings())
    }

    #[tokio::test(start_paused = true)]
    async fn retry_batch_keeps_order_and_stops_early() {
        let attempts = Mutex::new(HashMap::<u32, u32>::new());
        let started = tokio::time::Instant::now();
        let results = retry_batch("numbers", &[1u32, 2, 3, 4], &settings(), |item| {
            let tries = {
                let mut attempts = attempts.lock();
                let tries = attempts.entry(item).or_default();
                *tries += 1;
                *tries
            };
            async move {
                match item {
                    1 => Outcome::Done(10),
                    3 => Outcome::Abandon,
                    _ if tries == 2 => Outcome::Done(item * 10),
                    _ => Outcome::Retry,
                }
            }
        })
        .await;

        assert_eq!(results, vec![10, 20, 40]);
        assert_eq!(attempts.lock()[&1], 1);
        assert_eq!(attempts.lock()[&3], 1);
        assert_eq!(attempts.lock()[&2], 2);
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_batch_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let results: Vec<u32> = retry_batch("stuck", &["a"], &settings(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Outcome::Retry }
        })
        .await;
        assert!(results.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn messages_retry_until_complete() {
        let engine = Arc::new(
            ScriptedEngine::default()
                .answer("m1", vec![Some(Product::new()), Some(priced("1", Price::Single(9.9)))])
                .answer("m2", vec![None])
                .answer(
                    "m3",
                    vec![
                        Some(priced("3", Price::Range { low: 0.0, high: 0.0 })),
                        Some(priced("3", Price::Failed)),
                        Some(priced("3", Price::Absent)),
                    ],
                ),
        );
        let cache = Arc::new(MemoryCache::default());
        let batch = processor(engine.clone(), cache.clone(), Arc::new(NoopShortener));

        let payloads = batch
            .process_messages(&[message("m1"), message("m2"), message("m3")])
            .await;

        assert_eq!(payloads.len(), 1);
        let product = payloads[0].product.as_ref().unwrap();
        assert_eq!(payloads[0].message.as_ref().unwrap().id, "m1");
        assert_eq!(product.id, "1");
        assert!(product.update_time.is_some());
        assert!(cache.get("1").unwrap().is_some());
        assert_eq!(engine.calls(), vec!["m1", "m2", "m3", "m1", "m3", "m3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn products_skip_recent_and_reject_other_ids() {
        let engine = Arc::new(
            ScriptedEngine::default()
                .answer(
                    "https://item.example.com/1.html",
                    vec![
                        Some(priced("999", Price::Single(1.0))),
                        Some(priced("1", Price::Single(5.0))),
                    ],
                )
                .answer(
                    "https://item.example.com/2.html",
                    vec![Some(priced("2", Price::Single(7.0)))],
                ),
        );
        let cache = Arc::new(MemoryCache::default());
        let mut recent = priced("2", Price::Single(7.0));
        recent.update_time = Some(now());
        cache.put(&recent).unwrap();

        let batch = processor(engine.clone(), cache.clone(), Arc::new(NoopShortener));
        let payloads = batch
            .process_products(&[
                Product::reference("1", "https://item.example.com/1.html"),
                Product::reference("2", "https://item.example.com/2.html"),
            ])
            .await;

        assert_eq!(payloads.len(), 1);
        let product = payloads[0].product.as_ref().unwrap();
        assert!(payloads[0].message.is_none());
        assert_eq!(product.id, "1");
        assert_eq!(product.price, Price::Single(5.0));
        assert_eq!(
            engine.calls(),
            vec!["https://item.example.com/1.html", "https://item.example.com/1.html"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stale_cache_entries_do_not_block_recrawl() {
        let engine = Arc::new(ScriptedEngine::default().answer(
            "https://item.example.com/5.html",
            vec![Some(priced("5", Price::Single(3.0)))],
        ));
        let cache = Arc::new(MemoryCache::default());
        let mut stale = priced("5", Price::Single(4.0));
        stale.update_time = Some(now() - TimeDelta::hours(2));
        cache.put(&stale).unwrap();

        let batch = processor(engine, cache.clone(), Arc::new(NoopShortener));
        let payloads = batch
            .process_products(&[Product::reference("5", "https://item.example.com/5.html")])
            .await;

        assert_eq!(payloads.len(), 1);
        assert_eq!(cache.get("5").unwrap().unwrap().price, Price::Single(3.0));
    }

    #[tokio::test(start_paused = true)]
    async fn short_url_is_retried_then_given_up() {
        let shortener = Arc::new(FlakyShortener {
            failures: AtomicU32::new(2),
            calls: AtomicU32::new(0),
        });
        let engine = Arc::new(
            ScriptedEngine::default()
                .answer("a", vec![Some(priced("1", Price::Single(1.0)))])
                .answer("b", vec![Some(priced("2", Price::Single(2.0)))]),
        );
        let batch = processor(engine, Arc::new(MemoryCache::default()), shortener.clone());

        let first = batch.process_messages(&[message("a")]).await;
        assert_eq!(first[0].product.as_ref().unwrap().short_url, "https://s.example/abc");
        assert_eq!(shortener.calls.load(Ordering::SeqCst), 3);

        shortener.failures.store(5, Ordering::SeqCst);
        let second = batch.process_messages(&[message("b")]).await;
        let product = second[0].product.as_ref().unwrap();
        assert!(product.short_url.is_empty());
        assert!(product.update_time.is_some());
        assert_eq!(shortener.calls.load(Ordering::SeqCst), 6);
    }
}
