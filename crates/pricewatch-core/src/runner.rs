//! Service loop: take tasks from the queue, crawl them, report back.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use pricewatch_models::{Message, Product, Task};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batch::BatchProcessor;
use crate::queue::{Job, JobQueue, file_stem};

#[derive(Debug, Clone, PartialEq)]
pub struct RunnerSettings {
    /// Pause after the queue ran dry.
    pub polling_interval: Duration,
    pub reserve_timeout: Duration,
    /// Where reserved and reported task bodies are copied, if anywhere.
    pub dump_dir: Option<PathBuf>,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            polling_interval: Duration::from_secs(60),
            reserve_timeout: Duration::from_secs(5),
            dump_dir: None,
        }
    }
}

pub struct Runner {
    queue: Arc<dyn JobQueue>,
    batch: BatchProcessor,
    settings: RunnerSettings,
}

impl Runner {
    pub fn new(queue: Arc<dyn JobQueue>, batch: BatchProcessor, settings: RunnerSettings) -> Self {
        Self {
            queue,
            batch,
            settings,
        }
    }

    /// Work through the queue until `shutdown` fires.
    ///
    /// A job in progress is finished before returning. Failing to report
    /// results is fatal; the job then stays reserved.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!("runner started");
        while !shutdown.is_cancelled() {
            let reserved = tokio::select! {
                _ = shutdown.cancelled() => break,
                reserved = self.queue.reserve(self.settings.reserve_timeout) => reserved,
            };
            match reserved {
                Ok(Some(job)) => {
                    self.process(&job).await?;
                    continue;
                }
                Ok(None) => debug!("queue empty"),
                Err(err) => error!(error = %err, "failed to reserve job"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.settings.polling_interval) => {}
            }
        }
        info!("runner stopped");
        Ok(())
    }

    /// Reserve and process at most one job. Returns whether there was one.
    pub async fn run_once(&self) -> Result<bool> {
        let Some(job) = self.queue.reserve(self.settings.reserve_timeout).await? else {
            return Ok(false);
        };
        self.process(&job).await?;
        Ok(true)
    }

    /// Crawl a reserved job and report its messages and products as two
    /// separate tasks.
    pub async fn process(&self, job: &Job) -> Result<()> {
        let task = &job.task;
        self.dump(&task.id, "reserve", job.raw.as_bytes()).await;

        let (messages, products) = split(task);
        info!(
            task = %task.id,
            messages = messages.len(),
            products = products.len(),
            "processing task"
        );

        if !messages.is_empty() {
            let payloads = self.batch.process_messages(&messages).await;
            self.report(task.report(payloads), "report_messages").await?;
        }
        if !products.is_empty() {
            let payloads = self.batch.process_products(&products).await;
            self.report(task.report(payloads), "report_products").await?;
        }

        if let Err(err) = self.queue.delete(job).await {
            error!(job = %job.id, error = %err, "failed to delete job");
        }
        Ok(())
    }

    async fn report(&self, report: Task, kind: &str) -> Result<()> {
        let data = serde_json::to_vec(&report)?;
        self.dump(&report.id, kind, &data).await;
        self.queue
            .put(&report)
            .await
            .with_context(|| format!("Failed to report task {}", report.id))?;
        info!(task = %report.id, kind, count = report.payloads.len(), "task reported");
        Ok(())
    }

    async fn dump(&self, task_id: &str, kind: &str, data: &[u8]) {
        let Some(dir) = &self.settings.dump_dir else {
            return;
        };
        let path = dir.join(format!("{}_{kind}.json", file_stem(task_id)));
        let written = match tokio::fs::create_dir_all(dir).await {
            Ok(()) => tokio::fs::write(&path, data).await,
            Err(err) => Err(err),
        };
        if let Err(err) = written {
            warn!(path = ?path, error = %err, "failed to dump task");
        }
    }
}

/// Messages that carry an id, and products that carry a URL. A payload with
/// both counts as a message.
fn split(task: &Task) -> (Vec<Message>, Vec<Product>) {
    let mut messages = Vec::new();
    let mut products = Vec::new();
    for payload in &task.payloads {
        match (&payload.message, &payload.product) {
            (Some(message), _) if !message.id.is_empty() => messages.push(message.clone()),
            (_, Some(product)) if !product.url.is_empty() => products.push(product.clone()),
            _ => debug!(task = %task.id, "skipping empty payload"),
        }
    }
    (messages, products)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchSettings;
    use crate::cache::RedbProductCache;
    use crate::crawl::CrawlEngine;
    use crate::queue::SpoolQueue;
    use crate::shortener::NoopShortener;
    use async_trait::async_trait;
    use pricewatch_models::{Payload, Price};
    use std::path::Path;
    use tempfile::tempdir;

    /// Every link resolves to a product priced at its numeric suffix.
    struct PricingEngine;

    impl PricingEngine {
        fn product_for(url: &str) -> Option<Product> {
            let id = url.rsplit('/').next()?.trim_end_matches(".html");
            let price = id.parse::<f64>().ok()?;
            Some(Product {
                price: Price::Single(price),
                ..Product::reference(id, url)
            })
        }
    }

    #[async_trait]
    impl CrawlEngine for PricingEngine {
        async fn crawl_message(&self, message: &Message) -> Option<Product> {
            Self::product_for(&message.url)
        }

        async fn crawl_product(&self, product: &Product) -> Option<Product> {
            Self::product_for(&product.url)
        }
    }

    struct Fixture {
        queue: Arc<SpoolQueue>,
        runner: Runner,
        dump: PathBuf,
    }

    async fn fixture(root: &Path) -> Fixture {
        let queue = Arc::new(
            SpoolQueue::open(root.join("inbox"), root.join("outbox"))
                .await
                .unwrap(),
        );
        let cache = Arc::new(RedbProductCache::open(&root.join("cache.redb")).unwrap());
        let batch = BatchProcessor::new(
            Arc::new(PricingEngine),
            cache,
            Arc::new(NoopShortener),
            BatchSettings {
                max_attempts: 1,
                backoff: Duration::ZERO,
                dedup_window: None,
            },
        );
        let dump = root.join("dump");
        let runner = Runner::new(
            queue.clone(),
            batch,
            RunnerSettings {
                polling_interval: Duration::from_millis(20),
                reserve_timeout: Duration::ZERO,
                dump_dir: Some(dump.clone()),
            },
        );
        Fixture {
            queue,
            runner,
            dump,
        }
    }

    fn message(id: &str, url: &str) -> Payload {
        Payload {
            message: Some(Message {
                id: id.to_string(),
                url: url.to_string(),
                content: String::new(),
            }),
            product: None,
        }
    }

    fn reports(outbox: &Path) -> Vec<Task> {
        let mut reports: Vec<Task> = std::fs::read_dir(outbox)
            .unwrap()
            .map(|entry| {
                let body = std::fs::read_to_string(entry.unwrap().path()).unwrap();
                serde_json::from_str(&body).unwrap()
            })
            .collect();
        reports.sort_by_key(|report| report.payloads.first().map(|p| p.message.is_none()));
        reports
    }

    #[test]
    fn split_sorts_payloads_by_kind() {
        let task = Task {
            id: "t".to_string(),
            payloads: vec![
                message("m1", "https://a.example/1.html"),
                message("", "https://a.example/2.html"),
                Payload::crawled_product(Product::reference("3", "https://a.example/3.html")),
                Payload::crawled_product(Product::reference("4", "")),
                Payload::default(),
            ],
            ..Task::default()
        };
        let (messages, products) = split(&task);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, "m1");
        assert_eq!(products.len(), 1);
        assert_eq!(products[0].id, "3");
    }

    #[tokio::test]
    async fn job_is_reported_per_kind_and_deleted() {
        let dir = tempdir().unwrap();
        let fx = fixture(dir.path()).await;
        let task = Task {
            id: "t1".to_string(),
            payloads: vec![
                message("m1", "https://item.example.com/12.html"),
                message("m2", "https://item.example.com/nothing"),
                Payload::crawled_product(Product::reference(
                    "30",
                    "https://item.example.com/30.html",
                )),
            ],
            ..Task::default()
        };
        std::fs::write(
            fx.queue.inbox().join("t1.json"),
            serde_json::to_string(&task).unwrap(),
        )
        .unwrap();

        assert!(fx.runner.run_once().await.unwrap());
        assert!(!fx.runner.run_once().await.unwrap());

        let reports = reports(fx.queue.outbox());
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|report| report.id == "t1"));
        assert!(reports.iter().all(|report| report.report_time.is_some()));

        let messages = &reports[0].payloads;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message.as_ref().unwrap().id, "m1");
        assert_eq!(messages[0].product.as_ref().unwrap().price, Price::Single(12.0));

        let products = &reports[1].payloads;
        assert_eq!(products.len(), 1);
        assert_eq!(products[0].product.as_ref().unwrap().id, "30");

        assert!(!fx.queue.inbox().join(".reserved/t1.json").exists());
        assert!(fx.dump.join("t1_reserve.json").exists());
        assert!(fx.dump.join("t1_report_messages.json").exists());
        assert!(fx.dump.join("t1_report_products.json").exists());
    }

    #[tokio::test]
    async fn task_ids_with_separators_are_reported() {
        let dir = tempdir().unwrap();
        let fx = fixture(dir.path()).await;
        let task = Task {
            id: "shop/42".to_string(),
            payloads: vec![message("m1", "https://item.example.com/8.html")],
            ..Task::default()
        };
        std::fs::write(
            fx.queue.inbox().join("shop.json"),
            serde_json::to_string(&task).unwrap(),
        )
        .unwrap();

        assert!(fx.runner.run_once().await.unwrap());

        let reports = reports(fx.queue.outbox());
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].id, "shop/42");
        assert!(!fx.queue.inbox().join(".reserved/shop.json").exists());
        assert!(fx.dump.join("shop_42_reserve.json").exists());
        assert!(fx.dump.join("shop_42_report_messages.json").exists());
    }

    #[tokio::test]
    async fn run_stops_when_cancelled() {
        let dir = tempdir().unwrap();
        let fx = fixture(dir.path()).await;
        let shutdown = CancellationToken::new();

        let stopper = {
            let shutdown = shutdown.clone();
            let inbox = fx.queue.inbox().to_path_buf();
            tokio::spawn(async move {
                let task = Task {
                    id: "t2".to_string(),
                    payloads: vec![message("m", "https://item.example.com/5.html")],
                    ..Task::default()
                };
                tokio::time::sleep(Duration::from_millis(50)).await;
                std::fs::write(inbox.join("t2.json"), serde_json::to_string(&task).unwrap())
                    .unwrap();
                tokio::time::sleep(Duration::from_millis(300)).await;
                shutdown.cancel();
            })
        };

        tokio::time::timeout(Duration::from_secs(5), fx.runner.run(shutdown))
            .await
            .unwrap()
            .unwrap();
        stopper.await.unwrap();
        assert_eq!(reports(fx.queue.outbox()).len(), 1);
    }
}
