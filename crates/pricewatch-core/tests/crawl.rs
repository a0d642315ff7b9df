use std::sync::Arc;
use std::time::Duration;

use pricewatch_cdp::testkit::MockBrowser;
use pricewatch_core::{
    BatchProcessor, BatchSettings, CrawlEngine, CrawlSettings, Crawler, NoopShortener,
    ProductCache, RedbProductCache, RuleSet,
};
use pricewatch_models::{Message, Price, Product};
use serde_json::json;
use tempfile::tempdir;

const RULE: &str = r#"
name: example
source: 3
currency: 0
match:
  - '^https?://item\.example\.com/'
  - '^https?://s\.example\.com/'
  - '^https?://m\.example\.com/'
chain:
  - match: ['^https?://s\.example\.com/']
    index: 's\.example\.com/p/([0-9]+)'
    index_count: 1
    template: 'https://item.example.com/$1.html'
  - match: ['^https?://m\.example\.com/']
    script: "window.__itemId"
    script_template: 'https://item.example.com/$id.html'
id:
  match: ['item\.example\.com/([0-9]+)\.html']
  index: 1
scripts:
  - name: title
    script: "document.title"
  - name: price
    script: "priceOf('$id')"
  - name: sales
    script: "salesOf('$id')"
"#;

fn settings() -> CrawlSettings {
    CrawlSettings {
        timeout: Duration::from_millis(500),
        grace: Duration::from_millis(100),
        redirect_settle: Duration::from_millis(10),
    }
}

async fn setup() -> (MockBrowser, Crawler) {
    let mock = MockBrowser::start().await;
    let rules = RuleSet::parse("example.yaml", RULE).unwrap();
    let crawler = Crawler::new(mock.browser().unwrap(), rules, settings());
    (mock, crawler)
}

#[tokio::test]
async fn extracts_product_fields_through_the_browser() {
    let (mock, crawler) = setup().await;
    mock.set_evaluation("document.title", json!("Kettle"));
    mock.set_evaluation("priceOf('12345')", json!("199.00"));
    mock.set_evaluation("salesOf('12345')", json!("1.4万"));

    let product = crawler
        .crawl_url("https://item.example.com/12345.html")
        .await;

    assert_eq!(product.id, "12345");
    assert_eq!(product.url, "https://item.example.com/12345.html");
    assert_eq!(product.source, 3);
    assert_eq!(product.title, "Kettle");
    assert_eq!(product.price, Price::Single(199.0));
    assert_eq!(product.sales.value(), Some(&14_000));
    assert!(product.stock.value().is_none());

    assert_eq!(mock.tabs_created(), 1);
    assert_eq!(mock.closed_targets(), vec!["T1".to_string()]);
    assert_eq!(
        mock.navigations(),
        vec!["https://item.example.com/12345.html".to_string()]
    );
}

#[tokio::test]
async fn rewrite_chain_normalizes_without_a_tab() {
    let (mock, crawler) = setup().await;
    let url = crawler.normalize("https://s.example.com/p/777").await;
    assert_eq!(url, "https://item.example.com/777.html");
    assert_eq!(mock.tabs_created(), 0);
}

#[tokio::test]
async fn redirects_are_followed_to_a_canonical_url() {
    let (mock, crawler) = setup().await;
    mock.redirect("https://t.example/abc", "https://item.example.com/55.html");

    let url = crawler.normalize("https://t.example/abc").await;
    assert_eq!(url, "https://item.example.com/55.html");
    assert_eq!(mock.tabs_created(), 1);
    assert_eq!(mock.closed_targets(), vec!["T1".to_string()]);
}

#[tokio::test]
async fn page_script_chain_builds_the_canonical_url() {
    let (mock, crawler) = setup().await;
    mock.set_evaluation("window.__itemId", json!("88"));

    let url = crawler.normalize("https://m.example.com/share?x=1").await;
    assert_eq!(url, "https://item.example.com/88.html");
}

#[tokio::test]
async fn unresolvable_urls_fall_back() {
    let (mock, crawler) = setup().await;
    mock.redirect("https://t.example/x", "https://elsewhere.example/landing");

    let url = crawler.normalize("https://t.example/x").await;
    assert_eq!(url, "https://elsewhere.example/landing");

    let url = crawler.normalize("https://m.example.com/share?x=2").await;
    assert_eq!(url, "https://m.example.com/share?x=2");
}

#[tokio::test]
async fn missing_load_event_times_out_with_an_empty_product() {
    let (mock, crawler) = setup().await;
    mock.skip_load_events(1);
    mock.set_evaluation("priceOf('12345')", json!("199.00"));

    let started = tokio::time::Instant::now();
    let product = crawler.crawl("https://item.example.com/12345.html").await;

    assert!(!product.has_id());
    assert!(started.elapsed() >= settings().timeout);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(mock.closed_targets(), vec!["T1".to_string()]);
}

#[tokio::test]
async fn stalled_script_keeps_fields_read_before_it() {
    let (mock, crawler) = setup().await;
    mock.set_evaluation("document.title", json!("Kettle"));
    mock.stall_evaluation("priceOf('4242')");
    mock.set_evaluation("salesOf('4242')", json!("12"));

    let started = tokio::time::Instant::now();
    let product = crawler.crawl("https://item.example.com/4242.html").await;

    assert!(started.elapsed() >= settings().timeout + settings().grace);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(product.id, "4242");
    assert_eq!(product.url, "https://item.example.com/4242.html");
    assert_eq!(product.title, "Kettle");
    assert_eq!(product.price, Price::Failed);
    assert!(product.sales.value().is_none());
    assert_eq!(mock.commands_named("Runtime.evaluate").len(), 2);
    assert_eq!(mock.closed_targets(), vec!["T1".to_string()]);
}

#[tokio::test]
async fn urls_without_a_rule_are_not_visited() {
    let (mock, crawler) = setup().await;
    let product = crawler.crawl("https://unknown.example/item/1").await;
    assert_eq!(product, Product::new());
    assert_eq!(mock.tabs_created(), 0);
}

#[tokio::test]
async fn messages_without_a_link_are_not_crawlable() {
    let (mock, crawler) = setup().await;
    let message = Message {
        id: "m1".to_string(),
        url: String::new(),
        content: "hello, no link here".to_string(),
    };
    assert!(crawler.crawl_message(&message).await.is_none());

    let reference = Product::reference("1", "");
    assert!(crawler.crawl_product(&reference).await.is_none());
    assert_eq!(mock.tabs_created(), 0);
}

#[tokio::test]
async fn timed_out_attempt_is_retried_once() {
    let dir = tempdir().unwrap();
    let (mock, crawler) = setup().await;
    mock.skip_load_events(1);
    mock.set_evaluation("priceOf('12345')", json!("199.00"));

    let cache = Arc::new(RedbProductCache::open(&dir.path().join("cache.redb")).unwrap());
    let batch = BatchProcessor::new(
        Arc::new(crawler),
        cache.clone(),
        Arc::new(NoopShortener),
        BatchSettings {
            max_attempts: 3,
            backoff: Duration::from_millis(10),
            dedup_window: None,
        },
    );
    let message = Message {
        id: "m1".to_string(),
        url: String::new(),
        content: "deal: https://item.example.com/12345.html 好价".to_string(),
    };

    let payloads = batch.process_messages(&[message]).await;

    assert_eq!(payloads.len(), 1);
    let product = payloads[0].product.as_ref().unwrap();
    assert_eq!(product.id, "12345");
    assert_eq!(product.price, Price::Single(199.0));
    assert!(product.update_time.is_some());
    assert_eq!(mock.navigations().len(), 2);
    assert_eq!(mock.tabs_created(), 2);
    assert!(cache.get("12345").unwrap().is_some());
}

#[tokio::test]
async fn rules_can_be_swapped_while_running() {
    let (mock, crawler) = setup().await;
    mock.set_evaluation("priceOf('9')", json!("5"));
    assert_eq!(crawler.rules().len(), 1);

    crawler.replace_rules(RuleSet::default());
    let product = crawler.crawl("https://item.example.com/9.html").await;
    assert!(!product.has_id());
    assert_eq!(mock.tabs_created(), 0);
}
