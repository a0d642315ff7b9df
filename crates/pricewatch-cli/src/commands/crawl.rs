use anyhow::{Result, bail};
use pricewatch_core::{AppConfig, AppCore};
use serde::Serialize;
use tracing::warn;

use crate::cli::OutputFormat;
use crate::output::{print_json, print_json_line};

#[derive(Serialize)]
struct Normalized<'a> {
    url: &'a str,
    canonical: String,
}

/// Crawl each URL in turn. Fails after printing if any URL yielded no product.
pub async fn crawl(config: AppConfig, urls: &[String], format: OutputFormat) -> Result<()> {
    let core = AppCore::new(config).await?;
    let mut products = Vec::with_capacity(urls.len());
    for url in urls {
        let product = core.crawler.crawl_url(url).await;
        if !product.has_id() {
            warn!(url = %url, "no product extracted");
        }
        if !format.is_json() {
            print_json_line(&product)?;
        }
        products.push(product);
    }
    core.shutdown().await;
    if format.is_json() {
        print_json(&products)?;
    }

    let failed = products.iter().filter(|product| !product.has_id()).count();
    if failed > 0 {
        bail!("{} of {} URLs yielded no product", failed, urls.len());
    }
    Ok(())
}

pub async fn normalize(config: AppConfig, urls: &[String], format: OutputFormat) -> Result<()> {
    let core = AppCore::new(config).await?;
    let mut results = Vec::with_capacity(urls.len());
    for url in urls {
        let canonical = core.crawler.normalize(url).await;
        if !format.is_json() {
            println!("{url} -> {canonical}");
        }
        results.push(Normalized { url, canonical });
    }
    core.shutdown().await;
    if format.is_json() {
        print_json(&results)?;
    }
    Ok(())
}
