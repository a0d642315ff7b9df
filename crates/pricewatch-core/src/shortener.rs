//! Short links for reported products.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;

const URL_PLACEHOLDER: &str = "{url}";
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait UrlShortener: Send + Sync {
    /// A short link for `url`, or `None` when shortening is disabled.
    async fn shorten(&self, url: &str) -> Result<Option<String>>;
}

/// Leaves products without a short link.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopShortener;

#[async_trait]
impl UrlShortener for NoopShortener {
    async fn shorten(&self, _url: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Calls a shortening service whose response body is the short link.
///
/// The endpoint is a URL template; `{url}` is replaced by the percent-encoded
/// long URL, e.g. `https://short.example/api?url={url}`.
#[derive(Debug, Clone)]
pub struct HttpShortener {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpShortener {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let endpoint = endpoint.into();
        if !endpoint.contains(URL_PLACEHOLDER) {
            bail!("Shortener endpoint {} has no {{url}} placeholder", endpoint);
        }
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client, endpoint })
    }

    fn request_url(&self, url: &str) -> String {
        self.endpoint.replace(URL_PLACEHOLDER, &urlencoding::encode(url))
    }
}

#[async_trait]
impl UrlShortener for HttpShortener {
    async fn shorten(&self, url: &str) -> Result<Option<String>> {
        let response = self
            .client
            .get(self.request_url(url))
            .send()
            .await
            .context("Shortener request failed")?
            .error_for_status()
            .context("Shortener rejected request")?;
        let body = response.text().await.context("Failed to read shortener response")?;
        let short = body.trim();
        if !short.starts_with("http") {
            bail!("Shortener returned no link: {:?}", short);
        }
        Ok(Some(short.to_string()))
    }
}
