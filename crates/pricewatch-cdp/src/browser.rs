//! Endpoint: the browser's HTTP control address, used to create and destroy
//! pages.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::codec::methods;
use crate::error::{CdpError, Result};
use crate::tab::{CloseTarget, Tab, TabConfig, TabMeta};

pub const DEFAULT_DEBUGGING_PORT: u16 = 9222;
const PORT_FLAG: &str = "--remote-debugging-port=";
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const READY_POLL: Duration = Duration::from_millis(200);

/// Answer of `/json/version`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BrowserVersion {
    #[serde(rename = "Browser", default)]
    pub browser: String,
    #[serde(rename = "Protocol-Version", default)]
    pub protocol_version: String,
    #[serde(rename = "User-Agent", default)]
    pub user_agent: String,
    #[serde(rename = "webSocketDebuggerUrl", default)]
    pub ws_url: String,
}

/// Handle to a running browser's remote-debugging endpoint.
#[derive(Debug, Clone)]
pub struct Browser {
    base: String,
    client: reqwest::Client,
    tab_config: TabConfig,
}

impl Browser {
    /// Attach to a browser already listening on `host:port`.
    pub fn attach(host: &str, port: u16) -> Result<Self> {
        Self::from_base_url(&format!("http://{host}:{port}"))
    }

    /// Attach to an endpoint given as a base URL such as `http://127.0.0.1:9222`.
    pub fn from_base_url(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            base: format!("{}/json", base_url.trim_end_matches('/')),
            client,
            tab_config: TabConfig::default(),
        })
    }

    /// Spawn the browser binary with remote debugging enabled and attach to it.
    ///
    /// The process outlives this handle; stop it with [`Browser::shutdown`].
    pub fn launch(exec: &str, args: &[String]) -> Result<Self> {
        if exec.contains(std::path::MAIN_SEPARATOR) && !Path::new(exec).exists() {
            return Err(CdpError::Launch(format!("{exec} does not exist")));
        }

        let mut args = args.to_vec();
        let port = match debugging_port(&args)? {
            Some(port) => port,
            None => {
                args.push(format!("{PORT_FLAG}{DEFAULT_DEBUGGING_PORT}"));
                DEFAULT_DEBUGGING_PORT
            }
        };

        let child = tokio::process::Command::new(exec)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| CdpError::Launch(format!("{exec}: {err}")))?;
        info!(exec, pid = ?child.id(), port, "browser launched");

        Self::attach("127.0.0.1", port)
    }

    pub fn with_tab_config(mut self, config: TabConfig) -> Self {
        self.tab_config = config;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    /// Poll the endpoint until it answers or `timeout` elapses.
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<BrowserVersion> {
        let started = Instant::now();
        loop {
            match self.version().await {
                Ok(version) => return Ok(version),
                Err(err) if started.elapsed() >= timeout => {
                    return Err(CdpError::Launch(format!(
                        "endpoint {} not ready after {timeout:?}: {err}",
                        self.base
                    )));
                }
                Err(err) => debug!(error = %err, "endpoint not ready yet"),
            }
            tokio::time::sleep(READY_POLL).await;
        }
    }

    pub async fn version(&self) -> Result<BrowserVersion> {
        let url = format!("{}/version", self.base);
        let version = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| connect_error(&url, err))?
            .error_for_status()?
            .json()
            .await?;
        Ok(version)
    }

    /// Create a page and open a session on it.
    pub async fn new_tab(&self) -> Result<Tab> {
        let url = format!("{}/new", self.base);
        let mut response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| connect_error(&url, err))?;
        if response.status() == StatusCode::METHOD_NOT_ALLOWED {
            // Newer browsers only accept PUT here.
            response = self
                .client
                .put(&url)
                .send()
                .await
                .map_err(|err| connect_error(&url, err))?;
        }
        if !response.status().is_success() {
            return Err(CdpError::Connect {
                url,
                reason: format!("endpoint answered {}", response.status()),
            });
        }

        let meta: TabMeta = response.json().await?;
        debug!(tab = %meta.id, ws = %meta.ws_url, "page created");

        let close_target = CloseTarget {
            client: self.client.clone(),
            url: format!("{}/close/{}", self.base, meta.id),
        };
        Tab::open(meta, self.tab_config, Some(close_target)).await
    }

    /// Ask the browser to exit.
    pub async fn shutdown(&self) -> Result<()> {
        let tab = self.new_tab().await?;
        let sent = tab.call_async(methods::BROWSER_CLOSE, json!({})).await;
        tab.close().await;
        match sent {
            Ok(_) => {
                info!(endpoint = %self.base, "browser shutdown requested");
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "failed to request browser shutdown");
                Err(err)
            }
        }
    }
}

fn connect_error(url: &str, err: reqwest::Error) -> CdpError {
    CdpError::Connect {
        url: url.to_string(),
        reason: err.to_string(),
    }
}

/// Port from a `--remote-debugging-port=N` argument, if present.
fn debugging_port(args: &[String]) -> Result<Option<u16>> {
    let Some(value) = args.iter().find_map(|arg| arg.strip_prefix(PORT_FLAG)) else {
        return Ok(None);
    };
    value
        .parse()
        .map(Some)
        .map_err(|_| CdpError::Launch(format!("invalid {PORT_FLAG}{value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|arg| arg.to_string()).collect()
    }

    #[test]
    fn port_is_read_from_args() {
        assert_eq!(
            debugging_port(&args(&["--headless", "--remote-debugging-port=9333"])).unwrap(),
            Some(9333)
        );
        assert_eq!(debugging_port(&args(&["--headless"])).unwrap(), None);
        assert!(debugging_port(&args(&["--remote-debugging-port=abc"])).is_err());
    }

    #[test]
    fn launch_rejects_missing_executable() {
        let err = Browser::launch("/nonexistent/dir/chrome", &[]).unwrap_err();
        assert!(matches!(err, CdpError::Launch(_)));
    }

    #[test]
    fn base_url_points_at_json_root() {
        let browser = Browser::attach("localhost", 9222).unwrap();
        assert_eq!(browser.base_url(), "http://localhost:9222/json");
        let browser = Browser::from_base_url("http://h:1/").unwrap();
        assert_eq!(browser.base_url(), "http://h:1/json");
    }

    #[tokio::test]
    async fn version_is_decoded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/json/version"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "Browser": "HeadlessChrome/120.0.0.0",
                "Protocol-Version": "1.3",
                "User-Agent": "Mozilla/5.0",
                "webSocketDebuggerUrl": "ws://127.0.0.1/devtools/browser/b1"
            })))
            .mount(&server)
            .await;

        let browser = Browser::from_base_url(&server.uri()).unwrap();
        let version = browser.wait_until_ready(Duration::from_secs(2)).await.unwrap();
        assert_eq!(version.browser, "HeadlessChrome/120.0.0.0");
        assert_eq!(version.protocol_version, "1.3");
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_connect_error() {
        let browser = Browser::attach("127.0.0.1", 1).unwrap();
        let err = browser.new_tab().await.unwrap_err();
        assert!(matches!(err, CdpError::Connect { .. }));

        let err = browser
            .wait_until_ready(Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(err, CdpError::Launch(_)));
    }
}
