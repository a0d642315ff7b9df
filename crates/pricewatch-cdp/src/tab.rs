//! Tab Client: the call/subscribe/close surface over one page session.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::codec::{Command, Event, RemoteValue, methods};
use crate::connection::Connection;
use crate::error::{CdpError, Result};
use crate::router::{OverflowPolicy, PendingGuard, Router};

/// Page descriptor returned by the endpoint's `/json/new`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TabMeta {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub url: String,
    #[serde(rename = "webSocketDebuggerUrl")]
    pub ws_url: String,
}

/// Per-tab queue sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TabConfig {
    pub event_capacity: usize,
    pub overflow: OverflowPolicy,
    pub write_capacity: usize,
}

impl Default for TabConfig {
    fn default() -> Self {
        Self {
            event_capacity: 64,
            overflow: OverflowPolicy::DropOldest,
            write_capacity: 64,
        }
    }
}

/// Lets a tab ask the endpoint to destroy its page on close.
#[derive(Debug, Clone)]
pub(crate) struct CloseTarget {
    pub(crate) client: reqwest::Client,
    pub(crate) url: String,
}

/// One remote-controlled page. Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct Tab {
    inner: Arc<TabInner>,
}

struct TabInner {
    meta: TabMeta,
    router: Arc<Router>,
    connection: Connection,
    // Held across id allocation and enqueue so wire order equals id order.
    submit: tokio::sync::Mutex<()>,
    close_target: Option<CloseTarget>,
    close_requested: AtomicBool,
}

impl std::fmt::Debug for Tab {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tab")
            .field("id", &self.inner.meta.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Tab {
    /// Open a session on an existing page descriptor.
    pub async fn connect(meta: TabMeta, config: TabConfig) -> Result<Self> {
        Self::open(meta, config, None).await
    }

    pub(crate) async fn open(
        meta: TabMeta,
        config: TabConfig,
        close_target: Option<CloseTarget>,
    ) -> Result<Self> {
        let router = Arc::new(Router::new(config.event_capacity, config.overflow));
        let connection = Connection::open(&meta.ws_url, router.clone(), config.write_capacity).await?;
        info!(tab = %meta.id, "tab opened");

        Ok(Self {
            inner: Arc::new(TabInner {
                meta,
                router,
                connection,
                submit: tokio::sync::Mutex::new(()),
                close_target,
                close_requested: AtomicBool::new(false),
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.meta.id
    }

    pub fn meta(&self) -> &TabMeta {
        &self.inner.meta
    }

    /// Send a command and wait for its response.
    ///
    /// Resolves with [`CdpError::Closed`] if the tab closes first. Dropping the
    /// returned future withdraws the call from the pending table.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let (mut guard, rx) = self.submit_tracked(method, params).await?;
        let outcome = rx.await.map_err(|_| CdpError::Closed);
        guard.disarm();
        outcome?
    }

    /// [`Tab::call`] bounded by `duration`.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        duration: Duration,
    ) -> Result<Value> {
        match tokio::time::timeout(duration, self.call(method, params)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(CdpError::Timeout {
                method: method.to_string(),
                duration,
            }),
        }
    }

    /// Send a command without waiting; its response is discarded.
    pub async fn call_async(&self, method: &str, params: Value) -> Result<u64> {
        let _submit = self.inner.submit.lock().await;
        if self.is_closed() {
            return Err(CdpError::Closed);
        }
        let id = self.inner.router.next_id();
        let frame = Command::new(id, method, params).encode()?;
        self.inner.connection.send(frame).await?;
        Ok(id)
    }

    async fn submit_tracked(
        &self,
        method: &str,
        params: Value,
    ) -> Result<(PendingGuard, tokio::sync::oneshot::Receiver<Result<Value>>)> {
        let _submit = self.inner.submit.lock().await;
        let router = &self.inner.router;
        let id = router.next_id();
        let frame = Command::new(id, method, params).encode()?;

        let rx = router.register(id)?;
        let guard = PendingGuard::new(router.clone(), id);
        self.inner.connection.send(frame).await?;
        Ok((guard, rx))
    }

    /// Deliver events named `method` to this tab's queue from now on.
    pub fn subscribe(&self, method: &str) {
        self.inner.router.subscribe(method);
    }

    /// Next queued event; `None` once the tab is closed and the queue drained.
    pub async fn next_event(&self) -> Option<Event> {
        self.inner.router.events().recv().await
    }

    pub fn try_next_event(&self) -> Option<Event> {
        self.inner.router.events().try_recv()
    }

    /// Skip queued events until one named `method` arrives.
    pub async fn wait_for(&self, method: &str) -> Option<Event> {
        while let Some(event) = self.next_event().await {
            if event.is(method) {
                return Some(event);
            }
            debug!(tab = %self.id(), method = %event.method, "skipping event");
        }
        None
    }

    /// Push a synthetic event into the queue. Never blocks.
    pub fn inject(&self, event: Event) {
        debug!(tab = %self.id(), method = %event.method, "injecting event");
        self.inner.router.inject(event);
    }

    pub async fn enable_page(&self) -> Result<()> {
        self.call(methods::PAGE_ENABLE, json!({})).await?;
        Ok(())
    }

    pub async fn navigate(&self, url: &str) -> Result<()> {
        let result = self.call(methods::PAGE_NAVIGATE, json!({ "url": url })).await?;
        if let Some(reason) = result.get("errorText").and_then(Value::as_str) {
            debug!(tab = %self.id(), url, reason, "navigation reported an error page");
        }
        Ok(())
    }

    /// Evaluate `expression` in page context and return its value.
    pub async fn evaluate(&self, expression: &str) -> Result<RemoteValue> {
        let result = self
            .call(methods::RUNTIME_EVALUATE, evaluate_params(expression))
            .await?;
        RemoteValue::from_evaluation(&result)
    }

    /// Evaluate without waiting for the result.
    pub async fn evaluate_async(&self, expression: &str) -> Result<()> {
        self.call_async(methods::RUNTIME_EVALUATE, evaluate_params(expression))
            .await?;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.router.is_closed()
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.router.pending_len()
    }

    pub fn queued_events(&self) -> usize {
        self.inner.router.events().len()
    }

    /// Close the session: fail pending calls, stop both loops and ask the
    /// endpoint to destroy the page. Later calls return immediately.
    pub async fn close(&self) {
        if self.inner.close_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.router.shutdown();
        self.inner.connection.close().await;

        if let Some(target) = &self.inner.close_target {
            match target.client.get(&target.url).send().await {
                Ok(response) if !response.status().is_success() => {
                    debug!(tab = %self.id(), status = %response.status(), "page close refused");
                }
                Ok(_) => {}
                Err(err) => warn!(tab = %self.id(), error = %err, "failed to close page"),
            }
        }
        info!(tab = %self.id(), "tab closed");
    }
}

fn evaluate_params(expression: &str) -> Value {
    json!({
        "expression": expression,
        "returnByValue": true,
    })
}
