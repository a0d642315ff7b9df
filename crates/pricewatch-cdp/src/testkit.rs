//! Scripted stand-in for a browser endpoint.
//!
//! Page creation, version and close requests are served over HTTP by
//! `wiremock`; every page session is a websocket answering the handful of
//! commands the crawler issues.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use crate::browser::Browser;
use crate::codec::methods;
use crate::error::Result;

#[derive(Default)]
struct MockState {
    evaluations: Mutex<HashMap<String, Value>>,
    stalled: Mutex<HashSet<String>>,
    redirects: Mutex<HashMap<String, String>>,
    skip_loads: AtomicUsize,
    navigations: Mutex<Vec<String>>,
    commands: Mutex<Vec<Value>>,
    closed: Mutex<Vec<String>>,
    targets: AtomicU64,
}

impl MockState {
    fn take_skip(&self) -> bool {
        self.skip_loads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

pub struct MockBrowser {
    http: MockServer,
    state: Arc<MockState>,
    accept: JoinHandle<()>,
}

impl MockBrowser {
    pub async fn start() -> Self {
        let state = Arc::new(MockState::default());
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock devtools listener");
        let ws_base = format!(
            "ws://{}",
            listener.local_addr().expect("mock listener address")
        );
        let accept = tokio::spawn(accept_sessions(listener, state.clone()));

        let http = MockServer::start().await;
        Mock::given(path("/json/new"))
            .respond_with(NewTarget {
                state: state.clone(),
                ws_base,
            })
            .mount(&http)
            .await;
        Mock::given(method("GET"))
            .and(path("/json/version"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "Browser": "MockChrome/1.0",
                "Protocol-Version": "1.3",
                "User-Agent": "Mozilla/5.0 (MockChrome)",
            })))
            .mount(&http)
            .await;
        Mock::given(path_regex(r"^/json/close/.+$"))
            .respond_with(CloseTarget {
                state: state.clone(),
            })
            .mount(&http)
            .await;

        Self {
            http,
            state,
            accept,
        }
    }

    /// Endpoint handle pointing at this mock.
    pub fn browser(&self) -> Result<Browser> {
        Browser::from_base_url(&self.http.uri())
    }

    pub fn uri(&self) -> String {
        self.http.uri()
    }

    /// Answer `Runtime.evaluate` of exactly `expression` with `value`.
    pub fn set_evaluation(&self, expression: &str, value: Value) {
        self.state
            .evaluations
            .lock()
            .insert(expression.to_string(), value);
    }

    /// Never answer `Runtime.evaluate` of exactly `expression`.
    pub fn stall_evaluation(&self, expression: &str) {
        self.state.stalled.lock().insert(expression.to_string());
    }

    /// After navigating to `from`, report `to` as `document.URL`.
    pub fn redirect(&self, from: &str, to: &str) {
        self.state
            .redirects
            .lock()
            .insert(from.to_string(), to.to_string());
    }

    /// Withhold the load event of the next `count` navigations.
    pub fn skip_load_events(&self, count: usize) {
        self.state.skip_loads.store(count, Ordering::SeqCst);
    }

    pub fn navigations(&self) -> Vec<String> {
        self.state.navigations.lock().clone()
    }

    /// Every command frame received, across all sessions.
    pub fn commands(&self) -> Vec<Value> {
        self.state.commands.lock().clone()
    }

    pub fn commands_named(&self, name: &str) -> Vec<Value> {
        self.commands()
            .into_iter()
            .filter(|command| command["method"] == name)
            .collect()
    }

    pub fn tabs_created(&self) -> u64 {
        self.state.targets.load(Ordering::SeqCst)
    }

    pub fn closed_targets(&self) -> Vec<String> {
        self.state.closed.lock().clone()
    }
}

impl Drop for MockBrowser {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

struct NewTarget {
    state: Arc<MockState>,
    ws_base: String,
}

impl Respond for NewTarget {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.state.targets.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("T{n}");
        ResponseTemplate::new(200).set_body_json(json!({
            "id": id,
            "type": "page",
            "url": "about:blank",
            "webSocketDebuggerUrl": format!("{}/devtools/page/{id}", self.ws_base),
        }))
    }
}

struct CloseTarget {
    state: Arc<MockState>,
}

impl Respond for CloseTarget {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        if let Some(id) = request.url.path().rsplit('/').next() {
            self.state.closed.lock().push(id.to_string());
        }
        ResponseTemplate::new(200).set_body_string("Target is closing")
    }
}

async fn accept_sessions(listener: TcpListener, state: Arc<MockState>) {
    while let Ok((stream, _)) = listener.accept().await {
        tokio::spawn(session(stream, state.clone()));
    }
}

async fn session(stream: TcpStream, state: Arc<MockState>) {
    let Ok(socket) = accept_async(stream).await else {
        return;
    };
    let (mut sink, mut source) = socket.split();
    let mut current_url = "about:blank".to_string();

    while let Some(Ok(frame)) = source.next().await {
        let text = match frame {
            WsMessage::Text(text) => text.as_str().to_owned(),
            WsMessage::Close(_) => break,
            _ => continue,
        };
        let Ok(command) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        state.commands.lock().push(command.clone());

        let id = command["id"].as_u64().unwrap_or_default();
        let name = command["method"].as_str().unwrap_or_default();
        let params = &command["params"];
        let mut fire_load = false;

        let reply = match name {
            methods::PAGE_ENABLE | methods::BROWSER_CLOSE => json!({"id": id, "result": {}}),
            methods::PAGE_NAVIGATE => {
                let url = params["url"].as_str().unwrap_or_default().to_string();
                state.navigations.lock().push(url.clone());
                current_url = state
                    .redirects
                    .lock()
                    .get(&url)
                    .cloned()
                    .unwrap_or(url);
                fire_load = !state.take_skip();
                json!({"id": id, "result": {"frameId": "F1", "loaderId": "L1"}})
            }
            methods::RUNTIME_EVALUATE => {
                let expression = params["expression"].as_str().unwrap_or_default();
                if state.stalled.lock().contains(expression) {
                    continue;
                }
                let value = state.evaluations.lock().get(expression).cloned();
                let value = match value {
                    Some(value) => Some(value),
                    None if expression == "document.URL" => Some(json!(current_url)),
                    None => None,
                };
                json!({"id": id, "result": {"result": remote_object(value)}})
            }
            methods::BROWSER_GET_VERSION => json!({"id": id, "result": {
                "protocolVersion": "1.3",
                "product": "MockChrome/1.0",
            }}),
            other => json!({"id": id, "error": {
                "code": -32601,
                "message": format!("'{other}' wasn't found"),
            }}),
        };

        if sink.send(WsMessage::Text(reply.to_string().into())).await.is_err() {
            break;
        }
        if fire_load {
            let event = json!({
                "method": methods::PAGE_LOAD_EVENT_FIRED,
                "params": {"timestamp": 1.0},
            });
            if sink.send(WsMessage::Text(event.to_string().into())).await.is_err() {
                break;
            }
        }
    }
}

fn remote_object(value: Option<Value>) -> Value {
    match value {
        None => json!({"type": "undefined"}),
        Some(Value::Null) => json!({"type": "object", "subtype": "null", "value": null}),
        Some(Value::String(text)) => json!({"type": "string", "value": text}),
        Some(Value::Number(number)) => json!({"type": "number", "value": number}),
        Some(Value::Bool(flag)) => json!({"type": "boolean", "value": flag}),
        Some(other) => json!({"type": "object", "value": other}),
    }
}
