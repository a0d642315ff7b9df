//! One websocket to a tab's debugging endpoint, driven by a read loop and a
//! write loop.

use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::codec::{self, Inbound};
use crate::error::{CdpError, Result};
use crate::router::Router;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub(crate) struct Connection {
    outbound: mpsc::Sender<String>,
    cancel: CancellationToken,
    loops: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

impl Connection {
    /// Connect to `ws_url` and start both loops.
    ///
    /// Whichever loop stops first shuts the router down, so every pending call
    /// resolves with [`CdpError::Closed`] when the transport dies.
    pub(crate) async fn open(
        ws_url: &str,
        router: Arc<Router>,
        write_capacity: usize,
    ) -> Result<Self> {
        let (socket, _) = connect_async(ws_url)
            .await
            .map_err(|err| CdpError::Connect {
                url: ws_url.to_string(),
                reason: err.to_string(),
            })?;
        debug!(url = %ws_url, "tab websocket connected");

        let (sink, stream) = socket.split();
        let (outbound, queue) = mpsc::channel(write_capacity.max(1));
        let cancel = CancellationToken::new();

        let reader = tokio::spawn(read_loop(stream, router.clone(), cancel.clone()));
        let writer = tokio::spawn(write_loop(sink, queue, router, cancel.clone()));

        Ok(Self {
            outbound,
            cancel,
            loops: Mutex::new(Some((reader, writer))),
        })
    }

    /// Queue an encoded frame for the write loop.
    pub(crate) async fn send(&self, frame: String) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(CdpError::Closed);
        }
        self.outbound
            .send(frame)
            .await
            .map_err(|_| CdpError::Closed)
    }

    pub(crate) fn is_open(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Stop both loops and release the socket. Safe to call more than once.
    pub(crate) async fn close(&self) {
        self.cancel.cancel();
        let loops = self.loops.lock().take();
        if let Some((reader, writer)) = loops {
            let _ = writer.await;
            let _ = reader.await;
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn read_loop(mut stream: SplitStream<Socket>, router: Arc<Router>, cancel: CancellationToken) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = stream.next() => frame,
        };

        let text = match frame {
            Some(Ok(WsMessage::Text(text))) => text.as_str().to_owned(),
            Some(Ok(WsMessage::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => text,
                Err(err) => {
                    warn!(error = %err, "non-UTF-8 frame, closing tab");
                    break;
                }
            },
            Some(Ok(WsMessage::Close(frame))) => {
                debug!(?frame, "browser closed the websocket");
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => {
                warn!(error = %err, "websocket read failed, closing tab");
                break;
            }
            None => break,
        };

        match codec::decode(&text) {
            Ok(Inbound::Response(response)) => router.resolve(response),
            Ok(Inbound::Event(event)) => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = router.dispatch(event) => {}
                }
            }
            Err(err) => match err.id {
                Some(id) => {
                    debug!(id, reason = %err.reason, "undecodable response");
                    router.fail(id, CdpError::Protocol(err.reason));
                }
                None => {
                    warn!(reason = %err.reason, "undecodable frame, closing tab");
                    break;
                }
            },
        }
    }

    cancel.cancel();
    router.shutdown();
}

async fn write_loop(
    mut sink: SplitSink<Socket, WsMessage>,
    mut queue: mpsc::Receiver<String>,
    router: Arc<Router>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            frame = queue.recv() => frame,
            _ = cancel.cancelled() => None,
        };
        let Some(frame) = frame else { break };

        debug!(frame = %frame, "send");
        if let Err(err) = sink.send(WsMessage::Text(frame.into())).await {
            warn!(error = %err, "websocket write failed, closing tab");
            cancel.cancel();
            router.shutdown();
            return;
        }
    }

    // Flush what was queued before the close so fire-and-forget commands
    // issued right before it still reach the browser.
    while let Ok(frame) = queue.try_recv() {
        if sink.send(WsMessage::Text(frame.into())).await.is_err() {
            break;
        }
    }
    let _ = sink.send(WsMessage::Close(None)).await;
    let _ = sink.close().await;
}
