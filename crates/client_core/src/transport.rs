//! The persistent channel. A transport hands the session a pair of queues;
//! the session never touches the socket itself.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::protocol::{ClientFrame, ServerFrame};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, warn};
use url::Url;

const OUTBOUND_CAPACITY: usize = 256;
const INBOUND_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSignal {
    Frame(ServerFrame),
    /// The link is gone. Sent once, last.
    Closed(Option<String>),
}

pub struct TransportLink {
    pub outbound: mpsc::Sender<ClientFrame>,
    pub inbound: mpsc::Receiver<TransportSignal>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<TransportLink>;
}

/// `http(s)://host[:port]` to `ws(s)://host[:port]/ws`.
pub fn ws_url_from_http(server_url: &str) -> Result<Url> {
    let ws_url = if server_url.starts_with("https://") {
        server_url.replacen("https://", "wss://", 1)
    } else if server_url.starts_with("http://") {
        server_url.replacen("http://", "ws://", 1)
    } else {
        return Err(anyhow!("server_url must start with http:// or https://"));
    };
    let ws_url = format!("{}/ws", ws_url.trim_end_matches('/'));
    Url::parse(&ws_url).with_context(|| format!("invalid websocket url: {ws_url}"))
}

pub struct WebSocketTransport {
    url: Url,
}

impl WebSocketTransport {
    pub fn new(url: Url) -> Self {
        Self { url }
    }

    pub fn from_server_url(server_url: &str) -> Result<Self> {
        Ok(Self::new(ws_url_from_http(server_url)?))
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self) -> Result<TransportLink> {
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .with_context(|| format!("failed to connect websocket: {}", self.url))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<ClientFrame>(OUTBOUND_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(frame = frame.name(), "failed to encode frame: {err}");
                        continue;
                    }
                };
                if let Err(err) = ws_writer.send(WsMessage::Text(text)).await {
                    debug!("websocket send failed: {err}");
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        tokio::spawn(async move {
            let reason = loop {
                match ws_reader.next().await {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<ServerFrame>(&text) {
                            Ok(frame) => {
                                if inbound_tx.send(TransportSignal::Frame(frame)).await.is_err() {
                                    return;
                                }
                            }
                            Err(err) => warn!("invalid server frame: {err}"),
                        }
                    }
                    Some(Ok(WsMessage::Close(close))) => {
                        break close.map(|c| c.reason.to_string()).filter(|r| !r.is_empty());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => break Some(format!("websocket receive failed: {err}")),
                    None => break None,
                }
            };
            let _ = inbound_tx.send(TransportSignal::Closed(reason)).await;
        });

        Ok(TransportLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
