//! Websocket implementation of the signaling transport.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use ringcore::protocol::SignalingMessage;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::{SignalingTransport, TransportEvent, TransportFactory};

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;
type WsStream = SplitStream<RawWs>;

/// Websocket signaling transport.
pub struct WebSocketTransport {
    ws_sink: Arc<Mutex<Option<WsSink>>>,
}

impl WebSocketTransport {
    fn new(sink: WsSink) -> Self {
        Self {
            ws_sink: Arc::new(Mutex::new(Some(sink))),
        }
    }
}

#[async_trait]
impl SignalingTransport for WebSocketTransport {
    async fn send(&self, msg: &SignalingMessage) -> Result<(), anyhow::Error> {
        let mut sink_guard = self.ws_sink.lock().await;
        let sink = sink_guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("socket is closed"))?;
        let json = serde_json::to_string(msg)?;
        debug!("--> {}", msg.kind());
        sink.send(Message::text(json))
            .await
            .map_err(|e| anyhow::anyhow!("websocket send error: {e}"))?;
        Ok(())
    }

    async fn disconnect(&self) {
        let mut sink_guard = self.ws_sink.lock().await;
        if let Some(mut sink) = sink_guard.take() {
            let _ = sink.send(Message::Close(None)).await;
        }
    }
}

/// Factory for websocket transports pointed at one relay URL.
pub struct WebSocketTransportFactory {
    url: String,
}

impl WebSocketTransportFactory {
    /// `url` is a `ws://host:port` relay endpoint.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl TransportFactory for WebSocketTransportFactory {
    async fn connect(
        &self,
    ) -> Result<(Arc<dyn SignalingTransport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
        info!("dialing relay at {}", self.url);
        let (stream, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| anyhow::anyhow!("websocket connect failed: {e}"))?;
        let (sink, stream) = stream.split();

        let (event_tx, event_rx) = mpsc::channel(100);
        let transport = Arc::new(WebSocketTransport::new(sink));

        let pump_tx = event_tx.clone();
        tokio::spawn(read_pump(stream, pump_tx));

        let _ = event_tx.send(TransportEvent::Connected).await;
        Ok((transport, event_rx))
    }
}

async fn read_pump(mut stream: WsStream, event_tx: mpsc::Sender<TransportEvent>) {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                match serde_json::from_str::<SignalingMessage>(text.as_str()) {
                    Ok(msg) => {
                        debug!("<-- {}", msg.kind());
                        if event_tx.send(TransportEvent::Message(msg)).await.is_err() {
                            warn!("event receiver dropped, closing read pump");
                            return;
                        }
                    }
                    Err(e) => warn!("dropping undecodable signaling frame: {e}"),
                }
            }
            Some(Ok(Message::Close(_))) => {
                debug!("relay closed the connection");
                break;
            }
            Some(Ok(_)) => {
                // Binary/ping/pong frames carry nothing for us.
            }
            Some(Err(e)) => {
                warn!("error reading from websocket: {e}");
                break;
            }
            None => {
                debug!("websocket stream ended");
                break;
            }
        }
    }
    let _ = event_tx.send(TransportEvent::Disconnected).await;
}
