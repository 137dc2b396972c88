//! Websocket accept loop and per-connection tasks.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use ringcore::protocol::SignalingMessage;
use ringcore::types::Msisdn;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use super::directory::{ConnectionHandle, Directory};
use super::router::SignalRouter;

/// Queue depth per connection before back-pressure kicks in.
const CONNECTION_QUEUE: usize = 64;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:7070".to_string(),
        }
    }
}

/// The signaling relay server.
pub struct RelayServer {
    config: RelayConfig,
    directory: Arc<Directory>,
    router: Arc<SignalRouter>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Arc<Self> {
        let directory = Arc::new(Directory::new());
        let router = Arc::new(SignalRouter::new(Arc::clone(&directory)));
        Arc::new(Self {
            config,
            directory,
            router,
        })
    }

    pub fn directory(&self) -> &Arc<Directory> {
        &self.directory
    }

    /// Bind the configured address and serve until the task is aborted.
    pub async fn run(self: Arc<Self>) -> Result<(), anyhow::Error> {
        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|e| anyhow::anyhow!("cannot bind {}: {e}", self.config.bind_addr))?;
        self.serve(listener).await
    }

    /// Serve on an already-bound listener (lets tests bind port 0).
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), anyhow::Error> {
        let local = listener.local_addr()?;
        info!("signaling relay listening on {local}");
        loop {
            let (stream, peer_addr) = listener.accept().await?;
            debug!("connection from {peer_addr}");
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream).await {
                    debug!("connection from {peer_addr} ended: {e}");
                }
            });
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream) -> Result<(), anyhow::Error> {
        let ws = accept_async(stream).await?;
        let (mut sink, mut stream) = ws.split();

        // Writer task: everything addressed to this connection goes through
        // one queue, so the reader side never blocks on a slow socket.
        let (tx, mut rx) = mpsc::channel::<SignalingMessage>(CONNECTION_QUEUE);
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("cannot encode {}: {e}", msg.kind());
                        continue;
                    }
                };
                if sink.send(Message::text(json)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Registration phase: the first decoded frame must bind an identity.
        let identity = loop {
            let Some(frame) = stream.next().await else {
                writer.abort();
                return Ok(());
            };
            match frame? {
                Message::Text(text) => {
                    match serde_json::from_str::<SignalingMessage>(text.as_str()) {
                        Ok(SignalingMessage::Register { identity }) => break identity,
                        Ok(other) => {
                            warn!("dropping {} received before register", other.kind());
                        }
                        Err(e) => warn!("dropping undecodable frame: {e}"),
                    }
                }
                Message::Close(_) => {
                    writer.abort();
                    return Ok(());
                }
                _ => {}
            }
        };

        self.directory
            .register(ConnectionHandle::new(identity.clone(), tx.clone()));
        let presence_pump = self.spawn_presence_pump(identity.clone(), tx.clone());

        // Everything after this point must unregister on the way out, even
        // if the read loop errors.
        let teardown = scopeguard::guard(
            (
                Arc::clone(&self.directory),
                Arc::clone(&self.router),
                identity.clone(),
                tx.clone(),
                presence_pump,
            ),
            |(directory, router, identity, tx, presence_pump)| {
                presence_pump.abort();
                writer.abort();
                if directory.unregister(&identity, &tx) {
                    tokio::spawn(async move {
                        router.handle_disconnect(&identity).await;
                    });
                }
            },
        );

        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    match serde_json::from_str::<SignalingMessage>(text.as_str()) {
                        Ok(msg) => self.router.route(&identity, msg).await,
                        Err(e) => warn!("dropping undecodable frame from {identity}: {e}"),
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!("read error from {identity}: {e}");
                    break;
                }
            }
        }
        drop(teardown);
        Ok(())
    }

    /// Forward directory presence transitions to this connection until it
    /// goes away.
    fn spawn_presence_pump(
        &self,
        identity: Msisdn,
        tx: mpsc::Sender<SignalingMessage>,
    ) -> tokio::task::JoinHandle<()> {
        let mut presence_rx = self.directory.subscribe();
        tokio::spawn(async move {
            loop {
                match presence_rx.recv().await {
                    Ok(update) => {
                        let msg = SignalingMessage::PresenceUpdate {
                            identity: update.identity,
                            status: update.presence,
                        };
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("presence pump for {identity} lagged by {skipped}");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
