//! The client side of the signaling channel.
//!
//! [`SignalingTransport`] is the seam: the client sends typed messages and
//! consumes a stream of [`TransportEvent`]s. The production implementation
//! is a websocket ([`ws::WebSocketTransportFactory`]); tests plug in an
//! in-memory pair (see `test_utils`).

pub mod ws;

use std::sync::Arc;

use async_trait::async_trait;
use ringcore::protocol::SignalingMessage;
use tokio::sync::mpsc;

pub use ws::WebSocketTransportFactory;

/// An event produced by the transport layer.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The transport has successfully connected.
    Connected,
    /// A decoded signaling message arrived from the relay.
    Message(SignalingMessage),
    /// The connection was lost.
    Disconnected,
}

/// Represents an active signaling connection.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Sends one signaling message to the relay.
    async fn send(&self, msg: &SignalingMessage) -> Result<(), anyhow::Error>;

    /// Closes the connection.
    async fn disconnect(&self);
}

/// A factory responsible for creating new transport instances.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Creates a new transport and returns it, along with a stream of events.
    async fn connect(
        &self,
    ) -> Result<(Arc<dyn SignalingTransport>, mpsc::Receiver<TransportEvent>), anyhow::Error>;
}
