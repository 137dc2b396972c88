//! The calling client: one authenticated identity, one signaling
//! connection, one call manager.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info, warn};
use ringcore::protocol::SignalingMessage;
use ringcore::types::events::{Connected, Disconnected, PresenceUpdate};
use ringcore::types::{CallRecord, Contact, Msisdn};
use tokio::sync::{RwLock, mpsc};

use crate::calls::{CallError, CallManager, MediaEngineFactory, MediaSource};
use crate::config::ClientConfig;
use crate::socket::{SignalingTransport, TransportEvent, TransportFactory};
use crate::store::error::Result as StoreResult;
use crate::store::traits::Backend;
use crate::types::events::EventBus;

pub struct Client {
    config: ClientConfig,
    call_manager: Arc<CallManager>,
    event_bus: Arc<EventBus>,
    backend: Arc<dyn Backend>,
    transport: RwLock<Option<Arc<dyn SignalingTransport>>>,
    outbound_rx: std::sync::Mutex<Option<mpsc::Receiver<SignalingMessage>>>,
    is_connecting: AtomicBool,
    is_connected: AtomicBool,
}

impl Client {
    pub fn new(
        config: ClientConfig,
        engine_factory: Arc<dyn MediaEngineFactory>,
        media_source: Arc<dyn MediaSource>,
        backend: Arc<dyn Backend>,
    ) -> Arc<Self> {
        let event_bus = Arc::new(EventBus::new());
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let call_manager = CallManager::new(
            config.identity.clone(),
            config.calls.clone(),
            engine_factory,
            media_source,
            backend.clone(),
            event_bus.clone(),
            outbound_tx,
        );
        Arc::new(Self {
            config,
            call_manager,
            event_bus,
            backend,
            transport: RwLock::new(None),
            outbound_rx: std::sync::Mutex::new(Some(outbound_rx)),
            is_connecting: AtomicBool::new(false),
            is_connected: AtomicBool::new(false),
        })
    }

    pub fn identity(&self) -> &Msisdn {
        &self.config.identity
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn call_manager(&self) -> &Arc<CallManager> {
        &self.call_manager
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::SeqCst)
    }

    /// Connect to the relay and register our identity. Spawns the event
    /// pumps; returns once registration is on the wire.
    pub async fn connect(
        self: &Arc<Self>,
        factory: &dyn TransportFactory,
    ) -> Result<(), anyhow::Error> {
        if self.is_connecting.swap(true, Ordering::SeqCst) {
            return Err(anyhow::anyhow!("already connecting"));
        }
        let _guard = scopeguard::guard((), |_| {
            self.is_connecting.store(false, Ordering::Relaxed);
        });
        if self.is_connected() {
            return Err(anyhow::anyhow!("already connected"));
        }
        let mut outbound_rx = self
            .outbound_rx
            .lock()
            .map_err(|_| anyhow::anyhow!("client state poisoned"))?
            .take()
            .ok_or_else(|| anyhow::anyhow!("client was already connected once"))?;

        let (transport, mut events) = factory.connect().await?;
        transport
            .send(&SignalingMessage::Register {
                identity: self.config.identity.clone(),
            })
            .await?;
        *self.transport.write().await = Some(Arc::clone(&transport));
        self.is_connected.store(true, Ordering::SeqCst);
        info!("registered as {}", self.config.identity);

        // Writer pump: queued outbound messages onto the transport.
        let writer_transport = Arc::clone(&transport);
        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                if let Err(e) = writer_transport.send(&msg).await {
                    warn!("failed to send {}: {e}", msg.kind());
                }
            }
        });

        // Reader pump: transport events into the call manager and event bus.
        let client = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    TransportEvent::Connected => {
                        let _ = client.event_bus.connected.send(Arc::new(Connected));
                    }
                    TransportEvent::Message(msg) => client.handle_signal(msg).await,
                    TransportEvent::Disconnected => {
                        client.is_connected.store(false, Ordering::SeqCst);
                        client.call_manager.handle_transport_down().await;
                        let _ = client.event_bus.disconnected.send(Arc::new(Disconnected));
                        break;
                    }
                }
            }
            debug!("transport event pump finished");
        });
        Ok(())
    }

    pub async fn disconnect(&self) {
        if let Some(transport) = self.transport.write().await.take() {
            transport.disconnect().await;
        }
    }

    async fn handle_signal(&self, msg: SignalingMessage) {
        match msg {
            SignalingMessage::PresenceUpdate { identity, status } => {
                debug!("presence: {identity} is {status:?}");
                let _ = self.event_bus.presence.send(Arc::new(PresenceUpdate {
                    identity,
                    presence: status,
                }));
            }
            SignalingMessage::Register { .. } => {
                warn!("relay sent an unexpected register message");
            }
            other => self.dispatch_call_signal(other).await,
        }
    }

    // ==================== Calls ====================

    pub async fn place_call(&self, remote: Msisdn) -> Result<(), CallError> {
        if !self.is_connected() {
            return Err(CallError::NotConnected);
        }
        self.call_manager.place_call(remote).await
    }

    pub async fn accept(&self, remote: Msisdn) -> Result<(), CallError> {
        self.call_manager.accept(remote).await
    }

    pub async fn decline(&self, remote: Msisdn) -> Result<(), CallError> {
        self.call_manager.decline(remote).await
    }

    pub async fn hang_up(&self, remote: Msisdn) -> Result<(), CallError> {
        self.call_manager.hang_up(remote).await
    }

    // ==================== Contacts & history ====================

    pub async fn add_contact(&self, name: &str, mobile: &Msisdn) -> StoreResult<Contact> {
        self.backend
            .add_contact(&self.config.identity, name, mobile)
            .await
    }

    pub async fn contacts(&self) -> StoreResult<Vec<Contact>> {
        self.backend.contacts(&self.config.identity).await
    }

    pub async fn delete_contact(&self, id: u64) -> StoreResult<bool> {
        self.backend.delete_contact(&self.config.identity, id).await
    }

    pub async fn call_history(&self) -> StoreResult<Vec<CallRecord>> {
        self.backend.call_history(&self.config.identity).await
    }
}
