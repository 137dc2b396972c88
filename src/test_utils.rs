//! Test doubles for the trait seams: media engine, media source, and an
//! in-memory signaling transport. Used by the unit tests here and by the
//! integration tests under `tests/`.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use ringcore::protocol::{IceCandidate, SdpType, SessionDescription, SignalingMessage};
use tokio::sync::mpsc;

use crate::calls::{
    ConnectivityState, EngineError, EngineEvent, LocalMedia, MediaAccessDenied, MediaEngine,
    MediaEngineFactory, MediaSource,
};
use crate::socket::{SignalingTransport, TransportEvent, TransportFactory};

fn sdp_kind(desc: &SessionDescription) -> &'static str {
    match desc.sdp_type {
        SdpType::Offer => "offer",
        SdpType::Answer => "answer",
    }
}

/// A scripted media engine: records every call, optionally fails or delays,
/// and lets tests inject engine events.
pub struct MockMediaEngine {
    ops: StdMutex<Vec<String>>,
    candidates: StdMutex<Vec<String>>,
    events: mpsc::Sender<EngineEvent>,
    fail_set_remote: bool,
    delay: Duration,
    closed: AtomicBool,
}

impl MockMediaEngine {
    /// The negotiation calls seen so far, in order.
    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    /// Candidate strings applied so far, in order, duplicates included.
    pub fn candidates(&self) -> Vec<String> {
        self.candidates.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn emit_candidate(&self, candidate: IceCandidate) {
        let _ = self.events.send(EngineEvent::IceCandidate(candidate)).await;
    }

    pub async fn emit_connectivity(&self, state: ConnectivityState) {
        let _ = self.events.send(EngineEvent::Connectivity(state)).await;
    }

    fn record(&self, op: impl Into<String>) {
        self.ops.lock().unwrap().push(op.into());
    }
}

#[async_trait]
impl MediaEngine for MockMediaEngine {
    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.record("create_offer");
        Ok(SessionDescription::offer("v=0 mock offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.record("create_answer");
        Ok(SessionDescription::answer("v=0 mock answer"))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        self.record(format!("set_local({})", sdp_kind(&desc)));
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        if self.fail_set_remote {
            return Err(EngineError::new("mock remote description failure"));
        }
        self.record(format!("set_remote({})", sdp_kind(&desc)));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        self.candidates.lock().unwrap().push(candidate.candidate);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Factory handing out [`MockMediaEngine`]s and keeping them reachable for
/// assertions and event injection.
#[derive(Default)]
pub struct MockEngineFactory {
    engines: StdMutex<Vec<Arc<MockMediaEngine>>>,
    fail_set_remote: AtomicBool,
    delay_ms: AtomicUsize,
}

impl MockEngineFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many engines were created so far.
    pub fn created(&self) -> usize {
        self.engines.lock().unwrap().len()
    }

    /// The `index`-th engine created.
    pub fn engine(&self, index: usize) -> Arc<MockMediaEngine> {
        self.engines.lock().unwrap()[index].clone()
    }

    /// Engines created from now on fail `set_remote_description`.
    pub fn fail_next_set_remote(&self) {
        self.fail_set_remote.store(true, Ordering::SeqCst);
    }

    /// Engines created from now on sleep this long in offer/answer creation.
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as usize, Ordering::SeqCst);
    }
}

#[async_trait]
impl MediaEngineFactory for MockEngineFactory {
    async fn create_engine(
        &self,
    ) -> Result<(Arc<dyn MediaEngine>, mpsc::Receiver<EngineEvent>), EngineError> {
        let (tx, rx) = mpsc::channel(64);
        let engine = Arc::new(MockMediaEngine {
            ops: StdMutex::new(Vec::new()),
            candidates: StdMutex::new(Vec::new()),
            events: tx,
            fail_set_remote: self.fail_set_remote.load(Ordering::SeqCst),
            delay: Duration::from_millis(self.delay_ms.load(Ordering::SeqCst) as u64),
            closed: AtomicBool::new(false),
        });
        self.engines.lock().unwrap().push(engine.clone());
        Ok((engine, rx))
    }
}

/// A media source that counts acquisitions and releases.
#[derive(Default)]
pub struct MockMediaSource {
    denied: AtomicBool,
    acquired: AtomicUsize,
    released: Arc<AtomicUsize>,
}

impl MockMediaSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent acquisition fail with a permission error.
    pub fn deny(&self) {
        self.denied.store(true, Ordering::SeqCst);
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaSource for MockMediaSource {
    async fn acquire_local_media(&self) -> Result<LocalMedia, MediaAccessDenied> {
        if self.denied.load(Ordering::SeqCst) {
            return Err(MediaAccessDenied(
                "camera/microphone permission denied".into(),
            ));
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        let released = Arc::clone(&self.released);
        Ok(LocalMedia::with_releaser("mock devices", move || {
            released.fetch_add(1, Ordering::SeqCst);
        }))
    }
}

/// An in-memory signaling transport: outbound messages land in a channel
/// the test inspects, and the test injects transport events directly.
pub struct ChannelTransport {
    tx: mpsc::Sender<SignalingMessage>,
    closed: AtomicBool,
}

#[async_trait]
impl SignalingTransport for ChannelTransport {
    async fn send(&self, msg: &SignalingMessage) -> Result<(), anyhow::Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("socket is closed"));
        }
        self.tx
            .send(msg.clone())
            .await
            .map_err(|_| anyhow::anyhow!("receiver dropped"))
    }

    async fn disconnect(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// The test's side of a [`ChannelTransportFactory`].
pub struct ChannelTransportHandles {
    /// Messages the client sent to the "relay".
    pub outbound: mpsc::Receiver<SignalingMessage>,
    /// Inject transport events (incoming messages, disconnects).
    pub inject: mpsc::Sender<TransportEvent>,
}

/// One-shot factory producing a [`ChannelTransport`] wired to test handles.
pub struct ChannelTransportFactory {
    prepared: StdMutex<Option<(Arc<ChannelTransport>, mpsc::Receiver<TransportEvent>)>>,
}

impl ChannelTransportFactory {
    pub fn new() -> (Self, ChannelTransportHandles) {
        let (out_tx, out_rx) = mpsc::channel(64);
        let (inject_tx, inject_rx) = mpsc::channel(64);
        let transport = Arc::new(ChannelTransport {
            tx: out_tx,
            closed: AtomicBool::new(false),
        });
        let factory = Self {
            prepared: StdMutex::new(Some((transport, inject_rx))),
        };
        let handles = ChannelTransportHandles {
            outbound: out_rx,
            inject: inject_tx,
        };
        (factory, handles)
    }
}

#[async_trait]
impl TransportFactory for ChannelTransportFactory {
    async fn connect(
        &self,
    ) -> Result<(Arc<dyn SignalingTransport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
        let (transport, events) = self
            .prepared
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow::anyhow!("channel transport already connected"))?;
        Ok((transport as Arc<dyn SignalingTransport>, events))
    }
}

/// Poll `probe` until it returns true or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut probe: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if probe().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
