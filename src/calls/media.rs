//! Media negotiation seams.
//!
//! The signaling core never touches ICE/DTLS/SRTP itself. It drives a
//! [`MediaEngine`] (one per call attempt, built by a [`MediaEngineFactory`])
//! and listens to the engine's [`EngineEvent`] stream. Local capture devices
//! are behind [`MediaSource`]; the returned [`LocalMedia`] handle releases
//! the devices when dropped, which is what ties device lifetime to the call
//! session lifetime.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use log::warn;
use ringcore::protocol::{IceCandidate, SessionDescription};
use tokio::sync::{Mutex, mpsc};

/// Engine-reported connectivity, collapsed to what the state machine needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Connected,
    Disconnected,
    Failed,
}

/// Events emitted by a media engine while a call is being negotiated.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A local candidate was discovered; relay it to the peer immediately.
    /// Emission order must be preserved per engine.
    IceCandidate(IceCandidate),
    Connectivity(ConnectivityState),
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct EngineError(pub String);

impl EngineError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// The peer-to-peer media engine for one call attempt.
///
/// Implementations wrap a real engine (see `webrtc_engine` behind the
/// `media-webrtc` feature) or a test double. All errors are surfaced as
/// [`EngineError`] and converted into a failed call by the manager; they
/// must never panic the caller.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, EngineError>;
    async fn create_answer(&self) -> Result<SessionDescription, EngineError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError>;
    /// Apply one remote candidate. The engine owns idempotence; this layer
    /// hands candidates over exactly as received, duplicates included.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError>;
    async fn close(&self);
}

/// Builds one engine per call attempt, together with its event stream.
#[async_trait]
pub trait MediaEngineFactory: Send + Sync {
    async fn create_engine(
        &self,
    ) -> Result<(Arc<dyn MediaEngine>, mpsc::Receiver<EngineEvent>), EngineError>;
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("media access denied: {0}")]
pub struct MediaAccessDenied(pub String);

/// Local camera/microphone acquisition.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire_local_media(&self) -> Result<LocalMedia, MediaAccessDenied>;
}

/// A handle to acquired capture devices. Dropping it releases them; the
/// optional releaser makes the release observable.
pub struct LocalMedia {
    label: String,
    on_release: Option<Box<dyn FnOnce() + Send>>,
}

impl LocalMedia {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            on_release: None,
        }
    }

    pub fn with_releaser(label: impl Into<String>, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            label: label.into(),
            on_release: Some(Box::new(release)),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl Drop for LocalMedia {
    fn drop(&mut self) {
        if let Some(release) = self.on_release.take() {
            release();
        }
    }
}

impl fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalMedia")
            .field("label", &self.label)
            .finish()
    }
}

/// The engine plus the acquired devices for one live call attempt.
///
/// Candidate application goes through `candidate_lock` so that a
/// buffered-candidate flush and a freshly arrived candidate cannot
/// interleave out of order (the flush holds the lock for its whole batch).
pub struct MediaSession {
    engine: Arc<dyn MediaEngine>,
    pub(crate) candidate_lock: Mutex<()>,
    media: std::sync::Mutex<Option<LocalMedia>>,
}

impl MediaSession {
    pub fn new(engine: Arc<dyn MediaEngine>, media: LocalMedia) -> Self {
        Self {
            engine,
            candidate_lock: Mutex::new(()),
            media: std::sync::Mutex::new(Some(media)),
        }
    }

    pub(crate) fn engine(&self) -> &Arc<dyn MediaEngine> {
        &self.engine
    }

    /// Caller path: produce the offer and install it locally.
    pub async fn start_offer(&self) -> Result<SessionDescription, EngineError> {
        let offer = self.engine.create_offer().await?;
        self.engine.set_local_description(offer.clone()).await?;
        Ok(offer)
    }

    /// Callee path: install the peer's offer and produce our answer.
    pub async fn accept_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, EngineError> {
        self.engine.set_remote_description(offer).await?;
        let answer = self.engine.create_answer().await?;
        self.engine.set_local_description(answer.clone()).await?;
        Ok(answer)
    }

    /// Caller path: install the peer's answer.
    pub async fn install_answer(&self, answer: SessionDescription) -> Result<(), EngineError> {
        self.engine.set_remote_description(answer).await
    }

    /// Apply a single freshly received candidate, ordered behind any
    /// in-progress flush.
    pub async fn apply_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        let _ordered = self.candidate_lock.lock().await;
        self.engine.add_ice_candidate(candidate).await
    }

    /// Close the engine and release the devices immediately.
    pub async fn close(&self) {
        self.engine.close().await;
        let released = self.media.lock().map(|mut m| m.take());
        match released {
            Ok(handle) => drop(handle),
            Err(poisoned) => warn!("media handle lock poisoned: {poisoned}"),
        }
    }
}

impl fmt::Debug for MediaSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaSession").finish_non_exhaustive()
    }
}
