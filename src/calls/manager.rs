//! Call manager for orchestrating call lifecycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::{debug, info, warn};
use ringcore::protocol::{IceCandidate, SessionDescription, SignalingMessage};
use ringcore::types::events as events_t;
use ringcore::types::{
    CallDirection, CallEndReason, CallFailReason, CallLogStatus, CallRecord, Msisdn,
};
use tokio::sync::{Mutex, RwLock, mpsc};

use super::error::CallError;
use super::media::{
    ConnectivityState, EngineEvent, MediaEngineFactory, MediaSession, MediaSource,
};
use super::state::{CallSession, CallState, CallTransition, InvalidTransition};
use crate::store::traits::Backend;
use crate::types::events::EventBus;

/// Configuration for the call manager.
#[derive(Debug, Clone)]
pub struct CallManagerConfig {
    /// Maximum concurrent calls. 1 gives busy semantics: a second inbound
    /// offer is answered with `call-failed { busy }`, no call waiting.
    pub max_concurrent_calls: usize,
    /// Seconds before an unanswered Dialing/Ringing call fails. 0 disables.
    pub ring_timeout_secs: u64,
}

impl Default for CallManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 1,
            ring_timeout_secs: 45,
        }
    }
}

/// What to tell the peer when a session reaches a terminal state.
enum Notify {
    /// Nothing — the transition was triggered by the peer's own message.
    None,
    HangUp,
    Reject,
    CallFailed(CallFailReason),
}

enum FinalEvent {
    Ended(CallEndReason, Option<i64>),
    Rejected,
    Failed(String),
}

/// Manages the call sessions of one identity and their state transitions.
///
/// Sessions are keyed by the remote identity; with the default configuration
/// at most one non-terminal session exists at a time. Terminal sessions are
/// retained until the next call attempt so that late messages and stale
/// async completions can be recognized and dropped. Media sessions are
/// tagged with the attempt epoch: a delayed completion of an older attempt
/// can never install or tear down a newer attempt's engine.
pub struct CallManager {
    our_identity: Msisdn,
    config: CallManagerConfig,
    sessions: RwLock<HashMap<Msisdn, CallSession>>,
    media_sessions: Mutex<HashMap<Msisdn, (u64, Arc<MediaSession>)>>,
    engine_factory: Arc<dyn MediaEngineFactory>,
    media_source: Arc<dyn MediaSource>,
    store: Arc<dyn Backend>,
    events: Arc<EventBus>,
    outbound: mpsc::Sender<SignalingMessage>,
    next_epoch: AtomicU64,
}

impl CallManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        our_identity: Msisdn,
        config: CallManagerConfig,
        engine_factory: Arc<dyn MediaEngineFactory>,
        media_source: Arc<dyn MediaSource>,
        store: Arc<dyn Backend>,
        events: Arc<EventBus>,
        outbound: mpsc::Sender<SignalingMessage>,
    ) -> Arc<Self> {
        Arc::new(Self {
            our_identity,
            config,
            sessions: RwLock::new(HashMap::new()),
            media_sessions: Mutex::new(HashMap::new()),
            engine_factory,
            media_source,
            store,
            events,
            outbound,
            next_epoch: AtomicU64::new(1),
        })
    }

    pub fn identity(&self) -> &Msisdn {
        &self.our_identity
    }

    /// Start an outgoing call. Returns once the session exists; media
    /// acquisition and offer negotiation continue in the background and are
    /// reported through the event bus.
    pub async fn place_call(self: &Arc<Self>, remote: Msisdn) -> Result<(), CallError> {
        if remote == self.our_identity {
            return Err(CallError::SelfCall);
        }
        let epoch = {
            let mut sessions = self.sessions.write().await;
            sessions.retain(|_, s| !s.state.is_terminal());
            if sessions.len() >= self.config.max_concurrent_calls {
                return Err(CallError::AlreadyInCall);
            }
            let epoch = self.next_epoch.fetch_add(1, Ordering::SeqCst);
            sessions.insert(
                remote.clone(),
                CallSession::new_outgoing(self.our_identity.clone(), remote.clone(), epoch),
            );
            epoch
        };
        info!("placing call to {remote}");

        let mgr = Arc::clone(self);
        let peer = remote.clone();
        tokio::spawn(async move {
            mgr.negotiate_outgoing(peer, epoch).await;
        });
        Ok(())
    }

    /// Accept the ringing call from `remote`. Negotiation continues in the
    /// background; the `call-answer` is emitted once the engine produced it.
    pub async fn accept(self: &Arc<Self>, remote: Msisdn) -> Result<(), CallError> {
        let (epoch, offer) = {
            let sessions = self.sessions.read().await;
            let session = sessions
                .get(&remote)
                .ok_or_else(|| CallError::NotFound(remote.clone()))?;
            if !session.state.can_accept() {
                return Err(CallError::InvalidTransition(InvalidTransition {
                    current_state: session.state.name().to_string(),
                    attempted: "LocalAccepted".to_string(),
                }));
            }
            let offer = session
                .remote_description
                .clone()
                .ok_or_else(|| CallError::Negotiation("ringing call has no offer".into()))?;
            (session.epoch, offer)
        };
        info!("accepting call from {remote}");

        let mgr = Arc::clone(self);
        let peer = remote.clone();
        tokio::spawn(async move {
            mgr.negotiate_accept(peer, epoch, offer).await;
        });
        Ok(())
    }

    /// Decline the ringing call from `remote`.
    pub async fn decline(&self, remote: Msisdn) -> Result<(), CallError> {
        info!("declining call from {remote}");
        self.finalize(
            &remote,
            None,
            CallTransition::LocalDeclined,
            Notify::Reject,
            None,
        )
        .await
    }

    /// Hang up the call with `remote`, from any non-terminal state.
    pub async fn hang_up(&self, remote: Msisdn) -> Result<(), CallError> {
        info!("hanging up call with {remote}");
        self.finalize(
            &remote,
            None,
            CallTransition::HangUp {
                reason: CallEndReason::LocalHangUp,
            },
            Notify::HangUp,
            None,
        )
        .await
    }

    // ==================== Incoming signaling ====================

    /// An offer arrived. Creates a ringing session, or answers with
    /// `call-failed { busy }` when a non-terminal session already exists.
    pub(crate) async fn handle_offer(self: &Arc<Self>, from: Msisdn, offer: SessionDescription) {
        if from == self.our_identity {
            warn!("ignoring call-offer from our own identity");
            return;
        }
        let busy = {
            let mut sessions = self.sessions.write().await;
            sessions.retain(|_, s| !s.state.is_terminal());
            if sessions.len() >= self.config.max_concurrent_calls {
                true
            } else {
                let epoch = self.next_epoch.fetch_add(1, Ordering::SeqCst);
                sessions.insert(
                    from.clone(),
                    CallSession::new_incoming(
                        self.our_identity.clone(),
                        from.clone(),
                        offer,
                        epoch,
                    ),
                );
                self.start_ring_timer(from.clone(), epoch);
                false
            }
        };
        if busy {
            info!("busy: rejecting offer from {from}");
            self.send(SignalingMessage::CallFailed {
                to: from,
                reason: CallFailReason::Busy,
            })
            .await;
            return;
        }
        info!("incoming call from {from}");
        let _ = self
            .events
            .incoming_call
            .send(Arc::new(events_t::IncomingCall {
                from,
                received_at: chrono::Utc::now(),
            }));
    }

    /// The callee answered our offer: install it and flush buffered
    /// candidates. Engine work runs in the background so a concurrent
    /// hang-up is still honored.
    pub(crate) async fn handle_answer(self: &Arc<Self>, from: Msisdn, answer: SessionDescription) {
        let epoch = {
            let mut sessions = self.sessions.write().await;
            let Some(session) = sessions.get_mut(&from) else {
                debug!("ignoring call-answer from {from}: no session");
                return;
            };
            if session.state.is_terminal() {
                debug!("ignoring call-answer from {from}: call already over");
                return;
            }
            if !matches!(session.state, CallState::Dialing { .. }) {
                warn!(
                    "ignoring call-answer from {from} in state {}",
                    session.state.name()
                );
                return;
            }
            if session.record_remote_description(answer.clone()).is_err() {
                warn!("ignoring duplicate call-answer from {from}");
                return;
            }
            session.epoch
        };

        let mgr = Arc::clone(self);
        tokio::spawn(async move {
            mgr.install_answer(from, epoch, answer).await;
        });
    }

    /// A candidate arrived: buffer it until the remote description is in the
    /// engine, else apply it immediately. Never deduplicated here.
    pub(crate) async fn handle_ice(&self, from: Msisdn, candidate: IceCandidate) {
        let epoch = {
            let mut sessions = self.sessions.write().await;
            let Some(session) = sessions.get_mut(&from) else {
                debug!("ignoring ice-candidate from {from}: no session");
                return;
            };
            if session.state.is_terminal() {
                debug!("ignoring ice-candidate from {from}: call already over");
                return;
            }
            if !session.remote_applied {
                session.buffer_candidate(candidate);
                return;
            }
            session.epoch
        };
        let Some(media) = self.media_session(&from, epoch).await else {
            warn!("dropping ice-candidate from {from}: no media session");
            return;
        };
        if let Err(e) = media.apply_candidate(candidate).await {
            warn!("candidate from {from} rejected by engine: {e}");
            let _ = self
                .finalize(
                    &from,
                    Some(epoch),
                    CallTransition::Failed {
                        reason: format!("negotiation: {e}"),
                    },
                    Notify::HangUp,
                    Some(CallFailReason::Negotiation),
                )
                .await;
        }
    }

    /// The remote side declined our offer.
    pub(crate) async fn handle_reject(&self, from: Msisdn) {
        if let Err(e) = self
            .finalize(&from, None, CallTransition::RemoteRejected, Notify::None, None)
            .await
        {
            debug!("ignoring reject from {from}: {e}");
        }
    }

    /// The remote side hung up. No reflection: the peer already knows.
    pub(crate) async fn handle_hang_up(&self, from: Msisdn) {
        if let Err(e) = self
            .finalize(
                &from,
                None,
                CallTransition::HangUp {
                    reason: CallEndReason::RemoteHangUp,
                },
                Notify::None,
                None,
            )
            .await
        {
            debug!("ignoring hang-up from {from}: {e}");
        }
    }

    /// `call-failed` carries no sender; it concerns our single in-flight
    /// attempt (relay: target offline; callee: busy).
    pub(crate) async fn handle_call_failed(&self, reason: CallFailReason) {
        let remote = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .find(|s| !s.state.is_terminal())
                .map(|s| s.remote.clone())
        };
        let Some(remote) = remote else {
            debug!("ignoring call-failed ({reason}): no call in progress");
            return;
        };
        info!("call with {remote} failed: {reason}");
        let _ = self
            .finalize(
                &remote,
                None,
                CallTransition::Failed {
                    reason: reason.to_string(),
                },
                Notify::None,
                Some(reason),
            )
            .await;
    }

    /// Our own signaling connection dropped. Fail everything locally; the
    /// relay informs the peers.
    pub(crate) async fn handle_transport_down(&self) {
        let remotes: Vec<Msisdn> = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .filter(|s| !s.state.is_terminal())
                .map(|s| s.remote.clone())
                .collect()
        };
        for remote in remotes {
            warn!("signaling connection lost; failing call with {remote}");
            let _ = self
                .finalize(
                    &remote,
                    None,
                    CallTransition::Failed {
                        reason: "signaling connection lost".into(),
                    },
                    Notify::None,
                    None,
                )
                .await;
        }
    }

    // ==================== Engine events ====================

    pub(crate) async fn handle_engine_event(
        self: &Arc<Self>,
        remote: &Msisdn,
        epoch: u64,
        event: EngineEvent,
    ) {
        match event {
            EngineEvent::IceCandidate(candidate) => {
                let live = {
                    let sessions = self.sessions.read().await;
                    sessions
                        .get(remote)
                        .is_some_and(|s| s.epoch == epoch && !s.state.is_terminal())
                };
                if !live {
                    debug!("dropping local candidate for finished call with {remote}");
                    return;
                }
                self.send(SignalingMessage::IceCandidate {
                    from: self.our_identity.clone(),
                    to: remote.clone(),
                    candidate,
                })
                .await;
            }
            EngineEvent::Connectivity(ConnectivityState::Connected) => {
                let connected = {
                    let mut sessions = self.sessions.write().await;
                    match sessions.get_mut(remote) {
                        Some(s) if s.epoch == epoch => {
                            match s.apply_transition(CallTransition::MediaConnected) {
                                Ok(()) => true,
                                Err(e) => {
                                    debug!("ignoring engine connectivity for {remote}: {e}");
                                    false
                                }
                            }
                        }
                        _ => false,
                    }
                };
                if connected {
                    info!("call with {remote} connected");
                    let _ = self
                        .events
                        .call_connected
                        .send(Arc::new(events_t::CallConnected {
                            remote: remote.clone(),
                        }));
                }
            }
            EngineEvent::Connectivity(
                ConnectivityState::Failed | ConnectivityState::Disconnected,
            ) => {
                let was_connected = {
                    let sessions = self.sessions.read().await;
                    match sessions.get(remote) {
                        Some(s) if s.epoch == epoch && !s.state.is_terminal() => {
                            Some(s.state.is_connected())
                        }
                        _ => None,
                    }
                };
                match was_connected {
                    Some(true) => {
                        warn!("media connection with {remote} lost");
                        let _ = self
                            .finalize(
                                remote,
                                Some(epoch),
                                CallTransition::HangUp {
                                    reason: CallEndReason::ConnectivityLost,
                                },
                                Notify::HangUp,
                                None,
                            )
                            .await;
                    }
                    Some(false) => {
                        warn!("media connection with {remote} failed during setup");
                        let _ = self
                            .finalize(
                                remote,
                                Some(epoch),
                                CallTransition::Failed {
                                    reason: "media connectivity failed".into(),
                                },
                                Notify::HangUp,
                                Some(CallFailReason::Negotiation),
                            )
                            .await;
                    }
                    None => {}
                }
            }
        }
    }

    // ==================== Introspection ====================

    pub async fn session_state(&self, remote: &Msisdn) -> Option<CallState> {
        self.sessions.read().await.get(remote).map(|s| s.state.clone())
    }

    /// The peer of the current non-terminal session, if any.
    pub async fn active_remote(&self) -> Option<Msisdn> {
        self.sessions
            .read()
            .await
            .values()
            .find(|s| !s.state.is_terminal())
            .map(|s| s.remote.clone())
    }

    pub async fn has_active_call(&self) -> bool {
        self.active_remote().await.is_some()
    }

    /// Drop terminal sessions from memory.
    pub async fn cleanup_ended(&self) {
        self.sessions
            .write()
            .await
            .retain(|_, s| !s.state.is_terminal());
    }

    // ==================== Internals ====================

    async fn send(&self, msg: SignalingMessage) {
        if self.outbound.send(msg).await.is_err() {
            warn!("signaling channel closed; dropping outbound message");
        }
    }

    async fn media_session(&self, remote: &Msisdn, epoch: u64) -> Option<Arc<MediaSession>> {
        let map = self.media_sessions.lock().await;
        match map.get(remote) {
            Some((e, ms)) if *e == epoch => Some(Arc::clone(ms)),
            _ => None,
        }
    }

    /// Remove the media session of this attempt, leaving a newer attempt's
    /// entry untouched.
    async fn take_media_session(&self, remote: &Msisdn, epoch: u64) -> Option<Arc<MediaSession>> {
        let mut map = self.media_sessions.lock().await;
        match map.get(remote) {
            Some((e, _)) if *e == epoch => map.remove(remote).map(|(_, ms)| ms),
            _ => None,
        }
    }

    fn spawn_engine_pump(
        self: &Arc<Self>,
        remote: Msisdn,
        epoch: u64,
        mut rx: mpsc::Receiver<EngineEvent>,
    ) {
        let mgr = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                mgr.handle_engine_event(&remote, epoch, event).await;
            }
        });
    }

    fn start_ring_timer(self: &Arc<Self>, remote: Msisdn, epoch: u64) {
        let secs = self.config.ring_timeout_secs;
        if secs == 0 {
            return;
        }
        let mgr = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            let direction = {
                let sessions = mgr.sessions.read().await;
                match sessions.get(&remote) {
                    Some(s)
                        if s.epoch == epoch
                            && matches!(
                                s.state,
                                CallState::Initiating
                                    | CallState::Dialing { .. }
                                    | CallState::Ringing { .. }
                            ) =>
                    {
                        Some(s.direction)
                    }
                    _ => None,
                }
            };
            let Some(direction) = direction else { return };
            info!("call with {remote} timed out unanswered");
            let notify = match direction {
                CallDirection::Outgoing => Notify::HangUp,
                CallDirection::Incoming => Notify::Reject,
            };
            let _ = mgr
                .finalize(
                    &remote,
                    Some(epoch),
                    CallTransition::Failed {
                        reason: "ring timeout".into(),
                    },
                    notify,
                    Some(CallFailReason::Timeout),
                )
                .await;
        });
    }

    async fn negotiate_outgoing(self: Arc<Self>, remote: Msisdn, epoch: u64) {
        let media = match self.media_source.acquire_local_media().await {
            Ok(media) => media,
            Err(denied) => {
                // Nothing was sent yet: fail locally, tell no one.
                warn!("call to {remote} aborted: {denied}");
                self.fail_silently(&remote, epoch, denied.to_string()).await;
                return;
            }
        };
        let (engine, engine_events) = match self.engine_factory.create_engine().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("call to {remote} aborted: engine setup failed: {e}");
                drop(media);
                self.fail_silently(&remote, epoch, format!("engine setup: {e}"))
                    .await;
                return;
            }
        };
        self.spawn_engine_pump(remote.clone(), epoch, engine_events);
        let media_session = Arc::new(MediaSession::new(engine, media));

        let offer = match media_session.start_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                warn!("call to {remote} aborted: {e}");
                media_session.close().await;
                self.fail_silently(&remote, epoch, format!("negotiation: {e}"))
                    .await;
                return;
            }
        };

        // Commit: the user may have hung up while the offer was prepared.
        // The offer goes on the wire inside the same critical section as the
        // transition, so a hang-up cannot slip between send and transition.
        let committed = {
            let mut sessions = self.sessions.write().await;
            match sessions.get_mut(&remote) {
                Some(session) if session.epoch == epoch && !session.state.is_terminal() => {
                    if let Err(e) = session.record_local_description(offer.clone()) {
                        warn!("call to {remote}: {e}");
                    }
                    self.media_sessions
                        .lock()
                        .await
                        .insert(remote.clone(), (epoch, Arc::clone(&media_session)));
                    self.send(SignalingMessage::CallOffer {
                        from: self.our_identity.clone(),
                        to: remote.clone(),
                        session_description: offer,
                    })
                    .await;
                    if let Err(e) = session.apply_transition(CallTransition::OfferSent) {
                        warn!("call to {remote}: {e}");
                    }
                    true
                }
                _ => false,
            }
        };
        if !committed {
            debug!("discarding stale offer for call with {remote}");
            media_session.close().await;
            return;
        }
        self.start_ring_timer(remote, epoch);
    }

    async fn negotiate_accept(
        self: Arc<Self>,
        remote: Msisdn,
        epoch: u64,
        offer: SessionDescription,
    ) {
        let media = match self.media_source.acquire_local_media().await {
            Ok(media) => media,
            Err(denied) => {
                // Decline, so the caller is not left dialing forever.
                warn!("cannot accept call from {remote}: {denied}");
                let _ = self
                    .finalize(
                        &remote,
                        Some(epoch),
                        CallTransition::Failed {
                            reason: denied.to_string(),
                        },
                        Notify::Reject,
                        None,
                    )
                    .await;
                return;
            }
        };
        let (engine, engine_events) = match self.engine_factory.create_engine().await {
            Ok(pair) => pair,
            Err(e) => {
                drop(media);
                self.fail_negotiation(&remote, epoch, format!("engine setup: {e}"))
                    .await;
                return;
            }
        };
        self.spawn_engine_pump(remote.clone(), epoch, engine_events);
        let media_session = Arc::new(MediaSession::new(engine, media));

        let answer = match media_session.accept_offer(offer).await {
            Ok(answer) => answer,
            Err(e) => {
                media_session.close().await;
                self.fail_negotiation(&remote, epoch, format!("negotiation: {e}"))
                    .await;
                return;
            }
        };

        // Flush buffered candidates in receipt order. The candidate lock is
        // held across marking-applied and the batch, so a candidate arriving
        // concurrently cannot jump the queue. The answer goes on the wire
        // inside the same critical section as the transition.
        let ordered = media_session.candidate_lock.lock().await;
        let flushed = {
            let mut sessions = self.sessions.write().await;
            match sessions.get_mut(&remote) {
                Some(session) if session.epoch == epoch && session.state.can_accept() => {
                    if let Err(e) = session.record_local_description(answer.clone()) {
                        warn!("call with {remote}: {e}");
                    }
                    let flushed = session.mark_remote_applied();
                    self.media_sessions
                        .lock()
                        .await
                        .insert(remote.clone(), (epoch, Arc::clone(&media_session)));
                    self.send(SignalingMessage::CallAnswer {
                        from: self.our_identity.clone(),
                        to: remote.clone(),
                        session_description: answer,
                    })
                    .await;
                    if let Err(e) = session.apply_transition(CallTransition::LocalAccepted) {
                        warn!("call with {remote}: {e}");
                    }
                    Some(flushed)
                }
                _ => None,
            }
        };
        let Some(flushed) = flushed else {
            drop(ordered);
            debug!("discarding stale answer for call with {remote}");
            media_session.close().await;
            return;
        };
        for candidate in flushed {
            if let Err(e) = media_session.engine().add_ice_candidate(candidate).await {
                drop(ordered);
                self.fail_negotiation(&remote, epoch, format!("negotiation: {e}"))
                    .await;
                return;
            }
        }
        drop(ordered);
    }

    /// Caller side: install the received answer into the engine, flush
    /// buffered candidates, then move to Connecting.
    async fn install_answer(
        self: Arc<Self>,
        remote: Msisdn,
        epoch: u64,
        answer: SessionDescription,
    ) {
        let Some(media_session) = self.media_session(&remote, epoch).await else {
            debug!("discarding answer for finished call with {remote}");
            return;
        };
        if let Err(e) = media_session.install_answer(answer).await {
            self.fail_negotiation(&remote, epoch, format!("negotiation: {e}"))
                .await;
            return;
        }

        let ordered = media_session.candidate_lock.lock().await;
        let flushed = {
            let mut sessions = self.sessions.write().await;
            match sessions.get_mut(&remote) {
                Some(s) if s.epoch == epoch && matches!(s.state, CallState::Dialing { .. }) => {
                    let flushed = s.mark_remote_applied();
                    if let Err(e) = s.apply_transition(CallTransition::RemoteAnswered) {
                        warn!("call with {remote}: {e}");
                    }
                    Some(flushed)
                }
                _ => None,
            }
        };
        let Some(flushed) = flushed else {
            debug!("discarding stale answer install for call with {remote}");
            return;
        };
        for candidate in flushed {
            if let Err(e) = media_session.engine().add_ice_candidate(candidate).await {
                drop(ordered);
                self.fail_negotiation(&remote, epoch, format!("negotiation: {e}"))
                    .await;
                return;
            }
        }
        drop(ordered);
    }

    /// Fail a session without telling the peer (nothing was ever sent).
    async fn fail_silently(&self, remote: &Msisdn, epoch: u64, reason: String) {
        let _ = self
            .finalize(
                remote,
                Some(epoch),
                CallTransition::Failed { reason },
                Notify::None,
                None,
            )
            .await;
    }

    /// Fail a session over a negotiation error and make sure the peer does
    /// not wait indefinitely.
    async fn fail_negotiation(&self, remote: &Msisdn, epoch: u64, reason: String) {
        warn!("call with {remote} failed: {reason}");
        let _ = self
            .finalize(
                remote,
                Some(epoch),
                CallTransition::Failed { reason },
                Notify::CallFailed(CallFailReason::Negotiation),
                None,
            )
            .await;
    }

    /// Drive a session to a terminal state exactly once: apply the
    /// transition, notify the peer, release media, close the engine, append
    /// the history record and dispatch the event.
    async fn finalize(
        &self,
        remote: &Msisdn,
        epoch: Option<u64>,
        transition: CallTransition,
        notify: Notify,
        fail_reason: Option<CallFailReason>,
    ) -> Result<(), CallError> {
        let (record, event, attempt_epoch) = {
            let mut sessions = self.sessions.write().await;
            let Some(session) = sessions.get_mut(remote) else {
                return Err(CallError::NotFound(remote.clone()));
            };
            if let Some(expected) = epoch
                && session.epoch != expected
            {
                // A newer attempt with the same peer; nothing to do.
                return Ok(());
            }
            if session.state.is_terminal() {
                // Already finished; the peer was notified the first time.
                return Ok(());
            }
            let was_answered = matches!(
                session.state,
                CallState::Connecting { .. } | CallState::Connected { .. }
            );
            session.apply_transition(transition)?;

            let (event, duration) = match &session.state {
                CallState::Ended {
                    reason,
                    duration_secs,
                    ..
                } => (FinalEvent::Ended(*reason, *duration_secs), *duration_secs),
                CallState::Rejected { .. } => (FinalEvent::Rejected, None),
                CallState::Failed { reason, .. } => (FinalEvent::Failed(reason.clone()), None),
                other => {
                    warn!("finalize left call with {remote} in {}", other.name());
                    return Ok(());
                }
            };
            let record = match session.direction {
                CallDirection::Outgoing => CallRecord {
                    caller: session.local.clone(),
                    receiver: session.remote.clone(),
                    status: CallLogStatus::Outgoing,
                    duration_secs: duration.unwrap_or(0),
                    timestamp: chrono::Utc::now(),
                },
                CallDirection::Incoming => CallRecord {
                    caller: session.remote.clone(),
                    receiver: session.local.clone(),
                    status: if was_answered {
                        CallLogStatus::IncomingAnswered
                    } else {
                        CallLogStatus::IncomingMissed
                    },
                    duration_secs: duration.unwrap_or(0),
                    timestamp: chrono::Utc::now(),
                },
            };
            debug!("call with {remote} finished: {}", session.state.name());
            (record, event, session.epoch)
        };

        match notify {
            Notify::None => {}
            Notify::HangUp => {
                self.send(SignalingMessage::HangUp {
                    from: self.our_identity.clone(),
                    to: remote.clone(),
                })
                .await;
            }
            Notify::Reject => {
                self.send(SignalingMessage::Reject {
                    from: self.our_identity.clone(),
                    to: remote.clone(),
                })
                .await;
            }
            Notify::CallFailed(reason) => {
                self.send(SignalingMessage::CallFailed {
                    to: remote.clone(),
                    reason,
                })
                .await;
            }
        }

        if let Some(media_session) = self.take_media_session(remote, attempt_epoch).await {
            media_session.close().await;
        }

        if let Err(e) = self.store.append_call(&self.our_identity, record).await {
            warn!("failed to append call history: {e}");
        }

        match event {
            FinalEvent::Ended(reason, duration_secs) => {
                let _ = self.events.call_ended.send(Arc::new(events_t::CallEnded {
                    remote: remote.clone(),
                    reason,
                    duration_secs,
                }));
            }
            FinalEvent::Rejected => {
                let _ = self
                    .events
                    .call_rejected
                    .send(Arc::new(events_t::CallRejected {
                        remote: remote.clone(),
                    }));
            }
            FinalEvent::Failed(detail) => {
                let _ = self
                    .events
                    .call_failed
                    .send(Arc::new(events_t::CallFailed {
                        remote: remote.clone(),
                        reason: fail_reason,
                        detail,
                    }));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::traits::CallLogStore;
    use crate::test_utils::{MockEngineFactory, MockMediaSource, wait_until};
    use ringcore::protocol::SdpType;

    struct Harness {
        manager: Arc<CallManager>,
        outbound: mpsc::Receiver<SignalingMessage>,
        engines: Arc<MockEngineFactory>,
        media: Arc<MockMediaSource>,
        store: Arc<MemoryStore>,
        events: Arc<EventBus>,
    }

    fn us() -> Msisdn {
        "+1000000".parse().unwrap()
    }

    fn them() -> Msisdn {
        "+2000000".parse().unwrap()
    }

    fn harness() -> Harness {
        harness_with_config(CallManagerConfig {
            max_concurrent_calls: 1,
            ring_timeout_secs: 0,
        })
    }

    fn harness_with_config(config: CallManagerConfig) -> Harness {
        let (tx, rx) = mpsc::channel(64);
        let engines = Arc::new(MockEngineFactory::new());
        let media = Arc::new(MockMediaSource::new());
        let store = Arc::new(MemoryStore::new());
        let events = Arc::new(EventBus::new());
        let manager = CallManager::new(
            us(),
            config,
            engines.clone(),
            media.clone(),
            store.clone(),
            events.clone(),
            tx,
        );
        Harness {
            manager,
            outbound: rx,
            engines,
            media,
            store,
            events,
        }
    }

    async fn wait_for_state(
        manager: &Arc<CallManager>,
        remote: &Msisdn,
        pred: impl Fn(&CallState) -> bool,
    ) {
        let ok = wait_until(Duration::from_secs(2), || async {
            matches!(manager.session_state(remote).await, Some(ref s) if pred(s))
        })
        .await;
        assert!(ok, "session never reached the expected state");
    }

    #[tokio::test]
    async fn test_place_call_emits_offer_and_dials() {
        let mut h = harness();
        h.manager.place_call(them()).await.unwrap();

        let msg = h.outbound.recv().await.unwrap();
        match msg {
            SignalingMessage::CallOffer {
                from,
                to,
                session_description,
            } => {
                assert_eq!(from, us());
                assert_eq!(to, them());
                assert_eq!(session_description.sdp_type, SdpType::Offer);
            }
            other => panic!("expected call-offer, got {}", other.kind()),
        }
        wait_for_state(&h.manager, &them(), |s| {
            matches!(s, CallState::Dialing { .. })
        })
        .await;

        let engine = h.engines.engine(0);
        assert_eq!(engine.ops(), vec!["create_offer", "set_local(offer)"]);
        assert_eq!(h.media.acquired(), 1);
    }

    #[tokio::test]
    async fn test_second_call_rejected_while_active() {
        let h = harness();
        h.manager.place_call(them()).await.unwrap();
        let err = h.manager.place_call("+3000000".parse().unwrap()).await;
        assert!(matches!(err, Err(CallError::AlreadyInCall)));
    }

    #[tokio::test]
    async fn test_self_call_rejected() {
        let h = harness();
        assert!(matches!(
            h.manager.place_call(us()).await,
            Err(CallError::SelfCall)
        ));
    }

    #[tokio::test]
    async fn test_busy_offer_gets_call_failed_and_first_call_unaffected() {
        let mut h = harness();
        h.manager
            .handle_offer(them(), SessionDescription::offer("first"))
            .await;
        assert!(
            h.manager
                .session_state(&them())
                .await
                .unwrap()
                .can_accept()
        );

        let second: Msisdn = "+3000000".parse().unwrap();
        h.manager
            .handle_offer(second.clone(), SessionDescription::offer("second"))
            .await;

        let msg = h.outbound.recv().await.unwrap();
        assert_eq!(
            msg,
            SignalingMessage::CallFailed {
                to: second.clone(),
                reason: CallFailReason::Busy,
            }
        );
        // No session was created for the busy sender and the first call is
        // still ringing.
        assert!(h.manager.session_state(&second).await.is_none());
        assert!(
            h.manager
                .session_state(&them())
                .await
                .unwrap()
                .can_accept()
        );
    }

    #[tokio::test]
    async fn test_accept_emits_answer_and_connects() {
        let mut h = harness();
        h.manager
            .handle_offer(them(), SessionDescription::offer("v=0 caller"))
            .await;
        h.manager.accept(them()).await.unwrap();

        let msg = h.outbound.recv().await.unwrap();
        match msg {
            SignalingMessage::CallAnswer {
                session_description,
                ..
            } => assert_eq!(session_description.sdp_type, SdpType::Answer),
            other => panic!("expected call-answer, got {}", other.kind()),
        }
        wait_for_state(&h.manager, &them(), |s| {
            matches!(s, CallState::Connecting { .. })
        })
        .await;

        let engine = h.engines.engine(0);
        assert_eq!(
            engine.ops(),
            vec![
                "set_remote(offer)",
                "create_answer",
                "set_local(answer)"
            ]
        );

        // Engine connectivity moves the call to Connected.
        engine.emit_connectivity(ConnectivityState::Connected).await;
        wait_for_state(&h.manager, &them(), |s| s.is_connected()).await;
    }

    #[tokio::test]
    async fn test_decline_sends_reject_without_engine() {
        let mut h = harness();
        h.manager
            .handle_offer(them(), SessionDescription::offer("v=0"))
            .await;
        h.manager.decline(them()).await.unwrap();

        assert_eq!(
            h.outbound.recv().await.unwrap(),
            SignalingMessage::Reject {
                from: us(),
                to: them()
            }
        );
        assert!(matches!(
            h.manager.session_state(&them()).await.unwrap(),
            CallState::Rejected { .. }
        ));
        // The callee never created an engine or touched the devices.
        assert_eq!(h.engines.created(), 0);
        assert_eq!(h.media.acquired(), 0);

        let history = h.store.call_history(&us()).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, CallLogStatus::IncomingMissed);
    }

    #[tokio::test]
    async fn test_candidates_buffered_until_accept_then_flushed_in_order() {
        let mut h = harness();
        h.manager
            .handle_offer(them(), SessionDescription::offer("v=0"))
            .await;
        for name in ["c1", "c2", "c3"] {
            h.manager
                .handle_ice(them(), IceCandidate::new(name))
                .await;
        }

        h.manager.accept(them()).await.unwrap();
        let _answer = h.outbound.recv().await.unwrap();
        wait_for_state(&h.manager, &them(), |s| {
            matches!(s, CallState::Connecting { .. })
        })
        .await;

        let engine = h.engines.engine(0);
        let ok = wait_until(Duration::from_secs(2), || async {
            engine.candidates() == vec!["c1", "c2", "c3"]
        })
        .await;
        assert!(ok, "candidates not flushed in order: {:?}", engine.candidates());

        // A candidate arriving after the flush is applied immediately.
        h.manager.handle_ice(them(), IceCandidate::new("c4")).await;
        assert_eq!(engine.candidates(), vec!["c1", "c2", "c3", "c4"]);
    }

    #[tokio::test]
    async fn test_duplicate_candidates_not_deduplicated() {
        let mut h = harness();
        h.manager
            .handle_offer(them(), SessionDescription::offer("v=0"))
            .await;
        h.manager.handle_ice(them(), IceCandidate::new("dup")).await;
        h.manager.handle_ice(them(), IceCandidate::new("dup")).await;

        h.manager.accept(them()).await.unwrap();
        let _answer = h.outbound.recv().await.unwrap();
        let engine = h.engines.engine(0);
        let ok = wait_until(Duration::from_secs(2), || async {
            engine.candidates() == vec!["dup", "dup"]
        })
        .await;
        assert!(ok, "deduplication belongs to the engine, not this layer");
    }

    #[tokio::test]
    async fn test_caller_buffers_candidates_until_answer() {
        let mut h = harness();
        h.manager.place_call(them()).await.unwrap();
        let _offer = h.outbound.recv().await.unwrap();
        wait_for_state(&h.manager, &them(), |s| {
            matches!(s, CallState::Dialing { .. })
        })
        .await;

        h.manager.handle_ice(them(), IceCandidate::new("b1")).await;
        h.manager.handle_ice(them(), IceCandidate::new("b2")).await;
        let engine = h.engines.engine(0);
        assert!(engine.candidates().is_empty());

        h.manager
            .handle_answer(them(), SessionDescription::answer("v=0 callee"))
            .await;
        wait_for_state(&h.manager, &them(), |s| {
            matches!(s, CallState::Connecting { .. })
        })
        .await;
        let ok = wait_until(Duration::from_secs(2), || async {
            engine.candidates() == vec!["b1", "b2"]
        })
        .await;
        assert!(ok, "buffered candidates not applied in order");
    }

    #[tokio::test]
    async fn test_hang_up_from_every_state_releases_media() {
        // Dialing.
        let mut h = harness();
        h.manager.place_call(them()).await.unwrap();
        let _offer = h.outbound.recv().await.unwrap();
        wait_for_state(&h.manager, &them(), |s| {
            matches!(s, CallState::Dialing { .. })
        })
        .await;
        h.manager.hang_up(them()).await.unwrap();
        assert!(matches!(
            h.outbound.recv().await.unwrap(),
            SignalingMessage::HangUp { .. }
        ));
        assert!(
            h.manager
                .session_state(&them())
                .await
                .unwrap()
                .is_terminal()
        );
        assert_eq!(h.media.released(), 1);

        // Connecting (callee side).
        let mut h = harness();
        h.manager
            .handle_offer(them(), SessionDescription::offer("v=0"))
            .await;
        h.manager.accept(them()).await.unwrap();
        let _answer = h.outbound.recv().await.unwrap();
        wait_for_state(&h.manager, &them(), |s| {
            matches!(s, CallState::Connecting { .. })
        })
        .await;
        h.manager.hang_up(them()).await.unwrap();
        assert_eq!(h.media.released(), 1);

        // Connected.
        let mut h = harness();
        h.manager
            .handle_offer(them(), SessionDescription::offer("v=0"))
            .await;
        h.manager.accept(them()).await.unwrap();
        let _answer = h.outbound.recv().await.unwrap();
        wait_for_state(&h.manager, &them(), |s| {
            matches!(s, CallState::Connecting { .. })
        })
        .await;
        h.engines
            .engine(0)
            .emit_connectivity(ConnectivityState::Connected)
            .await;
        wait_for_state(&h.manager, &them(), |s| s.is_connected()).await;
        h.manager.hang_up(them()).await.unwrap();
        assert!(matches!(
            h.outbound.recv().await.unwrap(),
            SignalingMessage::HangUp { .. }
        ));
        assert_eq!(h.media.released(), 1);

        let history = h.store.call_history(&us()).await.unwrap();
        assert_eq!(history[0].status, CallLogStatus::IncomingAnswered);
    }

    #[tokio::test]
    async fn test_remote_hang_up_not_reflected() {
        let mut h = harness();
        h.manager.place_call(them()).await.unwrap();
        let _offer = h.outbound.recv().await.unwrap();
        wait_for_state(&h.manager, &them(), |s| {
            matches!(s, CallState::Dialing { .. })
        })
        .await;

        h.manager.handle_hang_up(them()).await;
        assert!(
            h.manager
                .session_state(&them())
                .await
                .unwrap()
                .is_terminal()
        );
        assert_eq!(h.media.released(), 1);
        // No hang-up goes back to the peer.
        assert!(h.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_remote_reject_terminates_outgoing() {
        let mut h = harness();
        let mut rejected = h.events.call_rejected.subscribe();
        h.manager.place_call(them()).await.unwrap();
        let _offer = h.outbound.recv().await.unwrap();
        wait_for_state(&h.manager, &them(), |s| {
            matches!(s, CallState::Dialing { .. })
        })
        .await;

        h.manager.handle_reject(them()).await;
        assert!(matches!(
            h.manager.session_state(&them()).await.unwrap(),
            CallState::Rejected { .. }
        ));
        assert_eq!(h.media.released(), 1);
        assert!(rejected.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_call_failed_returns_to_idle() {
        let mut h = harness();
        let mut failed = h.events.call_failed.subscribe();
        h.manager.place_call(them()).await.unwrap();
        let _offer = h.outbound.recv().await.unwrap();
        wait_for_state(&h.manager, &them(), |s| {
            matches!(s, CallState::Dialing { .. })
        })
        .await;

        h.manager
            .handle_call_failed(CallFailReason::TargetOffline)
            .await;
        assert!(matches!(
            h.manager.session_state(&them()).await.unwrap(),
            CallState::Failed { .. }
        ));
        let event = failed.recv().await.unwrap();
        assert_eq!(event.reason, Some(CallFailReason::TargetOffline));
        assert_eq!(h.media.released(), 1);

        // Back to idle: a new call can be placed.
        h.manager.place_call(them()).await.unwrap();
    }

    #[tokio::test]
    async fn test_media_denied_aborts_before_signaling() {
        let mut h = harness();
        h.media.deny();
        let mut failed = h.events.call_failed.subscribe();
        h.manager.place_call(them()).await.unwrap();

        let event = failed.recv().await.unwrap();
        assert!(event.detail.contains("media access denied"));
        // Nothing ever went on the wire.
        assert!(h.outbound.try_recv().is_err());
        assert_eq!(h.media.acquired(), 0);
    }

    #[tokio::test]
    async fn test_media_denied_on_accept_declines() {
        let mut h = harness();
        h.manager
            .handle_offer(them(), SessionDescription::offer("v=0"))
            .await;
        h.media.deny();
        h.manager.accept(them()).await.unwrap();

        assert_eq!(
            h.outbound.recv().await.unwrap(),
            SignalingMessage::Reject {
                from: us(),
                to: them()
            }
        );
    }

    #[tokio::test]
    async fn test_engine_failure_fails_call_and_notifies_peer() {
        let mut h = harness();
        h.engines.fail_next_set_remote();
        h.manager
            .handle_offer(them(), SessionDescription::offer("v=0"))
            .await;
        h.manager.accept(them()).await.unwrap();

        assert_eq!(
            h.outbound.recv().await.unwrap(),
            SignalingMessage::CallFailed {
                to: them(),
                reason: CallFailReason::Negotiation,
            }
        );
        wait_for_state(&h.manager, &them(), |s| {
            matches!(s, CallState::Failed { .. })
        })
        .await;
        assert_eq!(h.media.released(), 1);
    }

    #[tokio::test]
    async fn test_hang_up_during_negotiation_discards_stale_offer() {
        let mut h = harness();
        h.engines.set_delay(Duration::from_millis(100));
        h.manager.place_call(them()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.manager.hang_up(them()).await.unwrap();

        assert!(matches!(
            h.outbound.recv().await.unwrap(),
            SignalingMessage::HangUp { .. }
        ));
        // The delayed offer never goes out; the engine is closed and the
        // devices are released.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(h.outbound.try_recv().is_err());
        let ok = wait_until(Duration::from_secs(2), || async {
            h.media.released() == 1
        })
        .await;
        assert!(ok, "media not released after stale negotiation");
    }

    #[tokio::test]
    async fn test_connectivity_lost_after_connected_is_implicit_hang_up() {
        let mut h = harness();
        let mut ended = h.events.call_ended.subscribe();
        h.manager
            .handle_offer(them(), SessionDescription::offer("v=0"))
            .await;
        h.manager.accept(them()).await.unwrap();
        let _answer = h.outbound.recv().await.unwrap();
        wait_for_state(&h.manager, &them(), |s| {
            matches!(s, CallState::Connecting { .. })
        })
        .await;
        let engine = h.engines.engine(0);
        engine.emit_connectivity(ConnectivityState::Connected).await;
        wait_for_state(&h.manager, &them(), |s| s.is_connected()).await;

        engine
            .emit_connectivity(ConnectivityState::Disconnected)
            .await;
        wait_for_state(&h.manager, &them(), |s| s.is_terminal()).await;
        // Best-effort notification to the peer.
        assert!(matches!(
            h.outbound.recv().await.unwrap(),
            SignalingMessage::HangUp { .. }
        ));
        let event = ended.recv().await.unwrap();
        assert_eq!(event.reason, CallEndReason::ConnectivityLost);
        assert_eq!(h.media.released(), 1);
    }

    #[tokio::test]
    async fn test_messages_in_idle_or_terminal_state_ignored() {
        let mut h = harness();
        // Idle: no session at all.
        h.manager.handle_hang_up(them()).await;
        h.manager.handle_ice(them(), IceCandidate::new("c")).await;
        h.manager
            .handle_answer(them(), SessionDescription::answer("a"))
            .await;
        assert!(h.outbound.try_recv().is_err());
        assert!(h.manager.session_state(&them()).await.is_none());

        // Terminal: late duplicates after the call is over.
        h.manager
            .handle_offer(them(), SessionDescription::offer("v=0"))
            .await;
        h.manager.decline(them()).await.unwrap();
        let _reject = h.outbound.recv().await.unwrap();
        h.manager.handle_hang_up(them()).await;
        h.manager.handle_ice(them(), IceCandidate::new("late")).await;
        assert!(h.outbound.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ring_timeout_fails_unanswered_call() {
        let mut h = harness_with_config(CallManagerConfig {
            max_concurrent_calls: 1,
            ring_timeout_secs: 5,
        });
        let mut failed = h.events.call_failed.subscribe();
        h.manager
            .handle_offer(them(), SessionDescription::offer("v=0"))
            .await;

        // Paused time auto-advances past the timer.
        let event = failed.recv().await.unwrap();
        assert_eq!(event.reason, Some(CallFailReason::Timeout));
        assert_eq!(
            h.outbound.recv().await.unwrap(),
            SignalingMessage::Reject {
                from: us(),
                to: them()
            }
        );
        let history = h.store.call_history(&us()).await.unwrap();
        assert_eq!(history[0].status, CallLogStatus::IncomingMissed);
    }

    #[tokio::test]
    async fn test_transport_down_fails_call_locally() {
        let mut h = harness();
        h.manager.place_call(them()).await.unwrap();
        let _offer = h.outbound.recv().await.unwrap();
        wait_for_state(&h.manager, &them(), |s| {
            matches!(s, CallState::Dialing { .. })
        })
        .await;

        h.manager.handle_transport_down().await;
        assert!(
            h.manager
                .session_state(&them())
                .await
                .unwrap()
                .is_terminal()
        );
        assert_eq!(h.media.released(), 1);
        // Nothing can be sent; nothing is attempted.
        assert!(h.outbound.try_recv().is_err());
    }
}
