//! Message routing between two identified endpoints.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, info, warn};
use ringcore::protocol::SignalingMessage;
use ringcore::types::{CallFailReason, Msisdn};
use tokio::sync::Mutex;

use super::directory::Directory;

/// Unordered pair of identities; the serialization unit for call signaling.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PairKey(Msisdn, Msisdn);

impl PairKey {
    fn new(a: &Msisdn, b: &Msisdn) -> Self {
        if a <= b {
            Self(a.clone(), b.clone())
        } else {
            Self(b.clone(), a.clone())
        }
    }

    fn other(&self, identity: &Msisdn) -> &Msisdn {
        if &self.0 == identity { &self.1 } else { &self.0 }
    }

    fn contains(&self, identity: &Msisdn) -> bool {
        &self.0 == identity || &self.1 == identity
    }
}

/// Relay-side knowledge about a call in flight between a pair. The relay
/// tracks only enough to tear the call down when one side's connection
/// drops; the session state machines live in the clients.
#[derive(Debug)]
struct CallLink {
    caller: Msisdn,
    opened_at: DateTime<Utc>,
}

/// Routes signaling messages through the directory.
///
/// Every call-scoped message for a pair is processed while holding that
/// pair's lock: a hang-up and an in-flight answer can never interleave.
/// Messages for different pairs do not contend.
pub struct SignalRouter {
    directory: Arc<Directory>,
    links: DashMap<PairKey, Arc<Mutex<Option<CallLink>>>>,
}

impl SignalRouter {
    pub fn new(directory: Arc<Directory>) -> Self {
        Self {
            directory,
            links: DashMap::new(),
        }
    }

    /// Route one message received from the connection registered as
    /// `sender`.
    pub async fn route(&self, sender: &Msisdn, msg: SignalingMessage) {
        match &msg {
            SignalingMessage::Register { .. } => {
                debug!("{sender} sent a duplicate register, ignoring");
                return;
            }
            SignalingMessage::PresenceUpdate { .. } => {
                // Server-originated kind; a client must not inject it.
                warn!("{sender} tried to send a presence-update, dropping");
                return;
            }
            _ => {}
        }
        if let Some(claimed) = msg.sender()
            && claimed != sender
        {
            warn!(
                "{sender} sent a {} claiming to be {claimed}, dropping",
                msg.kind()
            );
            return;
        }
        let Some(target) = msg.target().cloned() else {
            return;
        };

        let key = PairKey::new(sender, &target);
        let link = self.pair_lock(&key);
        let mut link_guard = link.lock().await;

        match &msg {
            SignalingMessage::CallOffer { from, .. } => {
                if link_guard.is_none() {
                    *link_guard = Some(CallLink {
                        caller: from.clone(),
                        opened_at: Utc::now(),
                    });
                }
            }
            SignalingMessage::Reject { .. }
            | SignalingMessage::HangUp { .. }
            | SignalingMessage::CallFailed { .. } => {
                if let Some(closed) = link_guard.take() {
                    debug!(
                        "call {} -> {target} closed after {}s",
                        closed.caller,
                        (Utc::now() - closed.opened_at).num_seconds()
                    );
                }
            }
            _ => {}
        }

        self.deliver(sender, &target, msg).await;
    }

    /// The connection registered as `identity` went away: close every call
    /// it was part of and tell the other side.
    pub async fn handle_disconnect(&self, identity: &Msisdn) {
        let affected: Vec<(PairKey, Arc<Mutex<Option<CallLink>>>)> = self
            .links
            .iter()
            .filter(|entry| entry.key().contains(identity))
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        for (key, link) in affected {
            let mut link_guard = link.lock().await;
            if link_guard.take().is_none() {
                continue;
            }
            let peer = key.other(identity).clone();
            info!("{identity} disconnected mid-call, hanging up towards {peer}");
            if let Some(handle) = self.directory.resolve(&peer) {
                let hangup = SignalingMessage::HangUp {
                    from: identity.clone(),
                    to: peer.clone(),
                };
                if handle.tx.send(hangup).await.is_err() {
                    debug!("{peer} went away before the hang-up reached it");
                }
            }
        }
        self.links
            .retain(|key, _| !key.contains(identity));
    }

    fn pair_lock(&self, key: &PairKey) -> Arc<Mutex<Option<CallLink>>> {
        self.links
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Deliver to the target, or report `target-offline` back to the sender
    /// within this same routing operation.
    async fn deliver(&self, sender: &Msisdn, target: &Msisdn, msg: SignalingMessage) {
        let kind = msg.kind();
        let delivered = match self.directory.resolve(target) {
            Some(handle) => handle.tx.send(msg).await.is_ok(),
            None => false,
        };
        if delivered {
            debug!("relayed {kind} {sender} -> {target}");
            return;
        }
        info!("cannot deliver {kind} from {sender}: {target} is offline");
        if kind == "call-failed" {
            // Never bounce a failure report back and forth.
            return;
        }
        if let Some(handle) = self.directory.resolve(sender) {
            let _ = handle
                .tx
                .send(SignalingMessage::CallFailed {
                    to: sender.clone(),
                    reason: CallFailReason::TargetOffline,
                })
                .await;
        }
    }
}
