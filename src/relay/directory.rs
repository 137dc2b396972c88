//! Identity → connection registry and presence fan-out.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, info};
use ringcore::protocol::SignalingMessage;
use ringcore::types::events::PresenceUpdate;
use ringcore::types::{Msisdn, Presence};
use tokio::sync::{broadcast, mpsc};

const PRESENCE_CHANNEL_CAPACITY: usize = 100;

/// A live signaling connection bound to one identity.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub identity: Msisdn,
    /// Queue drained by the connection's writer task.
    pub tx: mpsc::Sender<SignalingMessage>,
    pub connected_at: DateTime<Utc>,
}

impl ConnectionHandle {
    pub fn new(identity: Msisdn, tx: mpsc::Sender<SignalingMessage>) -> Self {
        Self {
            identity,
            tx,
            connected_at: Utc::now(),
        }
    }
}

/// Maps each identity to at most one live connection and broadcasts
/// online/offline transitions after they take effect.
pub struct Directory {
    online: DashMap<Msisdn, ConnectionHandle>,
    presence_tx: broadcast::Sender<PresenceUpdate>,
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}

impl Directory {
    pub fn new() -> Self {
        Self {
            online: DashMap::new(),
            presence_tx: broadcast::channel(PRESENCE_CHANNEL_CAPACITY).0,
        }
    }

    /// Bind `handle` to its identity. A stale registration for the same
    /// identity is replaced; its connection can no longer receive anything.
    /// Returns true if a previous registration was replaced.
    pub fn register(&self, handle: ConnectionHandle) -> bool {
        let identity = handle.identity.clone();
        let replaced = self.online.insert(identity.clone(), handle).is_some();
        if replaced {
            info!("{identity} re-registered, replacing stale connection");
        } else {
            info!("{identity} is online");
        }
        let _ = self.presence_tx.send(PresenceUpdate {
            identity,
            presence: Presence::Online,
        });
        replaced
    }

    /// The live connection for `identity`, if any.
    pub fn resolve(&self, identity: &Msisdn) -> Option<ConnectionHandle> {
        self.online.get(identity).map(|h| h.clone())
    }

    /// Unbind `identity`, but only if it is still bound to the connection
    /// with queue `tx` — a replaced connection must not unregister its
    /// successor. Returns true if the identity actually went offline.
    pub fn unregister(
        &self,
        identity: &Msisdn,
        tx: &mpsc::Sender<SignalingMessage>,
    ) -> bool {
        let removed = self
            .online
            .remove_if(identity, |_, handle| handle.tx.same_channel(tx))
            .is_some();
        if removed {
            info!("{identity} is offline");
            let _ = self.presence_tx.send(PresenceUpdate {
                identity: identity.clone(),
                presence: Presence::Offline,
            });
        } else {
            debug!("{identity} already replaced or gone, skipping unregister");
        }
        removed
    }

    /// Subscribe to online/offline transitions. Events are broadcast after
    /// the registry change took effect; no further ordering is guaranteed.
    pub fn subscribe(&self) -> broadcast::Receiver<PresenceUpdate> {
        self.presence_tx.subscribe()
    }

    pub fn online_count(&self) -> usize {
        self.online.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(s: &str) -> Msisdn {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_register_resolve_unregister() {
        let directory = Directory::new();
        let (tx, _rx) = mpsc::channel(8);
        let a = user("+1000000");

        assert!(!directory.register(ConnectionHandle::new(a.clone(), tx.clone())));
        assert!(directory.resolve(&a).is_some());
        assert_eq!(directory.online_count(), 1);

        assert!(directory.unregister(&a, &tx));
        assert!(directory.resolve(&a).is_none());
        assert!(!directory.unregister(&a, &tx));
    }

    #[tokio::test]
    async fn test_presence_broadcast_order() {
        let directory = Directory::new();
        let mut presence = directory.subscribe();
        let (tx, _rx) = mpsc::channel(8);
        let a = user("+1000000");

        directory.register(ConnectionHandle::new(a.clone(), tx.clone()));
        directory.unregister(&a, &tx);

        let online = presence.recv().await.unwrap();
        assert_eq!(online.identity, a);
        assert_eq!(online.presence, Presence::Online);
        let offline = presence.recv().await.unwrap();
        assert_eq!(offline.presence, Presence::Offline);
    }

    #[tokio::test]
    async fn test_replaced_connection_cannot_unregister_successor() {
        let directory = Directory::new();
        let a = user("+1000000");
        let (old_tx, _old_rx) = mpsc::channel(8);
        let (new_tx, _new_rx) = mpsc::channel(8);

        directory.register(ConnectionHandle::new(a.clone(), old_tx.clone()));
        assert!(directory.register(ConnectionHandle::new(a.clone(), new_tx.clone())));

        // The stale connection's teardown is a no-op.
        assert!(!directory.unregister(&a, &old_tx));
        assert!(directory.resolve(&a).is_some());
        assert!(directory.unregister(&a, &new_tx));
    }
}
