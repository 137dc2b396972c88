//! Dispatch of incoming call signaling into the manager.

use log::warn;
use ringcore::protocol::SignalingMessage;

use crate::client::Client;

impl Client {
    /// Route one call-scoped signaling message into the call manager.
    ///
    /// Misrouted messages (wrong `to`) are dropped here; messages for idle
    /// or finished sessions are dropped inside the manager. Neither is an
    /// error: duplicate and late deliveries are expected after teardown.
    pub(crate) async fn dispatch_call_signal(&self, msg: SignalingMessage) {
        if let Some(target) = msg.target()
            && target != self.identity()
        {
            warn!(
                "dropping misrouted {} addressed to {target}",
                msg.kind()
            );
            return;
        }
        match msg {
            SignalingMessage::CallOffer {
                from,
                session_description,
                ..
            } => {
                self.call_manager()
                    .handle_offer(from, session_description)
                    .await;
            }
            SignalingMessage::CallAnswer {
                from,
                session_description,
                ..
            } => {
                self.call_manager()
                    .handle_answer(from, session_description)
                    .await;
            }
            SignalingMessage::IceCandidate {
                from, candidate, ..
            } => {
                self.call_manager().handle_ice(from, candidate).await;
            }
            SignalingMessage::Reject { from, .. } => {
                self.call_manager().handle_reject(from).await;
            }
            SignalingMessage::HangUp { from, .. } => {
                self.call_manager().handle_hang_up(from).await;
            }
            SignalingMessage::CallFailed { reason, .. } => {
                self.call_manager().handle_call_failed(reason).await;
            }
            SignalingMessage::Register { .. } | SignalingMessage::PresenceUpdate { .. } => {
                // Routed by the client's event pump, never here.
                warn!("non-call signal {} reached the call handler", msg.kind());
            }
        }
    }
}
