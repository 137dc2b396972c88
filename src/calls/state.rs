//! Call state machine implementation.

use chrono::{DateTime, Utc};
use ringcore::protocol::{IceCandidate, SessionDescription};
use ringcore::types::{CallDirection, CallEndReason, Msisdn};
use serde::Serialize;

/// Current state of a call attempt.
///
/// "Idle" has no representation here: no session object exists. An outgoing
/// session is created in [`CallState::Initiating`] while media and the offer
/// are being prepared; an incoming session is created directly in
/// [`CallState::Ringing`].
#[derive(Debug, Clone, Serialize, Default)]
pub enum CallState {
    /// Outgoing call: preparing media and the offer, nothing sent yet.
    #[default]
    Initiating,
    /// Outgoing call: offer sent, waiting for answer or reject.
    Dialing { offer_sent_at: DateTime<Utc> },
    /// Incoming call: ringing locally, waiting for accept or decline.
    Ringing { received_at: DateTime<Utc> },
    /// Answer exchanged, waiting for the media engine to connect.
    Connecting { answered_at: DateTime<Utc> },
    /// Media flowing.
    Connected { connected_at: DateTime<Utc> },
    /// Terminal: the call was hung up (or never picked up) after signaling.
    Ended {
        reason: CallEndReason,
        ended_at: DateTime<Utc>,
        duration_secs: Option<i64>,
    },
    /// Terminal: declined by the callee.
    Rejected { rejected_at: DateTime<Utc> },
    /// Terminal: setup or connectivity failed.
    Failed {
        reason: String,
        failed_at: DateTime<Utc>,
    },
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Ended { .. } | Self::Rejected { .. } | Self::Failed { .. }
        )
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    pub fn can_accept(&self) -> bool {
        matches!(self, Self::Ringing { .. })
    }

    pub fn can_decline(&self) -> bool {
        matches!(self, Self::Ringing { .. })
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Initiating => "initiating",
            Self::Dialing { .. } => "dialing",
            Self::Ringing { .. } => "ringing",
            Self::Connecting { .. } => "connecting",
            Self::Connected { .. } => "connected",
            Self::Ended { .. } => "ended",
            Self::Rejected { .. } => "rejected",
            Self::Failed { .. } => "failed",
        }
    }
}

/// State transitions for calls.
#[derive(Debug, Clone)]
pub enum CallTransition {
    /// The offer left the local endpoint.
    OfferSent,
    /// The callee answered our offer.
    RemoteAnswered,
    /// The local user accepted a ringing call.
    LocalAccepted,
    /// The local user declined a ringing call.
    LocalDeclined,
    /// The caller's offer was rejected by the remote side.
    RemoteRejected,
    /// The media engine reported connectivity.
    MediaConnected,
    /// Either side hung up, or the connection dropped after media flowed.
    HangUp { reason: CallEndReason },
    /// Setup failed (negotiation error, timeout, offline target, ...).
    Failed { reason: String },
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid transition {attempted} in state {current_state}")]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

/// Raised when a session description would be installed twice.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{side} description already set for this call attempt")]
pub struct DescriptionAlreadySet {
    pub side: &'static str,
}

/// One call attempt between the local user and `remote`.
#[derive(Debug, Clone, Serialize)]
pub struct CallSession {
    pub local: Msisdn,
    pub remote: Msisdn,
    pub direction: CallDirection,
    pub state: CallState,
    /// Our own description; set at most once per attempt.
    pub local_description: Option<SessionDescription>,
    /// The peer's description; set at most once per attempt.
    pub remote_description: Option<SessionDescription>,
    /// Whether the remote description has been installed into the media
    /// engine. Until then, incoming candidates are buffered.
    pub remote_applied: bool,
    /// Candidates received before the remote description was installed, in
    /// receipt order. Duplicates are kept; deduplication belongs to the
    /// media engine.
    pub pending_candidates: Vec<IceCandidate>,
    pub created_at: DateTime<Utc>,
    /// Monotonic id distinguishing this attempt from earlier ones with the
    /// same peer; async completions carry it and are dropped on mismatch.
    pub epoch: u64,
}

impl CallSession {
    pub fn new_outgoing(local: Msisdn, remote: Msisdn, epoch: u64) -> Self {
        Self {
            local,
            remote,
            direction: CallDirection::Outgoing,
            state: CallState::Initiating,
            local_description: None,
            remote_description: None,
            remote_applied: false,
            pending_candidates: Vec::new(),
            created_at: Utc::now(),
            epoch,
        }
    }

    pub fn new_incoming(
        local: Msisdn,
        remote: Msisdn,
        offer: SessionDescription,
        epoch: u64,
    ) -> Self {
        Self {
            local,
            remote,
            direction: CallDirection::Incoming,
            state: CallState::Ringing {
                received_at: Utc::now(),
            },
            local_description: None,
            remote_description: Some(offer),
            remote_applied: false,
            pending_candidates: Vec::new(),
            created_at: Utc::now(),
            epoch,
        }
    }

    pub fn record_local_description(
        &mut self,
        desc: SessionDescription,
    ) -> Result<(), DescriptionAlreadySet> {
        if self.local_description.is_some() {
            return Err(DescriptionAlreadySet { side: "local" });
        }
        self.local_description = Some(desc);
        Ok(())
    }

    pub fn record_remote_description(
        &mut self,
        desc: SessionDescription,
    ) -> Result<(), DescriptionAlreadySet> {
        if self.remote_description.is_some() {
            return Err(DescriptionAlreadySet { side: "remote" });
        }
        self.remote_description = Some(desc);
        Ok(())
    }

    /// Queue a candidate that arrived before the remote description was
    /// installed. Order is preserved exactly as received.
    pub fn buffer_candidate(&mut self, candidate: IceCandidate) {
        self.pending_candidates.push(candidate);
    }

    /// Mark the remote description as installed into the engine and drain
    /// the buffered candidates, in receipt order, for immediate application.
    pub fn mark_remote_applied(&mut self) -> Vec<IceCandidate> {
        self.remote_applied = true;
        std::mem::take(&mut self.pending_candidates)
    }

    pub fn is_initiator(&self) -> bool {
        self.direction == CallDirection::Outgoing
    }

    /// Apply a state transition. Returns an error if the transition is not
    /// valid in the current state; the state is left untouched in that case.
    pub fn apply_transition(&mut self, transition: CallTransition) -> Result<(), InvalidTransition> {
        let new_state = match (&self.state, transition) {
            (CallState::Initiating, CallTransition::OfferSent) => CallState::Dialing {
                offer_sent_at: Utc::now(),
            },
            (CallState::Dialing { .. }, CallTransition::RemoteAnswered) => CallState::Connecting {
                answered_at: Utc::now(),
            },
            (CallState::Ringing { .. }, CallTransition::LocalAccepted) => CallState::Connecting {
                answered_at: Utc::now(),
            },
            (CallState::Ringing { .. }, CallTransition::LocalDeclined) => CallState::Rejected {
                rejected_at: Utc::now(),
            },
            (CallState::Dialing { .. }, CallTransition::RemoteRejected) => CallState::Rejected {
                rejected_at: Utc::now(),
            },
            (CallState::Connecting { .. }, CallTransition::MediaConnected) => CallState::Connected {
                connected_at: Utc::now(),
            },
            (
                CallState::Initiating
                | CallState::Dialing { .. }
                | CallState::Ringing { .. }
                | CallState::Connecting { .. },
                CallTransition::HangUp { reason },
            ) => CallState::Ended {
                reason,
                ended_at: Utc::now(),
                duration_secs: None,
            },
            (CallState::Connected { connected_at }, CallTransition::HangUp { reason }) => {
                let duration = Utc::now()
                    .signed_duration_since(*connected_at)
                    .num_seconds();
                CallState::Ended {
                    reason,
                    ended_at: Utc::now(),
                    duration_secs: Some(duration),
                }
            }
            (
                CallState::Initiating
                | CallState::Dialing { .. }
                | CallState::Ringing { .. }
                | CallState::Connecting { .. }
                | CallState::Connected { .. },
                CallTransition::Failed { reason },
            ) => CallState::Failed {
                reason,
                failed_at: Utc::now(),
            },
            (current, transition) => {
                return Err(InvalidTransition {
                    current_state: current.name().to_string(),
                    attempted: format!("{:?}", transition),
                });
            }
        };
        self.state = new_state;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caller() -> Msisdn {
        "+1000000".parse().unwrap()
    }

    fn callee() -> Msisdn {
        "+2000000".parse().unwrap()
    }

    fn make_outgoing() -> CallSession {
        CallSession::new_outgoing(caller(), callee(), 1)
    }

    fn make_incoming() -> CallSession {
        CallSession::new_incoming(callee(), caller(), SessionDescription::offer("v=0"), 1)
    }

    /// Flow: Initiating → Dialing → Connecting → Connected → Ended.
    #[test]
    fn test_outgoing_call_flow() {
        let mut call = make_outgoing();
        assert!(matches!(call.state, CallState::Initiating));
        assert!(call.is_initiator());

        call.apply_transition(CallTransition::OfferSent).unwrap();
        assert!(matches!(call.state, CallState::Dialing { .. }));

        call.apply_transition(CallTransition::RemoteAnswered)
            .unwrap();
        assert!(matches!(call.state, CallState::Connecting { .. }));

        call.apply_transition(CallTransition::MediaConnected)
            .unwrap();
        assert!(call.state.is_connected());

        call.apply_transition(CallTransition::HangUp {
            reason: CallEndReason::LocalHangUp,
        })
        .unwrap();
        assert!(call.state.is_terminal());
        if let CallState::Ended { duration_secs, .. } = call.state {
            assert!(duration_secs.is_some());
        } else {
            panic!("expected Ended");
        }
    }

    /// Flow: Ringing → Connecting → Connected → Ended.
    #[test]
    fn test_incoming_call_flow() {
        let mut call = make_incoming();
        assert!(call.state.can_accept());
        assert!(!call.is_initiator());
        assert!(call.remote_description.is_some());

        call.apply_transition(CallTransition::LocalAccepted).unwrap();
        assert!(matches!(call.state, CallState::Connecting { .. }));

        call.apply_transition(CallTransition::MediaConnected)
            .unwrap();
        call.apply_transition(CallTransition::HangUp {
            reason: CallEndReason::RemoteHangUp,
        })
        .unwrap();
        assert!(call.state.is_terminal());
    }

    /// Flow: Dialing → Rejected when the remote side declines.
    #[test]
    fn test_outgoing_call_rejected() {
        let mut call = make_outgoing();
        call.apply_transition(CallTransition::OfferSent).unwrap();
        call.apply_transition(CallTransition::RemoteRejected)
            .unwrap();
        assert!(matches!(call.state, CallState::Rejected { .. }));
    }

    /// Flow: Ringing → Rejected on local decline.
    #[test]
    fn test_incoming_call_declined() {
        let mut call = make_incoming();
        assert!(call.state.can_decline());
        call.apply_transition(CallTransition::LocalDeclined).unwrap();
        assert!(matches!(call.state, CallState::Rejected { .. }));
    }

    /// A hang-up from every non-terminal state reaches Ended.
    #[test]
    fn test_hangup_always_terminates() {
        let reach = [
            vec![],
            vec![CallTransition::OfferSent],
            vec![CallTransition::OfferSent, CallTransition::RemoteAnswered],
            vec![
                CallTransition::OfferSent,
                CallTransition::RemoteAnswered,
                CallTransition::MediaConnected,
            ],
        ];
        for path in reach {
            let mut call = make_outgoing();
            for t in path {
                call.apply_transition(t).unwrap();
            }
            call.apply_transition(CallTransition::HangUp {
                reason: CallEndReason::RemoteHangUp,
            })
            .unwrap();
            assert!(matches!(call.state, CallState::Ended { .. }));
        }

        let mut ringing = make_incoming();
        ringing
            .apply_transition(CallTransition::HangUp {
                reason: CallEndReason::RemoteHangUp,
            })
            .unwrap();
        assert!(matches!(ringing.state, CallState::Ended { .. }));
    }

    /// Failure is reachable from every non-terminal state.
    #[test]
    fn test_failure_from_every_non_terminal_state() {
        let mut initiating = make_outgoing();
        initiating
            .apply_transition(CallTransition::Failed {
                reason: "media denied".into(),
            })
            .unwrap();
        assert!(matches!(initiating.state, CallState::Failed { .. }));

        let mut connected = make_outgoing();
        connected.apply_transition(CallTransition::OfferSent).unwrap();
        connected
            .apply_transition(CallTransition::RemoteAnswered)
            .unwrap();
        connected
            .apply_transition(CallTransition::MediaConnected)
            .unwrap();
        connected
            .apply_transition(CallTransition::Failed {
                reason: "connectivity lost".into(),
            })
            .unwrap();
        assert!(matches!(connected.state, CallState::Failed { .. }));
    }

    /// Invalid transitions are rejected and leave the state untouched.
    #[test]
    fn test_invalid_transitions() {
        let mut call = make_outgoing();
        assert!(call.apply_transition(CallTransition::RemoteAnswered).is_err());
        assert!(call.apply_transition(CallTransition::MediaConnected).is_err());
        assert!(call.apply_transition(CallTransition::LocalAccepted).is_err());
        assert!(matches!(call.state, CallState::Initiating));

        // A caller cannot "accept" its own dialing call.
        call.apply_transition(CallTransition::OfferSent).unwrap();
        assert!(call.apply_transition(CallTransition::LocalAccepted).is_err());
        assert!(call.apply_transition(CallTransition::LocalDeclined).is_err());
    }

    /// Terminal states accept no further transitions.
    #[test]
    fn test_terminal_states_reject_transitions() {
        let mut call = make_incoming();
        call.apply_transition(CallTransition::LocalDeclined).unwrap();
        assert!(call.state.is_terminal());

        assert!(call.apply_transition(CallTransition::LocalAccepted).is_err());
        assert!(call.apply_transition(CallTransition::MediaConnected).is_err());
        assert!(
            call.apply_transition(CallTransition::HangUp {
                reason: CallEndReason::RemoteHangUp,
            })
            .is_err()
        );
        assert!(
            call.apply_transition(CallTransition::Failed {
                reason: "late".into(),
            })
            .is_err()
        );
    }

    /// Candidates buffered before the remote description are drained in
    /// receipt order; duplicates are kept as-is.
    #[test]
    fn test_candidate_buffer_preserves_order_and_duplicates() {
        let mut call = make_outgoing();
        let c1 = IceCandidate::new("c1");
        let c2 = IceCandidate::new("c2");
        call.buffer_candidate(c1.clone());
        call.buffer_candidate(c2.clone());
        call.buffer_candidate(c1.clone());
        assert!(!call.remote_applied);

        let drained = call.mark_remote_applied();
        assert_eq!(drained, vec![c1.clone(), c2, c1]);
        assert!(call.remote_applied);
        assert!(call.pending_candidates.is_empty());
    }

    /// Descriptions are set at most once per attempt.
    #[test]
    fn test_descriptions_set_at_most_once() {
        let mut call = make_outgoing();
        call.record_local_description(SessionDescription::offer("o1"))
            .unwrap();
        assert!(
            call.record_local_description(SessionDescription::offer("o2"))
                .is_err()
        );

        call.record_remote_description(SessionDescription::answer("a1"))
            .unwrap();
        assert!(
            call.record_remote_description(SessionDescription::answer("a2"))
                .is_err()
        );

        // Incoming sessions already carry the offer.
        let mut incoming = make_incoming();
        assert!(
            incoming
                .record_remote_description(SessionDescription::offer("again"))
                .is_err()
        );
    }
}
