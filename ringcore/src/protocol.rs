//! The signaling wire protocol.
//!
//! Every frame on the signaling channel is one JSON object tagged by `kind`.
//! The schema is closed: unknown kinds fail to decode and are dropped by the
//! transport layer. Payload fields are camelCase, kinds are kebab-case.
//!
//! Apart from `register` (client → relay, binds the connection to an
//! identity) and `presence-update` (relay → clients), every kind is relayed
//! verbatim between the two parties of a call.

use serde::{Deserialize, Serialize};

use crate::types::call::CallFailReason;
use crate::types::identity::Msisdn;
use crate::types::presence::Presence;

/// Whether a session description is the offer or the answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// An SDP blob exchanged as offer or answer. Opaque to the signaling layer;
/// only the media engine interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// One ICE candidate, in RTCIceCandidateInit shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

/// A frame on the signaling channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SignalingMessage {
    /// First frame a client sends; binds the connection to `identity`.
    Register { identity: Msisdn },
    #[serde(rename_all = "camelCase")]
    CallOffer {
        from: Msisdn,
        to: Msisdn,
        session_description: SessionDescription,
    },
    #[serde(rename_all = "camelCase")]
    CallAnswer {
        from: Msisdn,
        to: Msisdn,
        session_description: SessionDescription,
    },
    IceCandidate {
        from: Msisdn,
        to: Msisdn,
        candidate: IceCandidate,
    },
    Reject { from: Msisdn, to: Msisdn },
    HangUp { from: Msisdn, to: Msisdn },
    /// Synthesized by the relay (target offline) or by the callee (busy);
    /// never relayed further than `to`.
    CallFailed { to: Msisdn, reason: CallFailReason },
    PresenceUpdate { identity: Msisdn, status: Presence },
}

impl SignalingMessage {
    /// The kind tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Register { .. } => "register",
            SignalingMessage::CallOffer { .. } => "call-offer",
            SignalingMessage::CallAnswer { .. } => "call-answer",
            SignalingMessage::IceCandidate { .. } => "ice-candidate",
            SignalingMessage::Reject { .. } => "reject",
            SignalingMessage::HangUp { .. } => "hang-up",
            SignalingMessage::CallFailed { .. } => "call-failed",
            SignalingMessage::PresenceUpdate { .. } => "presence-update",
        }
    }

    /// The identity this message should be delivered to, if it is routable.
    pub fn target(&self) -> Option<&Msisdn> {
        match self {
            SignalingMessage::CallOffer { to, .. }
            | SignalingMessage::CallAnswer { to, .. }
            | SignalingMessage::IceCandidate { to, .. }
            | SignalingMessage::Reject { to, .. }
            | SignalingMessage::HangUp { to, .. }
            | SignalingMessage::CallFailed { to, .. } => Some(to),
            SignalingMessage::Register { .. } | SignalingMessage::PresenceUpdate { .. } => None,
        }
    }

    /// The claimed sender, where the schema carries one.
    pub fn sender(&self) -> Option<&Msisdn> {
        match self {
            SignalingMessage::CallOffer { from, .. }
            | SignalingMessage::CallAnswer { from, .. }
            | SignalingMessage::IceCandidate { from, .. }
            | SignalingMessage::Reject { from, .. }
            | SignalingMessage::HangUp { from, .. } => Some(from),
            _ => None,
        }
    }

    /// True for the kinds that belong to an in-flight call between two
    /// parties (everything except registration and presence).
    pub fn is_call_signal(&self) -> bool {
        !matches!(
            self,
            SignalingMessage::Register { .. } | SignalingMessage::PresenceUpdate { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msisdn(s: &str) -> Msisdn {
        s.parse().unwrap()
    }

    #[test]
    fn test_offer_wire_shape() {
        let msg = SignalingMessage::CallOffer {
            from: msisdn("+1000000"),
            to: msisdn("+2000000"),
            session_description: SessionDescription::offer("v=0\r\n"),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["kind"], "call-offer");
        assert_eq!(json["from"], "+1000000");
        assert_eq!(json["to"], "+2000000");
        assert_eq!(json["sessionDescription"]["sdpType"], "offer");
        assert_eq!(json["sessionDescription"]["sdp"], "v=0\r\n");
    }

    #[test]
    fn test_candidate_wire_shape() {
        let msg = SignalingMessage::IceCandidate {
            from: msisdn("+1000000"),
            to: msisdn("+2000000"),
            candidate: IceCandidate {
                candidate: "candidate:1 1 udp 2130706431 192.0.2.1 54400 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            },
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["kind"], "ice-candidate");
        assert_eq!(json["candidate"]["sdpMid"], "0");
        assert_eq!(json["candidate"]["sdpMlineIndex"], 0);
    }

    #[test]
    fn test_candidate_optional_fields_omitted() {
        let c = IceCandidate::new("candidate:0");
        let json = serde_json::to_value(&c).unwrap();
        assert!(json.get("sdpMid").is_none());
        assert!(json.get("sdpMlineIndex").is_none());
    }

    #[test]
    fn test_call_failed_reason() {
        let msg = SignalingMessage::CallFailed {
            to: msisdn("+1000000"),
            reason: CallFailReason::TargetOffline,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["kind"], "call-failed");
        assert_eq!(json["reason"], "target-offline");
    }

    #[test]
    fn test_presence_update_wire_shape() {
        let msg = SignalingMessage::PresenceUpdate {
            identity: msisdn("+2000000"),
            status: Presence::Online,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["kind"], "presence-update");
        assert_eq!(json["status"], "online");
    }

    #[test]
    fn test_round_trip_all_kinds() {
        let a = msisdn("+1000000");
        let b = msisdn("+2000000");
        let msgs = vec![
            SignalingMessage::Register {
                identity: a.clone(),
            },
            SignalingMessage::CallOffer {
                from: a.clone(),
                to: b.clone(),
                session_description: SessionDescription::offer("o"),
            },
            SignalingMessage::CallAnswer {
                from: b.clone(),
                to: a.clone(),
                session_description: SessionDescription::answer("a"),
            },
            SignalingMessage::IceCandidate {
                from: a.clone(),
                to: b.clone(),
                candidate: IceCandidate::new("c"),
            },
            SignalingMessage::Reject {
                from: b.clone(),
                to: a.clone(),
            },
            SignalingMessage::HangUp {
                from: a.clone(),
                to: b.clone(),
            },
            SignalingMessage::CallFailed {
                to: a.clone(),
                reason: CallFailReason::Busy,
            },
            SignalingMessage::PresenceUpdate {
                identity: b.clone(),
                status: Presence::Offline,
            },
        ];
        for msg in msgs {
            let json = serde_json::to_string(&msg).unwrap();
            let back: SignalingMessage = serde_json::from_str(&json).unwrap();
            assert_eq!(back, msg);
        }
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let err = serde_json::from_str::<SignalingMessage>(
            r#"{"kind":"call-waiting","from":"+1000000","to":"+2000000"}"#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_routing_accessors() {
        let a = msisdn("+1000000");
        let b = msisdn("+2000000");
        let offer = SignalingMessage::CallOffer {
            from: a.clone(),
            to: b.clone(),
            session_description: SessionDescription::offer("o"),
        };
        assert_eq!(offer.target(), Some(&b));
        assert_eq!(offer.sender(), Some(&a));
        assert!(offer.is_call_signal());

        let reg = SignalingMessage::Register { identity: a };
        assert_eq!(reg.target(), None);
        assert!(!reg.is_call_signal());
    }
}
