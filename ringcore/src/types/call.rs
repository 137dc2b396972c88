use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::identity::Msisdn;

/// Which side initiated the call attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// Why a call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallEndReason {
    LocalHangUp,
    RemoteHangUp,
    /// The media engine reported a dropped connection after media flowed.
    ConnectivityLost,
    /// The peer's signaling connection went away; the relay ended the call.
    PeerDisconnected,
}

/// Reason carried by a `call-failed` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallFailReason {
    TargetOffline,
    Busy,
    Negotiation,
    Timeout,
}

impl fmt::Display for CallFailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallFailReason::TargetOffline => "target offline",
            CallFailReason::Busy => "busy",
            CallFailReason::Negotiation => "negotiation failed",
            CallFailReason::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// Status of a call-history entry, in the spelling the dashboard stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallLogStatus {
    #[serde(rename = "outgoing")]
    Outgoing,
    #[serde(rename = "incoming_answered")]
    IncomingAnswered,
    #[serde(rename = "incoming_missed")]
    IncomingMissed,
}

/// One appended call-history record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub caller: Msisdn,
    pub receiver: Msisdn,
    pub status: CallLogStatus,
    pub duration_secs: i64,
    pub timestamp: DateTime<Utc>,
}
