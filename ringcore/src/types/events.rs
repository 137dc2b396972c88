//! Event payloads dispatched to applications. The broadcast bus itself lives
//! in the platform crate; these are the plain data it carries.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::call::{CallEndReason, CallFailReason};
use super::identity::Msisdn;
use super::presence::Presence;

/// The signaling channel is up and the identity is registered.
#[derive(Debug, Clone, Serialize)]
pub struct Connected;

/// The signaling channel went away. Any in-progress call has been failed
/// locally and its media released.
#[derive(Debug, Clone, Serialize)]
pub struct Disconnected;

/// An inbound offer is ringing; answer or decline it.
#[derive(Debug, Clone, Serialize)]
pub struct IncomingCall {
    pub from: Msisdn,
    pub received_at: DateTime<Utc>,
}

/// Media is flowing on the call with `remote`.
#[derive(Debug, Clone, Serialize)]
pub struct CallConnected {
    pub remote: Msisdn,
}

/// The call with `remote` was declined (by either side).
#[derive(Debug, Clone, Serialize)]
pub struct CallRejected {
    pub remote: Msisdn,
}

/// The call with `remote` reached its end state.
#[derive(Debug, Clone, Serialize)]
pub struct CallEnded {
    pub remote: Msisdn,
    pub reason: CallEndReason,
    pub duration_secs: Option<i64>,
}

/// The call attempt with `remote` failed before or during setup.
#[derive(Debug, Clone, Serialize)]
pub struct CallFailed {
    pub remote: Msisdn,
    pub reason: Option<CallFailReason>,
    pub detail: String,
}

/// Another user went online or offline.
#[derive(Debug, Clone, Serialize)]
pub struct PresenceUpdate {
    pub identity: Msisdn,
    pub presence: Presence,
}
