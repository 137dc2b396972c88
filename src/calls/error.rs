//! Call-related error types.

use ringcore::types::Msisdn;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("no call session with {0}")]
    NotFound(Msisdn),

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] super::state::InvalidTransition),

    #[error("already in a call")]
    AlreadyInCall,

    #[error("cannot call yourself")]
    SelfCall,

    #[error("target is offline")]
    TargetOffline,

    #[error("local media unavailable: {0}")]
    MediaAcquisitionDenied(String),

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("not connected to the relay")]
    NotConnected,

    #[error("transport error: {0}")]
    Transport(String),
}
