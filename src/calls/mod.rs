//! Call signaling: the per-call state machine and its orchestration.
//!
//! # Architecture
//!
//! - [`CallState`] & [`CallSession`]: state machine tracking one call attempt
//!   between the local user and one remote identity
//! - [`CallTransition`]: the events that drive it; invalid transitions are
//!   rejected with a typed error, never applied
//! - [`CallManager`]: session registry and lifecycle orchestration — busy
//!   guard, candidate buffering, ring timeout, teardown, call-history records
//! - [`MediaEngine`] / [`MediaSource`]: the seams to the peer-to-peer media
//!   engine and the local capture devices; the manager only ever talks to
//!   these traits
//!
//! Incoming signaling is dispatched into the manager by the client's
//! transport pump (see `client.rs` / `handler.rs`). Outgoing messages are
//! queued on the client's writer channel; nothing here blocks on the network.

mod error;
mod handler;
mod manager;
mod media;
mod state;

pub use error::CallError;
pub use manager::{CallManager, CallManagerConfig};
pub use media::{
    ConnectivityState, EngineError, EngineEvent, LocalMedia, MediaAccessDenied, MediaEngine,
    MediaEngineFactory, MediaSession, MediaSource,
};
pub use state::{CallSession, CallState, CallTransition, DescriptionAlreadySet, InvalidTransition};

#[cfg(feature = "media-webrtc")]
pub mod webrtc_engine;
