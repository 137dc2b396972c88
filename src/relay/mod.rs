//! The signaling relay: accepts client connections, tracks who is online,
//! and forwards call signaling between two identified endpoints.
//!
//! # Architecture
//!
//! - [`Directory`]: identity → live connection registry plus presence
//!   broadcast; the only place that knows who is reachable
//! - [`SignalRouter`]: per-message routing with a per-user-pair lock, so
//!   messages of one call never interleave while independent calls proceed
//!   in parallel
//! - [`RelayServer`]: the websocket accept loop and per-connection tasks
//!
//! The relay never inspects SDP or candidates and persists nothing:
//! delivery is at-most-once, and an unreachable target is reported to the
//! sender synchronously as `call-failed { target-offline }`.

mod directory;
mod router;
mod server;

pub use directory::{ConnectionHandle, Directory};
pub use router::SignalRouter;
pub use server::{RelayConfig, RelayServer};
