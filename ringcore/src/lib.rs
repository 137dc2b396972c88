//! Platform-independent core for the ringline signaling stack: the wire
//! protocol and the domain types shared by clients and the relay.

pub mod protocol;
pub mod types;
