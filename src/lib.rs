// Re-export the core protocol for consumers of this crate
pub use ringcore::protocol;

// Core types are re-exported; events (with EventBus) remain here for
// platform-specific functionality
pub mod types {
    pub use ringcore::types::*;
    pub mod events;
}

// Platform-specific modules
pub mod calls;
pub mod client;
pub mod config;
pub mod relay;
pub mod socket;
pub mod store;

// Shared test doubles for the trait seams (also used by integration tests)
pub mod test_utils;
